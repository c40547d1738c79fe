//! Shared test harness: a scripted link driver, a settable clock, and
//! wire-format builders/parsers for driving the stack end to end.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use tinystack::checksum;
use tinystack::netif::{self, LinkDriver, NetIf};
use tinystack::stack::{Stack, TimeSource};
use tinystack::types::{Ipv4Addr, MacAddr};
use tinystack::{arp, icmp, tcp, udp, Result};

pub const HOST_MAC: MacAddr = MacAddr([0x00, 0x0C, 0x41, 0x57, 0x70, 0x00]);
pub const HOST_IP: Ipv4Addr = Ipv4Addr([192, 168, 1, 19]);
pub const NETMASK: Ipv4Addr = Ipv4Addr([255, 255, 255, 0]);
pub const GATEWAY: Ipv4Addr = Ipv4Addr([192, 168, 1, 1]);

pub const PEER_MAC: MacAddr = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
pub const PEER_IP: Ipv4Addr = Ipv4Addr([192, 168, 1, 10]);

// TCP flag bits as they appear on the wire.
pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

pub struct TestClock(pub Rc<Cell<u32>>);

impl TimeSource for TestClock {
    fn now(&self) -> u32 {
        self.0.get()
    }
}

pub struct TestDriver {
    rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    tx: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl LinkDriver for TestDriver {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn link_input(&mut self, frame: &mut [u8]) -> Option<usize> {
        let pkt = self.rx.borrow_mut().pop_front()?;
        frame[..pkt.len()].copy_from_slice(&pkt);
        Some(pkt.len())
    }

    fn link_output(&mut self, frame: &[u8]) -> Result<()> {
        self.tx.borrow_mut().push(frame.to_vec());
        Ok(())
    }

    fn link_state(&self) -> bool {
        true
    }
}

/// A stack wired to a scripted driver: push frames in, read frames out,
/// move time by hand.
pub struct Harness {
    pub stack: Stack,
    pub ifnum: usize,
    pub clock: Rc<Cell<u32>>,
    rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    tx: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Rc::new(Cell::new(10_000));
        let rx = Rc::new(RefCell::new(VecDeque::new()));
        let tx = Rc::new(RefCell::new(Vec::new()));

        let mut stack = Stack::new("testhost", Box::new(TestClock(clock.clone())));
        let driver = TestDriver { rx: rx.clone(), tx: tx.clone() };
        let ifnum = stack.add_interface(NetIf::new("eth0", HOST_MAC, Box::new(driver))).unwrap();

        netif::init(&mut stack, ifnum).unwrap();
        netif::set_addr(&mut stack, ifnum, HOST_IP, NETMASK, GATEWAY).unwrap();
        stack.set_route(NETMASK, GATEWAY, ifnum).unwrap();
        stack.set_route(Ipv4Addr::ZERO, GATEWAY, ifnum).unwrap();

        icmp::init(&mut stack);
        udp::init(&mut stack);
        tcp::init(&mut stack).unwrap();

        Harness { stack, ifnum, clock, rx, tx }
    }

    /// Put the peer in the ARP cache so replies do not stall on a miss.
    pub fn seed_peer_arp(&mut self) {
        let ifc = self.stack.interface_mut(self.ifnum).unwrap();
        arp::add(ifc, PEER_IP, PEER_MAC, arp::ArpFlags::Static).unwrap();
    }

    /// Feed one frame to the driver and run the input poll.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.rx.borrow_mut().push_back(frame);
        netif::input(&mut self.stack, self.ifnum);
    }

    /// Drain everything the stack transmitted since the last call.
    pub fn sent(&mut self) -> Vec<Vec<u8>> {
        self.tx.borrow_mut().drain(..).collect()
    }

    /// Advance the clock and fire due timers.
    pub fn advance(&mut self, ms: u32) {
        self.clock.set(self.clock.get().wrapping_add(ms));
        self.stack.timers();
    }

    pub fn now(&self) -> u32 {
        self.clock.get()
    }
}

// ── Frame builders (peer -> host) ───────────────────────────────────

pub fn eth_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.push((ethertype >> 8) as u8);
    frame.push((ethertype & 0xFF) as u8);
    frame.extend_from_slice(payload);
    frame
}

pub fn arp_packet(oper: u16, sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) -> Vec<u8> {
    let mut p = vec![0u8; 28];
    p[1] = 1; // Ethernet
    p[2] = 0x08;
    p[3] = 0x00;
    p[4] = 6;
    p[5] = 4;
    p[6] = (oper >> 8) as u8;
    p[7] = (oper & 0xFF) as u8;
    p[8..14].copy_from_slice(&sha.0);
    p[14..18].copy_from_slice(&spa.0);
    p[18..24].copy_from_slice(&tha.0);
    p[24..28].copy_from_slice(&tpa.0);
    p
}

pub fn arp_request_frame(sha: MacAddr, spa: Ipv4Addr, tpa: Ipv4Addr) -> Vec<u8> {
    eth_frame(MacAddr::BROADCAST, sha, 0x0806, &arp_packet(1, sha, spa, MacAddr::ZERO, tpa))
}

pub fn arp_reply_frame(sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) -> Vec<u8> {
    eth_frame(tha, sha, 0x0806, &arp_packet(2, sha, spa, tha, tpa))
}

pub fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut ip = vec![0u8; total_len];
    ip[0] = 0x45;
    ip[2] = (total_len >> 8) as u8;
    ip[3] = (total_len & 0xFF) as u8;
    ip[6] = 0x40; // DF
    ip[8] = 64;
    ip[9] = protocol;
    ip[12..16].copy_from_slice(&src.0);
    ip[16..20].copy_from_slice(&dst.0);
    let sum = checksum::checksum(&ip[..20]);
    ip[10] = (sum >> 8) as u8;
    ip[11] = (sum & 0xFF) as u8;
    ip[20..].copy_from_slice(payload);
    eth_frame(HOST_MAC, PEER_MAC, 0x0800, &ip)
}

pub fn icmp_echo_request_frame(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    let mut icmp = vec![0u8; 8 + data.len()];
    icmp[0] = 8;
    icmp[4] = (ident >> 8) as u8;
    icmp[5] = (ident & 0xFF) as u8;
    icmp[6] = (seq >> 8) as u8;
    icmp[7] = (seq & 0xFF) as u8;
    icmp[8..].copy_from_slice(data);
    let sum = checksum::checksum(&icmp);
    icmp[2] = (sum >> 8) as u8;
    icmp[3] = (sum & 0xFF) as u8;
    ipv4_frame(src, dst, 1, &icmp)
}

pub fn udp_frame(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, data: &[u8]) -> Vec<u8> {
    let udp_len = 8 + data.len();
    let mut udp = vec![0u8; udp_len];
    udp[0] = (sport >> 8) as u8;
    udp[1] = (sport & 0xFF) as u8;
    udp[2] = (dport >> 8) as u8;
    udp[3] = (dport & 0xFF) as u8;
    udp[4] = (udp_len >> 8) as u8;
    udp[5] = (udp_len & 0xFF) as u8;
    udp[8..].copy_from_slice(data);
    let pseudo = checksum::pseudo_header_sum(src.as_bytes(), dst.as_bytes(), 17, udp_len as u16);
    let mut sum = checksum::checksum_with(pseudo, &udp);
    if sum == 0 {
        sum = 0xFFFF;
    }
    udp[6] = (sum >> 8) as u8;
    udp[7] = (sum & 0xFF) as u8;
    ipv4_frame(src, dst, 17, &udp)
}

/// Peer TCP segment with a bare 20-byte header.
pub fn tcp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    wnd: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_len = 20 + payload.len();
    let mut tcp = vec![0u8; tcp_len];
    tcp[0] = (sport >> 8) as u8;
    tcp[1] = (sport & 0xFF) as u8;
    tcp[2] = (dport >> 8) as u8;
    tcp[3] = (dport & 0xFF) as u8;
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14] = (wnd >> 8) as u8;
    tcp[15] = (wnd & 0xFF) as u8;
    tcp[20..].copy_from_slice(payload);
    let pseudo = checksum::pseudo_header_sum(src.as_bytes(), dst.as_bytes(), 6, tcp_len as u16);
    let sum = checksum::checksum_with(pseudo, &tcp);
    tcp[16] = (sum >> 8) as u8;
    tcp[17] = (sum & 0xFF) as u8;
    ipv4_frame(src, dst, 6, &tcp)
}

// ── Frame parsers (host -> peer) ────────────────────────────────────

pub struct ArpOut {
    pub oper: u16,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

pub fn parse_arp(frame: &[u8]) -> Option<ArpOut> {
    if frame.len() < 42 || frame[12] != 0x08 || frame[13] != 0x06 {
        return None;
    }
    let p = &frame[14..42];
    Some(ArpOut {
        oper: ((p[6] as u16) << 8) | p[7] as u16,
        sha: MacAddr(p[8..14].try_into().unwrap()),
        spa: Ipv4Addr(p[14..18].try_into().unwrap()),
        tha: MacAddr(p[18..24].try_into().unwrap()),
        tpa: Ipv4Addr(p[24..28].try_into().unwrap()),
    })
}

pub struct IpOut {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub payload: Vec<u8>,
}

/// Parse an outgoing IPv4 frame, verifying the header checksum.
pub fn parse_ipv4(frame: &[u8]) -> Option<IpOut> {
    if frame.len() < 34 || frame[12] != 0x08 || frame[13] != 0x00 {
        return None;
    }
    let ip = &frame[14..];
    let ihl = ((ip[0] & 0x0F) as usize) * 4;
    assert_eq!(checksum::checksum(&ip[..ihl]), 0, "IP header checksum");
    let total_len = ((ip[2] as usize) << 8) | ip[3] as usize;
    Some(IpOut {
        src: Ipv4Addr(ip[12..16].try_into().unwrap()),
        dst: Ipv4Addr(ip[16..20].try_into().unwrap()),
        protocol: ip[9],
        payload: ip[ihl..total_len].to_vec(),
    })
}

pub struct TcpOut {
    pub ip: IpOut,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_off: usize,
    pub flags: u8,
    pub wnd: u16,
    pub payload: Vec<u8>,
}

/// Parse an outgoing TCP frame, verifying both checksums.
pub fn parse_tcp(frame: &[u8]) -> Option<TcpOut> {
    let ip = parse_ipv4(frame)?;
    if ip.protocol != 6 {
        return None;
    }
    let tcp = &ip.payload;
    let pseudo = checksum::pseudo_header_sum(ip.src.as_bytes(), ip.dst.as_bytes(), 6, tcp.len() as u16);
    assert_eq!(checksum::checksum_with(pseudo, tcp), 0, "TCP checksum");

    let data_off = ((tcp[12] >> 4) as usize) * 4;
    Some(TcpOut {
        src_port: ((tcp[0] as u16) << 8) | tcp[1] as u16,
        dst_port: ((tcp[2] as u16) << 8) | tcp[3] as u16,
        seq: u32::from_be_bytes(tcp[4..8].try_into().unwrap()),
        ack: u32::from_be_bytes(tcp[8..12].try_into().unwrap()),
        data_off,
        flags: tcp[13] & 0x3F,
        wnd: ((tcp[14] as u16) << 8) | tcp[15] as u16,
        payload: tcp[data_off..].to_vec(),
        ip,
    })
}

/// Every outgoing TCP frame in a batch, parsed.
pub fn tcp_out(frames: &[Vec<u8>]) -> Vec<TcpOut> {
    frames.iter().filter_map(|f| parse_tcp(f)).collect()
}
