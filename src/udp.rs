//! UDP datagram transport: a small PCB table with bind / receive
//! callback / sendto. Delivery is by (local IP, local port); the
//! callback borrows a copy of the payload and never owns the pbuf.

use alloc::vec::Vec;
use core::array;
use log::trace;

use crate::checksum;
use crate::error::{Error, Result};
use crate::ethernet::ETH_HEADER_LEN;
use crate::ipv4::{self, TRANSPORT_OFFSET};
use crate::pbuf::PbufId;
use crate::stack::{Protocol, Stack};
use crate::types::Ipv4Addr;

/// Number of UDP PCBs.
pub const UDP_PCB_COUNT: usize = 8;
pub const UDP_HDR_LEN: usize = 8;

/// Handle to a UDP PCB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpId(pub(crate) usize);

/// Datagram delivery callback: (stack, pcb, payload, source IP, source port).
pub type UdpRecvFn = fn(&mut Stack, UdpId, &[u8], Ipv4Addr, u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UdpState {
    Free,
    Bound,
}

pub(crate) struct UdpPcb {
    state: UdpState,
    local_ip: Ipv4Addr,
    local_port: u16,
    recv_fn: Option<UdpRecvFn>,
}

impl UdpPcb {
    fn new() -> Self {
        UdpPcb {
            state: UdpState::Free,
            local_ip: Ipv4Addr::ZERO,
            local_port: 0,
            recv_fn: None,
        }
    }
}

pub(crate) struct UdpContext {
    pcbs: [UdpPcb; UDP_PCB_COUNT],
}

impl UdpContext {
    pub(crate) fn new() -> Self {
        UdpContext { pcbs: array::from_fn(|_| UdpPcb::new()) }
    }
}

/// Register the UDP input handler with the stack.
pub fn init(stack: &mut Stack) {
    stack.set_protocol_handler(Protocol::Udp, input);
}

/// Find a free PCB.
pub fn new(stack: &mut Stack) -> Result<UdpId> {
    for (i, pcb) in stack.udp.pcbs.iter().enumerate() {
        if pcb.state == UdpState::Free {
            return Ok(UdpId(i));
        }
    }
    Err(Error::OutOfMemory)
}

/// Release a PCB back to the free pool.
pub fn remove(stack: &mut Stack, id: UdpId) -> Result<()> {
    let pcb = stack.udp.pcbs.get_mut(id.0).ok_or(Error::BadId)?;
    *pcb = UdpPcb::new();
    Ok(())
}

/// Bind a PCB to a local address and port.
pub fn bind(stack: &mut Stack, id: UdpId, ip: Ipv4Addr, port: u16) -> Result<()> {
    if id.0 >= UDP_PCB_COUNT {
        return Err(Error::BadId);
    }
    for (i, pcb) in stack.udp.pcbs.iter().enumerate() {
        if i != id.0 && pcb.state == UdpState::Bound && pcb.local_ip == ip && pcb.local_port == port {
            return Err(Error::InUse);
        }
    }
    let pcb = &mut stack.udp.pcbs[id.0];
    pcb.state = UdpState::Bound;
    pcb.local_ip = ip;
    pcb.local_port = port;
    Ok(())
}

/// Register the delivery callback for a PCB.
pub fn set_recv(stack: &mut Stack, id: UdpId, f: UdpRecvFn) -> Result<()> {
    let pcb = stack.udp.pcbs.get_mut(id.0).ok_or(Error::BadId)?;
    pcb.recv_fn = Some(f);
    Ok(())
}

/// Send a datagram from a bound PCB.
pub fn sendto(stack: &mut Stack, id: UdpId, data: &[u8], dst_ip: Ipv4Addr, dst_port: u16) -> Result<()> {
    let src_port = {
        let pcb = stack.udp.pcbs.get(id.0).ok_or(Error::BadId)?;
        if pcb.state != UdpState::Bound {
            return Err(Error::NotBound);
        }
        pcb.local_port
    };

    let udp_len = UDP_HDR_LEN + data.len();
    if udp_len > crate::pbuf::PACKET_BUF_SIZE - TRANSPORT_OFFSET {
        return Err(Error::Malformed);
    }

    // The checksum needs the source address before the IP layer picks
    // it, so resolve the route here as well.
    let route = stack.route_lookup(dst_ip)?;
    let src_ip = stack.interface(route.ifnum)?.ip4addr;

    let id_buf = stack.pool.allocate()?;
    {
        let frame = stack.pool.bytes_mut(id_buf);
        let udp = &mut frame[TRANSPORT_OFFSET..TRANSPORT_OFFSET + udp_len];
        udp[0] = (src_port >> 8) as u8;
        udp[1] = (src_port & 0xFF) as u8;
        udp[2] = (dst_port >> 8) as u8;
        udp[3] = (dst_port & 0xFF) as u8;
        udp[4] = (udp_len >> 8) as u8;
        udp[5] = (udp_len & 0xFF) as u8;
        udp[6] = 0;
        udp[7] = 0;
        udp[UDP_HDR_LEN..].copy_from_slice(data);

        let pseudo = checksum::pseudo_header_sum(
            src_ip.as_bytes(),
            dst_ip.as_bytes(),
            Protocol::Udp as u8,
            udp_len as u16,
        );
        let mut sum = checksum::checksum_with(pseudo, udp);
        if sum == 0 {
            sum = 0xFFFF; // transmitted zero means "no checksum"
        }
        udp[6] = (sum >> 8) as u8;
        udp[7] = (sum & 0xFF) as u8;
    }

    ipv4::output(stack, dst_ip, Protocol::Udp, id_buf, udp_len)
}

/// Validate an incoming datagram and deliver it to the bound PCB.
pub fn input(stack: &mut Stack, _ifnum: usize, id: PbufId) {
    let (src_ip, dst_ip, src_port, dst_port, payload) = {
        let frame = stack.pool.frame(id);
        let header = match ipv4::parse_header(frame) {
            Some(h) => h,
            None => return,
        };

        let udp_off = ETH_HEADER_LEN + header.header_len;
        let avail = header.total_len - header.header_len;
        if avail < UDP_HDR_LEN || frame.len() < udp_off + avail {
            stack.stats.udp_drops += 1;
            return;
        }

        let udp = &frame[udp_off..udp_off + avail];
        let udp_len = (((udp[4] as usize) << 8) | udp[5] as usize).min(avail);
        if udp_len < UDP_HDR_LEN {
            stack.stats.udp_drops += 1;
            return;
        }
        let udp = &udp[..udp_len];

        // Checksum zero on the wire means the sender skipped it.
        let stored = ((udp[6] as u16) << 8) | udp[7] as u16;
        if stored != 0 {
            let pseudo = checksum::pseudo_header_sum(
                header.src.as_bytes(),
                header.dst.as_bytes(),
                Protocol::Udp as u8,
                udp_len as u16,
            );
            if checksum::checksum_with(pseudo, udp) != 0 {
                stack.stats.udp_checksum_errs += 1;
                return;
            }
        }

        (
            header.src,
            header.dst,
            ((udp[0] as u16) << 8) | udp[1] as u16,
            ((udp[2] as u16) << 8) | udp[3] as u16,
            Vec::from(&udp[UDP_HDR_LEN..]),
        )
    };

    let slot = stack.udp.pcbs.iter().position(|pcb| {
        pcb.state == UdpState::Bound
            && pcb.local_port == dst_port
            && (pcb.local_ip == dst_ip || pcb.local_ip == Ipv4Addr::ZERO)
    });

    match slot {
        Some(i) => {
            if let Some(f) = stack.udp.pcbs[i].recv_fn {
                f(stack, UdpId(i), &payload, src_ip, src_port);
            }
        }
        None => {
            trace!("udp: no PCB bound to port {}", dst_port);
            stack.stats.udp_drops += 1;
        }
    }
}
