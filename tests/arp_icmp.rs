//! End-to-end ARP and ICMP behavior through a scripted link driver.

mod common;

use std::cell::RefCell;

use common::*;
use tinystack::stack::Stack;
use tinystack::types::{Ipv4Addr, MacAddr};
use tinystack::{arp, icmp};

#[test]
fn arp_request_for_us_is_answered_and_learned() {
    let mut h = Harness::new();

    h.inject(arp_request_frame(PEER_MAC, PEER_IP, HOST_IP));

    let frames = h.sent();
    assert_eq!(frames.len(), 1);
    let reply = parse_arp(&frames[0]).expect("ARP reply expected");
    assert_eq!(reply.oper, 2);
    assert_eq!(reply.sha, HOST_MAC);
    assert_eq!(reply.spa, HOST_IP);
    assert_eq!(reply.tha, PEER_MAC);
    assert_eq!(reply.tpa, PEER_IP);
    // Frame addressed to the requester
    assert_eq!(&frames[0][0..6], &PEER_MAC.0);

    // Requester is now in the cache as a dynamic entry
    let ifc = h.stack.interface_mut(h.ifnum).unwrap();
    assert_eq!(arp::query(ifc, PEER_IP), Some(PEER_MAC));
}

#[test]
fn arp_request_for_someone_else_is_ignored() {
    let mut h = Harness::new();
    h.inject(arp_request_frame(PEER_MAC, PEER_IP, Ipv4Addr::new(192, 168, 1, 50)));
    assert!(h.sent().is_empty());

    let ifc = h.stack.interface_mut(h.ifnum).unwrap();
    assert_eq!(arp::query(ifc, PEER_IP), None);
}

#[test]
fn arp_reply_updates_to_last_seen_mac() {
    let mut h = Harness::new();
    let other_mac = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);

    h.inject(arp_reply_frame(PEER_MAC, PEER_IP, HOST_MAC, HOST_IP));
    h.inject(arp_reply_frame(other_mac, PEER_IP, HOST_MAC, HOST_IP));

    let ifc = h.stack.interface_mut(h.ifnum).unwrap();
    assert_eq!(arp::query(ifc, PEER_IP), Some(other_mac));
    assert_eq!(arp::entries(ifc).count(), 1);
}

#[test]
fn gratuitous_arp_announces_our_address() {
    let mut h = Harness::new();
    arp::gratuitous(&mut h.stack, h.ifnum).unwrap();

    let frames = h.sent();
    assert_eq!(frames.len(), 1);
    let req = parse_arp(&frames[0]).unwrap();
    assert_eq!(req.oper, 1);
    assert_eq!(req.spa, HOST_IP);
    assert_eq!(req.tpa, HOST_IP);
    assert_eq!(&frames[0][0..6], &MacAddr::BROADCAST.0);
}

#[test]
fn icmp_echo_request_is_answered_verbatim() {
    let mut h = Harness::new();
    h.seed_peer_arp();

    h.inject(icmp_echo_request_frame(PEER_IP, HOST_IP, 0x0001, 0x0007, b"hello"));

    let frames = h.sent();
    assert_eq!(frames.len(), 1);
    let ip = parse_ipv4(&frames[0]).expect("IPv4 reply");
    assert_eq!(ip.protocol, 1);
    assert_eq!(ip.src, HOST_IP);
    assert_eq!(ip.dst, PEER_IP);

    let icmp = &ip.payload;
    assert_eq!(tinystack::checksum::checksum(icmp), 0, "ICMP checksum");
    assert_eq!(icmp[0], 0); // echo reply
    assert_eq!(icmp[1], 0);
    assert_eq!(((icmp[4] as u16) << 8) | icmp[5] as u16, 0x0001);
    assert_eq!(((icmp[6] as u16) << 8) | icmp[7] as u16, 0x0007);
    assert_eq!(&icmp[8..], b"hello");
}

thread_local! {
    static REPLIES: RefCell<Vec<(Ipv4Addr, u16, u16, Vec<u8>)>> = RefCell::new(Vec::new());
}

fn record_reply(_stack: &mut Stack, src: Ipv4Addr, ident: u16, seq: u16, data: &[u8]) {
    REPLIES.with(|r| r.borrow_mut().push((src, ident, seq, data.to_vec())));
}

#[test]
fn echo_reply_reaches_registered_hook() {
    let mut h = Harness::new();
    h.seed_peer_arp();
    REPLIES.with(|r| r.borrow_mut().clear());
    icmp::on_echo_reply(&mut h.stack, record_reply);

    icmp::send_echo_request(&mut h.stack, PEER_IP, 0x0042, 3, b"ping").unwrap();
    let frames = h.sent();
    assert_eq!(frames.len(), 1);
    let ip = parse_ipv4(&frames[0]).unwrap();
    assert_eq!(ip.payload[0], 8); // echo request on the wire

    // Peer answers: same id/seq/payload, type 0
    let mut icmp_reply = ip.payload.clone();
    icmp_reply[0] = 0;
    icmp_reply[2] = 0;
    icmp_reply[3] = 0;
    let sum = tinystack::checksum::checksum(&icmp_reply);
    icmp_reply[2] = (sum >> 8) as u8;
    icmp_reply[3] = (sum & 0xFF) as u8;
    h.inject(ipv4_frame(PEER_IP, HOST_IP, 1, &icmp_reply));

    REPLIES.with(|r| {
        let r = r.borrow();
        assert_eq!(r.len(), 1);
        assert_eq!(r[0], (PEER_IP, 0x0042, 3, b"ping".to_vec()));
    });
}

#[test]
fn corrupted_ip_header_is_dropped_and_counted() {
    let mut h = Harness::new();
    h.seed_peer_arp();

    let mut frame = icmp_echo_request_frame(PEER_IP, HOST_IP, 1, 1, b"x");
    frame[24] ^= 0xFF; // trash the IP checksum
    h.inject(frame);

    assert!(h.sent().is_empty());
    assert_eq!(h.stack.stats.ip_header_errs, 1);
}

#[test]
fn fragments_are_dropped() {
    let mut h = Harness::new();
    h.seed_peer_arp();

    let mut frame = icmp_echo_request_frame(PEER_IP, HOST_IP, 1, 1, b"x");
    // Set MF and refresh the header checksum
    frame[20] = 0x20;
    frame[24] = 0;
    frame[25] = 0;
    let sum = tinystack::checksum::checksum(&frame[14..34]);
    frame[24] = (sum >> 8) as u8;
    frame[25] = (sum & 0xFF) as u8;
    h.inject(frame);

    assert!(h.sent().is_empty());
    assert_eq!(h.stack.stats.frag_drops, 1);
}

#[test]
fn packets_for_other_hosts_are_dropped() {
    let mut h = Harness::new();
    h.inject(icmp_echo_request_frame(PEER_IP, Ipv4Addr::new(192, 168, 1, 42), 1, 1, b"x"));
    assert!(h.sent().is_empty());
    assert_eq!(h.stack.stats.ip_addr_drops, 1);
}
