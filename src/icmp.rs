//! ICMP echo: responder for incoming requests, delivery hook and sender
//! for an embedding ping application. Everything else is dropped.

use alloc::vec::Vec;
use log::trace;

use crate::arp;
use crate::checksum;
use crate::error::Result;
use crate::ethernet::ETH_HEADER_LEN;
use crate::ipv4::{self, IP_HDR_LEN, TRANSPORT_OFFSET};
use crate::pbuf::PbufId;
use crate::stack::{Protocol, Stack};
use crate::types::Ipv4Addr;

pub const ICMP_HDR_LEN: usize = 8;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;

/// Application hook for received echo replies:
/// (stack, source, identifier, sequence, payload copy).
pub type IcmpEchoFn = fn(&mut Stack, Ipv4Addr, u16, u16, &[u8]);

/// Register the ICMP input handler with the stack.
pub fn init(stack: &mut Stack) {
    stack.set_protocol_handler(Protocol::Icmp, input);
}

/// Register the echo-reply delivery hook. Without one, replies are
/// silently dropped.
pub fn on_echo_reply(stack: &mut Stack, f: IcmpEchoFn) {
    stack.icmp_echo_fn = Some(f);
}

/// Handle an incoming ICMP message.
pub fn input(stack: &mut Stack, ifnum: usize, id: PbufId) {
    let (src, icmp_type, ident, seq, payload) = {
        let frame = stack.pool.frame(id);
        let header = match ipv4::parse_header(frame) {
            Some(h) => h,
            None => return,
        };

        let icmp_off = ETH_HEADER_LEN + header.header_len;
        let icmp_len = header.total_len - header.header_len;
        if icmp_len < ICMP_HDR_LEN || frame.len() < icmp_off + icmp_len {
            stack.stats.icmp_drops += 1;
            return;
        }

        let icmp = &frame[icmp_off..icmp_off + icmp_len];
        if checksum::checksum(icmp) != 0 {
            stack.stats.icmp_drops += 1;
            return;
        }

        (
            header.src,
            icmp[0],
            ((icmp[4] as u16) << 8) | icmp[5] as u16,
            ((icmp[6] as u16) << 8) | icmp[7] as u16,
            Vec::from(&icmp[ICMP_HDR_LEN..]),
        )
    };

    match icmp_type {
        ICMP_ECHO_REQUEST => {
            trace!("icmp: echo request from {} id={:04x} seq={}", src, ident, seq);
            let _ = send_echo_reply(stack, ifnum, src, ident, seq, &payload);
        }
        ICMP_ECHO_REPLY => {
            match stack.icmp_echo_fn {
                Some(f) => f(stack, src, ident, seq, &payload),
                None => trace!("icmp: unsolicited echo reply from {}", src),
            }
        }
        _ => {
            stack.stats.icmp_drops += 1;
        }
    }
}

/// Build the echo reply in a fresh pbuf: payload copied verbatim,
/// addresses swapped, both checksums recomputed. Sent back through the
/// ARP gate on the interface the request arrived on.
fn send_echo_reply(stack: &mut Stack, ifnum: usize, dst: Ipv4Addr, ident: u16, seq: u16, payload: &[u8]) -> Result<()> {
    let (our_ip, subnet, gateway) = {
        let ifc = stack.interface(ifnum)?;
        (ifc.ip4addr, ifc.subnet, ifc.gateway)
    };

    let total_len = IP_HDR_LEN + ICMP_HDR_LEN + payload.len();
    let ip_id = stack.next_ip_id();
    let id = stack.pool.allocate()?;
    {
        let frame = stack.pool.bytes_mut(id);

        let ip = &mut frame[ETH_HEADER_LEN..TRANSPORT_OFFSET];
        ip[0] = 0x45;
        ip[1] = 0;
        ip[2] = (total_len >> 8) as u8;
        ip[3] = (total_len & 0xFF) as u8;
        ip[4] = (ip_id >> 8) as u8;
        ip[5] = (ip_id & 0xFF) as u8;
        ip[6] = 0x40; // DF
        ip[7] = 0;
        ip[8] = 64;
        ip[9] = Protocol::Icmp as u8;
        ip[10] = 0;
        ip[11] = 0;
        ip[12..16].copy_from_slice(&our_ip.0);
        ip[16..20].copy_from_slice(&dst.0);
        let sum = checksum::checksum(ip);
        ip[10] = (sum >> 8) as u8;
        ip[11] = (sum & 0xFF) as u8;

        let icmp = &mut frame[TRANSPORT_OFFSET..TRANSPORT_OFFSET + ICMP_HDR_LEN + payload.len()];
        icmp[0] = ICMP_ECHO_REPLY;
        icmp[1] = 0;
        icmp[2] = 0;
        icmp[3] = 0;
        icmp[4] = (ident >> 8) as u8;
        icmp[5] = (ident & 0xFF) as u8;
        icmp[6] = (seq >> 8) as u8;
        icmp[7] = (seq & 0xFF) as u8;
        icmp[ICMP_HDR_LEN..].copy_from_slice(payload);
        let sum = checksum::checksum(icmp);
        icmp[2] = (sum >> 8) as u8;
        icmp[3] = (sum & 0xFF) as u8;
    }
    stack.pool.set_len(id, ETH_HEADER_LEN + total_len);

    let next_hop = if dst.same_subnet(our_ip, subnet) { dst } else { gateway };
    arp::output(stack, ifnum, next_hop, id)
}

/// Send an echo request. Replies come back through the registered hook.
pub fn send_echo_request(stack: &mut Stack, dst: Ipv4Addr, ident: u16, seq: u16, payload: &[u8]) -> Result<()> {
    let icmp_len = ICMP_HDR_LEN + payload.len();
    if icmp_len > crate::pbuf::PACKET_BUF_SIZE - TRANSPORT_OFFSET {
        return Err(crate::error::Error::Malformed);
    }
    let id = stack.pool.allocate()?;
    {
        let frame = stack.pool.bytes_mut(id);
        let icmp = &mut frame[TRANSPORT_OFFSET..TRANSPORT_OFFSET + icmp_len];
        icmp[0] = ICMP_ECHO_REQUEST;
        icmp[1] = 0;
        icmp[2] = 0;
        icmp[3] = 0;
        icmp[4] = (ident >> 8) as u8;
        icmp[5] = (ident & 0xFF) as u8;
        icmp[6] = (seq >> 8) as u8;
        icmp[7] = (seq & 0xFF) as u8;
        icmp[ICMP_HDR_LEN..].copy_from_slice(payload);
        let sum = checksum::checksum(icmp);
        icmp[2] = (sum >> 8) as u8;
        icmp[3] = (sum & 0xFF) as u8;
    }

    ipv4::output(stack, dst, Protocol::Icmp, id, icmp_len)
}
