//! IPv4 input demultiplexer and output path.
//!
//! Input validates the header and hands the frame to the registered
//! protocol handler. Output fills the header around a transport payload
//! already placed at [`TRANSPORT_OFFSET`], routes it, and pushes it
//! through the ARP gate. No fragmentation support in either direction.

use log::trace;

use crate::arp;
use crate::checksum;
use crate::error::{Error, Result};
use crate::ethernet::ETH_HEADER_LEN;
use crate::pbuf::{PbufId, PACKET_BUF_SIZE};
use crate::stack::{Protocol, Stack};
use crate::types::Ipv4Addr;

/// Fixed header length; the stack emits no IP options.
pub const IP_HDR_LEN: usize = 20;
/// Where transport headers start in an outgoing pbuf.
pub const TRANSPORT_OFFSET: usize = ETH_HEADER_LEN + IP_HDR_LEN;

const IP_VERSION_4: u8 = 4;
const IP_FLAG_DF: u16 = 0x4000;
const IP_FLAG_MF: u16 = 0x2000;
const IP_FRAG_OFFSET_MASK: u16 = 0x1FFF;
const IP_DEFAULT_TTL: u8 = 64;

/// Parsed header fields of a received packet.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Read and structurally validate the IP header of a frame. Does not
/// verify the checksum.
pub(crate) fn parse_header(frame: &[u8]) -> Option<Ipv4Header> {
    if frame.len() < ETH_HEADER_LEN + IP_HDR_LEN {
        return None;
    }
    let ip = &frame[ETH_HEADER_LEN..];

    if ip[0] >> 4 != IP_VERSION_4 {
        return None;
    }
    let header_len = ((ip[0] & 0x0F) as usize) * 4;
    if header_len < IP_HDR_LEN || ip.len() < header_len {
        return None;
    }

    let total_len = (((ip[2] as usize) << 8) | ip[3] as usize).min(ip.len());
    if total_len < header_len {
        return None;
    }

    Some(Ipv4Header {
        header_len,
        total_len,
        flags_frag: ((ip[6] as u16) << 8) | ip[7] as u16,
        ttl: ip[8],
        protocol: ip[9],
        src: Ipv4Addr([ip[12], ip[13], ip[14], ip[15]]),
        dst: Ipv4Addr([ip[16], ip[17], ip[18], ip[19]]),
    })
}

/// Validate an incoming IPv4 packet and dispatch on its protocol.
pub fn input(stack: &mut Stack, ifnum: usize, id: PbufId) {
    let header = {
        let frame = stack.pool.frame(id);
        let header = match parse_header(frame) {
            Some(h) => h,
            None => {
                stack.stats.ip_header_errs += 1;
                return;
            }
        };

        // One's-complement sum over the header, including the stored
        // checksum, must come out zero.
        let ip = &frame[ETH_HEADER_LEN..];
        if checksum::checksum(&ip[..header.header_len]) != 0 {
            stack.stats.ip_header_errs += 1;
            return;
        }
        header
    };

    if header.flags_frag & IP_FLAG_MF != 0 || header.flags_frag & IP_FRAG_OFFSET_MASK != 0 {
        stack.stats.frag_drops += 1;
        return;
    }

    let for_us = match stack.interface(ifnum) {
        Ok(ifc) => {
            ifc.ip4addr != Ipv4Addr::ZERO
                && (header.dst == ifc.ip4addr || header.dst.is_broadcast_for(ifc.subnet))
        }
        Err(_) => false,
    };
    if !for_us {
        stack.stats.ip_addr_drops += 1;
        return;
    }

    let handler = Protocol::from_byte(header.protocol).and_then(|p| stack.protocol_handler(p));
    match handler {
        Some(handler) => handler(stack, ifnum, id),
        None => {
            trace!("ipv4: no handler for protocol {}", header.protocol);
            stack.stats.proto_drops += 1;
        }
    }
}

/// Fill the IP header around a transport payload at [`TRANSPORT_OFFSET`]
/// and send the packet toward `dst`. Consumes the pbuf on every path.
pub fn output(stack: &mut Stack, dst: Ipv4Addr, protocol: Protocol, id: PbufId, transport_len: usize) -> Result<()> {
    let total_len = IP_HDR_LEN + transport_len;
    if ETH_HEADER_LEN + total_len > PACKET_BUF_SIZE {
        stack.pool.free(id);
        return Err(Error::Malformed);
    }

    let route = match stack.route_lookup(dst) {
        Ok(r) => r,
        Err(e) => {
            stack.pool.free(id);
            return Err(e);
        }
    };

    let (src_ip, subnet, mtu) = {
        let ifc = &stack.interfaces[route.ifnum];
        (ifc.ip4addr, ifc.subnet, ifc.mtu as usize)
    };
    if total_len > mtu {
        stack.pool.free(id);
        return Err(Error::Malformed);
    }

    let ip_id = stack.next_ip_id();
    {
        let frame = stack.pool.bytes_mut(id);
        let ip = &mut frame[ETH_HEADER_LEN..ETH_HEADER_LEN + IP_HDR_LEN];
        ip[0] = (IP_VERSION_4 << 4) | (IP_HDR_LEN as u8 / 4);
        ip[1] = 0; // DSCP/ECN
        ip[2] = (total_len >> 8) as u8;
        ip[3] = (total_len & 0xFF) as u8;
        ip[4] = (ip_id >> 8) as u8;
        ip[5] = (ip_id & 0xFF) as u8;
        ip[6] = (IP_FLAG_DF >> 8) as u8;
        ip[7] = 0;
        ip[8] = IP_DEFAULT_TTL;
        ip[9] = protocol as u8;
        ip[10] = 0;
        ip[11] = 0;
        ip[12..16].copy_from_slice(&src_ip.0);
        ip[16..20].copy_from_slice(&dst.0);

        let sum = checksum::checksum(ip);
        ip[10] = (sum >> 8) as u8;
        ip[11] = (sum & 0xFF) as u8;
    }
    stack.pool.set_len(id, ETH_HEADER_LEN + total_len);

    // Next hop: on-link and broadcast destinations are reached directly,
    // anything else goes through the route's gateway.
    let next_hop = if dst == Ipv4Addr::BROADCAST
        || dst.is_broadcast_for(subnet)
        || dst.same_subnet(src_ip, subnet)
    {
        dst
    } else {
        route.gateway
    };

    arp::output(stack, route.ifnum, next_hop, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    // IPv4 header of a 84-byte ICMP echo, checksum field zeroed.
    fn sample_frame() -> [u8; 98] {
        let mut frame = [0u8; 98];
        let ip = &mut frame[ETH_HEADER_LEN..];
        ip[0] = 0x45;
        ip[2] = 0x00;
        ip[3] = 0x54;
        ip[6] = 0x40; // DF
        ip[8] = 64;
        ip[9] = 1;
        ip[12..16].copy_from_slice(&[192, 168, 1, 10]);
        ip[16..20].copy_from_slice(&[192, 168, 1, 19]);
        let sum = checksum::checksum(&ip[..IP_HDR_LEN]);
        ip[10] = (sum >> 8) as u8;
        ip[11] = (sum & 0xFF) as u8;
        frame
    }

    #[test]
    fn parse_valid_header() {
        let frame = sample_frame();
        let hdr = parse_header(&frame).unwrap();
        assert_eq!(hdr.header_len, 20);
        assert_eq!(hdr.total_len, 84);
        assert_eq!(hdr.protocol, 1);
        assert_eq!(hdr.src, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(hdr.dst, Ipv4Addr::new(192, 168, 1, 19));
        // Stored checksum verifies
        assert_eq!(checksum::checksum(&frame[ETH_HEADER_LEN..ETH_HEADER_LEN + 20]), 0);
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut frame = sample_frame();
        frame[ETH_HEADER_LEN] = 0x65;
        assert!(parse_header(&frame).is_none());
    }

    #[test]
    fn parse_rejects_short_frame() {
        let frame = sample_frame();
        assert!(parse_header(&frame[..20]).is_none());
    }
}
