//! TCP helpers: wrapping-safe sequence comparison, PCB lookup and
//! release, and reset generation for segments without a connection.

use log::{debug, trace};

use crate::checksum;
use crate::ipv4;
use crate::stack::{Protocol, Stack};
use crate::types::Ipv4Addr;

use super::tcb::*;

// ── Sequence number comparison (wrapping-safe, RFC 793) ─────────────

/// True if `a` is strictly after `b` in sequence space.
pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// True if `a` is at or after `b` in sequence space.
pub(crate) fn seq_gte(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

/// True if `a` is strictly before `b` in sequence space.
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    seq_gt(b, a)
}

/// True if `a` is at or before `b` in sequence space.
pub(crate) fn seq_lte(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `low <= x < high` in sequence space.
pub(crate) fn seq_in_range(x: u32, low: u32, high: u32) -> bool {
    seq_gte(x, low) && seq_lt(x, high)
}

// ── PCB lookup and lifecycle ────────────────────────────────────────

/// Locate the PCB for an incoming segment: an exact 4-tuple match in
/// any connected state wins, else a listener on the local endpoint.
pub(crate) fn find_pcb(stack: &Stack, seg: &Segment) -> Option<usize> {
    let exact = stack.tcp.pcbs.iter().position(|pcb| {
        !matches!(pcb.state, TcpState::Free | TcpState::Bound | TcpState::Listen)
            && pcb.local_port == seg.dst_port
            && pcb.remote_port == seg.src_port
            && pcb.local_ip == seg.dst_ip
            && pcb.remote_ip == seg.src_ip
    });
    if exact.is_some() {
        return exact;
    }

    stack.tcp.pcbs.iter().position(|pcb| {
        pcb.state == TcpState::Listen
            && pcb.local_port == seg.dst_port
            && (pcb.local_ip == seg.dst_ip || pcb.local_ip == Ipv4Addr::ZERO)
    })
}

/// First FREE PCB slot, if any.
pub(crate) fn alloc_pcb(stack: &Stack) -> Option<usize> {
    stack.tcp.pcbs.iter().position(|pcb| pcb.state == TcpState::Free)
}

/// Release a PCB and everything it holds.
pub(crate) fn free_pcb(stack: &mut Stack, id: usize) {
    debug!("tcp: pcb {} freed from {:?}", id, stack.tcp.pcbs[id].state);
    stack.tcp.pcbs[id].reset();
}

/// Invoke the connection's notify callback, if registered.
pub(crate) fn notify(stack: &mut Stack, id: usize, event: TcpEvent) {
    let notify_fn = stack.tcp.pcbs[id].notify_fn;
    if let Some(f) = notify_fn {
        f(stack, TcpId(id), event);
    }
}

// ── Reset generation ────────────────────────────────────────────────

/// Emit a RST for a segment that matched no PCB. Sequence and ack are
/// chosen so the reset is acceptable to the offending sender:
/// with ACK off `<SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>`,
/// with ACK on `<SEQ=SEG.ACK><CTL=RST>`.
pub(crate) fn send_reset_for(stack: &mut Stack, seg: &Segment) {
    if seg.flags & RST != 0 {
        return; // never reset a reset
    }

    let (seq, ack, flags) = if seg.flags & ACK != 0 {
        (seg.ack, 0, RST)
    } else {
        let mut ack = seg.seq.wrapping_add(seg.len as u32);
        if seg.flags & SYN != 0 {
            ack = ack.wrapping_add(1);
        }
        if seg.flags & FIN != 0 {
            ack = ack.wrapping_add(1);
        }
        (0, ack, RST | ACK)
    };

    trace!("tcp: reset for unknown {}:{} -> port {}", seg.src_ip, seg.src_port, seg.dst_port);
    let _ = send_raw_segment(stack, seg.dst_ip, seg.dst_port, seg.src_ip, seg.src_port, seq, ack, flags);
    stack.stats.tcp_resets_sent += 1;
}

/// Build and send a bare 20-byte segment outside any PCB context.
pub(crate) fn send_raw_segment(
    stack: &mut Stack,
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
) -> crate::error::Result<()> {
    let id = stack.pool.allocate()?;
    {
        let frame = stack.pool.bytes_mut(id);
        let tcp = &mut frame[ipv4::TRANSPORT_OFFSET..ipv4::TRANSPORT_OFFSET + TCP_HDR_LEN];
        fill_header(tcp, src_port, dst_port, seq, ack, 5, flags, 0, 0);

        let pseudo = checksum::pseudo_header_sum(
            src_ip.as_bytes(),
            dst_ip.as_bytes(),
            Protocol::Tcp as u8,
            TCP_HDR_LEN as u16,
        );
        let sum = checksum::checksum_with(pseudo, tcp);
        tcp[16] = (sum >> 8) as u8;
        tcp[17] = (sum & 0xFF) as u8;
    }
    stack.stats.tcp_segments_sent += 1;
    ipv4::output(stack, dst_ip, Protocol::Tcp, id, TCP_HDR_LEN)
}

/// Write the fixed 20-byte TCP header. `data_off_words` is the data
/// offset in 32-bit words; the checksum field is left zero.
pub(crate) fn fill_header(
    tcp: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    data_off_words: u8,
    flags: u8,
    wnd: u16,
    up: u16,
) {
    tcp[0] = (src_port >> 8) as u8;
    tcp[1] = (src_port & 0xFF) as u8;
    tcp[2] = (dst_port >> 8) as u8;
    tcp[3] = (dst_port & 0xFF) as u8;
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = data_off_words << 4;
    tcp[13] = flags;
    tcp[14] = (wnd >> 8) as u8;
    tcp[15] = (wnd & 0xFF) as u8;
    tcp[16] = 0;
    tcp[17] = 0;
    tcp[18] = (up >> 8) as u8;
    tcp[19] = (up & 0xFF) as u8;
}
