//! TCP incoming-segment processing: the RFC 793 event-processing order
//! (sequence check, RST, SYN, ACK, text, FIN) over the PCB table.

use log::{debug, trace};

use crate::checksum;
use crate::ethernet::ETH_HEADER_LEN;
use crate::ipv4;
use crate::pbuf::PbufId;
use crate::stack::{Protocol, Stack};

use super::send::{push_output, send_segment};
use super::tcb::*;
use super::util::*;

/// Protocol handler for incoming TCP segments.
pub fn input(stack: &mut Stack, _ifnum: usize, id: PbufId) {
    let seg = {
        let frame = stack.pool.frame(id);
        let header = match ipv4::parse_header(frame) {
            Some(h) => h,
            None => return,
        };

        // Checksum over pseudo-header + header + options + text.
        let tcp_off = ETH_HEADER_LEN + header.header_len;
        let tcp_len = header.total_len - header.header_len;
        if tcp_len < TCP_HDR_LEN || frame.len() < tcp_off + tcp_len {
            stack.stats.tcp_drops += 1;
            return;
        }
        let pseudo = checksum::pseudo_header_sum(
            header.src.as_bytes(),
            header.dst.as_bytes(),
            Protocol::Tcp as u8,
            tcp_len as u16,
        );
        if checksum::checksum_with(pseudo, &frame[tcp_off..tcp_off + tcp_len]) != 0 {
            stack.stats.tcp_checksum_errs += 1;
            return;
        }

        match parse_segment(frame, &header) {
            Some(seg) => seg,
            None => {
                stack.stats.tcp_drops += 1;
                return;
            }
        }
    };

    stack.stats.tcp_segments_recv += 1;

    let pcb_id = match find_pcb(stack, &seg) {
        Some(i) => i,
        None => {
            // No connection and no listener: resets are dropped,
            // everything else is answered with a reset.
            send_reset_for(stack, &seg);
            return;
        }
    };

    // Record per-segment scratch and learned peer options.
    {
        let pcb = &mut stack.tcp.pcbs[pcb_id];
        pcb.seg_seq = seg.seq;
        pcb.seg_ack = seg.ack;
        pcb.seg_len = seg.len as u32;
        pcb.seg_wnd = seg.wnd;
        pcb.seg_up = seg.up;
        if let Some(mss) = seg.mss {
            pcb.peer_mss = mss;
        }
        if let Some(ws) = seg.wscale {
            pcb.peer_wscale = ws; // parsed, never applied: no window scaling
        }
        if let Some(ts) = seg.tsval {
            pcb.peer_ts = ts;
        }
    }

    let state = stack.tcp.pcbs[pcb_id].state;
    match state {
        TcpState::Listen => on_listen(stack, pcb_id, &seg),
        TcpState::SynSent => on_syn_sent(stack, pcb_id, &seg),
        _ => on_synchronized(stack, pcb_id, &seg, id),
    }
}

/// Passive open: a listener answers SYNs by spawning a connection PCB.
/// The listener itself never leaves LISTEN.
fn on_listen(stack: &mut Stack, listener: usize, seg: &Segment) {
    if seg.flags & RST != 0 {
        return;
    }
    if seg.flags & ACK != 0 {
        // An ACK on a listener is always bad: <SEQ=SEG.ACK><CTL=RST>
        send_reset_for(stack, seg);
        return;
    }
    if seg.flags & SYN == 0 {
        return;
    }

    let new_id = match alloc_pcb(stack) {
        Some(i) => i,
        None => {
            debug!("tcp: SYN on port {} dropped, no free PCB", seg.dst_port);
            stack.stats.tcp_drops += 1;
            return;
        }
    };

    let now = stack.now();
    {
        let (accept_fn, notify_fn, local_port) = {
            let l = &stack.tcp.pcbs[listener];
            (l.accept_fn, l.notify_fn, l.local_port)
        };

        let pcb = &mut stack.tcp.pcbs[new_id];
        pcb.local_ip = seg.dst_ip;
        pcb.local_port = local_port;
        pcb.remote_ip = seg.src_ip;
        pcb.remote_port = seg.src_port;

        pcb.irs = seg.seq;
        pcb.rcv_nxt = seg.seq.wrapping_add(1);
        pcb.rcv_wnd = TCP_DEF_WINDOW;

        pcb.iss = now;
        pcb.snd_una = pcb.iss;
        pcb.snd_nxt = pcb.iss;
        pcb.snd_wnd = seg.wnd as u32;
        pcb.snd_wl1 = seg.seq;
        pcb.snd_wl2 = 0;

        if let Some(mss) = seg.mss {
            pcb.peer_mss = mss;
        }
        if let Some(ws) = seg.wscale {
            pcb.peer_wscale = ws;
        }
        if let Some(ts) = seg.tsval {
            pcb.peer_ts = ts;
        }

        pcb.accept_fn = accept_fn;
        pcb.notify_fn = notify_fn;
        pcb.set_state(new_id, TcpState::SynReceived, now);
    }

    // <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>
    let result = send_segment(stack, new_id, SYN | ACK);
    if !super::send::output_accepted(&result) {
        free_pcb(stack, new_id);
    }
}

/// Active open: waiting for the SYN+ACK (or a simultaneous SYN).
fn on_syn_sent(stack: &mut Stack, id: usize, seg: &Segment) {
    let (iss, snd_nxt) = {
        let pcb = &stack.tcp.pcbs[id];
        (pcb.iss, pcb.snd_nxt)
    };

    if seg.flags & ACK != 0 {
        // Acceptable ACK: ISS < SEG.ACK <= SND.NXT
        if seq_lte(seg.ack, iss) || seq_gt(seg.ack, snd_nxt) {
            if seg.flags & RST == 0 {
                send_segment(stack, id, RST).ok();
            }
            return;
        }
    }

    if seg.flags & RST != 0 {
        notify(stack, id, TcpEvent::RemoteRst);
        free_pcb(stack, id);
        return;
    }

    if seg.flags & SYN == 0 {
        return;
    }

    let now = stack.now();
    let established = {
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.irs = seg.seq;
        pcb.rcv_nxt = seg.seq.wrapping_add(1);
        pcb.update_rcv_wnd();
        if seg.flags & ACK != 0 {
            pcb.snd_una = seg.ack;
        }
        pcb.snd_wnd = seg.wnd as u32;
        pcb.snd_wl1 = seg.seq;
        pcb.snd_wl2 = seg.ack;

        seq_gt(pcb.snd_una, pcb.iss)
    };

    if established {
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.rtx_count = 0;
        pcb.rto = TCP_RTO_INIT;
        pcb.set_state(id, TcpState::Established, now);
        send_segment(stack, id, ACK).ok();
        notify(stack, id, TcpEvent::Connected);
    } else {
        // Simultaneous open: our SYN is not yet acknowledged. Repeat it
        // with an ACK, at the sequence number it already consumed.
        stack.tcp.pcbs[id].set_state(id, TcpState::SynReceived, now);
        let iss = stack.tcp.pcbs[id].iss;
        super::send::emit_segment(stack, id, iss, SYN | ACK, &[]).ok();
    }
}

/// Segment processing for every synchronized state.
fn on_synchronized(stack: &mut Stack, id: usize, seg: &Segment, pbuf: PbufId) {
    let now = stack.now();

    // TIME_WAIT only ever sees retransmitted FINs: re-acknowledge and
    // restart the 2*MSL clock.
    if stack.tcp.pcbs[id].state == TcpState::TimeWait && seg.flags & FIN != 0 {
        stack.tcp.pcbs[id].time_in_state = now;
        send_segment(stack, id, ACK).ok();
        return;
    }

    // First: sequence acceptability. Unacceptable segments get an ACK
    // (unless they carry RST) and are dropped.
    let acceptable = {
        let pcb = &stack.tcp.pcbs[id];
        let wnd_end = pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd as u32);
        if seg.len == 0 && pcb.rcv_wnd == 0 {
            seg.seq == pcb.rcv_nxt
        } else if seg.len > 0 && pcb.rcv_wnd == 0 {
            false
        } else {
            seq_in_range(seg.seq, pcb.rcv_nxt, wnd_end)
        }
    };
    if !acceptable {
        if seg.flags & RST == 0 {
            trace!("tcp: pcb {} out-of-window seq {}", id, seg.seq);
            send_segment(stack, id, ACK).ok();
        }
        return;
    }

    // Second: RST tears the connection down.
    if seg.flags & RST != 0 {
        notify(stack, id, TcpEvent::RemoteRst);
        free_pcb(stack, id);
        return;
    }

    // Fourth (security omitted): SYN in the window is a fatal error.
    if seg.flags & SYN != 0 {
        send_segment(stack, id, RST).ok();
        notify(stack, id, TcpEvent::RemoteRst);
        free_pcb(stack, id);
        return;
    }

    // Fifth: no ACK, no processing.
    if seg.flags & ACK == 0 {
        return;
    }

    if !process_ack(stack, id, seg, now) {
        return;
    }

    // Sixth: urgent pointer is recorded but never delivered.
    if seg.flags & URG != 0 {
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.rcv_up = pcb.rcv_up.max(seg.up);
    }

    // Seventh: segment text.
    process_text(stack, id, seg, pbuf);

    // Eighth: FIN.
    if seg.flags & FIN != 0 {
        process_fin(stack, id, seg, now);
    }
}

/// ACK processing. Returns false when the caller must stop (PCB freed
/// or segment rejected).
fn process_ack(stack: &mut Stack, id: usize, seg: &Segment, now: u32) -> bool {
    let state = stack.tcp.pcbs[id].state;

    if state == TcpState::SynReceived {
        let ok = {
            let pcb = &stack.tcp.pcbs[id];
            seq_gt(seg.ack, pcb.snd_una) && seq_lte(seg.ack, pcb.snd_nxt)
        };
        if !ok {
            send_segment(stack, id, RST).ok();
            return false;
        }
        {
            let pcb = &mut stack.tcp.pcbs[id];
            pcb.snd_una = seg.ack;
            pcb.snd_wnd = seg.wnd as u32;
            pcb.snd_wl1 = seg.seq;
            pcb.snd_wl2 = seg.ack;
            pcb.rtx_count = 0;
            pcb.rto = TCP_RTO_INIT;
            pcb.set_state(id, TcpState::Established, now);
        }
        // Hand the new connection to the application.
        let accept_fn = stack.tcp.pcbs[id].accept_fn;
        if let Some(f) = accept_fn {
            f(stack, TcpId(id));
        }
        return true;
    }

    let ack_of_unsent = {
        let pcb = &mut stack.tcp.pcbs[id];

        if seq_gt(seg.ack, pcb.snd_nxt) {
            true
        } else {
            if seq_gt(seg.ack, pcb.snd_una) {
                let acked = seg.ack.wrapping_sub(pcb.snd_una) as usize;
                // SYN/FIN occupy sequence space but not buffer bytes.
                let data_acked = acked.min(pcb.send_buf.len());
                pcb.send_buf.drop_front(data_acked);
                pcb.snd_una = seg.ack;
                pcb.rtx_count = 0;
                pcb.rto = TCP_RTO_INIT;
                pcb.last_send = now;
            }
            // Window update, gated so stale segments cannot shrink it.
            if seq_gte(seg.ack, pcb.snd_una) && seq_lte(seg.ack, pcb.snd_nxt) {
                if seq_lt(pcb.snd_wl1, seg.seq)
                    || (pcb.snd_wl1 == seg.seq && seq_lte(pcb.snd_wl2, seg.ack))
                {
                    pcb.snd_wnd = seg.wnd as u32;
                    pcb.snd_wl1 = seg.seq;
                    pcb.snd_wl2 = seg.ack;
                }
            }
            false
        }
    };

    if ack_of_unsent {
        // Acknowledgment of data never sent: re-ACK and drop.
        send_segment(stack, id, ACK).ok();
        return false;
    }

    // Freed buffer space or a freshly opened window may unblock queued
    // stream data, including after a bare window update.
    push_output(stack, id, false);

    // State-specific consequences of the acknowledgment.
    let fin_acked = {
        let pcb = &stack.tcp.pcbs[id];
        pcb.snd_una == pcb.snd_nxt
    };
    let state = stack.tcp.pcbs[id].state;
    match state {
        TcpState::FinWait1 if fin_acked => {
            stack.tcp.pcbs[id].set_state(id, TcpState::FinWait2, now);
        }
        TcpState::Closing if fin_acked => {
            stack.tcp.pcbs[id].set_state(id, TcpState::TimeWait, now);
        }
        TcpState::LastAck if fin_acked => {
            free_pcb(stack, id);
            return false;
        }
        _ => {}
    }

    true
}

/// Deliver in-order segment text to the receive buffer and ACK it.
fn process_text(stack: &mut Stack, id: usize, seg: &Segment, pbuf: PbufId) {
    if seg.len == 0 {
        return;
    }
    let state = stack.tcp.pcbs[id].state;
    match state {
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
        // The peer already sent FIN; late text is ignored.
        _ => return,
    }

    if seg.seq != stack.tcp.pcbs[id].rcv_nxt {
        // In-window but out of order: this stack keeps no reassembly
        // buffer, so the bytes are dropped and the duplicate ACK asks
        // for a retransmit in order.
        send_segment(stack, id, ACK).ok();
        return;
    }

    let taken = {
        let Stack { ref pool, ref mut tcp, .. } = *stack;
        let pcb = &mut tcp.pcbs[id];
        let payload = &pool.bytes(pbuf)[seg.payload_off..seg.payload_off + seg.len];
        pcb.recv_buf.push(payload)
    };

    if taken > 0 {
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(taken as u32);
        pcb.update_rcv_wnd();
    }
    // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
    send_segment(stack, id, ACK).ok();
}

/// FIN processing: the peer has no more data to send.
fn process_fin(stack: &mut Stack, id: usize, seg: &Segment, now: u32) {
    // The FIN is only valid once all text before it was consumed.
    if stack.tcp.pcbs[id].rcv_nxt != seg.seq.wrapping_add(seg.len as u32) {
        return;
    }

    notify(stack, id, TcpEvent::Close);
    {
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(1);
    }
    send_segment(stack, id, ACK).ok();

    let fin_acked = {
        let pcb = &stack.tcp.pcbs[id];
        pcb.snd_una == pcb.snd_nxt
    };

    let state = stack.tcp.pcbs[id].state;
    match state {
        TcpState::SynReceived | TcpState::Established => {
            stack.tcp.pcbs[id].set_state(id, TcpState::CloseWait, now);
        }
        TcpState::FinWait1 => {
            if fin_acked {
                stack.tcp.pcbs[id].set_state(id, TcpState::TimeWait, now);
            } else {
                stack.tcp.pcbs[id].set_state(id, TcpState::Closing, now);
            }
        }
        TcpState::FinWait2 => {
            stack.tcp.pcbs[id].set_state(id, TcpState::TimeWait, now);
        }
        // CLOSE_WAIT, CLOSING, LAST_ACK: remain; TIME_WAIT is handled
        // before the acceptability check.
        _ => {}
    }
}
