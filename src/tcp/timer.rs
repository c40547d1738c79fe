//! Timeout sweeper, run every 250 ms from the stack timer table.
//!
//! Responsibilities: expire TIME_WAIT after 2*MSL, bound the lifetime
//! of half-open states, and drive the per-connection retransmission
//! timer with exponential backoff.

use log::{debug, warn};

use crate::stack::Stack;

use super::send::{effective_mss, emit_segment};
use super::tcb::*;
use super::util::{free_pcb, notify};

/// Scan the PCB table for expired timers.
pub fn sweep(stack: &mut Stack, now: u32) {
    for id in 0..TCP_PCB_COUNT {
        let state = stack.tcp.pcbs[id].state;
        match state {
            TcpState::TimeWait => {
                if now.wrapping_sub(stack.tcp.pcbs[id].time_in_state) >= 2 * TCP_MSL_TIMEOUT {
                    free_pcb(stack, id);
                }
            }

            TcpState::SynSent | TcpState::SynReceived | TcpState::LastAck => {
                if now.wrapping_sub(stack.tcp.pcbs[id].time_in_state) >= TCP_HSTATE_TIMEOUT {
                    debug!("tcp: pcb {} half-open timeout", id);
                    free_pcb(stack, id);
                } else {
                    check_retransmit(stack, id, now);
                }
            }

            TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait1
            | TcpState::Closing => {
                check_retransmit(stack, id, now);
            }

            _ => {}
        }
    }
}

/// Retransmit the head of the un-ACKed sequence space when its timer
/// expires, doubling the timeout each round up to a fixed ceiling.
fn check_retransmit(stack: &mut Stack, id: usize, now: u32) {
    let due = {
        let pcb = &stack.tcp.pcbs[id];
        pcb.in_flight() > 0 && now.wrapping_sub(pcb.last_send) >= pcb.rto
    };
    if !due {
        return;
    }

    if stack.tcp.pcbs[id].rtx_count >= TCP_MAX_RETRANSMITS {
        warn!("tcp: pcb {} retransmit limit reached, aborting", id);
        notify(stack, id, TcpEvent::RemoteRst);
        free_pcb(stack, id);
        return;
    }

    {
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.rtx_count += 1;
        pcb.rto = (pcb.rto.saturating_mul(2)).min(TCP_RTO_MAX);
        pcb.last_send = now;
    }
    stack.stats.tcp_retransmits += 1;

    let state = stack.tcp.pcbs[id].state;
    match state {
        TcpState::SynSent => {
            let iss = stack.tcp.pcbs[id].iss;
            emit_segment(stack, id, iss, SYN, &[]).ok();
        }
        TcpState::SynReceived => {
            let iss = stack.tcp.pcbs[id].iss;
            emit_segment(stack, id, iss, SYN | ACK, &[]).ok();
        }
        TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => {
            retransmit_data(stack, id);
            // The FIN occupies the last sequence number in flight.
            let seq = stack.tcp.pcbs[id].snd_nxt.wrapping_sub(1);
            emit_segment(stack, id, seq, FIN | ACK, &[]).ok();
        }
        TcpState::Established | TcpState::CloseWait => {
            retransmit_data(stack, id);
        }
        _ => {}
    }
}

/// Resend the oldest un-ACKed stream bytes (one segment's worth).
fn retransmit_data(stack: &mut Stack, id: usize) {
    let (seq, len, chunk) = {
        let pcb = &stack.tcp.pcbs[id];
        if pcb.send_buf.is_empty() {
            return;
        }
        let mut chunk = [0u8; MSS as usize];
        let len = effective_mss(pcb).min(pcb.send_buf.len());
        let copied = pcb.send_buf.peek(0, &mut chunk[..len]);
        (pcb.snd_una, copied, chunk)
    };
    if len == 0 {
        return;
    }

    debug!("tcp: pcb {} retransmit seq={} len={}", id, seq, len);
    // Failures just wait for the next sweep.
    emit_segment(stack, id, seq, ACK | PSH, &chunk[..len]).ok();
}
