//! TCP segment construction and the data-send engine.
//!
//! Three builder paths share one pseudo-header checksum: bare resets
//! (no options), SYN/SYN+ACK (timestamp + MSS options, 16 bytes), and
//! everything else (timestamp option, 12 bytes). Data segments ride
//! the normal path with payload appended.

use log::trace;

use crate::checksum;
use crate::error::{Error, Result};
use crate::ipv4::{self, TRANSPORT_OFFSET};
use crate::stack::{Protocol, Stack};

use super::tcb::*;
use super::util::fill_header;

/// Timestamp option: kind 8, length 10, tsval, tsecho.
fn write_timestamp(buf: &mut [u8], tsval: u32, tsecho: u32) {
    buf[0] = 8;
    buf[1] = 10;
    buf[2..6].copy_from_slice(&tsval.to_be_bytes());
    buf[6..10].copy_from_slice(&tsecho.to_be_bytes());
}

/// Build and transmit one segment for a connection at an explicit
/// sequence number. Does not advance SND.NXT; callers own that.
pub(crate) fn emit_segment(stack: &mut Stack, id: usize, seq: u32, flags: u8, payload: &[u8]) -> Result<()> {
    let now = stack.now();
    let (local_ip, local_port, remote_ip, remote_port, ack, wnd, up, peer_ts) = {
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.snd_ts = now;
        pcb.update_rcv_wnd();
        (
            pcb.local_ip,
            pcb.local_port,
            pcb.remote_ip,
            pcb.remote_port,
            if flags & ACK != 0 { pcb.rcv_nxt } else { 0 },
            pcb.rcv_wnd,
            pcb.snd_up,
            pcb.peer_ts,
        )
    };

    let opt_len = if flags & RST != 0 {
        0
    } else if flags & SYN != 0 {
        SYN_OPT_BYTES
    } else {
        OPT_BYTES
    };
    let tcp_len = TCP_HDR_LEN + opt_len + payload.len();

    let buf = stack.pool.allocate()?;
    {
        let frame = stack.pool.bytes_mut(buf);
        let tcp = &mut frame[TRANSPORT_OFFSET..TRANSPORT_OFFSET + tcp_len];
        fill_header(
            tcp,
            local_port,
            remote_port,
            seq,
            ack,
            ((TCP_HDR_LEN + opt_len) / 4) as u8,
            flags,
            wnd,
            up,
        );

        if flags & RST == 0 {
            let opts = &mut tcp[TCP_HDR_LEN..TCP_HDR_LEN + opt_len];
            write_timestamp(opts, now, peer_ts);
            if flags & SYN != 0 {
                let mss = stack.tcp.pcbs[id].snd_mss;
                opts[10] = 2;
                opts[11] = 4;
                opts[12] = (mss >> 8) as u8;
                opts[13] = (mss & 0xFF) as u8;
                opts[14] = 0; // end of option list
                opts[15] = 0;
            } else {
                opts[10] = 0;
                opts[11] = 0;
            }
        }

        if !payload.is_empty() {
            tcp[TCP_HDR_LEN + opt_len..].copy_from_slice(payload);
        }

        let pseudo = checksum::pseudo_header_sum(
            local_ip.as_bytes(),
            remote_ip.as_bytes(),
            Protocol::Tcp as u8,
            tcp_len as u16,
        );
        let sum = checksum::checksum_with(pseudo, tcp);
        tcp[16] = (sum >> 8) as u8;
        tcp[17] = (sum & 0xFF) as u8;
    }

    stack.stats.tcp_segments_sent += 1;
    if flags & RST != 0 {
        stack.stats.tcp_resets_sent += 1;
    }
    ipv4::output(stack, remote_ip, Protocol::Tcp, buf, tcp_len)
}

/// True when an output result still advances the connection: an ARP
/// miss drops the frame but the retransmit discipline recovers it.
pub(crate) fn output_accepted(result: &Result<()>) -> bool {
    matches!(result, Ok(()) | Err(Error::ArpPending))
}

/// Send a control segment at SND.NXT (or SEG.ACK for resets) and
/// advance SND.NXT over SYN/FIN on success.
pub(crate) fn send_segment(stack: &mut Stack, id: usize, flags: u8) -> Result<()> {
    let seq = if flags & RST != 0 {
        stack.tcp.pcbs[id].seg_ack
    } else {
        stack.tcp.pcbs[id].snd_nxt
    };

    let result = emit_segment(stack, id, seq, flags, &[]);

    if flags & RST == 0 && output_accepted(&result) {
        let now = stack.now();
        let pcb = &mut stack.tcp.pcbs[id];
        let mut advance = 0u32;
        if flags & SYN != 0 {
            advance += 1;
        }
        if flags & FIN != 0 {
            advance += 1;
        }
        if advance > 0 {
            pcb.snd_nxt = pcb.snd_nxt.wrapping_add(advance);
            pcb.last_send = now;
        }
    }

    result
}

/// Largest payload for one segment: our MSS bounded by the peer's,
/// less the room the timestamp option takes in every data segment.
pub(crate) fn effective_mss(pcb: &TcpPcb) -> usize {
    let mss = if pcb.peer_mss != 0 {
        pcb.snd_mss.min(pcb.peer_mss)
    } else {
        pcb.snd_mss
    };
    (mss as usize).saturating_sub(OPT_BYTES)
}

/// Transmit as much buffered stream data as the peer window allows,
/// in at-most-MSS segments, each carrying the current ACK.
pub(crate) fn push_output(stack: &mut Stack, id: usize, push: bool) {
    loop {
        let (seq, chunk_len, last_chunk, chunk) = {
            let pcb = &stack.tcp.pcbs[id];
            if !matches!(pcb.state, TcpState::Established | TcpState::CloseWait) {
                return;
            }

            let in_flight = pcb.in_flight() as usize;
            let unsent = pcb.send_buf.len().saturating_sub(in_flight);
            if unsent == 0 {
                return;
            }
            if in_flight as u32 >= pcb.snd_wnd {
                trace!("tcp: pcb {} window full ({} in flight)", id, in_flight);
                return;
            }

            let room = (pcb.snd_wnd as usize) - in_flight;
            let chunk_len = effective_mss(pcb).min(unsent).min(room);
            if chunk_len == 0 {
                return;
            }

            let mut chunk = [0u8; MSS as usize];
            let copied = pcb.send_buf.peek(in_flight, &mut chunk[..chunk_len]);
            (pcb.snd_nxt, copied, copied == unsent, chunk)
        };

        let flags = if push && last_chunk { ACK | PSH } else { ACK };
        let result = emit_segment(stack, id, seq, flags, &chunk[..chunk_len]);
        if !output_accepted(&result) {
            return;
        }

        let now = stack.now();
        let pcb = &mut stack.tcp.pcbs[id];
        pcb.snd_nxt = pcb.snd_nxt.wrapping_add(chunk_len as u32);
        pcb.last_send = now;
    }
}

/// Queue application bytes for transmission. Only legal once the
/// connection is established (or half-closed by the peer). Returns the
/// byte count accepted into the send buffer.
pub fn send(stack: &mut Stack, id: TcpId, data: &[u8], push: bool) -> Result<usize> {
    let pcb = stack.tcp.pcbs.get_mut(id.0).ok_or(Error::BadId)?;
    match pcb.state {
        TcpState::Established | TcpState::CloseWait => {}
        TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => {
            return Err(Error::Closing);
        }
        _ => return Err(Error::BadState),
    }

    let accepted = pcb.send_buf.push(data);
    push_output(stack, id.0, push);
    Ok(accepted)
}
