//! Pull-based receive path: the application drains the per-connection
//! receive buffer from its main loop. There is no data callback.

use crate::error::{Error, Result};
use crate::stack::Stack;

use super::send::send_segment;
use super::tcb::*;

/// Pull up to `buf.len()` bytes of in-order stream data.
///
/// Returns `Closing` once the peer has sent FIN and the buffer is
/// drained, and `Closed` for unopened connections. While the handshake
/// is still running there is nothing to queue against, which surfaces
/// as `OutOfMemory`.
pub fn recv(stack: &mut Stack, id: TcpId, buf: &mut [u8]) -> Result<usize> {
    let state = stack.tcp.pcbs.get(id.0).ok_or(Error::BadId)?.state;

    match state {
        TcpState::Free | TcpState::Bound => Err(Error::Closed),
        TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => Err(Error::OutOfMemory),
        TcpState::CloseWait => {
            if stack.tcp.pcbs[id.0].recv_buf.is_empty() {
                // The peer sent FIN and everything before it was read.
                Err(Error::Closing)
            } else {
                Ok(drain(stack, id.0, buf))
            }
        }
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => Ok(drain(stack, id.0, buf)),
        TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => Err(Error::Closing),
    }
}

/// Bytes waiting in the receive buffer.
pub fn available(stack: &Stack, id: TcpId) -> Result<usize> {
    let pcb = stack.tcp.pcbs.get(id.0).ok_or(Error::BadId)?;
    Ok(pcb.recv_buf.len())
}

fn drain(stack: &mut Stack, id: usize, buf: &mut [u8]) -> usize {
    let (n, reopened) = {
        let pcb = &mut stack.tcp.pcbs[id];
        let was_closed = pcb.rcv_wnd == 0;
        let n = pcb.recv_buf.pop(buf);
        pcb.update_rcv_wnd();
        (n, was_closed && n > 0)
    };

    // A zero window kept the peer from sending; announce the space
    // that just opened up (RFC 1122 4.2.3.3).
    if reopened {
        send_segment(stack, id, ACK).ok();
    }

    n
}
