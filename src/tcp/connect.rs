//! Connection lifecycle: PCB allocation, bind, passive and active open,
//! callback registration, and orderly close.

use log::debug;

use crate::error::{Error, Result};
use crate::stack::Stack;
use crate::types::Ipv4Addr;

use super::send::{output_accepted, send_segment};
use super::tcb::*;
use super::util::free_pcb;

/// Find a FREE PCB. The slot is claimed by the following `bind`.
pub fn new(stack: &mut Stack) -> Result<TcpId> {
    for (i, pcb) in stack.tcp.pcbs.iter().enumerate() {
        if pcb.state == TcpState::Free {
            return Ok(TcpId(i));
        }
    }
    Err(Error::OutOfMemory)
}

/// Bind a PCB to a local address and port.
pub fn bind(stack: &mut Stack, id: TcpId, ip: Ipv4Addr, port: u16) -> Result<()> {
    if id.0 >= TCP_PCB_COUNT {
        return Err(Error::BadId);
    }
    if !matches!(stack.tcp.pcbs[id.0].state, TcpState::Free | TcpState::Bound) {
        return Err(Error::BadState);
    }
    for (i, pcb) in stack.tcp.pcbs.iter().enumerate() {
        if i != id.0
            && matches!(pcb.state, TcpState::Bound | TcpState::Listen)
            && pcb.local_ip == ip
            && pcb.local_port == port
        {
            return Err(Error::InUse);
        }
    }

    let now = stack.now();
    let pcb = &mut stack.tcp.pcbs[id.0];
    pcb.local_ip = ip;
    pcb.local_port = port;
    pcb.set_state(id.0, TcpState::Bound, now);
    Ok(())
}

/// Passive open: accept connection requests on the bound endpoint.
pub fn listen(stack: &mut Stack, id: TcpId) -> Result<()> {
    if id.0 >= TCP_PCB_COUNT {
        return Err(Error::BadId);
    }
    if stack.tcp.pcbs[id.0].state != TcpState::Bound {
        return Err(Error::NotBound);
    }
    let now = stack.now();
    stack.tcp.pcbs[id.0].set_state(id.0, TcpState::Listen, now);
    Ok(())
}

/// Register the accept callback on a listener. Spawned connections
/// inherit it and fire it when their handshake completes.
pub fn accept(stack: &mut Stack, id: TcpId, f: TcpAcceptFn) -> Result<()> {
    let pcb = stack.tcp.pcbs.get_mut(id.0).ok_or(Error::BadId)?;
    if pcb.state != TcpState::Listen {
        return Err(Error::NotListening);
    }
    pcb.accept_fn = Some(f);
    Ok(())
}

/// Register the event callback (connect completion, close, reset).
pub fn notify(stack: &mut Stack, id: TcpId, f: TcpNotifyFn) -> Result<()> {
    let pcb = stack.tcp.pcbs.get_mut(id.0).ok_or(Error::BadId)?;
    if pcb.state == TcpState::Free {
        return Err(Error::BadState);
    }
    pcb.notify_fn = Some(f);
    Ok(())
}

/// Active open: send a SYN toward a remote endpoint. Completion is
/// polled with [`is_connected`] or observed via `TcpEvent::Connected`.
pub fn connect(stack: &mut Stack, id: TcpId, remote_ip: Ipv4Addr, remote_port: u16) -> Result<()> {
    if id.0 >= TCP_PCB_COUNT {
        return Err(Error::BadId);
    }
    if stack.tcp.pcbs[id.0].state != TcpState::Bound {
        return Err(Error::BadState);
    }

    let now = stack.now();
    {
        let pcb = &mut stack.tcp.pcbs[id.0];
        pcb.remote_ip = remote_ip;
        pcb.remote_port = remote_port;

        pcb.iss = now;
        pcb.snd_una = pcb.iss;
        pcb.snd_nxt = pcb.iss;
        pcb.snd_wnd = 0;
        pcb.snd_wl1 = 0;
        pcb.snd_wl2 = 0;
        pcb.snd_up = 0;
        pcb.rcv_wnd = TCP_DEF_WINDOW;
        pcb.rto = TCP_RTO_INIT;
        pcb.rtx_count = 0;
    }

    // <SEQ=ISS><CTL=SYN>; an ARP miss still counts, the sweeper will
    // retransmit the SYN once the address is learned.
    let result = send_segment(stack, id.0, SYN);
    if output_accepted(&result) {
        stack.tcp.pcbs[id.0].set_state(id.0, TcpState::SynSent, now);
        Ok(())
    } else {
        result
    }
}

/// True once the connection reached ESTABLISHED.
pub fn is_connected(stack: &Stack, id: TcpId) -> bool {
    stack
        .tcp
        .pcbs
        .get(id.0)
        .map(|pcb| pcb.state == TcpState::Established)
        .unwrap_or(false)
}

/// Current state of a PCB, for polling loops and diagnostics.
pub fn state(stack: &Stack, id: TcpId) -> Result<TcpState> {
    stack.tcp.pcbs.get(id.0).map(|pcb| pcb.state).ok_or(Error::BadId)
}

/// Remote address of a connected PCB.
pub fn remote_addr(stack: &Stack, id: TcpId) -> Option<Ipv4Addr> {
    stack
        .tcp
        .pcbs
        .get(id.0)
        .filter(|pcb| pcb.is_synchronized())
        .map(|pcb| pcb.remote_ip)
}

/// Remote port of a connected PCB.
pub fn remote_port(stack: &Stack, id: TcpId) -> Option<u16> {
    stack
        .tcp
        .pcbs
        .get(id.0)
        .filter(|pcb| pcb.is_synchronized())
        .map(|pcb| pcb.remote_port)
}

/// Orderly shutdown. The effect depends on the connection state: idle
/// PCBs are released immediately, synchronized ones send FIN and walk
/// the closing handshake, and an already-closing PCB reports that.
pub fn close(stack: &mut Stack, id: TcpId) -> Result<()> {
    if id.0 >= TCP_PCB_COUNT {
        return Err(Error::BadId);
    }

    let now = stack.now();
    let state = stack.tcp.pcbs[id.0].state;
    debug!("tcp: close pcb {} in {:?}", id.0, state);

    match state {
        TcpState::Free => Ok(()),

        TcpState::Bound | TcpState::Listen | TcpState::SynSent => {
            free_pcb(stack, id.0);
            Ok(())
        }

        // No pending sends are queued here: emit FIN and wait for its ACK.
        TcpState::SynReceived | TcpState::Established => {
            let result = send_segment(stack, id.0, FIN | ACK);
            if output_accepted(&result) {
                stack.tcp.pcbs[id.0].set_state(id.0, TcpState::FinWait1, now);
                Ok(())
            } else {
                result
            }
        }

        TcpState::CloseWait => {
            let result = send_segment(stack, id.0, FIN | ACK);
            if output_accepted(&result) {
                stack.tcp.pcbs[id.0].set_state(id.0, TcpState::LastAck, now);
                Ok(())
            } else {
                result
            }
        }

        TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::Closing
        | TcpState::LastAck
        | TcpState::TimeWait => Err(Error::Closing),
    }
}
