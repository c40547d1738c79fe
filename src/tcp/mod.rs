//! TCP — connection-oriented, reliable byte-stream transport.
//!
//! Active open (connect) and passive open (listen/accept) over a fixed
//! PCB table, in-order delivery through per-connection circular
//! buffers, single-timer retransmission with exponential backoff, and
//! orderly close per RFC 793.
//!
//! ## Module structure
//!
//! - `tcb` — protocol control block, states, constants, segment parser
//! - `ring` — circular byte buffer for the send/receive streams
//! - `send` — segment builders and the data-send engine
//! - `recv` — pull-based receive path
//! - `input` — incoming segment dispatch and state machine
//! - `connect` — connection lifecycle (bind/listen/accept/connect/close)
//! - `timer` — retransmission and timeout sweeper
//! - `util` — sequence arithmetic, PCB lookup, reset generation

pub(crate) mod input;
pub(crate) mod ring;
pub(crate) mod send;
pub(crate) mod tcb;
pub(crate) mod timer;
pub(crate) mod util;

mod connect;
mod recv;

use alloc::vec::Vec;

use crate::error::Result;
use crate::stack::{Protocol, Stack};

pub use connect::{
    accept, bind, close, connect, is_connected, listen, new, notify, remote_addr, remote_port,
    state,
};
pub use recv::{available, recv};
pub use send::send;
pub use tcb::{
    TcpAcceptFn, TcpEvent, TcpId, TcpNotifyFn, TcpState, MSS, TCP_DATA_BUF_SIZE, TCP_DEF_WINDOW,
    TCP_HSTATE_TIMEOUT, TCP_MSL_TIMEOUT, TCP_PCB_COUNT,
};

/// The PCB table, owned by the stack registry.
pub(crate) struct TcpContext {
    pub(crate) pcbs: Vec<tcb::TcpPcb>,
}

impl TcpContext {
    pub(crate) fn new() -> Self {
        let mut pcbs = Vec::with_capacity(TCP_PCB_COUNT);
        for _ in 0..TCP_PCB_COUNT {
            pcbs.push(tcb::TcpPcb::new());
        }
        TcpContext { pcbs }
    }
}

/// Register the TCP input handler and the 250 ms timeout sweeper.
pub fn init(stack: &mut Stack) -> Result<()> {
    stack.set_protocol_handler(Protocol::Tcp, input::input);
    stack.set_timer(tcb::TCP_SWEEP_INTERVAL_MS, timer::sweep)
}
