//! TCP protocol control block, connection states, protocol constants,
//! and the incoming-segment parser.

use log::debug;

use crate::ipv4::Ipv4Header;
use crate::stack::Stack;
use crate::types::Ipv4Addr;

use super::ring::RingBuffer;

// ── TCP header flags ────────────────────────────────────────────────
pub(crate) const FIN: u8 = 0x01;
pub(crate) const SYN: u8 = 0x02;
pub(crate) const RST: u8 = 0x04;
pub(crate) const PSH: u8 = 0x08;
pub(crate) const ACK: u8 = 0x10;
pub(crate) const URG: u8 = 0x20;

// ── Protocol constants ──────────────────────────────────────────────
pub(crate) const TCP_HDR_LEN: usize = 20;
/// Number of connection slots.
pub const TCP_PCB_COUNT: usize = 8;
/// Per-connection send/receive buffer capacity. Must be a power of two.
pub const TCP_DATA_BUF_SIZE: usize = 2048;
/// Initial advertised receive window.
pub const TCP_DEF_WINDOW: u16 = TCP_DATA_BUF_SIZE as u16;
/// Advertised maximum segment size.
pub const MSS: u16 = 1460;
/// Maximum segment lifetime; TIME_WAIT lasts twice this.
pub const TCP_MSL_TIMEOUT: u32 = 30_000;
/// Lifetime cap for half-open states (SYN_SENT, SYN_RECEIVED, LAST_ACK).
pub const TCP_HSTATE_TIMEOUT: u32 = 30_000;
/// Initial retransmission timeout (RFC 1122 recommendation).
pub(crate) const TCP_RTO_INIT: u32 = 1_000;
/// Backoff ceiling for the retransmission timeout.
pub(crate) const TCP_RTO_MAX: u32 = 60_000;
/// Retransmissions before the connection is aborted.
pub(crate) const TCP_MAX_RETRANSMITS: u8 = 6;
/// Timeout sweeper period.
pub(crate) const TCP_SWEEP_INTERVAL_MS: u32 = 250;

/// SYN-path options: timestamp (10) + MSS (4) + end-of-option pad (2).
pub(crate) const SYN_OPT_BYTES: usize = 16;
/// Normal-path options: timestamp (10) + end-of-option pad (2).
pub(crate) const OPT_BYTES: usize = 12;

// ── Connection state machine (RFC 793) ──────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Free,
    Bound,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Events surfaced to the application through the notify callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpEvent {
    /// An active open completed the handshake.
    Connected,
    /// The peer sent FIN; remaining data is still readable.
    Close,
    /// The peer reset the connection, or retransmission gave up.
    RemoteRst,
}

/// Handle to a TCP PCB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpId(pub(crate) usize);

/// Called on a listener's behalf when a handshake completes.
pub type TcpAcceptFn = fn(&mut Stack, TcpId);
/// Called on connection events (connect completion, close, reset).
pub type TcpNotifyFn = fn(&mut Stack, TcpId, TcpEvent);

// ── Parsed incoming segment ─────────────────────────────────────────

/// Header fields of the segment under processing. `payload` addresses
/// the text inside the input pbuf; `len` excludes options.
pub(crate) struct Segment {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub wnd: u16,
    pub up: u16,
    pub payload_off: usize,
    pub len: usize,
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub tsval: Option<u32>,
}

/// Parse the TCP header and options out of a validated IPv4 frame.
/// Returns `None` for structurally bad headers or malformed options.
pub(crate) fn parse_segment(frame: &[u8], header: &Ipv4Header) -> Option<Segment> {
    let tcp_off = crate::ethernet::ETH_HEADER_LEN + header.header_len;
    let tcp_len = header.total_len - header.header_len;
    if tcp_len < TCP_HDR_LEN || frame.len() < tcp_off + tcp_len {
        return None;
    }
    let tcp = &frame[tcp_off..tcp_off + tcp_len];

    let data_off = ((tcp[12] >> 4) as usize) * 4;
    if data_off < TCP_HDR_LEN || data_off > tcp_len {
        return None;
    }

    let mut mss = None;
    let mut wscale = None;
    let mut tsval = None;

    let opts = &tcp[TCP_HDR_LEN..data_off];
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break, // end of option list, rest is padding
            1 => i += 1,
            kind => {
                if i + 1 >= opts.len() {
                    return None;
                }
                let olen = opts[i + 1] as usize;
                if olen < 2 || i + olen > opts.len() {
                    return None;
                }
                match kind {
                    2 if olen == 4 => {
                        mss = Some(((opts[i + 2] as u16) << 8) | opts[i + 3] as u16);
                    }
                    3 if olen == 3 => {
                        wscale = Some(opts[i + 2]);
                    }
                    8 if olen == 10 => {
                        tsval = Some(u32::from_be_bytes([
                            opts[i + 2],
                            opts[i + 3],
                            opts[i + 4],
                            opts[i + 5],
                        ]));
                    }
                    _ => {} // unrecognized, skip by length
                }
                i += olen;
            }
        }
    }

    Some(Segment {
        src_ip: header.src,
        dst_ip: header.dst,
        src_port: ((tcp[0] as u16) << 8) | tcp[1] as u16,
        dst_port: ((tcp[2] as u16) << 8) | tcp[3] as u16,
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: tcp[13] & 0x3F,
        wnd: ((tcp[14] as u16) << 8) | tcp[15] as u16,
        up: ((tcp[18] as u16) << 8) | tcp[19] as u16,
        payload_off: tcp_off + data_off,
        len: tcp_len - data_off,
        mss,
        wscale,
        tsval,
    })
}

// ── Protocol control block ──────────────────────────────────────────

pub(crate) struct TcpPcb {
    pub state: TcpState,
    /// Timestamp of the most recent state transition.
    pub time_in_state: u32,

    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,

    // Send sequence space (RFC 793 §3.2)
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    pub snd_up: u16,

    // Receive sequence space
    pub irs: u32,
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub rcv_up: u16,

    // Current-segment scratch
    pub seg_seq: u32,
    pub seg_ack: u32,
    pub seg_len: u32,
    pub seg_wnd: u16,
    pub seg_up: u16,

    // Options: ours and the peer's
    pub snd_mss: u16,
    pub snd_ts: u32,
    pub peer_mss: u16,
    pub peer_wscale: u8,
    pub peer_ts: u32,

    // Stream buffers
    pub send_buf: RingBuffer,
    pub recv_buf: RingBuffer,

    // Retransmission
    pub rto: u32,
    pub rtx_count: u8,
    pub last_send: u32,

    pub accept_fn: Option<TcpAcceptFn>,
    pub notify_fn: Option<TcpNotifyFn>,
}

impl TcpPcb {
    pub fn new() -> Self {
        TcpPcb {
            state: TcpState::Free,
            time_in_state: 0,
            local_ip: Ipv4Addr::ZERO,
            local_port: 0,
            remote_ip: Ipv4Addr::ZERO,
            remote_port: 0,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            snd_up: 0,
            irs: 0,
            rcv_nxt: 0,
            rcv_wnd: 0,
            rcv_up: 0,
            seg_seq: 0,
            seg_ack: 0,
            seg_len: 0,
            seg_wnd: 0,
            seg_up: 0,
            snd_mss: MSS,
            snd_ts: 0,
            peer_mss: 0,
            peer_wscale: 0,
            peer_ts: 0,
            send_buf: RingBuffer::new(TCP_DATA_BUF_SIZE),
            recv_buf: RingBuffer::new(TCP_DATA_BUF_SIZE),
            rto: TCP_RTO_INIT,
            rtx_count: 0,
            last_send: 0,
            accept_fn: None,
            notify_fn: None,
        }
    }

    /// Return the PCB to FREE with every identity, sequence and buffer
    /// field cleared. The buffer storage itself is kept.
    pub fn reset(&mut self) {
        self.state = TcpState::Free;
        self.time_in_state = 0;
        self.local_ip = Ipv4Addr::ZERO;
        self.local_port = 0;
        self.remote_ip = Ipv4Addr::ZERO;
        self.remote_port = 0;
        self.iss = 0;
        self.snd_una = 0;
        self.snd_nxt = 0;
        self.snd_wnd = 0;
        self.snd_wl1 = 0;
        self.snd_wl2 = 0;
        self.snd_up = 0;
        self.irs = 0;
        self.rcv_nxt = 0;
        self.rcv_wnd = 0;
        self.rcv_up = 0;
        self.seg_seq = 0;
        self.seg_ack = 0;
        self.seg_len = 0;
        self.seg_wnd = 0;
        self.seg_up = 0;
        self.snd_mss = MSS;
        self.snd_ts = 0;
        self.peer_mss = 0;
        self.peer_wscale = 0;
        self.peer_ts = 0;
        self.send_buf.clear();
        self.recv_buf.clear();
        self.rto = TCP_RTO_INIT;
        self.rtx_count = 0;
        self.last_send = 0;
        self.accept_fn = None;
        self.notify_fn = None;
    }

    pub fn set_state(&mut self, id: usize, state: TcpState, now: u32) {
        debug!("tcp: pcb {} {:?} -> {:?}", id, self.state, state);
        self.state = state;
        self.time_in_state = now;
    }

    /// Window to advertise: free receive-buffer space.
    pub fn advertised_window(&self) -> u16 {
        self.recv_buf.free().min(u16::MAX as usize) as u16
    }

    /// Refresh RCV.WND after buffer occupancy changed.
    pub fn update_rcv_wnd(&mut self) {
        self.rcv_wnd = self.advertised_window();
    }

    /// Bytes of stream data sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// True in states where sequence numbers have been synchronized.
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self.state,
            TcpState::Free | TcpState::Bound | TcpState::Listen | TcpState::SynSent
        )
    }
}
