//! Stack registry: the single owning context for every process-wide
//! table (buffer pool, interfaces, routes, timers, protocol handlers,
//! UDP/TCP PCBs).
//!
//! The registry is passed `&mut` through every public entry point. One
//! thread of control drives it: a main loop alternating between
//! `poll()` and application work. There are no locks because there is
//! nothing to lock against.

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::debug;

use crate::error::{Error, Result};
use crate::netif::NetIf;
use crate::pbuf::{PbufId, PbufPool};
use crate::types::Ipv4Addr;
use crate::{icmp, netif, tcp, udp};

/// Maximum number of attached interfaces.
pub const INTERFACE_COUNT: usize = 2;
/// Route table slots.
pub const ROUTE_TABLE_LENGTH: usize = 4;
/// Periodic timer slots.
pub const TIMER_COUNT: usize = 4;

/// Monotonic millisecond clock. Timeout arithmetic wraps, so a 32-bit
/// counter is sufficient.
pub trait TimeSource {
    fn now(&self) -> u32;
}

/// IPv4 protocols the stack dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl Protocol {
    pub fn from_byte(b: u8) -> Option<Protocol> {
        match b {
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

/// Protocol input handler: (stack, ingress interface, pbuf holding the
/// full frame). The handler borrows the pbuf; the input loop frees it.
pub type ProtocolHandler = fn(&mut Stack, usize, PbufId);

/// Periodic timer callback, invoked with the current time.
pub type TimerFn = fn(&mut Stack, u32);

#[derive(Clone, Copy)]
struct TimerSlot {
    interval_ms: u32,
    last_run: u32,
    f: TimerFn,
}

/// One routing table entry. An empty slot has `gateway == 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    pub dest_net: Ipv4Addr,
    pub net_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub ifnum: usize,
}

impl RouteEntry {
    const EMPTY: RouteEntry = RouteEntry {
        dest_net: Ipv4Addr::ZERO,
        net_mask: Ipv4Addr::ZERO,
        gateway: Ipv4Addr::ZERO,
        ifnum: 0,
    };

    fn is_empty(&self) -> bool {
        self.gateway == Ipv4Addr::ZERO
    }
}

/// Drop and error counters. All bumps happen on the main thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct StackStats {
    pub ip_header_errs: u32,
    pub ip_addr_drops: u32,
    pub frag_drops: u32,
    pub proto_drops: u32,
    pub arp_drops: u32,
    pub icmp_drops: u32,
    pub udp_drops: u32,
    pub udp_checksum_errs: u32,
    pub tcp_checksum_errs: u32,
    pub tcp_drops: u32,
    pub tcp_segments_sent: u32,
    pub tcp_segments_recv: u32,
    pub tcp_retransmits: u32,
    pub tcp_resets_sent: u32,
}

pub struct Stack {
    hostname: &'static str,
    time: Box<dyn TimeSource>,

    pub(crate) pool: PbufPool,
    pub(crate) interfaces: Vec<NetIf>,
    routes: [RouteEntry; ROUTE_TABLE_LENGTH],
    timers: [Option<TimerSlot>; TIMER_COUNT],

    icmp_handler: Option<ProtocolHandler>,
    udp_handler: Option<ProtocolHandler>,
    tcp_handler: Option<ProtocolHandler>,

    pub(crate) icmp_echo_fn: Option<icmp::IcmpEchoFn>,
    pub(crate) udp: udp::UdpContext,
    pub(crate) tcp: tcp::TcpContext,

    ip_id: u16,
    pub stats: StackStats,
}

impl Stack {
    /// Build an empty registry. Interfaces are attached afterwards and
    /// the protocol modules register themselves via their `init`.
    pub fn new(hostname: &'static str, time: Box<dyn TimeSource>) -> Self {
        Stack {
            hostname,
            time,
            pool: PbufPool::new(),
            interfaces: Vec::with_capacity(INTERFACE_COUNT),
            routes: [RouteEntry::EMPTY; ROUTE_TABLE_LENGTH],
            timers: [None; TIMER_COUNT],
            icmp_handler: None,
            udp_handler: None,
            tcp_handler: None,
            icmp_echo_fn: None,
            udp: udp::UdpContext::new(),
            tcp: tcp::TcpContext::new(),
            ip_id: 0,
            stats: StackStats::default(),
        }
    }

    pub fn hostname(&self) -> &'static str {
        self.hostname
    }

    /// Current stack time in milliseconds.
    pub fn now(&self) -> u32 {
        self.time.now()
    }

    // ── Interfaces ──────────────────────────────────────────────────

    /// Attach an interface, returning its slot number.
    pub fn add_interface(&mut self, ifc: NetIf) -> Result<usize> {
        if self.interfaces.len() >= INTERFACE_COUNT {
            return Err(Error::Netif);
        }
        self.interfaces.push(ifc);
        Ok(self.interfaces.len() - 1)
    }

    pub fn interface(&self, ifnum: usize) -> Result<&NetIf> {
        self.interfaces.get(ifnum).ok_or(Error::Netif)
    }

    pub fn interface_mut(&mut self, ifnum: usize) -> Result<&mut NetIf> {
        self.interfaces.get_mut(ifnum).ok_or(Error::Netif)
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Insert a route into the first empty slot.
    pub fn set_route(&mut self, net_mask: Ipv4Addr, gateway: Ipv4Addr, ifnum: usize) -> Result<()> {
        if ifnum >= self.interfaces.len() {
            return Err(Error::Netif);
        }
        for slot in self.routes.iter_mut() {
            if slot.is_empty() {
                *slot = RouteEntry {
                    dest_net: Ipv4Addr::from_u32(gateway.to_u32() & net_mask.to_u32()),
                    net_mask,
                    gateway,
                    ifnum,
                };
                debug!("route: {}/{} via {} if{}", slot.dest_net, net_mask, gateway, ifnum);
                return Ok(());
            }
        }
        Err(Error::RouteTableFull)
    }

    /// Clear a route slot by index.
    pub fn clear_route(&mut self, index: usize) -> Result<()> {
        if index >= ROUTE_TABLE_LENGTH {
            return Err(Error::RouteRange);
        }
        self.routes[index] = RouteEntry::EMPTY;
        Ok(())
    }

    /// Route slot by index; `None` for empty slots.
    pub fn get_route(&self, index: usize) -> Option<RouteEntry> {
        self.routes.get(index).copied().filter(|r| !r.is_empty())
    }

    /// Find the route for a destination: first entry whose network
    /// matches under its mask, else the default (mask 0) route.
    pub fn route_lookup(&self, dest: Ipv4Addr) -> Result<RouteEntry> {
        let mut default = None;
        for route in self.routes.iter().filter(|r| !r.is_empty()) {
            if route.net_mask == Ipv4Addr::ZERO {
                default.get_or_insert(*route);
                continue;
            }
            if dest.to_u32() & route.net_mask.to_u32() == route.dest_net.to_u32() {
                return Ok(*route);
            }
        }
        default.ok_or(Error::NoRoute)
    }

    // ── Protocol dispatch ───────────────────────────────────────────

    pub fn set_protocol_handler(&mut self, protocol: Protocol, handler: ProtocolHandler) {
        match protocol {
            Protocol::Icmp => self.icmp_handler = Some(handler),
            Protocol::Udp => self.udp_handler = Some(handler),
            Protocol::Tcp => self.tcp_handler = Some(handler),
        }
    }

    pub(crate) fn protocol_handler(&self, protocol: Protocol) -> Option<ProtocolHandler> {
        match protocol {
            Protocol::Icmp => self.icmp_handler,
            Protocol::Udp => self.udp_handler,
            Protocol::Tcp => self.tcp_handler,
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Register a periodic callback.
    pub fn set_timer(&mut self, interval_ms: u32, f: TimerFn) -> Result<()> {
        let now = self.now();
        for slot in self.timers.iter_mut() {
            if slot.is_none() {
                *slot = Some(TimerSlot { interval_ms, last_run: now, f });
                return Ok(());
            }
        }
        Err(Error::TimerTableFull)
    }

    /// Fire due timers, in registration order, at most once per call.
    pub fn timers(&mut self) {
        let now = self.now();
        for i in 0..TIMER_COUNT {
            let due = match self.timers[i] {
                Some(slot) => now.wrapping_sub(slot.last_run) >= slot.interval_ms,
                None => false,
            };
            if due {
                let f = match self.timers[i].as_mut() {
                    Some(slot) => {
                        slot.last_run = now;
                        slot.f
                    }
                    None => continue,
                };
                f(self, now);
            }
        }
    }

    /// One main-loop iteration: poll every interface, then run timers.
    pub fn poll(&mut self) {
        for ifnum in 0..self.interfaces.len() {
            netif::input(self, ifnum);
        }
        self.timers();
    }

    /// Monotonic IP identification counter.
    pub(crate) fn next_ip_id(&mut self) -> u16 {
        self.ip_id = self.ip_id.wrapping_add(1);
        self.ip_id
    }
}
