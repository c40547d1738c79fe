//! Ethernet interface object and the boundary toward the physical driver.
//!
//! The stack never touches hardware: it talks to a [`LinkDriver`] trait
//! object bound into the interface at creation. Frames are polled, never
//! pushed; `input()` is called from the application's main loop.

use alloc::boxed::Box;
use bitflags::bitflags;
use log::{debug, trace};

use crate::arp::{ArpEntry, ARP_TABLE_LENGTH};
use crate::error::Result;
use crate::ethernet::{self, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::stack::Stack;
use crate::types::{Ipv4Addr, MacAddr};
use crate::{arp, ipv4};

/// Default maximum transmission unit.
pub const MTU: u16 = 1500;

bitflags! {
    /// Interface status word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IfFlags: u8 {
        const UP        = 0x01;
        const LINK_UP   = 0x02;
        const MULTICAST = 0x04;
        const BROADCAST = 0x08;
    }
}

/// Contract the physical Ethernet driver provides to the stack.
///
/// All methods are non-blocking; `link_output` transmits synchronously.
pub trait LinkDriver {
    /// Bring the controller up. Must be called once before any I/O.
    fn init(&mut self) -> Result<()>;

    /// Fetch one fully received frame into `frame`, returning its length,
    /// or `None` when no frame is waiting.
    fn link_input(&mut self, frame: &mut [u8]) -> Option<usize>;

    /// Transmit a frame as-is.
    fn link_output(&mut self, frame: &[u8]) -> Result<()>;

    /// Current PHY link state.
    fn link_state(&self) -> bool;
}

/// One Ethernet interface: addressing, counters, ARP cache, driver binding.
pub struct NetIf {
    pub name: &'static str,
    pub hwaddr: MacAddr,
    pub broadcast: MacAddr,
    pub ip4addr: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mtu: u16,
    pub flags: IfFlags,

    // Statistics
    pub sent: u32,
    pub recv: u32,
    pub rx_drop: u32,
    pub tx_drop: u32,

    pub(crate) arp_table: [ArpEntry; ARP_TABLE_LENGTH],
    pub(crate) driver: Box<dyn LinkDriver>,
}

impl NetIf {
    /// Create an interface bound to a driver. Addresses are assigned
    /// later with [`set_addr`].
    pub fn new(name: &'static str, hwaddr: MacAddr, driver: Box<dyn LinkDriver>) -> Self {
        NetIf {
            name,
            hwaddr,
            broadcast: MacAddr::BROADCAST,
            ip4addr: Ipv4Addr::ZERO,
            subnet: Ipv4Addr::ZERO,
            gateway: Ipv4Addr::ZERO,
            mtu: MTU,
            flags: IfFlags::BROADCAST,
            sent: 0,
            recv: 0,
            rx_drop: 0,
            tx_drop: 0,
            arp_table: [ArpEntry::EMPTY; ARP_TABLE_LENGTH],
            driver,
        }
    }
}

/// Initialize the interface hardware and mark it up.
pub fn init(stack: &mut Stack, ifnum: usize) -> Result<()> {
    let ifc = stack.interface_mut(ifnum)?;
    ifc.driver.init()?;
    ifc.flags |= IfFlags::UP;
    if ifc.driver.link_state() {
        ifc.flags |= IfFlags::LINK_UP;
    }
    debug!("netif: {} up, mac={}", ifc.name, ifc.hwaddr);
    Ok(())
}

/// Assign the interface's IPv4 identity.
pub fn set_addr(stack: &mut Stack, ifnum: usize, ip: Ipv4Addr, subnet: Ipv4Addr, gateway: Ipv4Addr) -> Result<()> {
    let ifc = stack.interface_mut(ifnum)?;
    ifc.ip4addr = ip;
    ifc.subnet = subnet;
    ifc.gateway = gateway;
    debug!("netif: {} addr={} mask={} gw={}", ifc.name, ip, subnet, gateway);
    Ok(())
}

/// Current PHY link state, refreshing the LINK_UP flag.
pub fn link_state(stack: &mut Stack, ifnum: usize) -> bool {
    match stack.interface_mut(ifnum) {
        Ok(ifc) => {
            let up = ifc.driver.link_state();
            ifc.flags.set(IfFlags::LINK_UP, up);
            up
        }
        Err(_) => false,
    }
}

/// Hand a fully framed pbuf to the link driver, padding runt frames.
/// Consumes the pbuf on every path.
pub(crate) fn transmit(stack: &mut Stack, ifnum: usize, id: crate::pbuf::PbufId) -> Result<()> {
    let len = stack.pool.len(id);
    let tx_len = ethernet::padded_len(stack.pool.bytes_mut(id), len);
    stack.pool.set_len(id, tx_len);

    let result = {
        let ifc = &mut stack.interfaces[ifnum];
        ifc.driver.link_output(stack.pool.frame(id))
    };

    match result {
        Ok(()) => stack.interfaces[ifnum].sent += 1,
        Err(_) => stack.interfaces[ifnum].tx_drop += 1,
    }

    stack.pool.free(id);
    result
}

/// Poll the driver for received frames and dispatch them up the stack.
///
/// Every frame gets a pbuf for its lifetime inside the stack; the pbuf
/// is freed here on return from the protocol handlers.
pub fn input(stack: &mut Stack, ifnum: usize) {
    if stack.interface(ifnum).is_err() {
        return;
    }

    loop {
        let id = match stack.pool.allocate() {
            Ok(id) => id,
            Err(_) => {
                // No buffer to receive into; leave the frame in the
                // controller and retry on the next poll.
                stack.interfaces[ifnum].rx_drop += 1;
                return;
            }
        };

        let len = {
            let ifc = &mut stack.interfaces[ifnum];
            ifc.driver.link_input(stack.pool.bytes_mut(id))
        };

        let len = match len {
            Some(len) => len,
            None => {
                stack.pool.free(id);
                return;
            }
        };

        stack.pool.set_len(id, len);
        stack.interfaces[ifnum].recv += 1;

        let ethertype = ethernet::parse_header(stack.pool.frame(id)).map(|hdr| hdr.ethertype);
        match ethertype {
            Some(ETHERTYPE_ARP) => arp::input(stack, ifnum, id),
            Some(ETHERTYPE_IPV4) => ipv4::input(stack, ifnum, id),
            Some(other) => {
                trace!("netif: dropping ethertype {:04x}", other);
                stack.interfaces[ifnum].rx_drop += 1;
            }
            None => {
                stack.interfaces[ifnum].rx_drop += 1;
            }
        }

        stack.pool.free(id);
    }
}
