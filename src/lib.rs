//! tinystack — a compact IPv4 networking stack for single-board
//! computers driving an SPI-attached Ethernet controller.
//!
//! The stack provides ARP, IPv4 with ICMP echo, UDP datagram I/O, and a
//! TCP implementation with active/passive open, in-order byte-stream
//! send/receive, and orderly close. Everything runs single-threaded and
//! cooperative: the application owns a [`stack::Stack`] and drives it
//! from its main loop.
//!
//! ```no_run
//! use tinystack::{arp, netif, stack, tcp, types};
//! # struct Clock;
//! # impl stack::TimeSource for Clock { fn now(&self) -> u32 { 0 } }
//! # struct Nic;
//! # impl netif::LinkDriver for Nic {
//! #     fn init(&mut self) -> tinystack::Result<()> { Ok(()) }
//! #     fn link_input(&mut self, _f: &mut [u8]) -> Option<usize> { None }
//! #     fn link_output(&mut self, _f: &[u8]) -> tinystack::Result<()> { Ok(()) }
//! #     fn link_state(&self) -> bool { true }
//! # }
//!
//! let mut stack = stack::Stack::new("host", Box::new(Clock));
//! let ifnum = stack
//!     .add_interface(netif::NetIf::new(
//!         "eth0",
//!         types::MacAddr([0x00, 0x0C, 0x41, 0x57, 0x70, 0x00]),
//!         Box::new(Nic),
//!     ))
//!     .unwrap();
//! netif::init(&mut stack, ifnum).unwrap();
//! netif::set_addr(
//!     &mut stack,
//!     ifnum,
//!     types::Ipv4Addr::new(192, 168, 1, 19),
//!     types::Ipv4Addr::new(255, 255, 255, 0),
//!     types::Ipv4Addr::new(192, 168, 1, 1),
//! )
//! .unwrap();
//! stack
//!     .set_route(types::Ipv4Addr::ZERO, types::Ipv4Addr::new(192, 168, 1, 1), ifnum)
//!     .unwrap();
//! tcp::init(&mut stack).unwrap();
//! arp::gratuitous(&mut stack, ifnum).unwrap();
//!
//! loop {
//!     stack.poll();
//!     // application work
//! }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arp;
pub mod checksum;
pub mod error;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod netif;
pub mod pbuf;
pub mod stack;
pub mod tcp;
pub mod types;
pub mod udp;

pub use error::{DriverError, Error, Result};
pub use netif::{IfFlags, LinkDriver, NetIf};
pub use stack::{Protocol, Stack, TimeSource};
pub use types::{Ipv4Addr, MacAddr};
