//! Stack-wide error codes.
//!
//! Every application-facing operation returns an explicit status; the
//! stack never panics or aborts. Recoverable conditions on the input
//! path (bad checksums, out-of-window segments) are absorbed silently
//! and counted, not surfaced here.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Failure reported by the physical link driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("transmit collision")]
    TxCollision,
    #[error("late transmit collision")]
    TxLateCollision,
    #[error("driver failure")]
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// A fixed resource pool (pbuf, PCB) is exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// No route table entry matches the destination.
    #[error("no route to destination")]
    NoRoute,
    /// The route table has no empty slot.
    #[error("route table full")]
    RouteTableFull,
    /// Route slot index out of range.
    #[error("route index out of range")]
    RouteRange,
    /// The ARP table is full of static entries.
    #[error("ARP table full")]
    ArpTableFull,
    /// An ARP update found no entry for the target IP.
    #[error("no ARP entry")]
    ArpNoEntry,
    /// Address resolution is in progress; the frame was dropped and an
    /// ARP request went out. Retry after the reply is learned.
    #[error("ARP resolution pending")]
    ArpPending,
    /// The timer table has no empty slot.
    #[error("timer table full")]
    TimerTableFull,
    /// Interface table full or interface number invalid.
    #[error("network interface error")]
    Netif,
    /// Another PCB already holds this (address, port) binding.
    #[error("address in use")]
    InUse,
    /// PCB id does not name an allocated PCB.
    #[error("bad PCB id")]
    BadId,
    /// Operation requires a bound PCB.
    #[error("PCB not bound")]
    NotBound,
    /// Operation requires a listening PCB.
    #[error("PCB not listening")]
    NotListening,
    /// Operation is illegal in the PCB's current state.
    #[error("bad PCB state")]
    BadState,
    /// The connection is shutting down; no more data will arrive.
    #[error("connection closing")]
    Closing,
    /// The connection is fully closed.
    #[error("connection closed")]
    Closed,
    /// Packet too large for the buffer/MTU, or structurally invalid.
    #[error("overflow or malformed packet")]
    Malformed,
    /// The physical driver reported a transmit or receive fault.
    #[error("link driver: {0}")]
    Driver(#[from] DriverError),
}
