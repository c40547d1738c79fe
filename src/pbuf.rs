//! Packet buffer pool.
//!
//! A small static pool of MTU-sized frames. Each buffer is FREE or
//! IN_USE and carries a valid byte length. A pbuf is owned by exactly
//! one site at a time: the input poll loop for received frames, or the
//! output path that allocated it. There is no reference counting.

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::warn;

use crate::error::{Error, Result};

/// Size of one packet buffer: MTU plus link header, rounded up.
pub const PACKET_BUF_SIZE: usize = 1536;
/// Number of buffers in the pool.
pub const PACKET_BUF_COUNT: usize = 8;

/// Handle to a pool slot. Only the pool constructs these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PbufId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PbufState {
    Free,
    InUse,
}

struct Pbuf {
    state: PbufState,
    len: usize,
    data: Box<[u8; PACKET_BUF_SIZE]>,
}

pub struct PbufPool {
    bufs: Vec<Pbuf>,
    /// Frees of an already-free buffer. Nonzero indicates an ownership bug.
    pub bad_frees: u32,
}

impl PbufPool {
    pub fn new() -> Self {
        let mut bufs = Vec::with_capacity(PACKET_BUF_COUNT);
        for _ in 0..PACKET_BUF_COUNT {
            bufs.push(Pbuf {
                state: PbufState::Free,
                len: 0,
                data: Box::new([0; PACKET_BUF_SIZE]),
            });
        }
        PbufPool { bufs, bad_frees: 0 }
    }

    /// Take the first free buffer, marked in-use with `len = 0`.
    pub fn allocate(&mut self) -> Result<PbufId> {
        for (i, buf) in self.bufs.iter_mut().enumerate() {
            if buf.state == PbufState::Free {
                buf.state = PbufState::InUse;
                buf.len = 0;
                return Ok(PbufId(i));
            }
        }
        warn!("pbuf: pool exhausted");
        Err(Error::OutOfMemory)
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, id: PbufId) {
        let buf = &mut self.bufs[id.0];
        if buf.state == PbufState::Free {
            self.bad_frees += 1;
            warn!("pbuf: double free of slot {}", id.0);
            return;
        }
        buf.state = PbufState::Free;
        buf.len = 0;
    }

    pub fn len(&self, id: PbufId) -> usize {
        self.bufs[id.0].len
    }

    pub fn set_len(&mut self, id: PbufId, len: usize) {
        self.bufs[id.0].len = len.min(PACKET_BUF_SIZE);
    }

    /// Whole buffer region, regardless of `len`.
    pub fn bytes(&self, id: PbufId) -> &[u8; PACKET_BUF_SIZE] {
        &self.bufs[id.0].data
    }

    pub fn bytes_mut(&mut self, id: PbufId) -> &mut [u8; PACKET_BUF_SIZE] {
        &mut self.bufs[id.0].data
    }

    /// The valid frame bytes (`..len`).
    pub fn frame(&self, id: PbufId) -> &[u8] {
        let buf = &self.bufs[id.0];
        &buf.data[..buf.len]
    }

    pub fn free_count(&self) -> usize {
        self.bufs.iter().filter(|b| b.state == PbufState::Free).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_until_exhausted() {
        let mut pool = PbufPool::new();
        let mut ids = Vec::new();
        for _ in 0..PACKET_BUF_COUNT {
            ids.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.allocate(), Err(Error::OutOfMemory));
        pool.free(ids[3]);
        assert_eq!(pool.allocate(), Ok(ids[3]));
    }

    #[test]
    fn allocate_resets_len() {
        let mut pool = PbufPool::new();
        let id = pool.allocate().unwrap();
        pool.set_len(id, 64);
        pool.free(id);
        let id = pool.allocate().unwrap();
        assert_eq!(pool.len(id), 0);
    }

    #[test]
    fn double_free_is_counted_not_fatal() {
        let mut pool = PbufPool::new();
        let id = pool.allocate().unwrap();
        pool.free(id);
        pool.free(id);
        assert_eq!(pool.bad_frees, 1);
        assert_eq!(pool.free_count(), PACKET_BUF_COUNT);
    }

    #[test]
    fn set_len_clamps_to_capacity() {
        let mut pool = PbufPool::new();
        let id = pool.allocate().unwrap();
        pool.set_len(id, PACKET_BUF_SIZE + 100);
        assert_eq!(pool.len(id), PACKET_BUF_SIZE);
    }
}
