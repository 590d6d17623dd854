//! Packet buffer pools.
//!
//! Each endpoint owns fixed-size slab pools of registered packet buffers:
//! one for transmits, one for posted receives, one for staging unexpected
//! and out-of-order packets, and one for read-copy bounce buffers. Pool
//! entries alternate strictly between FREE and IN_USE; debug builds write
//! a poison pattern on release.

use std::cell::RefCell;
use std::rc::Rc;

use slab::Slab;

use crate::addr::FiAddr;
use crate::error::{Error, Result};
use crate::transport::{Access, MemDesc, Transport};

/// Poison byte written over released buffers in debug builds.
#[cfg(debug_assertions)]
const POISON: u8 = 0xef;

/// Borrow a packet entry through a direct field path, so the borrow is
/// granular to the pool fields and other endpoint state stays free.
macro_rules! pkt_entry {
    ($ep:expr, $id:expr) => {{
        let id = $id;
        match id.pool {
            $crate::pool::PoolKind::Tx => $ep.tx_pool.get(id),
            $crate::pool::PoolKind::Rx => $ep.rx_pool.get(id),
            $crate::pool::PoolKind::Unexp => $ep.unexp_pool.get(id),
            $crate::pool::PoolKind::ReadCopy => $ep.readcopy_pool.get(id),
        }
    }};
}
pub(crate) use pkt_entry;

/// Identifies a packet entry within one endpoint: pool kind + slab key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PktId {
    pub pool: PoolKind,
    pub key: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PoolKind {
    Tx = 0,
    Rx = 1,
    Unexp = 2,
    ReadCopy = 3,
}

impl PktId {
    /// Pack into a transport `wr_id`.
    #[inline]
    pub fn wr_id(self) -> u64 {
        ((self.pool as u64) << 48) | self.key as u64
    }

    /// Unpack from a transport `wr_id`.
    pub fn from_wr_id(wr_id: u64) -> Self {
        let pool = match wr_id >> 48 {
            0 => PoolKind::Tx,
            1 => PoolKind::Rx,
            2 => PoolKind::Unexp,
            _ => PoolKind::ReadCopy,
        };
        Self {
            pool,
            key: (wr_id & 0xffff_ffff_ffff) as usize,
        }
    }
}

/// Lifecycle state of a packet entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktState {
    InUse,
    /// Send failed with RNR; awaiting retransmit after peer backoff.
    RnrRetransmit,
    /// Holds received data while an RDMA read copies it to device memory.
    CopyByRead,
}

/// The entry that owns a packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktOwner {
    None,
    Tx(usize),
    Rx(usize),
    Read(usize),
}

/// One pool-allocated packet buffer plus bookkeeping.
pub struct PktEntry {
    /// The buffer; `None` while posted to the transport.
    buf: Option<Box<[u8]>>,
    /// Valid bytes in `buf`.
    pub size: usize,
    /// Bytes of application payload this packet carries (for ack
    /// accounting on send completion).
    pub payload_len: usize,
    /// Peer this packet came from / goes to.
    pub addr: Option<FiAddr>,
    pub owner: PktOwner,
    pub state: PktState,
    /// Payload byte offset within `buf` (receive side, set at dispatch).
    pub payload_off: usize,
    /// Posted to the shm transport (repost accounting).
    pub shm_posted: bool,
}

impl PktEntry {
    /// Borrow the buffer. Panics if the buffer is posted to the device.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf.as_ref().expect("packet buffer is posted")[..self.size]
    }

    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("packet buffer is posted")
    }

    /// Received payload slice.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bytes()[self.payload_off..]
    }

    /// Take the buffer for posting to the transport.
    pub fn take_buf(&mut self) -> Box<[u8]> {
        self.buf.take().expect("packet buffer already posted")
    }

    /// Return the buffer from a transport completion.
    pub fn restore_buf(&mut self, buf: Box<[u8]>, size: usize) {
        debug_assert!(self.buf.is_none());
        self.size = size;
        self.buf = Some(buf);
    }

    #[inline]
    pub fn is_posted(&self) -> bool {
        self.buf.is_none()
    }
}

/// A fixed-capacity pool of equally sized registered packet buffers.
pub struct PktPool {
    kind: PoolKind,
    entries: Slab<PktEntry>,
    buf_size: usize,
    capacity: usize,
    /// Registration covering the pool's buffers.
    desc: MemDesc,
    /// Backing registration region (kept alive for the pool lifetime).
    _region: Rc<RefCell<Vec<u8>>>,
}

impl PktPool {
    /// Create a pool of `capacity` buffers of `buf_size` bytes, registered
    /// with the transport.
    pub fn new<T: Transport>(
        tp: &mut T,
        kind: PoolKind,
        buf_size: usize,
        capacity: usize,
    ) -> Result<Self> {
        let region = Rc::new(RefCell::new(vec![0u8; buf_size * capacity]));
        let desc = tp.register(region.clone(), Access::LOCAL_READ | Access::LOCAL_WRITE)?;
        Ok(Self {
            kind,
            entries: Slab::with_capacity(capacity),
            buf_size,
            capacity,
            desc,
            _region: region,
        })
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.desc.lkey
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.entries.len()
    }

    /// Allocate one entry. Fails with `OutOfMemory` at capacity.
    pub fn alloc(&mut self) -> Result<PktId> {
        if self.entries.len() >= self.capacity {
            return Err(Error::OutOfMemory("packet pool exhausted"));
        }
        let key = self.entries.insert(PktEntry {
            buf: Some(vec![0u8; self.buf_size].into_boxed_slice()),
            size: 0,
            payload_len: 0,
            addr: None,
            owner: PktOwner::None,
            state: PktState::InUse,
            payload_off: 0,
            shm_posted: false,
        });
        Ok(PktId {
            pool: self.kind,
            key,
        })
    }

    #[inline]
    pub fn get(&self, id: PktId) -> &PktEntry {
        debug_assert_eq!(id.pool, self.kind);
        &self.entries[id.key]
    }

    #[inline]
    pub fn get_mut(&mut self, id: PktId) -> &mut PktEntry {
        debug_assert_eq!(id.pool, self.kind);
        &mut self.entries[id.key]
    }

    #[inline]
    pub fn try_get_mut(&mut self, id: PktId) -> Option<&mut PktEntry> {
        debug_assert_eq!(id.pool, self.kind);
        self.entries.get_mut(id.key)
    }

    /// Release an entry back to the pool.
    pub fn release(&mut self, id: PktId) {
        debug_assert_eq!(id.pool, self.kind);
        let entry = self.entries.remove(id.key);
        #[cfg(debug_assertions)]
        if let Some(mut buf) = entry.buf {
            buf.fill(POISON);
        }
        #[cfg(not(debug_assertions))]
        drop(entry);
    }

    /// Clone a staged packet into this pool (unexpected / out-of-order /
    /// read-copy staging), so the source buffer can be reposted.
    pub fn clone_from(&mut self, src: &PktEntry) -> Result<PktId> {
        let id = self.alloc()?;
        let entry = self.get_mut(id);
        entry.size = src.size;
        entry.payload_len = src.payload_len;
        entry.addr = src.addr;
        entry.owner = src.owner;
        entry.payload_off = src.payload_off;
        entry.buf_mut()[..src.size].copy_from_slice(src.bytes());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFabric;

    #[test]
    fn test_pool_alloc_release() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut pool = PktPool::new(&mut tp, PoolKind::Tx, 256, 2).unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(matches!(
            pool.alloc(),
            Err(Error::OutOfMemory("packet pool exhausted"))
        ));

        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.alloc().unwrap();
        assert_eq!(pool.in_use(), 2);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pool_wr_id_roundtrip() {
        for kind in [
            PoolKind::Tx,
            PoolKind::Rx,
            PoolKind::Unexp,
            PoolKind::ReadCopy,
        ] {
            let id = PktId { pool: kind, key: 1234 };
            assert_eq!(PktId::from_wr_id(id.wr_id()), id);
        }
    }

    #[test]
    fn test_pool_clone() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut pool = PktPool::new(&mut tp, PoolKind::Rx, 64, 4).unwrap();
        let mut unexp = PktPool::new(&mut tp, PoolKind::Unexp, 64, 4).unwrap();

        let a = pool.alloc().unwrap();
        {
            let e = pool.get_mut(a);
            e.size = 5;
            e.payload_off = 1;
            e.buf_mut()[..5].copy_from_slice(b"hello");
        }
        let b = unexp.clone_from(pool.get(a)).unwrap();
        assert_eq!(unexp.get(b).bytes(), b"hello");
        assert_eq!(unexp.get(b).payload(), b"ello");
    }

    #[test]
    fn test_take_restore_buf() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut pool = PktPool::new(&mut tp, PoolKind::Rx, 64, 1).unwrap();
        let id = pool.alloc().unwrap();
        let buf = pool.get_mut(id).take_buf();
        assert!(pool.get(id).is_posted());
        pool.get_mut(id).restore_buf(buf, 10);
        assert_eq!(pool.get(id).bytes().len(), 10);
    }
}
