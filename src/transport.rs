//! The wire-transport seam.
//!
//! The provider core never talks to a device directly; it drives a
//! [`Transport`] implementation that exposes unreliable, unordered,
//! MTU-limited datagrams plus optional RDMA read. The intra-node shm fast
//! path is a second `Transport` with identical semantics. Tests run
//! against the in-memory fabric in [`crate::sim`].

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::addr::{AhHandle, Gid, RawAddr};
use crate::error::Result;

bitflags! {
    /// Memory registration access bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const LOCAL_READ = 0x1;
        const LOCAL_WRITE = 0x2;
        const REMOTE_READ = 0x4;
        const REMOTE_WRITE = 0x8;
    }
}

/// Registered memory descriptor: local key for posting, remote key for the
/// peer, and the opaque handle used to close the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    pub lkey: u32,
    pub rkey: u64,
}

/// Shared registered region. The transport keeps a clone for the duration
/// of the registration so RDMA reads and emulated one-sided operations
/// observe the live bytes.
pub type Region = Rc<RefCell<Vec<u8>>>;

/// Completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Send,
    Recv,
    Read,
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompStatus {
    Ok,
    /// Receiver-not-ready: the packet did not land and should be
    /// retransmitted after peer-local backoff.
    Rnr,
    /// Hard transport failure.
    Err,
}

/// One completion-queue entry from the transport.
#[derive(Debug)]
pub struct Completion {
    pub op: CompOp,
    pub status: CompStatus,
    /// The `wr_id` given at post time.
    pub wr_id: u64,
    /// Bytes transferred. For receives, the packet size.
    pub byte_len: usize,
    /// For receives: (AHN, source QPN) stamped by the device. The AHN is
    /// the receiver-side handle number for the sender's GID, or `u16::MAX`
    /// if the receiver holds no handle for that GID.
    pub src: Option<(u16, u16)>,
    /// For receives: the posted buffer, filled. For reads: the remote
    /// bytes. Absent on send completions.
    pub buf: Option<Box<[u8]>>,
}

/// Unreliable datagram transport with optional RDMA read.
///
/// All methods are non-blocking. A post that cannot be accepted returns
/// `Error::Again` and is retried by the progress engine.
pub trait Transport {
    /// Datagram MTU, including protocol headers.
    fn mtu(&self) -> usize;

    /// GID + QPN identity of this endpoint. The connid part is owned by
    /// the RDM layer and is zero here.
    fn local_gid(&self) -> Gid;
    fn local_qpn(&self) -> u16;

    /// Cap on outstanding transmit work requests.
    fn max_outstanding_tx(&self) -> usize;

    /// Whether this transport can originate RDMA reads.
    fn supports_rdma_read(&self) -> bool;

    /// Largest single RDMA read the device accepts.
    fn max_rdma_size(&self) -> usize;

    /// Create (or fail to create) a hardware address handle for a GID.
    fn create_ah(&mut self, gid: Gid) -> Result<AhHandle>;
    fn destroy_ah(&mut self, ah: AhHandle) -> Result<()>;

    /// Register a memory region. The transport holds a clone of the
    /// region until `mr_close`.
    fn register(&mut self, mem: Region, access: Access) -> Result<MemDesc>;
    fn mr_close(&mut self, desc: MemDesc) -> Result<()>;

    /// Post one datagram to `(ah, qpn)`.
    fn post_send(
        &mut self,
        ah: &AhHandle,
        qpn: u16,
        pkt: &[u8],
        lkey: u32,
        wr_id: u64,
    ) -> Result<()>;

    /// Post one receive buffer. The buffer is returned, filled, in the
    /// matching `Recv` completion. `more` hints that further posts follow
    /// in the same batch (doorbell batching).
    fn post_recv(&mut self, buf: Box<[u8]>, lkey: u32, wr_id: u64, more: bool) -> Result<()>;

    /// Post one RDMA read of `len` bytes at `remote_addr` within the
    /// region registered under `rkey`. The bytes arrive in the `Read`
    /// completion.
    fn post_read(&mut self, len: usize, lkey: u32, remote_addr: u64, rkey: u64, wr_id: u64)
        -> Result<()>;

    /// Poll up to `batch` completions.
    fn poll_cq(&mut self, batch: usize) -> Vec<Completion>;

    /// Flush any batched work to the device (doorbell). Default: no-op.
    fn flush(&mut self) {}
}

/// Address of a peer as the raw-address header carries it, derived from a
/// transport identity plus the RDM-layer connid.
pub fn compose_raw_addr<T: Transport>(tp: &T, connid: u32) -> RawAddr {
    RawAddr::new(tp.local_gid(), tp.local_qpn(), connid)
}
