//! The RDM endpoint.
//!
//! `Endpoint` owns the transport(s), the address vector, the packet
//! pools, the entry arenas, and the completion queue. Application calls
//! enqueue intent; all control flow is driven by [`Endpoint::progress`].
//! The model is single-threaded cooperative: `&mut self` is the lock.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rand::Rng;
use slab::Slab;

use crate::addr::{AhHandle, FiAddr, Gid, RawAddr};
use crate::av::AddressVector;
use crate::config::EndpointConfig;
use crate::cq::{CompFlags, CompQueue, CqEntry, CqErrEntry};
use crate::error::{Error, Result};
use crate::hmem::{HmemDesc, HmemRegistry};
use crate::packet::{extra_feature, ExtraInfo, ReqOptHdrs, RmaIov};
use crate::peer::PeerFlags;
use crate::pool::{PktId, PktPool, PoolKind};
use crate::read::ReadEntry;
use crate::rx_entry::{RxEntry, RxOp, RxState};
use crate::transport::{Access, Region, Transport};
use crate::tx_entry::{TxEntry, TxOp, TxState};

/// Options for transmit operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOpts {
    pub tag: Option<u64>,
    /// Immediate data carried in the CQ-data optional header.
    pub cq_data: Option<u64>,
    /// Delivery-complete: withhold the completion until the peer's
    /// RECEIPT.
    pub delivery_complete: bool,
    pub hmem: HmemDesc,
}

/// A locally registered region exposed to remote one-sided operations.
#[derive(Debug, Clone, Copy)]
pub struct RmaRegion {
    pub key: u64,
    pub len: usize,
}

pub struct Endpoint<T: Transport> {
    pub(crate) tp: T,
    pub(crate) shm: Option<T>,
    pub(crate) cfg: EndpointConfig,
    pub(crate) connid: u32,
    pub(crate) raw: RawAddr,
    pub(crate) local_gids: Vec<Gid>,
    pub(crate) extra_info: ExtraInfo,
    pub(crate) av: AddressVector,

    pub(crate) tx_pool: PktPool,
    pub(crate) rx_pool: PktPool,
    pub(crate) unexp_pool: PktPool,
    pub(crate) readcopy_pool: PktPool,

    pub(crate) txs: Slab<TxEntry>,
    pub(crate) rxs: Slab<RxEntry>,
    pub(crate) reads: Slab<ReadEntry>,

    /// Entries with deferred packets or controls, re-driven by progress.
    pub(crate) tx_queued: Vec<usize>,
    pub(crate) rx_queued: Vec<usize>,
    /// Long-CTS senders holding window to pump.
    pub(crate) tx_pending: Vec<usize>,
    pub(crate) read_pending: Vec<usize>,
    /// Ownerless control packets (handshakes, short READRSPs) deferred by
    /// RNR.
    pub(crate) ctrl_queued: Vec<PktId>,
    pub(crate) peers_in_backoff: Vec<FiAddr>,
    pub(crate) handshake_queued: Vec<FiAddr>,

    /// Posted receives awaiting a match.
    pub(crate) rx_list: VecDeque<usize>,
    pub(crate) rx_tagged_list: VecDeque<usize>,
    /// Unexpected messages awaiting a posted receive.
    pub(crate) unexp_list: VecDeque<usize>,
    pub(crate) unexp_tagged_list: VecDeque<usize>,
    /// (msg_id, peer) -> rx entry, for multi-packet reassembly.
    pub(crate) pkt_rx_map: HashMap<(u32, FiAddr), usize>,

    pub(crate) cq: CompQueue,

    /// Receive buffers to (re)post on the next progress call.
    pub(crate) rx_to_post: usize,
    pub(crate) shm_rx_to_post: usize,
    /// Transmit work requests outstanding at the main transport.
    pub(crate) outstanding_tx: usize,
    pub(crate) max_outstanding_tx: usize,

    /// Locally registered one-sided target regions.
    pub(crate) mr_regions: HashMap<u64, Region>,
    pub(crate) mr_descs: HashMap<u64, crate::transport::MemDesc>,

    pub(crate) hmem: HmemRegistry,
}

impl<T: Transport> Endpoint<T> {
    /// Open an endpoint over `tp`.
    pub fn new(tp: T, cfg: EndpointConfig) -> Result<Self> {
        Self::build(tp, None, cfg)
    }

    /// Open an endpoint with an intra-node fast-path transport for local
    /// peers.
    pub fn with_shm(tp: T, shm: T, cfg: EndpointConfig) -> Result<Self> {
        Self::build(tp, Some(shm), cfg)
    }

    fn build(mut tp: T, mut shm: Option<T>, cfg: EndpointConfig) -> Result<Self> {
        let connid: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        let raw = RawAddr::new(tp.local_gid(), tp.local_qpn(), connid);

        let mtu = tp.mtu();
        let tx_pool = PktPool::new(&mut tp, PoolKind::Tx, mtu, cfg.tx_pool_size)?;
        // The posted-receive pool feeds both transports when shm is on.
        let rx_pool_cap = cfg.rx_pool_size * if shm.is_some() { 2 } else { 1 };
        let rx_pool = PktPool::new(&mut tp, PoolKind::Rx, mtu, rx_pool_cap)?;
        let unexp_pool = PktPool::new(&mut tp, PoolKind::Unexp, mtu, cfg.unexp_pool_size)?;
        let readcopy_pool =
            PktPool::new(&mut tp, PoolKind::ReadCopy, mtu, cfg.readcopy_pool_size)?;

        let mut extra_info = ExtraInfo::default();
        if tp.supports_rdma_read() {
            extra_info.set(extra_feature::RDMA_READ);
        }
        if cfg.delivery_complete {
            extra_info.set(extra_feature::DELIVERY_COMPLETE);
        }
        if cfg.constant_header_length {
            extra_info.set(extra_feature::CONSTANT_HEADER_LENGTH);
        }
        extra_info.set(extra_feature::CONNID_HEADER);

        let max_outstanding_tx = cfg.max_outstanding_tx.min(tp.max_outstanding_tx());
        let rx_to_post = cfg.rx_pool_size;
        let shm_rx_to_post = if shm.is_some() { cfg.rx_pool_size } else { 0 };
        let local_gids = vec![raw.gid];

        if let Some(shm_tp) = shm.as_mut() {
            debug_assert_eq!(shm_tp.local_gid(), raw.gid);
            debug_assert_eq!(shm_tp.local_qpn(), raw.qpn);
        }

        Ok(Self {
            tp,
            shm,
            cfg,
            connid,
            raw,
            local_gids,
            extra_info,
            av: AddressVector::new(),
            tx_pool,
            rx_pool,
            unexp_pool,
            readcopy_pool,
            txs: Slab::new(),
            rxs: Slab::new(),
            reads: Slab::new(),
            tx_queued: Vec::new(),
            rx_queued: Vec::new(),
            tx_pending: Vec::new(),
            read_pending: Vec::new(),
            ctrl_queued: Vec::new(),
            peers_in_backoff: Vec::new(),
            handshake_queued: Vec::new(),
            rx_list: VecDeque::new(),
            rx_tagged_list: VecDeque::new(),
            unexp_list: VecDeque::new(),
            unexp_tagged_list: VecDeque::new(),
            pkt_rx_map: HashMap::new(),
            cq: CompQueue::new(),
            rx_to_post,
            shm_rx_to_post,
            outstanding_tx: 0,
            max_outstanding_tx,
            mr_regions: HashMap::new(),
            mr_descs: HashMap::new(),
            hmem: HmemRegistry::new(),
        })
    }

    /// This endpoint's raw address (GID, QPN, connid).
    #[inline]
    pub fn raw_addr(&self) -> RawAddr {
        self.raw
    }

    /// Read access to the address vector (peer state, AH cache).
    #[inline]
    pub fn av(&self) -> &AddressVector {
        &self.av
    }

    /// Mutable access to the address vector. Intended for harnesses that
    /// need to pre-position peer state.
    #[doc(hidden)]
    pub fn av_mut(&mut self) -> &mut AddressVector {
        &mut self.av
    }

    /// Mutable access to the underlying transport (test rigging).
    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.tp
    }

    /// The heterogeneous-memory registry, for registering accelerator
    /// copy providers.
    #[inline]
    pub fn hmem_mut(&mut self) -> &mut HmemRegistry {
        &mut self.hmem
    }

    // ---------------------------------------------------------------
    // Address vector operations
    // ---------------------------------------------------------------

    /// Insert a peer address. Idempotent for known addresses. A stale
    /// peer occupying the same (AHN, QPN) is evicted and its in-flight
    /// entries fail with `Io` error completions.
    pub fn av_insert(&mut self, addr: &RawAddr) -> Result<FiAddr> {
        let (fi, evicted) = self.av.insert(
            &mut self.tp,
            self.shm.as_mut(),
            addr,
            &self.raw,
            &self.local_gids,
            self.cfg.tx_max_credits,
        )?;
        if let Some(evicted) = evicted {
            for tx_id in evicted.tx_entries {
                self.fail_tx(tx_id, Error::Io("peer QP was recreated"));
            }
            for rx_id in evicted.rx_entries {
                self.fail_rx(rx_id, Error::Io("peer QP was recreated"));
            }
            for pkt in evicted.staged_pkts {
                self.pool(pkt.pool).release(pkt);
            }
        }
        Ok(fi)
    }

    /// Look up the raw address behind a `FiAddr`.
    pub fn av_lookup(&self, fi: FiAddr) -> Result<RawAddr> {
        self.av.lookup(fi)
    }

    /// Remove a peer. Fails with `Busy` while in-flight entries reference
    /// it.
    pub fn av_remove(&mut self, fi: FiAddr) -> Result<()> {
        let released = self.av.remove(&mut self.tp, fi)?;
        for pkt in released.staged_pkts {
            self.pool(pkt.pool).release(pkt);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Memory registration (one-sided targets)
    // ---------------------------------------------------------------

    /// Register a local region as a target for remote writes, reads and
    /// atomics. The returned key is what peers put in their rma_iov.
    pub fn register_region(&mut self, data: &[u8]) -> Result<RmaRegion> {
        let region: Region = Rc::new(std::cell::RefCell::new(data.to_vec()));
        let desc = self.tp.register(
            region.clone(),
            Access::REMOTE_READ | Access::REMOTE_WRITE | Access::LOCAL_READ | Access::LOCAL_WRITE,
        )?;
        self.mr_regions.insert(desc.rkey, region);
        self.mr_descs.insert(desc.rkey, desc);
        Ok(RmaRegion {
            key: desc.rkey,
            len: data.len(),
        })
    }

    /// Snapshot the bytes of a registered region.
    pub fn region_bytes(&self, key: u64) -> Option<Vec<u8>> {
        self.mr_regions.get(&key).map(|r| r.borrow().clone())
    }

    /// Close a registered region.
    pub fn close_region(&mut self, key: u64) -> Result<()> {
        let desc = self
            .mr_descs
            .remove(&key)
            .ok_or(Error::InvalidArgument("unknown region key"))?;
        self.mr_regions.remove(&key);
        self.tp.mr_close(desc)
    }

    // ---------------------------------------------------------------
    // Completion queue
    // ---------------------------------------------------------------

    pub fn pop_completion(&mut self) -> Option<CqEntry> {
        self.cq.pop()
    }

    pub fn pop_error(&mut self) -> Option<CqErrEntry> {
        self.cq.pop_error()
    }

    // ---------------------------------------------------------------
    // Internal helpers shared by the sub-protocol drivers
    // ---------------------------------------------------------------

    /// Optional headers for the next REQ to `fi`. The raw address rides
    /// along until the handshake arrives (or indefinitely if the peer
    /// asked for constant header lengths); the connid always does.
    pub(crate) fn req_opt_hdrs(&self, fi: FiAddr, cq_data: Option<u64>) -> ReqOptHdrs {
        let peer = self.av.peer(fi).expect("peer for REQ");
        ReqOptHdrs {
            raw_addr: peer.needs_raw_addr_hdr().then_some(self.raw),
            cq_data,
            connid: Some(self.connid),
        }
    }

    /// Connid for control packets: carried once the peer asked for it.
    pub(crate) fn ctrl_connid(&self, fi: FiAddr) -> Option<u32> {
        let peer = self.av.peer(fi)?;
        peer.supports(extra_feature::CONNID_HEADER)
            .then_some(self.connid)
    }

    /// Largest payload a DATA packet can carry toward `fi`.
    pub(crate) fn max_data_payload(&self, fi: FiAddr) -> usize {
        let hdr = crate::packet::DataHdr {
            recv_id: 0,
            data_length: 0,
            data_offset: 0,
            connid: self.ctrl_connid(fi),
        };
        self.tp.mtu() - hdr.wire_len()
    }

    /// Post one packet to the wire, routing local peers through the shm
    /// transport. Fails with `Again` when the peer is in backoff or the
    /// transmit queue is at its cap.
    pub(crate) fn post_pkt(&mut self, pkt_id: PktId) -> Result<()> {
        let (addr, size) = {
            let pkt = self.pool(pkt_id.pool).get(pkt_id);
            (pkt.addr.expect("packet peer"), pkt.size)
        };
        let peer = self.av.peer(addr).ok_or(Error::InvalidArgument("packet to unknown peer"))?;
        if peer.in_backoff() {
            return Err(Error::Again);
        }
        let is_local = peer.is_local && self.shm.is_some() && !peer.is_self;
        let qpn = self.av.raw(addr).expect("raw addr").qpn;

        let lkey = self.tx_pool.lkey();
        let pkt = match pkt_id.pool {
            PoolKind::Tx => self.tx_pool.get(pkt_id),
            PoolKind::Rx => self.rx_pool.get(pkt_id),
            PoolKind::Unexp => self.unexp_pool.get(pkt_id),
            PoolKind::ReadCopy => self.readcopy_pool.get(pkt_id),
        };
        if is_local {
            let ah = *self.av.shm_ah(addr).expect("shm ah for local peer");
            let shm = self.shm.as_mut().expect("shm transport");
            shm.post_send(&ah, qpn, &pkt.bytes()[..size], lkey, pkt_id.wr_id())?;
        } else {
            if self.outstanding_tx >= self.max_outstanding_tx {
                return Err(Error::Again);
            }
            let ah: AhHandle = *self.av.ah(addr).expect("ah for peer");
            self.tp
                .post_send(&ah, qpn, &pkt.bytes()[..size], lkey, pkt_id.wr_id())?;
            self.outstanding_tx += 1;
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.inc_tx_pending();
            }
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn pool(&mut self, kind: PoolKind) -> &mut PktPool {
        match kind {
            PoolKind::Tx => &mut self.tx_pool,
            PoolKind::Rx => &mut self.rx_pool,
            PoolKind::Unexp => &mut self.unexp_pool,
            PoolKind::ReadCopy => &mut self.readcopy_pool,
        }
    }

    #[inline]
    pub(crate) fn pool_ref(&self, kind: PoolKind) -> &PktPool {
        match kind {
            PoolKind::Tx => &self.tx_pool,
            PoolKind::Rx => &self.rx_pool,
            PoolKind::Unexp => &self.unexp_pool,
            PoolKind::ReadCopy => &self.readcopy_pool,
        }
    }

    /// Copy a received packet into the unexpected-staging pool, so the
    /// posted buffer (or a reorder staging slot) can be recycled.
    pub(crate) fn clone_to_unexp(&mut self, pkt_id: PktId) -> Result<PktId> {
        let (bytes, payload_len, payload_off, addr, owner) = {
            let src = self.pool_ref(pkt_id.pool).get(pkt_id);
            (
                src.bytes().to_vec(),
                src.payload_len,
                src.payload_off,
                src.addr,
                src.owner,
            )
        };
        let id = self.unexp_pool.alloc()?;
        let entry = self.unexp_pool.get_mut(id);
        entry.size = bytes.len();
        entry.payload_len = payload_len;
        entry.payload_off = payload_off;
        entry.addr = addr;
        entry.owner = owner;
        entry.buf_mut()[..bytes.len()].copy_from_slice(&bytes);
        Ok(id)
    }

    /// Release a receive-side packet, scheduling a repost on the
    /// transport it was posted to when it came from the posted pool.
    pub(crate) fn release_rx_pkt(&mut self, pkt_id: PktId) {
        if pkt_id.pool == PoolKind::Rx {
            if self.rx_pool.get(pkt_id).shm_posted {
                self.shm_rx_to_post += 1;
            } else {
                self.rx_to_post += 1;
            }
        }
        self.pool(pkt_id.pool).release(pkt_id);
    }

    /// Post a freshly built TX packet, or queue it on its owning TX entry
    /// on `Again`.
    pub(crate) fn send_or_queue_tx(&mut self, tx_id: usize, pkt_id: PktId) {
        match self.post_pkt(pkt_id) {
            Ok(()) => {
                let tx = &mut self.txs[tx_id];
                if tx.state == TxState::Req {
                    tx.state = TxState::Send;
                }
            }
            Err(Error::Again) => {
                let tx = &mut self.txs[tx_id];
                tx.queued_pkts.push(pkt_id);
                if tx.state == TxState::Req {
                    tx.state = TxState::QueuedCtrl;
                }
                if !self.tx_queued.contains(&tx_id) {
                    self.tx_queued.push(tx_id);
                }
            }
            Err(e) => {
                log::warn!("post failed for tx {}: {}", tx_id, e);
                self.release_tx_pkt_on_error(pkt_id);
                self.fail_tx(tx_id, e);
            }
        }
    }

    /// Post a control packet owned by an RX entry, or queue it.
    pub(crate) fn send_or_queue_rx(&mut self, rx_id: usize, pkt_id: PktId) {
        match self.post_pkt(pkt_id) {
            Ok(()) => {}
            Err(Error::Again) => {
                let rx = &mut self.rxs[rx_id];
                rx.queued_pkts.push(pkt_id);
                if rx.state != RxState::Recv {
                    rx.state = RxState::QueuedCtrl;
                }
                if !self.rx_queued.contains(&rx_id) {
                    self.rx_queued.push(rx_id);
                }
            }
            Err(e) => {
                log::warn!("post failed for rx {}: {}", rx_id, e);
                self.release_tx_pkt_on_error(pkt_id);
                self.fail_rx(rx_id, e);
            }
        }
    }

    /// Post an ownerless control packet, or park it for the progress
    /// loop.
    pub(crate) fn send_or_queue_ctrl(&mut self, pkt_id: PktId) {
        match self.post_pkt(pkt_id) {
            Ok(()) => {}
            Err(Error::Again) => self.ctrl_queued.push(pkt_id),
            Err(e) => {
                log::warn!("dropping control packet: {}", e);
                self.release_tx_pkt_on_error(pkt_id);
            }
        }
    }

    fn release_tx_pkt_on_error(&mut self, pkt_id: PktId) {
        self.pool(pkt_id.pool).release(pkt_id);
    }

    /// Detach an entry id from its peer's in-use list.
    pub(crate) fn unpin_tx(&mut self, tx_id: usize) {
        let addr = self.txs[tx_id].addr;
        if let Some(peer) = self.av.peer_mut(addr) {
            peer.tx_entries.retain(|&id| id != tx_id);
        }
    }

    pub(crate) fn unpin_rx(&mut self, rx_id: usize) {
        if let Some(addr) = self.rxs[rx_id].addr {
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.rx_entries.retain(|&id| id != rx_id);
            }
        }
    }

    /// Completion flags for a finished TX entry.
    pub(crate) fn tx_comp_flags(op: TxOp) -> CompFlags {
        match op {
            TxOp::Msg => CompFlags::TRANSMIT | CompFlags::MSG,
            TxOp::Tagged => CompFlags::TRANSMIT | CompFlags::MSG | CompFlags::TAGGED,
            TxOp::Write => CompFlags::RMA | CompFlags::WRITE,
            TxOp::Read => CompFlags::RMA | CompFlags::READ,
            TxOp::AtomicWrite => CompFlags::ATOMIC | CompFlags::WRITE,
            TxOp::AtomicFetch | TxOp::AtomicCompare => CompFlags::ATOMIC | CompFlags::READ,
        }
    }

    /// Write the (single) completion for a finished TX entry and release
    /// it. Returns credits to the peer and unpins.
    pub(crate) fn finalize_tx(&mut self, tx_id: usize) {
        let tx = &mut self.txs[tx_id];
        debug_assert!(tx.done());
        let addr = tx.addr;
        let credits = tx.credits;
        let silent = tx.silent;
        let context = tx.context;
        let flags = Self::tx_comp_flags(tx.op);
        let len = tx.total_len as usize;
        let result = tx.result_buf.take();
        let read_desc = tx.read_desc.take();
        let tag = tx.tag;

        if let Some(desc) = read_desc {
            if let Err(e) = self.tp.mr_close(desc) {
                log::warn!("closing long-read registration failed: {}", e);
            }
        }
        if let Some(peer) = self.av.peer_mut(addr) {
            peer.return_credits(credits);
        }
        self.unpin_tx(tx_id);
        self.tx_pending.retain(|&id| id != tx_id);
        self.tx_queued.retain(|&id| id != tx_id);
        self.txs.remove(tx_id);

        if !silent {
            self.cq.write(CqEntry {
                context,
                flags,
                len,
                buf: result,
                data: None,
                tag,
                src_addr: Some(addr),
            });
        }
    }

    /// Fail a TX entry with one error completion.
    pub(crate) fn fail_tx(&mut self, tx_id: usize, err: Error) {
        let Some(tx) = self.txs.try_remove(tx_id) else {
            return;
        };
        for pkt in tx.queued_pkts {
            self.pool(pkt.pool).release(pkt);
        }
        if let Some(peer) = self.av.peer_mut(tx.addr) {
            peer.return_credits(tx.credits);
            peer.tx_entries.retain(|&id| id != tx_id);
        }
        self.tx_pending.retain(|&id| id != tx_id);
        self.tx_queued.retain(|&id| id != tx_id);
        if !tx.silent {
            self.cq.write_error(CqErrEntry {
                context: tx.context,
                flags: Self::tx_comp_flags(tx.op),
                err,
            });
        }
    }

    /// Fail an RX entry with one error completion.
    pub(crate) fn fail_rx(&mut self, rx_id: usize, err: Error) {
        let Some(rx) = self.rxs.try_remove(rx_id) else {
            return;
        };
        for pkt in rx.queued_pkts.iter().chain(rx.unexp_pkts.iter()) {
            self.pool(pkt.pool).release(*pkt);
        }
        if let Some(addr) = rx.addr {
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.rx_entries.retain(|&id| id != rx_id);
            }
            if let Some(msg_id) = rx.msg_id {
                self.pkt_rx_map.remove(&(msg_id, addr));
            }
        }
        self.rx_queued.retain(|&id| id != rx_id);
        self.rx_list.retain(|&id| id != rx_id);
        self.rx_tagged_list.retain(|&id| id != rx_id);
        self.unexp_list.retain(|&id| id != rx_id);
        self.unexp_tagged_list.retain(|&id| id != rx_id);
        if let Some(parent_id) = rx.multi_recv_parent {
            if let Some(parent) = self.rxs.get_mut(parent_id) {
                parent.mr_consumers = parent.mr_consumers.saturating_sub(1);
            }
            self.maybe_finish_multi_recv(parent_id);
        }
        if !rx.silent {
            let flags = match rx.op {
                RxOp::Msg => CompFlags::RECV | CompFlags::MSG,
                RxOp::Tagged => CompFlags::RECV | CompFlags::MSG | CompFlags::TAGGED,
                RxOp::WriteTarget => CompFlags::REMOTE_WRITE | CompFlags::RMA,
                RxOp::ReadRsp => CompFlags::RMA | CompFlags::READ,
                RxOp::Atomic => CompFlags::REMOTE_WRITE | CompFlags::ATOMIC,
            };
            self.cq.write_error(CqErrEntry {
                context: rx.context,
                flags,
                err,
            });
        }
    }

    /// Allocate and pin a TX entry.
    pub(crate) fn alloc_tx(&mut self, tx: TxEntry) -> usize {
        let addr = tx.addr;
        let id = self.txs.insert(tx);
        if let Some(peer) = self.av.peer_mut(addr) {
            peer.tx_entries.push(id);
            peer.flags |= PeerFlags::REQ_SENT;
        }
        id
    }

    /// Allocate and pin an RX entry bound to a known peer.
    pub(crate) fn alloc_rx(&mut self, rx: RxEntry) -> usize {
        let addr = rx.addr;
        let id = self.rxs.insert(rx);
        if let Some(addr) = addr {
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.rx_entries.push(id);
            }
        }
        id
    }

    /// Pin an existing RX entry to a peer once the source is known.
    pub(crate) fn pin_rx(&mut self, rx_id: usize, addr: FiAddr) {
        let rx = &mut self.rxs[rx_id];
        if rx.addr != Some(addr) {
            rx.addr = Some(addr);
        }
        if let Some(peer) = self.av.peer_mut(addr) {
            if !peer.rx_entries.contains(&rx_id) {
                peer.rx_entries.push(rx_id);
            }
        }
    }

    /// Build the basic one-sided target iov list against local regions,
    /// validating keys.
    pub(crate) fn resolve_region(&self, iovs: &[RmaIov]) -> Result<Region> {
        let first = iovs.first().ok_or(Error::InvalidArgument("empty rma_iov"))?;
        self.mr_regions
            .get(&first.key)
            .cloned()
            .ok_or(Error::InvalidArgument("unknown rma key"))
    }
}
