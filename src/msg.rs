//! Two-sided messaging sub-protocols.
//!
//! The send side picks a packet family from the payload length and the
//! peer's feature bitmap: eager (one packet), medium (a burst of
//! segments), long-CTS (flow-controlled DATA stream) or long-read (the
//! receiver pulls with RDMA reads). The receive side matches RTM packets
//! against posted receives, stages unexpected messages in a dedicated
//! pool, reassembles multi-packet messages through the
//! `(msg_id, peer)` map, and slices multi-recv buffers.

use crate::addr::FiAddr;
use crate::cq::{CompFlags, CqEntry, CqErrEntry};
use crate::endpoint::{Endpoint, SendOpts};
use crate::error::{Error, Result};
use crate::hmem::HmemDesc;
use crate::packet::{
    extra_feature, EagerRtmHdr, LongCtsRtmHdr, LongReadRtmHdr, MediumRtmHdr, PktType, ReqCommon,
    RmaIov, BASE_HDR_LEN,
};
use crate::peer::PeerFlags;
use crate::pool::{PktId, PktOwner};
use crate::read::{ReadEntry, ReadOwner};
use crate::rx_entry::{RxDest, RxEntry, RxOp, RxState};
use crate::transport::{Access, Region, Transport};
use crate::tx_entry::{TxEntry, TxOp, TxProto, TxState};

/// Normalized view of any RTM packet.
pub(crate) struct RtmInfo {
    pub typ: PktType,
    pub tagged: bool,
    pub tag: Option<u64>,
    pub msg_id: u32,
    pub dc: bool,
    pub cq_data: Option<u64>,
    /// Total message length.
    pub total_len: u64,
    /// Sender's send_id for the CTS/EOR/RECEIPT back-channel.
    pub send_id: Option<u32>,
    /// Payload offset within the packet.
    pub payload_off: usize,
    /// Where the payload lands in the message (medium segments).
    pub seg_offset: u64,
    pub read_iov: Vec<RmaIov>,
}

impl RtmInfo {
    /// Decode any RTM family packet into the normalized view.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let base = crate::packet::BaseHdr::decode(bytes)?;
        let typ = base.typ;
        debug_assert!(typ.is_rtm());
        if typ.is_medium_rtm() {
            let (hdr, off) = MediumRtmHdr::decode(bytes)?;
            Ok(Self {
                typ,
                tagged: hdr.common.tag.is_some(),
                tag: hdr.common.tag,
                msg_id: hdr.common.msg_id,
                dc: typ.is_dc(),
                cq_data: hdr.opt.cq_data,
                total_len: hdr.data_len,
                send_id: None,
                payload_off: off,
                seg_offset: hdr.seg_offset,
                read_iov: Vec::new(),
            })
        } else if typ.is_longcts_rtm() {
            let (hdr, off) = LongCtsRtmHdr::decode(bytes)?;
            Ok(Self {
                typ,
                tagged: hdr.common.tag.is_some(),
                tag: hdr.common.tag,
                msg_id: hdr.common.msg_id,
                dc: typ.is_dc(),
                cq_data: hdr.opt.cq_data,
                total_len: hdr.msg_length,
                send_id: Some(hdr.send_id),
                payload_off: off,
                seg_offset: 0,
                read_iov: Vec::new(),
            })
        } else if typ.is_longread_rtm() {
            let (hdr, off) = LongReadRtmHdr::decode(bytes)?;
            Ok(Self {
                typ,
                tagged: hdr.common.tag.is_some(),
                tag: hdr.common.tag,
                msg_id: hdr.common.msg_id,
                dc: false,
                cq_data: hdr.opt.cq_data,
                total_len: hdr.msg_length,
                send_id: Some(hdr.send_id),
                payload_off: off,
                seg_offset: 0,
                read_iov: hdr.read_iov,
            })
        } else {
            let (hdr, off) = EagerRtmHdr::decode(bytes)?;
            Ok(Self {
                typ,
                tagged: hdr.common.tag.is_some(),
                tag: hdr.common.tag,
                msg_id: hdr.common.msg_id,
                dc: typ.is_dc(),
                cq_data: hdr.opt.cq_data,
                total_len: (bytes.len() - off) as u64,
                send_id: None,
                payload_off: off,
                seg_offset: 0,
                read_iov: Vec::new(),
            })
        }
    }
}

impl<T: Transport> Endpoint<T> {
    // ---------------------------------------------------------------
    // Public send surface
    // ---------------------------------------------------------------

    /// Send an untagged message.
    pub fn send(&mut self, addr: FiAddr, buf: &[u8], context: u64) -> Result<()> {
        self.send_opts(addr, buf, &SendOpts::default(), context)
    }

    /// Send a tagged message.
    pub fn tsend(&mut self, addr: FiAddr, buf: &[u8], tag: u64, context: u64) -> Result<()> {
        let opts = SendOpts {
            tag: Some(tag),
            ..Default::default()
        };
        self.send_opts(addr, buf, &opts, context)
    }

    /// Send with full options.
    pub fn send_opts(
        &mut self,
        addr: FiAddr,
        buf: &[u8],
        opts: &SendOpts,
        context: u64,
    ) -> Result<()> {
        let peer = self
            .av
            .peer(addr)
            .ok_or(Error::InvalidArgument("send to unknown fi_addr"))?;
        if opts.delivery_complete
            && peer.handshake_received()
            && !peer.supports(extra_feature::DELIVERY_COMPLETE)
        {
            return Err(Error::OpNotSupported("peer lacks delivery-complete"));
        }
        if !self.hmem.is_supported(opts.hmem.iface) {
            return Err(Error::NotSupported("hmem interface not discovered"));
        }

        let mut payload = vec![0u8; buf.len()];
        self.hmem.copy_from(opts.hmem, &mut payload, buf)?;

        let op = if opts.tag.is_some() {
            TxOp::Tagged
        } else {
            TxOp::Msg
        };
        let proto = self.choose_msg_proto(addr, buf.len(), opts);
        let mut tx = TxEntry::new(op, proto, addr, payload, context);
        tx.tag = opts.tag;
        tx.cq_data = opts.cq_data;
        tx.dc = opts.delivery_complete;
        tx.hmem = opts.hmem;
        tx.msg_id = self.av.peer_mut(addr).unwrap().next_msg_id();
        let tx_id = self.alloc_tx(tx);

        let res = match proto {
            TxProto::Eager => self.send_eager_rtm(tx_id),
            TxProto::Medium => self.send_medium_rtm(tx_id),
            TxProto::LongCts => self.start_longcts_rtm(tx_id),
            TxProto::LongRead => self.send_longread_rtm(tx_id),
            _ => unreachable!("message proto"),
        };
        if let Err(e) = res {
            // Unwind so the peer never sees a msg_id gap.
            let tx = self.txs.remove(tx_id);
            self.tx_queued.retain(|&id| id != tx_id);
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.undo_msg_id();
                peer.return_credits(tx.credits);
                peer.tx_entries.retain(|&id| id != tx_id);
            }
            return Err(e);
        }
        Ok(())
    }

    fn choose_msg_proto(&self, addr: FiAddr, len: usize, opts: &SendOpts) -> TxProto {
        if len <= self.max_eager_payload(addr, opts) {
            return TxProto::Eager;
        }
        if len <= self.cfg.medium_threshold {
            return TxProto::Medium;
        }
        let peer = self.av.peer(addr).expect("peer");
        if len >= self.cfg.longread_threshold
            && self.tp.supports_rdma_read()
            && peer.handshake_received()
            && peer.supports(extra_feature::RDMA_READ)
        {
            return TxProto::LongRead;
        }
        TxProto::LongCts
    }

    /// Largest payload an eager RTM to `addr` can carry right now.
    fn max_eager_payload(&self, addr: FiAddr, opts: &SendOpts) -> usize {
        let opt = self.req_opt_hdrs(addr, opts.cq_data);
        let tag_len = if opts.tag.is_some() { 8 } else { 0 };
        let hdr = BASE_HDR_LEN + 4 + tag_len + opt.wire_len();
        self.tp.mtu().saturating_sub(hdr)
    }

    fn eager_type(dc: bool, tagged: bool) -> PktType {
        match (dc, tagged) {
            (false, false) => PktType::EagerMsgRtm,
            (false, true) => PktType::EagerTagRtm,
            (true, false) => PktType::DcEagerMsgRtm,
            (true, true) => PktType::DcEagerTagRtm,
        }
    }

    fn medium_type(dc: bool, tagged: bool) -> PktType {
        match (dc, tagged) {
            (false, false) => PktType::MediumMsgRtm,
            (false, true) => PktType::MediumTagRtm,
            (true, false) => PktType::DcMediumMsgRtm,
            (true, true) => PktType::DcMediumTagRtm,
        }
    }

    fn longcts_type(dc: bool, tagged: bool) -> PktType {
        match (dc, tagged) {
            (false, false) => PktType::LongCtsMsgRtm,
            (false, true) => PktType::LongCtsTagRtm,
            (true, false) => PktType::DcLongCtsMsgRtm,
            (true, true) => PktType::DcLongCtsTagRtm,
        }
    }

    fn send_eager_rtm(&mut self, tx_id: usize) -> Result<()> {
        let tx = &self.txs[tx_id];
        let addr = tx.addr;
        let hdr = EagerRtmHdr {
            common: ReqCommon {
                typ: Self::eager_type(tx.dc, tx.tag.is_some()),
                msg_id: tx.msg_id,
                tag: tx.tag,
            },
            opt: self.req_opt_hdrs(addr, tx.cq_data),
        };

        let pkt_id = self.tx_pool.alloc()?;
        {
            let tx = &self.txs[tx_id];
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.buf_mut()[n..n + tx.payload.len()].copy_from_slice(&tx.payload);
            pkt.size = n + tx.payload.len();
            pkt.payload_len = tx.payload.len();
            pkt.payload_off = n;
            pkt.owner = PktOwner::Tx(tx_id);
            pkt.addr = Some(addr);
        }
        let len = self.txs[tx_id].payload.len() as u64;
        self.txs[tx_id].add_sent(len);
        self.send_or_queue_tx(tx_id, pkt_id);
        Ok(())
    }

    fn send_medium_rtm(&mut self, tx_id: usize) -> Result<()> {
        let (addr, total, dc, tagged) = {
            let tx = &self.txs[tx_id];
            (tx.addr, tx.total_len, tx.dc, tx.tag.is_some())
        };
        let opt = self.req_opt_hdrs(addr, self.txs[tx_id].cq_data);
        let hdr_probe = MediumRtmHdr {
            common: ReqCommon {
                typ: Self::medium_type(dc, tagged),
                msg_id: self.txs[tx_id].msg_id,
                tag: self.txs[tx_id].tag,
            },
            data_len: total,
            seg_offset: 0,
            opt,
        };
        let max_seg = self.tp.mtu() - hdr_probe.wire_len();
        let nsegs = (total as usize).div_ceil(max_seg);

        // Allocate the whole burst up front so a pool shortage fails the
        // submit cleanly instead of mid-message.
        let mut pkts = Vec::with_capacity(nsegs);
        for _ in 0..nsegs {
            match self.tx_pool.alloc() {
                Ok(id) => pkts.push(id),
                Err(e) => {
                    for id in pkts {
                        self.tx_pool.release(id);
                    }
                    return Err(e);
                }
            }
        }

        for (i, pkt_id) in pkts.into_iter().enumerate() {
            if !self.txs.contains(tx_id) {
                // A hard post error already failed the entry.
                self.tx_pool.release(pkt_id);
                continue;
            }
            let seg_offset = (i * max_seg) as u64;
            let seg_len = max_seg.min((total - seg_offset) as usize);
            let mut hdr = hdr_probe.clone();
            hdr.seg_offset = seg_offset;
            {
                let tx = &self.txs[tx_id];
                let pkt = self.tx_pool.get_mut(pkt_id);
                let n = hdr.encode(pkt.buf_mut());
                pkt.buf_mut()[n..n + seg_len].copy_from_slice(
                    &tx.payload[seg_offset as usize..seg_offset as usize + seg_len],
                );
                pkt.size = n + seg_len;
                pkt.payload_len = seg_len;
                pkt.payload_off = n;
                pkt.owner = PktOwner::Tx(tx_id);
                pkt.addr = Some(addr);
            }
            self.txs[tx_id].add_sent(seg_len as u64);
            // A rejected segment parks on the queued list; the burst is
            // re-driven by progress, never aborted.
            self.send_or_queue_tx(tx_id, pkt_id);
        }
        Ok(())
    }

    /// Long-CTS start: claim credits and emit the RTM. With no credits
    /// available the entry waits on the queued list and is retried by the
    /// progress loop.
    pub(crate) fn start_longcts_rtm(&mut self, tx_id: usize) -> Result<()> {
        let addr = self.txs[tx_id].addr;
        let max_data = self.max_data_payload(addr);
        let (total, min_credits) = (self.txs[tx_id].total_len, self.cfg.tx_min_credits);
        let claimed = self
            .av
            .peer_mut(addr)
            .expect("peer")
            .request_credits(total, max_data, min_credits);
        if claimed == 0 {
            let tx = &mut self.txs[tx_id];
            tx.state = TxState::QueuedCtrl;
            if !self.tx_queued.contains(&tx_id) {
                self.tx_queued.push(tx_id);
            }
            log::debug!("longcts tx {} waiting for credits", tx_id);
            return Ok(());
        }
        {
            let tx = &mut self.txs[tx_id];
            tx.credits = claimed;
            tx.credit_request = claimed;
        }

        let tx = &self.txs[tx_id];
        let hdr = LongCtsRtmHdr {
            common: ReqCommon {
                typ: Self::longcts_type(tx.dc, tx.tag.is_some()),
                msg_id: tx.msg_id,
                tag: tx.tag,
            },
            msg_length: tx.total_len,
            send_id: tx_id as u32,
            credit_request: claimed,
            opt: self.req_opt_hdrs(addr, tx.cq_data),
        };

        let pkt_id = self.tx_pool.alloc()?;
        let chunk = {
            let tx = &self.txs[tx_id];
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            let chunk = (self.tp.mtu() - n).min(tx.payload.len());
            pkt.buf_mut()[n..n + chunk].copy_from_slice(&tx.payload[..chunk]);
            pkt.size = n + chunk;
            pkt.payload_len = chunk;
            pkt.payload_off = n;
            pkt.owner = PktOwner::Tx(tx_id);
            pkt.addr = Some(addr);
            chunk
        };
        self.txs[tx_id].add_sent(chunk as u64);
        self.send_or_queue_tx(tx_id, pkt_id);
        Ok(())
    }

    fn send_longread_rtm(&mut self, tx_id: usize) -> Result<()> {
        let addr = self.txs[tx_id].addr;

        // Move the payload into a registered region the peer reads from.
        let payload = std::mem::take(&mut self.txs[tx_id].payload);
        let total = payload.len() as u64;
        let region: Region = std::rc::Rc::new(std::cell::RefCell::new(payload));
        let desc = self
            .tp
            .register(region.clone(), Access::REMOTE_READ | Access::LOCAL_READ)?;
        {
            let tx = &mut self.txs[tx_id];
            tx.read_region = Some(region);
            tx.read_desc = Some(desc);
        }

        let tx = &self.txs[tx_id];
        let typ = if tx.tag.is_some() {
            PktType::LongReadTagRtm
        } else {
            PktType::LongReadMsgRtm
        };
        let hdr = LongReadRtmHdr {
            common: ReqCommon {
                typ,
                msg_id: tx.msg_id,
                tag: tx.tag,
            },
            msg_length: total,
            send_id: tx_id as u32,
            read_iov: vec![RmaIov {
                addr: 0,
                len: total,
                key: desc.rkey,
            }],
            opt: self.req_opt_hdrs(addr, tx.cq_data),
        };

        let pkt_id = self.tx_pool.alloc()?;
        {
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.size = n;
            pkt.payload_len = 0;
            pkt.payload_off = n;
            pkt.owner = PktOwner::Tx(tx_id);
            pkt.addr = Some(addr);
        }
        self.send_or_queue_tx(tx_id, pkt_id);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Public receive surface
    // ---------------------------------------------------------------

    /// Post an untagged receive of up to `len` bytes from any peer.
    pub fn recv(&mut self, len: usize, context: u64) -> Result<()> {
        self.recv_from(None, len, context)
    }

    /// Post an untagged receive restricted to `src`.
    pub fn recv_from(&mut self, src: Option<FiAddr>, len: usize, context: u64) -> Result<()> {
        self.post_recv_entry(src, false, 0, 0, len, context, HmemDesc::default())
    }

    /// Post a tagged receive.
    pub fn trecv(
        &mut self,
        src: Option<FiAddr>,
        tag: u64,
        ignore: u64,
        len: usize,
        context: u64,
    ) -> Result<()> {
        self.post_recv_entry(src, true, tag, ignore, len, context, HmemDesc::default())
    }

    /// Post a multi-recv buffer: successive untagged messages consume it
    /// until the remaining space drops below the configured minimum.
    pub fn multi_recv(&mut self, len: usize, context: u64) -> Result<()> {
        let mut rx = RxEntry::new(RxOp::Msg, None, RxDest::None, len, context);
        rx.is_multi_recv = true;
        rx.mr_remaining = len;
        let rx_id = self.alloc_rx(rx);
        self.rx_list.push_back(rx_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn post_recv_entry(
        &mut self,
        src: Option<FiAddr>,
        tagged: bool,
        tag: u64,
        ignore: u64,
        len: usize,
        context: u64,
        hmem: HmemDesc,
    ) -> Result<()> {
        if !self.hmem.is_supported(hmem.iface) {
            return Err(Error::NotSupported("hmem interface not discovered"));
        }

        // Try the unexpected lists first.
        if let Some(rx_id) = self.match_unexpected(src, tagged, tag, ignore) {
            {
                let rx = &mut self.rxs[rx_id];
                rx.dest = RxDest::Owned(vec![0u8; len]);
                rx.recv_len = len;
                rx.context = context;
                rx.hmem = hmem;
                rx.state = RxState::Matched;
                rx.cq_len = (rx.total_len as usize).min(len);
            }
            let staged = std::mem::take(&mut self.rxs[rx_id].unexp_pkts);
            for pkt_id in staged {
                self.process_rtm_payload(rx_id, pkt_id);
                // Staged packets live in the unexpected pool.
                self.pool(pkt_id.pool).release(pkt_id);
            }
            return Ok(());
        }

        let op = if tagged { RxOp::Tagged } else { RxOp::Msg };
        let mut rx = RxEntry::new(op, src, RxDest::Owned(vec![0u8; len]), len, context);
        rx.tag = tag;
        rx.ignore = ignore;
        rx.hmem = hmem;
        let rx_id = self.alloc_rx(rx);
        if tagged {
            self.rx_tagged_list.push_back(rx_id);
        } else {
            self.rx_list.push_back(rx_id);
        }
        Ok(())
    }

    /// Cancel a posted receive by context. One `Cancelled` error
    /// completion is written; a matched entry keeps sinking protocol
    /// packets silently until its transfer drains.
    pub fn cancel_recv(&mut self, context: u64) -> bool {
        let Some(rx_id) = self.rxs.iter().find_map(|(id, rx)| {
            (matches!(rx.op, RxOp::Msg | RxOp::Tagged)
                && !rx.silent
                && !rx.cancelled
                && rx.state != RxState::Unexp
                && rx.context == context)
                .then_some(id)
        }) else {
            return false;
        };

        let flags = if self.rxs[rx_id].tagged() {
            CompFlags::RECV | CompFlags::MSG | CompFlags::TAGGED
        } else {
            CompFlags::RECV | CompFlags::MSG
        };
        self.cq.write_error(CqErrEntry {
            context,
            flags,
            err: Error::Cancelled,
        });

        let state = self.rxs[rx_id].state;
        if state == RxState::Init {
            // Never matched: drop the posted entry entirely.
            self.rx_list.retain(|&id| id != rx_id);
            self.rx_tagged_list.retain(|&id| id != rx_id);
            self.unpin_rx(rx_id);
            self.rxs.remove(rx_id);
        } else {
            // Mid-transfer: sink everything that still arrives.
            self.rxs[rx_id].cancelled = true;
        }
        true
    }

    // ---------------------------------------------------------------
    // RTM receive path
    // ---------------------------------------------------------------

    /// Handle an ordered RTM that cleared the reorder window, or a medium
    /// segment routed via the rx map.
    pub(crate) fn handle_rtm(&mut self, pkt_id: PktId) {
        let src = self.pool_ref(pkt_id.pool).get(pkt_id).addr.expect("rtm src");
        let info = match RtmInfo::decode(self.pool_ref(pkt_id.pool).get(pkt_id).bytes()) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("dropping malformed RTM from {}: {}", src, e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };

        match self.match_posted(src, &info) {
            Some(rx_id) => {
                self.bind_rtm(rx_id, src, &info);
                if info.typ.is_medium_rtm() && !self.rxs[rx_id].complete_received() {
                    self.pkt_rx_map.insert((info.msg_id, src), rx_id);
                }
                self.process_rtm_payload(rx_id, pkt_id);
                self.release_rx_pkt(pkt_id);
            }
            None => self.stage_unexpected(src, &info, pkt_id),
        }
    }

    /// Route a medium segment to its reassembling entry, if one exists.
    /// Returns false when the packet is not a known segment and must go
    /// through ordering.
    pub(crate) fn try_route_medium(&mut self, pkt_id: PktId) -> bool {
        let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
        let src = pkt.addr.expect("rtm src");
        let Ok(msg_id) = crate::packet::pkt_msg_id(pkt.bytes()) else {
            return false;
        };
        let Some(&rx_id) = self.pkt_rx_map.get(&(msg_id, src)) else {
            return false;
        };
        if self.rxs[rx_id].state == RxState::Unexp {
            // Still unmatched: chain the segment onto the staged entry.
            match self.clone_to_unexp(pkt_id) {
                Ok(clone) => self.rxs[rx_id].unexp_pkts.push(clone),
                Err(e) => log::warn!("dropping unexpected medium segment: {}", e),
            }
            self.release_rx_pkt(pkt_id);
        } else {
            self.process_rtm_payload(rx_id, pkt_id);
            self.release_rx_pkt(pkt_id);
        }
        true
    }

    /// Find a posted receive for an incoming RTM, slicing multi-recv
    /// parents as needed.
    fn match_posted(&mut self, src: FiAddr, info: &RtmInfo) -> Option<usize> {
        let list = if info.tagged {
            &self.rx_tagged_list
        } else {
            &self.rx_list
        };
        let pos = list
            .iter()
            .position(|&id| self.rxs[id].matches(src, info.tagged, info.tag))?;
        let rx_id = if info.tagged {
            self.rx_tagged_list[pos]
        } else {
            self.rx_list[pos]
        };

        if self.rxs[rx_id].is_multi_recv {
            return Some(self.carve_multi_recv(rx_id, pos, src, info));
        }

        if info.tagged {
            self.rx_tagged_list.remove(pos);
        } else {
            self.rx_list.remove(pos);
        }
        Some(rx_id)
    }

    /// Carve a child entry out of a multi-recv parent.
    fn carve_multi_recv(
        &mut self,
        parent_id: usize,
        pos: usize,
        src: FiAddr,
        info: &RtmInfo,
    ) -> usize {
        let msg_len = info.total_len as usize;
        let (context, slice) = {
            let parent = &mut self.rxs[parent_id];
            let slice = msg_len.min(parent.mr_remaining);
            parent.mr_consumers += 1;
            parent.mr_remaining -= slice;
            (parent.context, slice)
        };
        let mut child = RxEntry::new(
            RxOp::Msg,
            Some(src),
            RxDest::Owned(vec![0u8; slice]),
            slice,
            context,
        );
        child.multi_recv_parent = Some(parent_id);
        let child_id = self.alloc_rx(child);

        if self.rxs[parent_id].mr_remaining < self.cfg.min_multi_recv {
            // Retired: no further matches; final completion once the
            // last consumer drains.
            self.rx_list.remove(pos);
            self.maybe_finish_multi_recv(parent_id);
        }
        child_id
    }

    /// Write the parent's MULTI_RECV completion once retired and
    /// drained.
    pub(crate) fn maybe_finish_multi_recv(&mut self, parent_id: usize) {
        let Some(parent) = self.rxs.get(parent_id) else {
            return;
        };
        if !parent.is_multi_recv
            || parent.mr_consumers > 0
            || self.rx_list.contains(&parent_id)
        {
            return;
        }
        let context = parent.context;
        let cancelled = parent.cancelled;
        self.unpin_rx(parent_id);
        self.rxs.remove(parent_id);
        if !cancelled {
            self.cq.write(CqEntry {
                context,
                flags: CompFlags::MULTI_RECV,
                len: 0,
                buf: None,
                data: None,
                tag: None,
                src_addr: None,
            });
        }
    }

    /// Bind RTM identity onto a matched entry.
    fn bind_rtm(&mut self, rx_id: usize, src: FiAddr, info: &RtmInfo) {
        self.pin_rx(rx_id, src);
        let rx = &mut self.rxs[rx_id];
        rx.state = RxState::Recv;
        rx.msg_id = Some(info.msg_id);
        rx.peer_send_id = info.send_id;
        rx.total_len = info.total_len;
        rx.dc = info.dc;
        rx.cq_data = info.cq_data;
        if info.tagged {
            rx.tag = info.tag.unwrap_or(0);
        }
        rx.cq_len = (info.total_len as usize).min(rx.recv_len);
    }

    /// Stage an unexpected message: clone out of the posted buffer and
    /// park on the unexpected list.
    fn stage_unexpected(&mut self, src: FiAddr, info: &RtmInfo, pkt_id: PktId) {
        let clone = match self.clone_to_unexp(pkt_id) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("unexpected pool exhausted, dropping message: {}", e);
                self.cq.write_error(CqErrEntry {
                    context: 0,
                    flags: CompFlags::RECV | CompFlags::MSG,
                    err: e,
                });
                self.release_rx_pkt(pkt_id);
                return;
            }
        };
        self.release_rx_pkt(pkt_id);

        let op = if info.tagged { RxOp::Tagged } else { RxOp::Msg };
        let mut rx = RxEntry::new(op, Some(src), RxDest::None, 0, 0);
        rx.state = RxState::Unexp;
        rx.msg_id = Some(info.msg_id);
        rx.peer_send_id = info.send_id;
        rx.total_len = info.total_len;
        rx.dc = info.dc;
        rx.cq_data = info.cq_data;
        rx.tag = info.tag.unwrap_or(0);
        rx.unexp_pkts.push(clone);
        let rx_id = self.alloc_rx(rx);
        if info.typ.is_medium_rtm() {
            self.pkt_rx_map.insert((info.msg_id, src), rx_id);
        }
        // The packet's own class bits decide which unexpected list it
        // joins.
        if info.tagged {
            self.unexp_tagged_list.push_back(rx_id);
        } else {
            self.unexp_list.push_back(rx_id);
        }
        log::trace!("staged unexpected msg_id {} from {}", info.msg_id, src);
    }

    /// Find and claim a staged unexpected message matching a new posted
    /// receive.
    fn match_unexpected(
        &mut self,
        src: Option<FiAddr>,
        tagged: bool,
        tag: u64,
        ignore: u64,
    ) -> Option<usize> {
        let list = if tagged {
            &mut self.unexp_tagged_list
        } else {
            &mut self.unexp_list
        };
        let rxs = &self.rxs;
        let pos = list.iter().position(|&id| {
            let rx = &rxs[id];
            let src_ok = src.is_none() || src == rx.addr;
            let tag_ok = !tagged || (rx.tag ^ tag) & !ignore == 0;
            src_ok && tag_ok
        })?;
        let rx_id = list[pos];
        list.remove(pos);
        Some(rx_id)
    }

    /// Apply one RTM packet's payload and protocol actions to a matched
    /// entry.
    pub(crate) fn process_rtm_payload(&mut self, rx_id: usize, pkt_id: PktId) {
        let info = match RtmInfo::decode(self.pool_ref(pkt_id.pool).get(pkt_id).bytes()) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("malformed staged RTM: {}", e);
                return;
            }
        };

        if info.typ.is_longread_rtm() {
            let addr = self.rxs[rx_id].addr.expect("bound rx");
            let read = ReadEntry::new(
                ReadOwner::Rx(rx_id),
                addr,
                info.read_iov.clone(),
                info.total_len,
            );
            let read_id = self.reads.insert(read);
            self.post_reads_or_queue(read_id);
            return;
        }

        {
            let pkt = crate::pool::pkt_entry!(self, pkt_id);
            let payload = &pkt.bytes()[info.payload_off..];
            let rx = &mut self.rxs[rx_id];
            if !rx.cancelled && !payload.is_empty() {
                rx.dest.write(info.seg_offset as usize, payload);
            }
            rx.add_received(payload.len() as u64);
        }

        if info.typ.is_longcts_rtm() && !self.rxs[rx_id].complete_received() {
            self.send_cts(rx_id);
            return;
        }

        if self.rxs[rx_id].complete_received() {
            if info.typ.is_medium_rtm() {
                let addr = self.rxs[rx_id].addr.expect("bound rx");
                self.pkt_rx_map.remove(&(info.msg_id, addr));
            }
            self.finalize_rx_msg(rx_id);
        }
    }

    /// Finish a message receive: RECEIPT for delivery-complete, the
    /// single application completion, multi-recv accounting, release.
    pub(crate) fn finalize_rx_msg(&mut self, rx_id: usize) {
        let (dc, addr, send_id, msg_id) = {
            let rx = &self.rxs[rx_id];
            (rx.dc, rx.addr, rx.peer_send_id, rx.msg_id)
        };
        if dc {
            if let Some(addr) = addr {
                // Long protocols route the receipt by send_id; eager and
                // medium fall back to (peer, msg_id) on the sender.
                self.send_receipt(addr, send_id.unwrap_or(u32::MAX), msg_id.unwrap_or(0));
            }
        }

        let mut rx = self.rxs.remove(rx_id);
        self.rx_queued.retain(|&id| id != rx_id);
        if let Some(addr) = rx.addr {
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.rx_entries.retain(|&id| id != rx_id);
            }
        }

        if !rx.cancelled && !rx.silent {
            let mut flags = match rx.op {
                RxOp::Tagged => CompFlags::RECV | CompFlags::MSG | CompFlags::TAGGED,
                RxOp::WriteTarget => CompFlags::REMOTE_WRITE | CompFlags::RMA,
                RxOp::ReadRsp => CompFlags::RMA | CompFlags::READ,
                _ => CompFlags::RECV | CompFlags::MSG,
            };
            if rx.cq_data.is_some() {
                flags |= CompFlags::REMOTE_CQ_DATA;
            }
            let mut buf = rx.dest.take_owned();
            if let Some(b) = buf.as_mut() {
                b.truncate(rx.cq_len);
            }
            self.cq.write(CqEntry {
                context: rx.context,
                flags,
                len: rx.cq_len,
                buf,
                data: rx.cq_data,
                tag: rx.tagged().then_some(rx.tag),
                src_addr: rx.addr,
            });
        }

        // Control packets still waiting (an EOR or RECEIPT that hit
        // EAGAIN) outlive the entry as ownerless controls.
        for pkt in rx.queued_pkts.drain(..) {
            self.pool(pkt.pool).get_mut(pkt).owner = PktOwner::None;
            self.ctrl_queued.push(pkt);
        }
        if let Some(parent_id) = rx.multi_recv_parent {
            if let Some(parent) = self.rxs.get_mut(parent_id) {
                parent.mr_consumers -= 1;
            }
            self.maybe_finish_multi_recv(parent_id);
        }
    }

    /// Send the handshake reply if this peer has not seen ours yet.
    /// Failures are non-fatal; EAGAIN parks the peer on the retry list.
    pub(crate) fn ensure_handshake(&mut self, addr: FiAddr) {
        let Some(peer) = self.av.peer_mut(addr) else {
            return;
        };
        if peer.flags.contains(PeerFlags::HANDSHAKE_SENT) {
            return;
        }
        peer.flags |= PeerFlags::HANDSHAKE_SENT;
        self.post_handshake(addr);
    }
}
