//! The progress engine.
//!
//! A single cooperative pass drives everything: poll the transport
//! completion queues, dispatch by packet type, refill receive buffers,
//! expire RNR backoffs, retry queued handshakes and packets, pump
//! long-CTS windows, post pending RDMA reads, and flush. Application
//! calls only enqueue intent; nothing blocks.

use crate::addr::FiAddr;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::packet::{pkt_connid, pkt_msg_id, pkt_raw_addr, BaseHdr, PktType};
use crate::peer::{current_time_us, PeerFlags, SeqCheck};
use crate::pool::{PktId, PktOwner, PktState};
use crate::rx_entry::RxState;
use crate::transport::{CompOp, CompStatus, Completion, Transport};
use crate::tx_entry::TxState;

impl<T: Transport> Endpoint<T> {
    /// Run one iteration of the progress engine.
    pub fn progress(&mut self) {
        // 1. Poll the main transport CQ.
        let comps = self.tp.poll_cq(self.cfg.cq_poll_batch);
        for comp in comps {
            self.dispatch_completion(comp, false);
        }

        // 2. Poll the shm CQ, translating sources back to main
        //    addresses.
        if self.shm.is_some() {
            let comps = self
                .shm
                .as_mut()
                .expect("shm transport")
                .poll_cq(self.cfg.cq_poll_batch);
            for comp in comps {
                self.dispatch_completion(comp, true);
            }
        }

        // 3. Refill the receive pools.
        self.bulk_post_recv();

        // 4. Expire peer backoffs.
        self.sweep_backoff();

        // 5. Retry queued handshakes.
        let queued = std::mem::take(&mut self.handshake_queued);
        for addr in queued {
            let still_queued = self
                .av
                .peer(addr)
                .is_some_and(|p| p.flags.contains(PeerFlags::HANDSHAKE_QUEUED));
            if still_queued {
                self.post_handshake(addr);
            }
        }

        // Ownerless control packets deferred by RNR or EAGAIN.
        let ctrl = std::mem::take(&mut self.ctrl_queued);
        for pkt_id in ctrl {
            self.send_or_queue_ctrl(pkt_id);
        }

        // 6. Re-drive RX entries with queued packets.
        let rx_queued = std::mem::take(&mut self.rx_queued);
        for rx_id in rx_queued {
            self.redrive_rx(rx_id);
        }

        // 7. Re-drive TX entries with queued packets or deferred
        //    controls.
        let tx_queued = std::mem::take(&mut self.tx_queued);
        for tx_id in tx_queued {
            self.redrive_tx(tx_id);
        }

        // 8. Pump long-CTS windows.
        let pending = self.tx_pending.clone();
        for tx_id in pending {
            if self.txs.contains(tx_id) {
                self.pump_tx_data(tx_id);
            }
        }
        self.tx_pending.retain(|&id| self.txs.contains(id));

        // 9. Post pending RDMA reads.
        let reads = std::mem::take(&mut self.read_pending);
        for read_id in reads {
            if self.reads.contains(read_id) {
                self.post_reads_or_queue(read_id);
            }
        }

        // 10. Flush batched work.
        self.tp.flush();
        if let Some(shm) = self.shm.as_mut() {
            shm.flush();
        }
    }

    // ---------------------------------------------------------------
    // Completion dispatch
    // ---------------------------------------------------------------

    fn dispatch_completion(&mut self, comp: Completion, from_shm: bool) {
        match comp.op {
            CompOp::Send => {
                if !from_shm {
                    self.outstanding_tx = self.outstanding_tx.saturating_sub(1);
                }
                self.handle_send_comp(comp, from_shm);
            }
            CompOp::Recv => self.handle_recv_comp(comp, from_shm),
            CompOp::Read => {
                self.outstanding_tx = self.outstanding_tx.saturating_sub(1);
                let pkt_id = PktId::from_wr_id(comp.wr_id);
                self.handle_read_completion(pkt_id, comp.status == CompStatus::Ok, comp.buf);
            }
        }
    }

    fn handle_send_comp(&mut self, comp: Completion, from_shm: bool) {
        let pkt_id = PktId::from_wr_id(comp.wr_id);
        let Some(pkt) = self.tx_pool.try_get_mut(pkt_id) else {
            log::warn!("send completion for unknown packet {:?}", pkt_id);
            return;
        };
        let addr = pkt.addr.expect("sent packet peer");
        let was_retransmit = pkt.state == PktState::RnrRetransmit;
        let owner = pkt.owner;
        let payload_len = pkt.payload_len as u64;

        if !from_shm {
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.dec_tx_pending();
            }
        }

        match comp.status {
            CompStatus::Ok => {
                // Any successful completion to a peer ends its backoff.
                if let Some(peer) = self.av.peer_mut(addr) {
                    if was_retransmit || peer.in_backoff() {
                        peer.reset_backoff();
                    }
                }
                self.tx_pool.release(pkt_id);
                match owner {
                    PktOwner::Tx(tx_id) => {
                        if self.txs.contains(tx_id) {
                            self.txs[tx_id].add_acked(payload_len);
                            if self.txs[tx_id].done() {
                                self.finalize_tx(tx_id);
                            }
                        }
                    }
                    PktOwner::Rx(_) | PktOwner::None => {}
                    PktOwner::Read(_) => unreachable!("read context in send completion"),
                }
            }
            CompStatus::Rnr => self.handle_rnr(pkt_id, addr, owner),
            CompStatus::Err => {
                self.tx_pool.release(pkt_id);
                log::warn!("hard send error toward {}", addr);
                match owner {
                    PktOwner::Tx(tx_id) => self.fail_tx(tx_id, Error::Io("send failed")),
                    PktOwner::Rx(rx_id) => self.fail_rx(rx_id, Error::Io("send failed")),
                    _ => {}
                }
            }
        }
    }

    /// Receiver-not-ready: back the peer off and park the packet for
    /// retransmission.
    fn handle_rnr(&mut self, pkt_id: PktId, addr: FiAddr, owner: PktOwner) {
        let now = current_time_us();
        let (initial, cap) = (self.cfg.rnr_backoff_initial_us, self.cfg.rnr_backoff_cap_us);
        if let Some(peer) = self.av.peer_mut(addr) {
            peer.backoff(now, initial, cap);
            peer.rnr_queued_pkts += 1;
        }
        if !self.peers_in_backoff.contains(&addr) {
            self.peers_in_backoff.push(addr);
        }
        self.tx_pool.get_mut(pkt_id).state = PktState::RnrRetransmit;
        log::debug!("RNR from {}; packet {:?} parked", addr, pkt_id);

        match owner {
            PktOwner::Tx(tx_id) => {
                if !self.txs.contains(tx_id) {
                    self.tx_pool.release(pkt_id);
                    return;
                }
                let tx = &mut self.txs[tx_id];
                tx.queued_pkts.push(pkt_id);
                tx.state = match tx.state {
                    TxState::Req | TxState::QueuedCtrl | TxState::QueuedReqRnr => {
                        TxState::QueuedReqRnr
                    }
                    _ => TxState::QueuedDataRnr,
                };
                if !self.tx_queued.contains(&tx_id) {
                    self.tx_queued.push(tx_id);
                }
            }
            PktOwner::Rx(rx_id) => {
                if !self.rxs.contains(rx_id) {
                    self.tx_pool.release(pkt_id);
                    return;
                }
                self.rxs[rx_id].queued_pkts.push(pkt_id);
                if !self.rx_queued.contains(&rx_id) {
                    self.rx_queued.push(rx_id);
                }
            }
            PktOwner::None => self.ctrl_queued.push(pkt_id),
            PktOwner::Read(_) => unreachable!("read context got RNR"),
        }
    }

    fn handle_recv_comp(&mut self, comp: Completion, from_shm: bool) {
        let pkt_id = PktId::from_wr_id(comp.wr_id);
        let buf = comp.buf.expect("recv completion returns the buffer");
        if comp.status != CompStatus::Ok {
            log::warn!("recv completion error");
            self.rx_pool.get_mut(pkt_id).restore_buf(buf, 0);
            self.release_rx_pkt(pkt_id);
            return;
        }
        self.rx_pool.get_mut(pkt_id).restore_buf(buf, comp.byte_len);

        let src = comp.src.and_then(|(ahn, qpn)| {
            if from_shm {
                self.av.shm_reverse_lookup(ahn, qpn)
            } else {
                self.av.reverse_lookup(ahn, qpn)
            }
        });
        self.dispatch_pkt(pkt_id, src);
    }

    /// Attribute and dispatch one received packet.
    fn dispatch_pkt(&mut self, pkt_id: PktId, src: Option<FiAddr>) {
        let base = match BaseHdr::decode(self.pool_ref(pkt_id.pool).get(pkt_id).bytes()) {
            Ok(base) => base,
            Err(e) => {
                log::warn!("dropping malformed packet: {}", e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };

        // Unknown sender: a REQ carrying the raw-address header
        // introduces the peer; anything else is dropped.
        let src = match src {
            Some(src) => src,
            None => {
                let raw = pkt_raw_addr(self.pool_ref(pkt_id.pool).get(pkt_id).bytes())
                    .ok()
                    .flatten();
                match raw {
                    Some(raw) => match self.av_insert(&raw) {
                        Ok(fi) => fi,
                        Err(e) => {
                            log::warn!("implicit AV insert failed: {}", e);
                            self.release_rx_pkt(pkt_id);
                            return;
                        }
                    },
                    None => {
                        log::debug!("dropping packet from unknown peer");
                        self.release_rx_pkt(pkt_id);
                        return;
                    }
                }
            }
        };
        self.pool(pkt_id.pool).get_mut(pkt_id).addr = Some(src);

        // Connid gate: a mismatch is traffic from a destroyed
        // predecessor QP that shares GID and QPN. Silently dropped.
        let pkt_cid = pkt_connid(self.pool_ref(pkt_id.pool).get(pkt_id).bytes())
            .ok()
            .flatten();
        if let (Some(cid), Some(peer)) = (pkt_cid, self.av.peer(src)) {
            if cid != peer.connid {
                log::debug!(
                    "dropping stale packet from {} (connid {:#x}, expected {:#x})",
                    src,
                    cid,
                    peer.connid
                );
                self.release_rx_pkt(pkt_id);
                return;
            }
        }

        if base.typ.is_req() {
            self.ensure_handshake(src);
        }

        if base.typ.is_ordered() {
            self.dispatch_ordered(pkt_id, src, base.typ);
            return;
        }

        match base.typ {
            PktType::Handshake => self.handle_handshake(pkt_id),
            PktType::Cts => self.handle_cts(pkt_id),
            PktType::Data => self.handle_data(pkt_id),
            PktType::ReadRsp => self.handle_readrsp(pkt_id),
            PktType::Eor => self.handle_eor(pkt_id),
            PktType::Receipt => self.handle_receipt(pkt_id),
            PktType::AtomRsp => self.handle_atomrsp(pkt_id),
            t if t.is_rtw() => self.handle_rtw(pkt_id),
            t if t.is_rtr() => self.handle_rtr(pkt_id),
            t => {
                log::warn!("unhandled packet type {:?}", t);
                self.release_rx_pkt(pkt_id);
            }
        }
    }

    /// Ordered (RTM/RTA) arrival: run it through the peer's reorder
    /// window, then drain whatever became processable.
    fn dispatch_ordered(&mut self, pkt_id: PktId, src: FiAddr, typ: PktType) {
        // Medium segments of an already-started message bypass the
        // window; the message consumed its msg_id with its first
        // segment.
        if typ.is_medium_rtm() && self.try_route_medium(pkt_id) {
            return;
        }

        let msg_id = match pkt_msg_id(self.pool_ref(pkt_id.pool).get(pkt_id).bytes()) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("malformed ordered packet: {}", e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };

        let recvwin_size = self.cfg.recvwin_size;
        let check = {
            let peer = self.av.peer_mut(src).expect("peer for ordered packet");
            peer.recvwin_mut(recvwin_size).check(msg_id)
        };
        match check {
            SeqCheck::Expected => {
                {
                    let peer = self.av.peer_mut(src).expect("peer");
                    peer.recvwin_mut(recvwin_size).advance();
                }
                self.process_ordered(pkt_id, typ);
                self.drain_recvwin(src);
            }
            SeqCheck::InWindow => {
                log::trace!(
                    "buffering out-of-order msg_id {} from {} ",
                    msg_id,
                    src
                );
                let chain = typ.is_medium_rtm();
                match self.clone_to_unexp(pkt_id) {
                    Ok(clone) => {
                        let peer = self.av.peer_mut(src).expect("peer");
                        if !peer.recvwin_mut(recvwin_size).buffer(msg_id, clone, chain) {
                            // Duplicate of an already-buffered id.
                            self.unexp_pool.release(clone);
                        }
                    }
                    Err(e) => log::warn!("reorder staging failed, dropping: {}", e),
                }
                self.release_rx_pkt(pkt_id);
            }
            SeqCheck::Duplicate => {
                log::trace!("duplicate msg_id {} from {}", msg_id, src);
                self.release_rx_pkt(pkt_id);
            }
            SeqCheck::TooFar => {
                log::warn!(
                    "msg_id {} from {} beyond reorder window, dropping",
                    msg_id,
                    src
                );
                self.release_rx_pkt(pkt_id);
            }
        }
    }

    /// Process buffered in-order packets that the last advance exposed.
    fn drain_recvwin(&mut self, src: FiAddr) {
        loop {
            let chain = {
                let Some(peer) = self.av.peer_mut(src) else {
                    return;
                };
                let Some(win) = peer.recvwin.as_mut() else {
                    return;
                };
                let chain = win.take_expected();
                if chain.is_empty() {
                    return;
                }
                win.advance();
                chain
            };
            for staged in chain {
                let typ = match BaseHdr::decode(self.pool_ref(staged.pool).get(staged).bytes()) {
                    Ok(base) => base.typ,
                    Err(e) => {
                        log::warn!("malformed staged packet: {}", e);
                        self.release_rx_pkt(staged);
                        continue;
                    }
                };
                // Chained medium segments after the first route through
                // the reassembly map, not the matcher.
                if typ.is_medium_rtm() && self.try_route_medium(staged) {
                    continue;
                }
                self.process_ordered(staged, typ);
            }
        }
    }

    fn process_ordered(&mut self, pkt_id: PktId, typ: PktType) {
        if typ.is_rta() {
            self.handle_rta(pkt_id);
        } else {
            self.handle_rtm(pkt_id);
        }
    }

    // ---------------------------------------------------------------
    // Queue re-driving
    // ---------------------------------------------------------------

    fn redrive_rx(&mut self, rx_id: usize) {
        if !self.rxs.contains(rx_id) {
            return;
        }
        let addr = self.rxs[rx_id].addr;
        if let Some(addr) = addr {
            if self.av.peer(addr).is_some_and(|p| p.in_backoff()) {
                self.rx_queued.push(rx_id);
                return;
            }
        }
        let mut pkts = std::mem::take(&mut self.rxs[rx_id].queued_pkts);
        while let Some(pkt_id) = pkts.first().copied() {
            match self.post_pkt(pkt_id) {
                Ok(()) => {
                    pkts.remove(0);
                }
                Err(Error::Again) => {
                    self.rxs[rx_id].queued_pkts = pkts;
                    self.rx_queued.push(rx_id);
                    return;
                }
                Err(e) => {
                    for p in pkts {
                        self.pool(p.pool).release(p);
                    }
                    self.fail_rx(rx_id, e);
                    return;
                }
            }
        }
        if self.rxs[rx_id].state == RxState::QueuedCtrl {
            self.rxs[rx_id].state = RxState::Recv;
        }
    }

    fn redrive_tx(&mut self, tx_id: usize) {
        if !self.txs.contains(tx_id) {
            return;
        }
        let addr = self.txs[tx_id].addr;
        if self.av.peer(addr).is_some_and(|p| p.in_backoff()) {
            self.tx_queued.push(tx_id);
            return;
        }

        // A long-CTS submit that could not claim credits retries here.
        if self.txs[tx_id].state == TxState::QueuedCtrl
            && self.txs[tx_id].queued_pkts.is_empty()
            && self.txs[tx_id].credits == 0
            && self.txs[tx_id].proto == crate::tx_entry::TxProto::LongCts
        {
            if let Err(e) = self.start_longcts_rtm(tx_id) {
                self.fail_tx(tx_id, e);
            }
            return;
        }

        let mut pkts = std::mem::take(&mut self.txs[tx_id].queued_pkts);
        while let Some(pkt_id) = pkts.first().copied() {
            match self.post_pkt(pkt_id) {
                Ok(()) => {
                    pkts.remove(0);
                }
                Err(Error::Again) => {
                    self.txs[tx_id].queued_pkts = pkts;
                    self.tx_queued.push(tx_id);
                    return;
                }
                Err(e) => {
                    for p in pkts {
                        self.pool(p.pool).release(p);
                    }
                    self.fail_tx(tx_id, e);
                    return;
                }
            }
        }

        let state = self.txs[tx_id].state;
        match state {
            TxState::QueuedReqRnr | TxState::QueuedCtrl => {
                self.txs[tx_id].state = TxState::Send;
            }
            TxState::QueuedDataRnr => {
                self.txs[tx_id].state = TxState::Send;
                if !self.tx_pending.contains(&tx_id) {
                    self.tx_pending.push(tx_id);
                }
            }
            _ => {}
        }
    }

    fn sweep_backoff(&mut self) {
        if self.peers_in_backoff.is_empty() {
            return;
        }
        let now = current_time_us();
        let peers = std::mem::take(&mut self.peers_in_backoff);
        for addr in peers {
            let Some(peer) = self.av.peer_mut(addr) else {
                continue;
            };
            if !peer.in_backoff() {
                continue;
            }
            if peer.backoff_expired(now) {
                peer.flags -= PeerFlags::IN_BACKOFF;
            } else {
                self.peers_in_backoff.push(addr);
            }
        }
    }

    /// Refill the posted-receive pools, batching all but the last post.
    fn bulk_post_recv(&mut self) {
        while self.rx_to_post > 0 {
            let pkt_id = match self.rx_pool.alloc() {
                Ok(id) => id,
                Err(_) => break,
            };
            let lkey = self.rx_pool.lkey();
            let buf = self.rx_pool.get_mut(pkt_id).take_buf();
            let more = self.rx_to_post > 1;
            match self.tp.post_recv(buf, lkey, pkt_id.wr_id(), more) {
                Ok(()) => self.rx_to_post -= 1,
                Err(e) => {
                    log::warn!("posting recv buffer failed: {}", e);
                    self.rx_pool.release(pkt_id);
                    break;
                }
            }
        }

        while self.shm.is_some() && self.shm_rx_to_post > 0 {
            let pkt_id = match self.rx_pool.alloc() {
                Ok(id) => id,
                Err(_) => break,
            };
            let lkey = self.rx_pool.lkey();
            let buf = {
                let pkt = self.rx_pool.get_mut(pkt_id);
                pkt.shm_posted = true;
                pkt.take_buf()
            };
            let more = self.shm_rx_to_post > 1;
            let shm = self.shm.as_mut().expect("shm transport");
            match shm.post_recv(buf, lkey, pkt_id.wr_id(), more) {
                Ok(()) => self.shm_rx_to_post -= 1,
                Err(e) => {
                    log::warn!("posting shm recv buffer failed: {}", e);
                    self.rx_pool.release(pkt_id);
                    break;
                }
            }
        }
    }
}
