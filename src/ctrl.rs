//! Control packet drivers: HANDSHAKE, CTS, DATA, READRSP, EOR, RECEIPT.
//!
//! Control packets are unordered; they route by the send/recv entry ids
//! carried in their headers. CTS grants are never zero, so a long-CTS
//! transfer always makes progress.

use crate::addr::FiAddr;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::packet::{
    CtsHdr, DataHdr, EorHdr, HandshakeHdr, ReadRspHdr, ReceiptHdr,
};
use crate::peer::PeerFlags;
use crate::pool::{PktId, PktOwner};
use crate::transport::Transport;

impl<T: Transport> Endpoint<T> {
    // ---------------------------------------------------------------
    // HANDSHAKE
    // ---------------------------------------------------------------

    /// Post our HANDSHAKE to `addr`. EAGAIN parks the peer on the retry
    /// list; other failures are logged and dropped (the application
    /// never observes handshake errors).
    pub(crate) fn post_handshake(&mut self, addr: FiAddr) {
        let hdr = HandshakeHdr {
            extra_info: self.extra_info.clone(),
            connid: Some(self.connid),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("handshake to {} deferred: {}", addr, e);
                self.queue_handshake(addr);
                return;
            }
        };
        {
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.size = n;
            pkt.owner = PktOwner::None;
            pkt.addr = Some(addr);
        }
        match self.post_pkt(pkt_id) {
            Ok(()) => {
                if let Some(peer) = self.av.peer_mut(addr) {
                    peer.flags -= PeerFlags::HANDSHAKE_QUEUED;
                }
            }
            Err(Error::Again) => {
                self.tx_pool.release(pkt_id);
                self.queue_handshake(addr);
            }
            Err(e) => {
                log::warn!("handshake to {} failed: {}", addr, e);
                self.tx_pool.release(pkt_id);
            }
        }
    }

    fn queue_handshake(&mut self, addr: FiAddr) {
        if let Some(peer) = self.av.peer_mut(addr) {
            peer.flags |= PeerFlags::HANDSHAKE_QUEUED;
        }
        if !self.handshake_queued.contains(&addr) {
            self.handshake_queued.push(addr);
        }
    }

    pub(crate) fn handle_handshake(&mut self, pkt_id: PktId) {
        let (src, info) = {
            let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
            let src = pkt.addr.expect("handshake src");
            match HandshakeHdr::decode(pkt.bytes()) {
                Ok(hdr) => (src, hdr.extra_info),
                Err(e) => {
                    log::warn!("malformed handshake: {}", e);
                    self.release_rx_pkt(pkt_id);
                    return;
                }
            }
        };
        if let Some(peer) = self.av.peer_mut(src) {
            log::debug!("handshake from {}: features {:?}", src, info.0);
            peer.set_handshake(info);
        }
        self.release_rx_pkt(pkt_id);
    }

    // ---------------------------------------------------------------
    // CTS
    // ---------------------------------------------------------------

    /// Grant the sender another window. The grant is at least one packet
    /// and at most the configured credit ceiling.
    pub(crate) fn send_cts(&mut self, rx_id: usize) {
        let addr = self.rxs[rx_id].addr.expect("bound rx");
        let max_data = self.max_data_payload(addr) as u64;
        let grant = {
            let rx = &self.rxs[rx_id];
            let remaining = rx.total_len - rx.bytes_received;
            remaining.min((self.cfg.tx_max_credits as u64).max(1) * max_data)
        };
        debug_assert!(grant > 0);
        self.rxs[rx_id].window = grant;

        let hdr = CtsHdr {
            send_id: self.rxs[rx_id].peer_send_id.expect("send id for CTS"),
            recv_id: rx_id as u32,
            recv_length: grant,
            connid: self.ctrl_connid(addr),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("CTS for rx {} deferred: {}", rx_id, e);
                return;
            }
        };
        {
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.size = n;
            pkt.owner = PktOwner::Rx(rx_id);
            pkt.addr = Some(addr);
        }
        self.send_or_queue_rx(rx_id, pkt_id);
    }

    pub(crate) fn handle_cts(&mut self, pkt_id: PktId) {
        let (src, hdr) = {
            let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
            let src = pkt.addr.expect("cts src");
            match CtsHdr::decode(pkt.bytes()) {
                Ok(hdr) => (src, hdr),
                Err(e) => {
                    log::warn!("malformed CTS: {}", e);
                    self.release_rx_pkt(pkt_id);
                    return;
                }
            }
        };
        self.release_rx_pkt(pkt_id);

        let tx_id = hdr.send_id as usize;
        if !self.txs.contains(tx_id) || self.txs[tx_id].addr != src {
            log::debug!("CTS for finished tx {}", tx_id);
            return;
        }
        {
            let tx = &mut self.txs[tx_id];
            tx.peer_recv_id = Some(hdr.recv_id);
            tx.window += hdr.recv_length;
        }
        if !self.tx_pending.contains(&tx_id) {
            self.tx_pending.push(tx_id);
        }
        // Pump immediately; whatever does not fit is driven by progress.
        self.pump_tx_data(tx_id);
    }

    /// Post DATA packets while window, payload and the transmit cap
    /// allow.
    pub(crate) fn pump_tx_data(&mut self, tx_id: usize) {
        loop {
            if !self.txs.contains(tx_id) {
                return;
            }
            let (addr, window, remaining) = {
                let tx = &self.txs[tx_id];
                (tx.addr, tx.window, tx.remaining())
            };
            if window == 0 || remaining == 0 {
                return;
            }
            if let Some(peer) = self.av.peer(addr) {
                if peer.in_backoff() {
                    return;
                }
            }
            if self.post_one_data(tx_id).is_err() {
                return;
            }
        }
    }

    fn post_one_data(&mut self, tx_id: usize) -> Result<()> {
        let addr = self.txs[tx_id].addr;
        let max_data = self.max_data_payload(addr) as u64;
        let (offset, chunk, recv_id) = {
            let tx = &self.txs[tx_id];
            let chunk = max_data.min(tx.window).min(tx.remaining());
            (
                tx.bytes_sent,
                chunk,
                tx.peer_recv_id.expect("recv id before DATA"),
            )
        };
        let hdr = DataHdr {
            recv_id,
            data_length: chunk,
            data_offset: offset,
            connid: self.ctrl_connid(addr),
        };
        let pkt_id = self.tx_pool.alloc()?;
        {
            let tx = &self.txs[tx_id];
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.buf_mut()[n..n + chunk as usize]
                .copy_from_slice(&tx.payload[offset as usize..(offset + chunk) as usize]);
            pkt.size = n + chunk as usize;
            pkt.payload_len = chunk as usize;
            pkt.payload_off = n;
            pkt.owner = PktOwner::Tx(tx_id);
            pkt.addr = Some(addr);
        }
        match self.post_pkt(pkt_id) {
            Ok(()) => {
                let tx = &mut self.txs[tx_id];
                tx.add_sent(chunk);
                tx.window -= chunk;
                Ok(())
            }
            Err(Error::Again) => {
                self.tx_pool.release(pkt_id);
                Err(Error::Again)
            }
            Err(e) => {
                self.tx_pool.release(pkt_id);
                self.fail_tx(tx_id, e);
                Err(Error::Again)
            }
        }
    }

    pub(crate) fn handle_data(&mut self, pkt_id: PktId) {
        let (src, hdr, off) = {
            let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
            let src = pkt.addr.expect("data src");
            match DataHdr::decode(pkt.bytes()) {
                Ok((hdr, off)) => (src, hdr, off),
                Err(e) => {
                    log::warn!("malformed DATA: {}", e);
                    self.release_rx_pkt(pkt_id);
                    return;
                }
            }
        };
        let rx_id = hdr.recv_id as usize;
        if !self.rxs.contains(rx_id) || self.rxs[rx_id].addr != Some(src) {
            log::debug!("DATA for finished rx {}", rx_id);
            self.release_rx_pkt(pkt_id);
            return;
        }
        {
            let pkt = crate::pool::pkt_entry!(self, pkt_id);
            let payload = &pkt.bytes()[off..];
            debug_assert_eq!(payload.len() as u64, hdr.data_length);
            let rx = &mut self.rxs[rx_id];
            if !rx.cancelled {
                rx.dest.write(hdr.data_offset as usize, payload);
            }
            rx.add_received(hdr.data_length);
            rx.window = rx.window.saturating_sub(hdr.data_length);
        }
        self.release_rx_pkt(pkt_id);

        let (complete, window) = {
            let rx = &self.rxs[rx_id];
            (rx.complete_received(), rx.window)
        };
        if complete {
            self.finalize_rx_msg(rx_id);
        } else if window == 0 {
            // Window exhausted: grant the next one.
            self.send_cts(rx_id);
        }
    }

    // ---------------------------------------------------------------
    // READRSP (requester side)
    // ---------------------------------------------------------------

    pub(crate) fn handle_readrsp(&mut self, pkt_id: PktId) {
        let (src, hdr, off) = {
            let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
            let src = pkt.addr.expect("readrsp src");
            match ReadRspHdr::decode(pkt.bytes()) {
                Ok((hdr, off)) => (src, hdr, off),
                Err(e) => {
                    log::warn!("malformed READRSP: {}", e);
                    self.release_rx_pkt(pkt_id);
                    return;
                }
            }
        };
        let rx_id = hdr.recv_id as usize;
        if !self.rxs.contains(rx_id) || self.rxs[rx_id].addr != Some(src) {
            log::debug!("READRSP for finished rx {}", rx_id);
            self.release_rx_pkt(pkt_id);
            return;
        }
        {
            let pkt = crate::pool::pkt_entry!(self, pkt_id);
            let payload = &pkt.bytes()[off..];
            let rx = &mut self.rxs[rx_id];
            rx.peer_send_id = Some(hdr.send_id);
            if !rx.cancelled && !payload.is_empty() {
                rx.dest.write(0, payload);
            }
            rx.add_received(payload.len() as u64);
        }
        self.release_rx_pkt(pkt_id);

        if self.rxs[rx_id].complete_received() {
            self.finalize_rx_msg(rx_id);
        } else {
            self.send_cts(rx_id);
        }
    }

    // ---------------------------------------------------------------
    // EOR
    // ---------------------------------------------------------------

    /// End-of-read: tell the long-read sender its buffers were pulled.
    pub(crate) fn send_eor(&mut self, addr: FiAddr, send_id: u32, recv_id: u32, rx_id: usize) {
        let hdr = EorHdr {
            send_id,
            recv_id,
            connid: self.ctrl_connid(addr),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("EOR deferred: {}", e);
                return;
            }
        };
        {
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.size = n;
            pkt.owner = PktOwner::Rx(rx_id);
            pkt.addr = Some(addr);
        }
        self.send_or_queue_rx(rx_id, pkt_id);
    }

    pub(crate) fn handle_eor(&mut self, pkt_id: PktId) {
        let (src, hdr) = {
            let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
            let src = pkt.addr.expect("eor src");
            match EorHdr::decode(pkt.bytes()) {
                Ok(hdr) => (src, hdr),
                Err(e) => {
                    log::warn!("malformed EOR: {}", e);
                    self.release_rx_pkt(pkt_id);
                    return;
                }
            }
        };
        self.release_rx_pkt(pkt_id);

        let tx_id = hdr.send_id as usize;
        if !self.txs.contains(tx_id) || self.txs[tx_id].addr != src {
            return;
        }
        self.txs[tx_id].eor_received = true;
        if self.txs[tx_id].done() {
            self.finalize_tx(tx_id);
        }
    }

    /// All RDMA reads for a long-read receive landed: answer with EOR so
    /// the sender can release its registrations, then a RECEIPT for the
    /// delivery-complete completion model (the RTM does not say whether
    /// the sender wants one, so it is always sent), then complete.
    pub(crate) fn finish_longread_rx(&mut self, rx_id: usize) {
        let (addr, send_id, msg_id, is_msg) = {
            let rx = &self.rxs[rx_id];
            (
                rx.addr.expect("bound rx"),
                rx.peer_send_id.expect("send id for EOR"),
                rx.msg_id,
                matches!(rx.op, crate::rx_entry::RxOp::Msg | crate::rx_entry::RxOp::Tagged),
            )
        };
        self.send_eor(addr, send_id, rx_id as u32, rx_id);
        if is_msg {
            self.send_receipt(addr, send_id, msg_id.unwrap_or(0));
        }
        self.finalize_rx_msg(rx_id);
    }

    // ---------------------------------------------------------------
    // RECEIPT
    // ---------------------------------------------------------------

    pub(crate) fn send_receipt(&mut self, addr: FiAddr, send_id: u32, msg_id: u32) {
        let hdr = ReceiptHdr {
            send_id,
            msg_id,
            connid: self.ctrl_connid(addr),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("RECEIPT deferred: {}", e);
                return;
            }
        };
        {
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.size = n;
            pkt.owner = PktOwner::None;
            pkt.addr = Some(addr);
        }
        self.send_or_queue_ctrl(pkt_id);
    }

    pub(crate) fn handle_receipt(&mut self, pkt_id: PktId) {
        let (src, hdr) = {
            let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
            let src = pkt.addr.expect("receipt src");
            match ReceiptHdr::decode(pkt.bytes()) {
                Ok(hdr) => (src, hdr),
                Err(e) => {
                    log::warn!("malformed RECEIPT: {}", e);
                    self.release_rx_pkt(pkt_id);
                    return;
                }
            }
        };
        self.release_rx_pkt(pkt_id);

        // Long protocols echo our send_id; eager and medium receipts
        // route by (peer, msg_id) because their RTMs carry no send_id.
        // The source peer must match: slab keys recycle.
        let tx_id = if hdr.send_id != u32::MAX
            && self.txs.contains(hdr.send_id as usize)
            && self.txs[hdr.send_id as usize].addr == src
        {
            hdr.send_id as usize
        } else {
            let Some(tx_id) = self
                .txs
                .iter()
                .find_map(|(id, tx)| (tx.addr == src && tx.msg_id == hdr.msg_id).then_some(id))
            else {
                return;
            };
            tx_id
        };
        self.txs[tx_id].receipt_received = true;
        if self.txs[tx_id].done() {
            self.finalize_tx(tx_id);
        }
    }
}
