//! Emulated one-sided operations.
//!
//! Writes, reads and their long variants are emulated over send/recv (or
//! RDMA read where both sides support it). The REQ header always leads
//! with the rma_iov array describing the target buffer on the responder.
//! One-sided operations are unordered.

use std::rc::Rc;

use crate::addr::FiAddr;
use crate::cq::{CompFlags, CqEntry};
use crate::endpoint::{Endpoint, SendOpts};
use crate::error::{Error, Result};
use crate::packet::{extra_feature, PktType, ReadRspHdr, RmaIov, RtrHdr, RtwHdr};
use crate::pool::{PktId, PktOwner};
use crate::read::{ReadEntry, ReadOwner};
use crate::rx_entry::{RxDest, RxEntry, RxOp, RxState};
use crate::transport::{Access, Region, Transport};
use crate::tx_entry::{TxEntry, TxOp, TxProto};

impl<T: Transport> Endpoint<T> {
    // ---------------------------------------------------------------
    // Write
    // ---------------------------------------------------------------

    /// One-sided write into the peer's registered region.
    pub fn write(&mut self, addr: FiAddr, buf: &[u8], rma_iov: &[RmaIov], context: u64) -> Result<()> {
        self.write_opts(addr, buf, rma_iov, &SendOpts::default(), context)
    }

    /// One-sided write with options (CQ data, delivery-complete).
    pub fn write_opts(
        &mut self,
        addr: FiAddr,
        buf: &[u8],
        rma_iov: &[RmaIov],
        opts: &SendOpts,
        context: u64,
    ) -> Result<()> {
        let peer = self
            .av
            .peer(addr)
            .ok_or(Error::InvalidArgument("write to unknown fi_addr"))?;
        if opts.delivery_complete
            && peer.handshake_received()
            && !peer.supports(extra_feature::DELIVERY_COMPLETE)
        {
            return Err(Error::OpNotSupported("peer lacks delivery-complete"));
        }
        if rma_iov.is_empty() {
            return Err(Error::InvalidArgument("empty rma_iov"));
        }

        let mut payload = vec![0u8; buf.len()];
        self.hmem.copy_from(opts.hmem, &mut payload, buf)?;

        let mut tx = TxEntry::new(TxOp::Write, TxProto::Eager, addr, payload, context);
        tx.cq_data = opts.cq_data;
        tx.dc = opts.delivery_complete;
        tx.rma_iov = rma_iov.to_vec();
        let tx_id = self.alloc_tx(tx);

        let res = self.send_rtw(tx_id, opts);
        if let Err(e) = res {
            let tx = self.txs.remove(tx_id);
            if let Some(peer) = self.av.peer_mut(addr) {
                peer.tx_entries.retain(|&id| id != tx_id);
                peer.return_credits(tx.credits);
            }
            return Err(e);
        }
        Ok(())
    }

    fn send_rtw(&mut self, tx_id: usize, opts: &SendOpts) -> Result<()> {
        let addr = self.txs[tx_id].addr;
        let total = self.txs[tx_id].total_len;
        let opt = self.req_opt_hdrs(addr, opts.cq_data);

        // Probe the eager header size against the MTU.
        let probe = RtwHdr {
            typ: if opts.delivery_complete {
                PktType::DcEagerRtw
            } else {
                PktType::EagerRtw
            },
            rma_iov: self.txs[tx_id].rma_iov.clone(),
            send_id: tx_id as u32,
            msg_length: 0,
            credit_request: 0,
            read_iov: Vec::new(),
            opt,
        };
        let eager_room = self.tp.mtu().saturating_sub(probe.wire_len());

        if (total as usize) <= eager_room {
            self.txs[tx_id].proto = TxProto::Eager;
            let pkt_id = self.tx_pool.alloc()?;
            {
                let tx = &self.txs[tx_id];
                let pkt = self.tx_pool.get_mut(pkt_id);
                let n = probe.encode(pkt.buf_mut());
                pkt.buf_mut()[n..n + tx.payload.len()].copy_from_slice(&tx.payload);
                pkt.size = n + tx.payload.len();
                pkt.payload_len = tx.payload.len();
                pkt.payload_off = n;
                pkt.owner = PktOwner::Tx(tx_id);
                pkt.addr = Some(addr);
            }
            self.txs[tx_id].add_sent(total);
            self.send_or_queue_tx(tx_id, pkt_id);
            return Ok(());
        }

        let peer = self.av.peer(addr).expect("peer");
        let use_longread = !opts.delivery_complete
            && (total as usize) >= self.cfg.longread_threshold
            && self.tp.supports_rdma_read()
            && peer.handshake_received()
            && peer.supports(extra_feature::RDMA_READ);

        if use_longread {
            self.txs[tx_id].proto = TxProto::LongRead;
            let payload = std::mem::take(&mut self.txs[tx_id].payload);
            let region: Region = Rc::new(std::cell::RefCell::new(payload));
            let desc = self
                .tp
                .register(region.clone(), Access::REMOTE_READ | Access::LOCAL_READ)?;
            {
                let tx = &mut self.txs[tx_id];
                tx.read_region = Some(region);
                tx.read_desc = Some(desc);
            }
            let hdr = RtwHdr {
                typ: PktType::LongReadRtw,
                rma_iov: self.txs[tx_id].rma_iov.clone(),
                send_id: tx_id as u32,
                msg_length: total,
                credit_request: 0,
                read_iov: vec![RmaIov {
                    addr: 0,
                    len: total,
                    key: desc.rkey,
                }],
                opt: self.req_opt_hdrs(addr, opts.cq_data),
            };
            let pkt_id = self.tx_pool.alloc()?;
            {
                let pkt = self.tx_pool.get_mut(pkt_id);
                let n = hdr.encode(pkt.buf_mut());
                pkt.size = n;
                pkt.owner = PktOwner::Tx(tx_id);
                pkt.addr = Some(addr);
            }
            self.send_or_queue_tx(tx_id, pkt_id);
            return Ok(());
        }

        // Long-CTS write.
        self.txs[tx_id].proto = TxProto::LongCts;
        let max_data = self.max_data_payload(addr);
        let claimed = self
            .av
            .peer_mut(addr)
            .expect("peer")
            .request_credits(total, max_data, self.cfg.tx_min_credits);
        {
            let tx = &mut self.txs[tx_id];
            tx.credits = claimed;
            tx.credit_request = claimed.max(self.cfg.tx_min_credits);
        }
        let hdr = RtwHdr {
            typ: if opts.delivery_complete {
                PktType::DcLongCtsRtw
            } else {
                PktType::LongCtsRtw
            },
            rma_iov: self.txs[tx_id].rma_iov.clone(),
            send_id: tx_id as u32,
            msg_length: total,
            credit_request: claimed,
            read_iov: Vec::new(),
            opt: self.req_opt_hdrs(addr, opts.cq_data),
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

    /// Responder side of an incoming RTW.
    pub(crate) fn handle_rtw(&mut self, pkt_id: PktId) {
        let src = self.pool_ref(pkt_id.pool).get(pkt_id).addr.expect("rtw src");
        let (hdr, off) = match RtwHdr::decode(self.pool_ref(pkt_id.pool).get(pkt_id).bytes()) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("malformed RTW from {}: {}", src, e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };
        let mem = match self.resolve_region(&hdr.rma_iov) {
            Ok(mem) => mem,
            Err(e) => {
                log::warn!("RTW from {} targets unknown region: {}", src, e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };

        match hdr.typ {
            PktType::EagerRtw | PktType::DcEagerRtw => {
                let payload_len = {
                    let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
                    let payload = &pkt.bytes()[off..];
                    let mut dest = RxDest::Region {
                        mem,
                        iovs: hdr.rma_iov.clone(),
                    };
                    dest.write(0, payload);
                    payload.len()
                };
                if hdr.typ == PktType::DcEagerRtw {
                    self.send_receipt(src, hdr.send_id, 0);
                }
                if let Some(data) = hdr.opt.cq_data {
                    self.cq.write(CqEntry {
                        context: 0,
                        flags: CompFlags::REMOTE_WRITE | CompFlags::RMA | CompFlags::REMOTE_CQ_DATA,
                        len: payload_len,
                        buf: None,
                        data: Some(data),
                        tag: None,
                        src_addr: Some(src),
                    });
                }
                self.release_rx_pkt(pkt_id);
            }
            PktType::LongCtsRtw | PktType::DcLongCtsRtw => {
                let mut rx = RxEntry::new(
                    RxOp::WriteTarget,
                    Some(src),
                    RxDest::Region {
                        mem,
                        iovs: hdr.rma_iov.clone(),
                    },
                    hdr.msg_length as usize,
                    0,
                );
                rx.state = RxState::Recv;
                rx.total_len = hdr.msg_length;
                rx.peer_send_id = Some(hdr.send_id);
                rx.dc = hdr.typ == PktType::DcLongCtsRtw;
                rx.cq_data = hdr.opt.cq_data;
                rx.cq_len = hdr.msg_length as usize;
                rx.silent = hdr.opt.cq_data.is_none();
                let rx_id = self.alloc_rx(rx);

                {
                    let pkt = crate::pool::pkt_entry!(self, pkt_id);
                    let payload = &pkt.bytes()[off..];
                    let rx = &mut self.rxs[rx_id];
                    if !payload.is_empty() {
                        rx.dest.write(0, payload);
                        rx.add_received(payload.len() as u64);
                    }
                }
                self.release_rx_pkt(pkt_id);
                if self.rxs[rx_id].complete_received() {
                    self.finalize_rx_msg(rx_id);
                } else {
                    self.send_cts(rx_id);
                }
            }
            PktType::LongReadRtw => {
                let mut rx = RxEntry::new(
                    RxOp::WriteTarget,
                    Some(src),
                    RxDest::Region {
                        mem,
                        iovs: hdr.rma_iov.clone(),
                    },
                    hdr.msg_length as usize,
                    0,
                );
                rx.state = RxState::Recv;
                rx.total_len = hdr.msg_length;
                rx.peer_send_id = Some(hdr.send_id);
                rx.cq_data = hdr.opt.cq_data;
                rx.cq_len = hdr.msg_length as usize;
                rx.silent = hdr.opt.cq_data.is_none();
                let rx_id = self.alloc_rx(rx);
                self.release_rx_pkt(pkt_id);

                let read = ReadEntry::new(
                    ReadOwner::Rx(rx_id),
                    src,
                    hdr.read_iov.clone(),
                    hdr.msg_length,
                );
                let read_id = self.reads.insert(read);
                self.post_reads_or_queue(read_id);
            }
            _ => unreachable!("rtw type"),
        }
    }

    // ---------------------------------------------------------------
    // Read
    // ---------------------------------------------------------------

    /// One-sided read of `len` bytes from the peer's registered region.
    ///
    /// With RDMA read advertised on both sides the transfer goes
    /// straight to the transport; otherwise it is emulated with an RTR
    /// and the peer sends the data back.
    pub fn read(&mut self, addr: FiAddr, len: usize, rma_iov: &[RmaIov], context: u64) -> Result<()> {
        let peer = self
            .av
            .peer(addr)
            .ok_or(Error::InvalidArgument("read from unknown fi_addr"))?;
        if rma_iov.is_empty() {
            return Err(Error::InvalidArgument("empty rma_iov"));
        }

        let direct = self.tp.supports_rdma_read()
            && peer.handshake_received()
            && peer.supports(extra_feature::RDMA_READ)
            && !peer.is_local;
        if direct {
            let mut tx = TxEntry::new(TxOp::Read, TxProto::DirectRead, addr, Vec::new(), context);
            tx.total_len = len as u64;
            tx.result_buf = Some(vec![0u8; len]);
            tx.rma_iov = rma_iov.to_vec();
            let tx_id = self.alloc_tx(tx);

            let read = ReadEntry::new(ReadOwner::Tx(tx_id), addr, rma_iov.to_vec(), len as u64);
            let read_id = self.reads.insert(read);
            self.txs[tx_id].read_id = Some(read_id);
            self.post_reads_or_queue(read_id);
            return Ok(());
        }

        // Emulated: the RTR is owned by the receive entry that collects
        // the READRSP/DATA response.
        let mut rx = RxEntry::new(
            RxOp::ReadRsp,
            Some(addr),
            RxDest::Owned(vec![0u8; len]),
            len,
            context,
        );
        rx.state = RxState::Recv;
        rx.total_len = len as u64;
        rx.cq_len = len;
        let rx_id = self.alloc_rx(rx);

        let short_room = {
            let probe = ReadRspHdr {
                send_id: 0,
                recv_id: 0,
                data_length: 0,
                connid: self.ctrl_connid(addr),
            };
            self.tp.mtu().saturating_sub(probe.wire_len())
        };
        let typ = if len <= short_room {
            PktType::ShortRtr
        } else {
            PktType::LongCtsRtr
        };
        let hdr = RtrHdr {
            typ,
            rma_iov: rma_iov.to_vec(),
            msg_length: len as u64,
            recv_id: rx_id as u32,
            window: self.cfg.tx_max_credits,
            opt: self.req_opt_hdrs(addr, None),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                self.unpin_rx(rx_id);
                self.rxs.remove(rx_id);
                return Err(e);
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
        Ok(())
    }

    /// Responder side of an incoming RTR: gather the region bytes and
    /// answer with a READRSP, continuing as a long-CTS sender if the
    /// response does not fit one packet.
    pub(crate) fn handle_rtr(&mut self, pkt_id: PktId) {
        let src = self.pool_ref(pkt_id.pool).get(pkt_id).addr.expect("rtr src");
        let (hdr, _off) = match RtrHdr::decode(self.pool_ref(pkt_id.pool).get(pkt_id).bytes()) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("malformed RTR from {}: {}", src, e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };
        self.release_rx_pkt(pkt_id);

        let mem = match self.resolve_region(&hdr.rma_iov) {
            Ok(mem) => mem,
            Err(e) => {
                log::warn!("RTR from {} targets unknown region: {}", src, e);
                return;
            }
        };

        // Gather the requested bytes.
        let mut payload = vec![0u8; hdr.msg_length as usize];
        {
            let mem = mem.borrow();
            let mut filled = 0usize;
            for iov in &hdr.rma_iov {
                if filled >= payload.len() {
                    break;
                }
                let start = iov.addr as usize;
                let take = (iov.len as usize).min(payload.len() - filled);
                if start + take > mem.len() {
                    log::warn!("RTR from {} reads past region end", src);
                    return;
                }
                payload[filled..filled + take].copy_from_slice(&mem[start..start + take]);
                filled += take;
            }
        }

        let mut tx = TxEntry::new(TxOp::Read, TxProto::ReadRsp, src, payload, 0);
        tx.silent = true;
        tx.peer_recv_id = Some(hdr.recv_id);
        let tx_id = self.alloc_tx(tx);

        // First response packet is always a READRSP carrying as much as
        // fits; the remainder flows as CTS-driven DATA.
        let rsp_hdr = ReadRspHdr {
            send_id: tx_id as u32,
            recv_id: hdr.recv_id,
            data_length: 0,
            connid: self.ctrl_connid(src),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("READRSP deferred: {}", e);
                self.fail_tx(tx_id, e);
                return;
            }
        };
        let chunk = {
            let tx = &self.txs[tx_id];
            let pkt = self.tx_pool.get_mut(pkt_id);
            let mut hdr = rsp_hdr;
            let room = pkt.buf_mut().len() - hdr.wire_len();
            let chunk = room.min(tx.payload.len());
            hdr.data_length = chunk as u64;
            let n = hdr.encode(pkt.buf_mut());
            pkt.buf_mut()[n..n + chunk].copy_from_slice(&tx.payload[..chunk]);
            pkt.size = n + chunk;
            pkt.payload_len = chunk;
            pkt.payload_off = n;
            pkt.owner = PktOwner::Tx(tx_id);
            pkt.addr = Some(src);
            chunk
        };
        self.txs[tx_id].add_sent(chunk as u64);
        self.send_or_queue_tx(tx_id, pkt_id);
    }
}
