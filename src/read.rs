//! RDMA-read engine.
//!
//! A read entry tracks one RDMA-read-backed transfer: the long-read
//! message and write protocols (receiver pulls the sender's registered
//! buffers) and direct reads (no protocol packets at all). Reads are
//! segmented against the transport's limits and posted until the
//! outstanding-tx cap; what does not fit waits on the read-pending list.

use crate::addr::FiAddr;
use crate::error::{Error, Result};
use crate::packet::RmaIov;
use crate::pool::{PktOwner, PoolKind};
use crate::transport::Transport;

/// The x_entry a read entry reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOwner {
    Tx(usize),
    Rx(usize),
}

/// One RDMA-read-backed transfer.
pub struct ReadEntry {
    pub owner: ReadOwner,
    pub addr: FiAddr,
    /// Remote source iovs.
    pub rma_iov: Vec<RmaIov>,
    pub total_len: u64,
    pub bytes_submitted: u64,
    pub bytes_finished: u64,
}

impl ReadEntry {
    pub fn new(owner: ReadOwner, addr: FiAddr, rma_iov: Vec<RmaIov>, total_len: u64) -> Self {
        debug_assert!(rma_iov.iter().map(|i| i.len).sum::<u64>() >= total_len);
        Self {
            owner,
            addr,
            rma_iov,
            total_len,
            bytes_submitted: 0,
            bytes_finished: 0,
        }
    }

    #[inline]
    pub fn submitted_all(&self) -> bool {
        self.bytes_submitted >= self.total_len
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.bytes_finished >= self.total_len
    }

    /// The next segment to read: `(remote_addr, rkey, len)`, bounded by
    /// `max_seg` and the current remote iov.
    pub fn next_segment(&self, max_seg: usize) -> (u64, u64, usize) {
        debug_assert!(!self.submitted_all());
        let mut skip = self.bytes_submitted;
        for iov in &self.rma_iov {
            if skip >= iov.len {
                skip -= iov.len;
                continue;
            }
            let remain_in_iov = (iov.len - skip) as usize;
            let remain_total = (self.total_len - self.bytes_submitted) as usize;
            let len = remain_in_iov.min(remain_total).min(max_seg);
            return (iov.addr + skip, iov.key, len);
        }
        unreachable!("read entry exhausted its iov list");
    }
}

impl<T: Transport> crate::endpoint::Endpoint<T> {
    /// Post as many read segments as fit under the outstanding-tx cap.
    pub(crate) fn post_reads(&mut self, read_id: usize) -> Result<()> {
        let max_seg = self.cfg.read_segment_size.min(self.tp.max_rdma_size());
        loop {
            if self.reads[read_id].submitted_all() {
                return Ok(());
            }
            if self.outstanding_tx >= self.max_outstanding_tx {
                return Err(Error::Again);
            }
            let (remote_addr, rkey, len) = self.reads[read_id].next_segment(max_seg);
            let addr = self.reads[read_id].addr;
            let offset = self.reads[read_id].bytes_submitted as usize;

            // A packet entry serves as the read context, like sends do.
            let pkt_id = self.tx_pool.alloc()?;
            {
                let pkt = self.tx_pool.get_mut(pkt_id);
                pkt.owner = PktOwner::Read(read_id);
                pkt.addr = Some(addr);
                pkt.payload_off = offset;
                pkt.payload_len = len;
            }
            let lkey = self.tx_pool.lkey();
            match self.tp.post_read(len, lkey, remote_addr, rkey, pkt_id.wr_id()) {
                Ok(()) => {
                    self.outstanding_tx += 1;
                    self.reads[read_id].bytes_submitted += len as u64;
                }
                Err(e) => {
                    self.tx_pool.release(pkt_id);
                    return Err(e);
                }
            }
        }
    }

    /// Post reads now or park the entry on the read-pending list.
    pub(crate) fn post_reads_or_queue(&mut self, read_id: usize) {
        match self.post_reads(read_id) {
            Ok(()) => {}
            Err(Error::Again) => {
                if !self.read_pending.contains(&read_id) {
                    self.read_pending.push(read_id);
                }
            }
            Err(e) => {
                log::warn!("posting RDMA read failed: {}", e);
                self.fail_read(read_id, e);
            }
        }
    }

    /// One read segment finished.
    pub(crate) fn handle_read_completion(
        &mut self,
        pkt_id: crate::pool::PktId,
        ok: bool,
        bytes: Option<Box<[u8]>>,
    ) {
        debug_assert_eq!(pkt_id.pool, PoolKind::Tx);
        let (read_id, offset, len) = {
            let pkt = self.tx_pool.get(pkt_id);
            let PktOwner::Read(read_id) = pkt.owner else {
                panic!("read completion for non-read context");
            };
            (read_id, pkt.payload_off, pkt.payload_len)
        };
        self.tx_pool.release(pkt_id);

        if !ok {
            self.fail_read(read_id, Error::Io("RDMA read failed"));
            return;
        }
        let bytes = bytes.expect("read completion carries data");
        debug_assert_eq!(bytes.len(), len);
        self.reads[read_id].bytes_finished += len as u64;
        let owner = self.reads[read_id].owner;
        let finished = self.reads[read_id].finished();

        match owner {
            ReadOwner::Rx(rx_id) => {
                {
                    let rx = &mut self.rxs[rx_id];
                    if !rx.cancelled {
                        rx.dest.write(offset, &bytes);
                    }
                    rx.add_received(len as u64);
                }
                if finished {
                    self.reads.remove(read_id);
                    self.finish_longread_rx(rx_id);
                }
            }
            ReadOwner::Tx(tx_id) => {
                {
                    let tx = &mut self.txs[tx_id];
                    if let Some(buf) = tx.result_buf.as_mut() {
                        buf[offset..offset + len].copy_from_slice(&bytes);
                    }
                    tx.add_sent(len as u64);
                    tx.add_acked(len as u64);
                }
                if finished {
                    self.reads.remove(read_id);
                    if self.txs[tx_id].done() {
                        self.finalize_tx(tx_id);
                    }
                }
            }
        }
    }

    /// Fail the read entry and its owning x_entry.
    pub(crate) fn fail_read(&mut self, read_id: usize, err: Error) {
        let Some(read) = self.reads.try_remove(read_id) else {
            return;
        };
        self.read_pending.retain(|&id| id != read_id);
        match read.owner {
            ReadOwner::Tx(tx_id) => self.fail_tx(tx_id, err),
            ReadOwner::Rx(rx_id) => self.fail_rx(rx_id, err),
        }
    }
}
