//! Transmit entry: one active outbound operation.

use crate::addr::FiAddr;
use crate::hmem::HmemDesc;
use crate::packet::{AtomicDatatype, AtomicOp, RmaIov};
use crate::pool::PktId;
use crate::transport::{MemDesc, Region};

/// Transmit state machine.
///
/// ```text
/// Req -> Send (first packet posted)
/// Send <-> QueuedDataRnr (RNR received -> backoff)
/// any -> QueuedCtrl / QueuedReqRnr (packet deferred on EAGAIN / RNR)
/// Send -> done (bytes_acked == total_len, optionally awaiting RECEIPT)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Req,
    Send,
    QueuedCtrl,
    QueuedReqRnr,
    QueuedDataRnr,
}

/// Operation class of a transmit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Msg,
    Tagged,
    Write,
    Read,
    AtomicWrite,
    AtomicFetch,
    AtomicCompare,
}

/// Protocol family chosen for this entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxProto {
    Eager,
    Medium,
    LongCts,
    LongRead,
    /// RDMA read issued straight to the transport, no protocol packets.
    DirectRead,
    /// Responder-side data flow answering an RTR (no app completion).
    ReadRsp,
}

/// One active outbound operation.
pub struct TxEntry {
    pub op: TxOp,
    pub proto: TxProto,
    pub state: TxState,
    pub addr: FiAddr,

    /// Payload staged at submit time (message bytes, write bytes, or
    /// atomic operands).
    pub payload: Vec<u8>,
    pub total_len: u64,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    /// Bytes the peer has granted via CTS.
    pub window: u64,

    pub msg_id: u32,
    /// The peer's receive-entry id, learned from CTS (or the RTR for
    /// responder flows); stamped on outgoing DATA packets.
    pub peer_recv_id: Option<u32>,
    /// Credits claimed from the peer for this transfer.
    pub credits: u32,
    pub credit_request: u32,

    pub tag: Option<u64>,
    pub cq_data: Option<u64>,
    /// Delivery-complete: hold the completion until RECEIPT.
    pub dc: bool,
    pub receipt_received: bool,
    pub eor_received: bool,

    /// Packets deferred by EAGAIN or RNR, re-driven by progress.
    pub queued_pkts: Vec<PktId>,

    /// Target iovs on the responder (write/read/atomic).
    pub rma_iov: Vec<RmaIov>,
    /// Registration backing the long-read source iovs.
    pub read_desc: Option<MemDesc>,
    pub read_region: Option<Region>,
    /// Read entry servicing this op (direct read).
    pub read_id: Option<usize>,

    pub atomic: Option<(AtomicDatatype, AtomicOp)>,
    /// Result bytes for fetching atomics.
    pub result_buf: Option<Vec<u8>>,

    pub hmem: HmemDesc,
    pub context: u64,
    /// Internal entries (responder flows) write no application
    /// completion.
    pub silent: bool,
}

impl TxEntry {
    pub fn new(op: TxOp, proto: TxProto, addr: FiAddr, payload: Vec<u8>, context: u64) -> Self {
        let total_len = payload.len() as u64;
        Self {
            op,
            proto,
            state: TxState::Req,
            addr,
            payload,
            total_len,
            bytes_sent: 0,
            bytes_acked: 0,
            window: 0,
            msg_id: 0,
            peer_recv_id: None,
            credits: 0,
            credit_request: 0,
            tag: None,
            cq_data: None,
            dc: false,
            receipt_received: false,
            eor_received: false,
            queued_pkts: Vec::new(),
            rma_iov: Vec::new(),
            read_desc: None,
            read_region: None,
            read_id: None,
            atomic: None,
            result_buf: None,
            hmem: HmemDesc::default(),
            context,
            silent: false,
        }
    }

    /// Record payload bytes accepted by the transport.
    pub fn add_sent(&mut self, n: u64) {
        self.bytes_sent += n;
        debug_assert!(self.bytes_sent <= self.total_len);
    }

    /// Record payload bytes acknowledged by a send completion.
    pub fn add_acked(&mut self, n: u64) {
        self.bytes_acked += n;
        debug_assert!(self.bytes_acked <= self.bytes_sent);
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.total_len - self.bytes_sent
    }

    /// Whether every protocol obligation for the application completion
    /// is met.
    pub fn done(&self) -> bool {
        let delivered = match self.proto {
            TxProto::LongRead => self.eor_received,
            TxProto::DirectRead => self.bytes_acked == self.total_len,
            _ => self.bytes_acked == self.total_len,
        };
        let receipt_ok = !self.dc || self.receipt_received;
        let fetch_ok = !matches!(self.op, TxOp::AtomicFetch | TxOp::AtomicCompare)
            || self.result_buf.is_some();
        delivered && receipt_ok && fetch_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_accounting_order() {
        let mut tx = TxEntry::new(TxOp::Msg, TxProto::LongCts, FiAddr(0), vec![0u8; 100], 1);
        tx.add_sent(60);
        tx.add_acked(60);
        tx.add_sent(40);
        assert!(!tx.done());
        tx.add_acked(40);
        assert!(tx.done());
    }

    #[test]
    fn test_dc_holds_completion() {
        let mut tx = TxEntry::new(TxOp::Msg, TxProto::Eager, FiAddr(0), vec![1, 2], 1);
        tx.dc = true;
        tx.add_sent(2);
        tx.add_acked(2);
        assert!(!tx.done());
        tx.receipt_received = true;
        assert!(tx.done());
    }

    #[test]
    fn test_longread_completes_on_eor() {
        let mut tx = TxEntry::new(TxOp::Msg, TxProto::LongRead, FiAddr(0), vec![0u8; 10], 1);
        tx.add_sent(0);
        assert!(!tx.done());
        tx.eor_received = true;
        assert!(tx.done());
    }

    #[test]
    fn test_fetch_waits_for_result() {
        let mut tx = TxEntry::new(TxOp::AtomicFetch, TxProto::Eager, FiAddr(0), vec![0u8; 8], 1);
        tx.add_sent(8);
        tx.add_acked(8);
        assert!(!tx.done());
        tx.result_buf = Some(vec![0u8; 8]);
        assert!(tx.done());
    }
}
