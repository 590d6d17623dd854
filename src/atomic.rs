//! Emulated atomic operations.
//!
//! Atomics are REQ/response flows over the same wire as messages: one
//! RTA packet carries the operands, the responder applies the operation
//! to its registered region under the endpoint lock (which makes it
//! atomic in the single-threaded model), and FETCH/COMPARE answer with
//! an ATOMRSP carrying the pre-operation values. RTA packets are
//! ordered like RTMs.

use crate::addr::FiAddr;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::packet::{
    AtomRspHdr, AtomicDatatype, AtomicOp, PktType, ReqCommon, RmaIov, RtaHdr,
};
use crate::pool::{PktId, PktOwner};
use crate::transport::{Region, Transport};
use crate::tx_entry::{TxEntry, TxOp, TxProto};

macro_rules! apply_elem {
    ($ty:ty, $old:expr, $operand:expr, $op:expr) => {{
        let old = <$ty>::from_le_bytes($old.try_into().unwrap());
        let operand = <$ty>::from_le_bytes($operand.try_into().unwrap());
        let new = match $op {
            AtomicOp::Sum => old.wrapping_add(operand),
            AtomicOp::Min => old.min(operand),
            AtomicOp::Max => old.max(operand),
            AtomicOp::Swap => operand,
            AtomicOp::CompareSwap => unreachable!("compare handled separately"),
        };
        new.to_le_bytes().to_vec()
    }};
}

macro_rules! compare_elem {
    ($ty:ty, $old:expr, $cmp:expr, $swap:expr) => {{
        let old = <$ty>::from_le_bytes($old.try_into().unwrap());
        let cmp = <$ty>::from_le_bytes($cmp.try_into().unwrap());
        if old == cmp {
            $swap.to_vec()
        } else {
            $old.to_vec()
        }
    }};
}

impl<T: Transport> Endpoint<T> {
    /// Atomic update of the peer's region (no result).
    pub fn atomic_write(
        &mut self,
        addr: FiAddr,
        datatype: AtomicDatatype,
        op: AtomicOp,
        operand: &[u8],
        rma_iov: &[RmaIov],
        context: u64,
    ) -> Result<()> {
        self.submit_rta(addr, datatype, op, operand, rma_iov, TxOp::AtomicWrite, context)
    }

    /// Atomic update returning the pre-operation values.
    pub fn atomic_fetch(
        &mut self,
        addr: FiAddr,
        datatype: AtomicDatatype,
        op: AtomicOp,
        operand: &[u8],
        rma_iov: &[RmaIov],
        context: u64,
    ) -> Result<()> {
        self.submit_rta(addr, datatype, op, operand, rma_iov, TxOp::AtomicFetch, context)
    }

    /// Atomic compare-and-swap. The operand payload is the compare
    /// buffer followed by the swap buffer.
    pub fn atomic_compare(
        &mut self,
        addr: FiAddr,
        datatype: AtomicDatatype,
        compare: &[u8],
        swap: &[u8],
        rma_iov: &[RmaIov],
        context: u64,
    ) -> Result<()> {
        if compare.len() != swap.len() {
            return Err(Error::InvalidArgument("compare/swap length mismatch"));
        }
        let mut operand = Vec::with_capacity(compare.len() * 2);
        operand.extend_from_slice(compare);
        operand.extend_from_slice(swap);
        self.submit_rta(
            addr,
            datatype,
            AtomicOp::CompareSwap,
            &operand,
            rma_iov,
            TxOp::AtomicCompare,
            context,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_rta(
        &mut self,
        addr: FiAddr,
        datatype: AtomicDatatype,
        op: AtomicOp,
        operand: &[u8],
        rma_iov: &[RmaIov],
        tx_op: TxOp,
        context: u64,
    ) -> Result<()> {
        self.av
            .peer(addr)
            .ok_or(Error::InvalidArgument("atomic to unknown fi_addr"))?;
        if rma_iov.is_empty() {
            return Err(Error::InvalidArgument("empty rma_iov"));
        }
        let elem_payload = if tx_op == TxOp::AtomicCompare {
            operand.len() / 2
        } else {
            operand.len()
        };
        if elem_payload == 0 || elem_payload % datatype.size() != 0 {
            return Err(Error::InvalidArgument("operand length"));
        }

        let typ = match tx_op {
            TxOp::AtomicWrite => PktType::WriteRta,
            TxOp::AtomicFetch => PktType::FetchRta,
            TxOp::AtomicCompare => PktType::CompareRta,
            _ => unreachable!(),
        };

        let mut tx = TxEntry::new(tx_op, TxProto::Eager, addr, operand.to_vec(), context);
        tx.atomic = Some((datatype, op));
        tx.rma_iov = rma_iov.to_vec();
        tx.msg_id = self.av.peer_mut(addr).unwrap().next_msg_id();
        // The wire payload for compare is both buffers; the logical
        // transfer length is one.
        tx.total_len = operand.len() as u64;
        let tx_id = self.alloc_tx(tx);

        let hdr = RtaHdr {
            common: ReqCommon {
                typ,
                msg_id: self.txs[tx_id].msg_id,
                tag: None,
            },
            tx_id: tx_id as u32,
            rma_iov: rma_iov.to_vec(),
            datatype,
            op,
            opt: self.req_opt_hdrs(addr, None),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                let tx = self.txs.remove(tx_id);
                if let Some(peer) = self.av.peer_mut(addr) {
                    peer.undo_msg_id();
                    peer.tx_entries.retain(|&id| id != tx_id);
                }
                drop(tx);
                return Err(e);
            }
        };
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
        let sent = self.txs[tx_id].total_len;
        self.txs[tx_id].add_sent(sent);
        self.send_or_queue_tx(tx_id, pkt_id);
        Ok(())
    }

    /// Responder side of an RTA (already cleared the reorder window).
    pub(crate) fn handle_rta(&mut self, pkt_id: PktId) {
        let src = self.pool_ref(pkt_id.pool).get(pkt_id).addr.expect("rta src");
        let (hdr, off) = match RtaHdr::decode(self.pool_ref(pkt_id.pool).get(pkt_id).bytes()) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("malformed RTA from {}: {}", src, e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };
        let mem = match self.resolve_region(&hdr.rma_iov) {
            Ok(mem) => mem,
            Err(e) => {
                log::warn!("RTA from {} targets unknown region: {}", src, e);
                self.release_rx_pkt(pkt_id);
                return;
            }
        };
        let operands = self.pool_ref(pkt_id.pool).get(pkt_id).bytes()[off..].to_vec();
        self.release_rx_pkt(pkt_id);

        match hdr.common.typ {
            PktType::WriteRta | PktType::DcWriteRta => {
                if apply_atomic(&mem, &hdr.rma_iov, hdr.datatype, hdr.op, &operands, false)
                    .is_none()
                {
                    log::warn!("RTA from {} out of region bounds", src);
                    return;
                }
                if hdr.common.typ == PktType::DcWriteRta {
                    self.send_receipt(src, hdr.tx_id, hdr.common.msg_id);
                }
            }
            PktType::FetchRta => {
                let Some(old) =
                    apply_atomic(&mem, &hdr.rma_iov, hdr.datatype, hdr.op, &operands, true)
                else {
                    log::warn!("RTA from {} out of region bounds", src);
                    return;
                };
                self.send_atomrsp(src, hdr.tx_id, &old);
            }
            PktType::CompareRta => {
                let Some(old) = apply_compare(&mem, &hdr.rma_iov, hdr.datatype, &operands) else {
                    log::warn!("RTA from {} out of region bounds", src);
                    return;
                };
                self.send_atomrsp(src, hdr.tx_id, &old);
            }
            _ => unreachable!("rta type"),
        }
    }

    fn send_atomrsp(&mut self, addr: FiAddr, tx_id: u32, payload: &[u8]) {
        let hdr = AtomRspHdr {
            tx_id,
            data_length: payload.len() as u64,
            connid: self.ctrl_connid(addr),
        };
        let pkt_id = match self.tx_pool.alloc() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("ATOMRSP deferred: {}", e);
                return;
            }
        };
        {
            let pkt = self.tx_pool.get_mut(pkt_id);
            let n = hdr.encode(pkt.buf_mut());
            pkt.buf_mut()[n..n + payload.len()].copy_from_slice(payload);
            pkt.size = n + payload.len();
            pkt.owner = PktOwner::None;
            pkt.addr = Some(addr);
        }
        self.send_or_queue_ctrl(pkt_id);
    }

    pub(crate) fn handle_atomrsp(&mut self, pkt_id: PktId) {
        let (src, hdr, off) = {
            let pkt = self.pool_ref(pkt_id.pool).get(pkt_id);
            let src = pkt.addr.expect("atomrsp src");
            match AtomRspHdr::decode(pkt.bytes()) {
                Ok((hdr, off)) => (src, hdr, off),
                Err(e) => {
                    log::warn!("malformed ATOMRSP: {}", e);
                    self.release_rx_pkt(pkt_id);
                    return;
                }
            }
        };
        let payload = self.pool_ref(pkt_id.pool).get(pkt_id).bytes()[off..].to_vec();
        self.release_rx_pkt(pkt_id);

        let tx_id = hdr.tx_id as usize;
        if !self.txs.contains(tx_id) || self.txs[tx_id].addr != src {
            return;
        }
        self.txs[tx_id].result_buf = Some(payload);
        if self.txs[tx_id].done() {
            self.finalize_tx(tx_id);
        }
    }
}

/// Locate the physical range for a logical element offset within the iov
/// list.
fn locate(iovs: &[RmaIov], logical: usize, len: usize) -> Option<usize> {
    let mut skip = logical;
    for iov in iovs {
        if skip + len <= iov.len as usize {
            return Some(iov.addr as usize + skip);
        }
        if skip >= iov.len as usize {
            skip -= iov.len as usize;
        } else {
            // Elements never straddle iov boundaries.
            return None;
        }
    }
    None
}

/// Apply an elementwise atomic op; optionally return the old values.
fn apply_atomic(
    mem: &Region,
    iovs: &[RmaIov],
    datatype: AtomicDatatype,
    op: AtomicOp,
    operands: &[u8],
    want_old: bool,
) -> Option<Vec<u8>> {
    let size = datatype.size();
    let mut mem = mem.borrow_mut();
    let mut old_out = Vec::with_capacity(operands.len());
    for (i, operand) in operands.chunks(size).enumerate() {
        let phys = locate(iovs, i * size, size)?;
        if phys + size > mem.len() {
            return None;
        }
        let old = &mem[phys..phys + size];
        if want_old {
            old_out.extend_from_slice(old);
        }
        let new = match datatype {
            AtomicDatatype::U32 => apply_elem!(u32, old, operand, op),
            AtomicDatatype::U64 => apply_elem!(u64, old, operand, op),
            AtomicDatatype::I32 => apply_elem!(i32, old, operand, op),
            AtomicDatatype::I64 => apply_elem!(i64, old, operand, op),
        };
        mem[phys..phys + size].copy_from_slice(&new);
    }
    Some(old_out)
}

/// Compare-and-swap: operands are the compare buffer followed by the
/// swap buffer; returns the old values.
fn apply_compare(
    mem: &Region,
    iovs: &[RmaIov],
    datatype: AtomicDatatype,
    operands: &[u8],
) -> Option<Vec<u8>> {
    let size = datatype.size();
    let half = operands.len() / 2;
    let (cmp_buf, swap_buf) = operands.split_at(half);
    let mut mem = mem.borrow_mut();
    let mut old_out = Vec::with_capacity(half);
    for i in 0..half / size {
        let phys = locate(iovs, i * size, size)?;
        if phys + size > mem.len() {
            return None;
        }
        let old = mem[phys..phys + size].to_vec();
        old_out.extend_from_slice(&old);
        let cmp = &cmp_buf[i * size..(i + 1) * size];
        let swap = &swap_buf[i * size..(i + 1) * size];
        let new = match datatype {
            AtomicDatatype::U32 => compare_elem!(u32, &old[..], cmp, swap),
            AtomicDatatype::U64 => compare_elem!(u64, &old[..], cmp, swap),
            AtomicDatatype::I32 => compare_elem!(i32, &old[..], cmp, swap),
            AtomicDatatype::I64 => compare_elem!(i64, &old[..], cmp, swap),
        };
        mem[phys..phys + size].copy_from_slice(&new);
    }
    Some(old_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn region(bytes: &[u8]) -> Region {
        Rc::new(RefCell::new(bytes.to_vec()))
    }

    fn iov(addr: u64, len: u64) -> Vec<RmaIov> {
        vec![RmaIov { addr, len, key: 0 }]
    }

    #[test]
    fn test_atomic_sum_u64() {
        let mem = region(&5u64.to_le_bytes());
        let old = apply_atomic(
            &mem,
            &iov(0, 8),
            AtomicDatatype::U64,
            AtomicOp::Sum,
            &7u64.to_le_bytes(),
            true,
        )
        .unwrap();
        assert_eq!(old, 5u64.to_le_bytes());
        assert_eq!(&*mem.borrow(), &12u64.to_le_bytes());
    }

    #[test]
    fn test_atomic_min_signed() {
        let mem = region(&(-3i32).to_le_bytes());
        apply_atomic(
            &mem,
            &iov(0, 4),
            AtomicDatatype::I32,
            AtomicOp::Min,
            &2i32.to_le_bytes(),
            false,
        )
        .unwrap();
        assert_eq!(&*mem.borrow(), &(-3i32).to_le_bytes());
    }

    #[test]
    fn test_compare_swap() {
        let mem = region(&10u32.to_le_bytes());
        let mut operands = Vec::new();
        operands.extend_from_slice(&10u32.to_le_bytes());
        operands.extend_from_slice(&99u32.to_le_bytes());
        let old = apply_compare(&mem, &iov(0, 4), AtomicDatatype::U32, &operands).unwrap();
        assert_eq!(old, 10u32.to_le_bytes());
        assert_eq!(&*mem.borrow(), &99u32.to_le_bytes());

        // Mismatch leaves memory untouched.
        let old = apply_compare(&mem, &iov(0, 4), AtomicDatatype::U32, &operands).unwrap();
        assert_eq!(old, 99u32.to_le_bytes());
        assert_eq!(&*mem.borrow(), &99u32.to_le_bytes());
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = region(&[0u8; 4]);
        assert!(apply_atomic(
            &mem,
            &iov(0, 4),
            AtomicDatatype::U64,
            AtomicOp::Sum,
            &1u64.to_le_bytes(),
            false,
        )
        .is_none());
    }
}
