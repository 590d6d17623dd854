//! Receive entry: one active inbound operation.

use crate::addr::FiAddr;
use crate::hmem::HmemDesc;
use crate::packet::RmaIov;
use crate::pool::PktId;
use crate::transport::Region;

/// Receive state machine: `Init -> Unexp | Matched -> Recv -> done`, with
/// `QueuedCtrl` for deferred control packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Init,
    Unexp,
    Matched,
    Recv,
    QueuedCtrl,
}

/// Operation class of a receive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOp {
    Msg,
    Tagged,
    /// Target side of an emulated write.
    WriteTarget,
    /// Requester side of an emulated read: receives READRSP/DATA.
    ReadRsp,
    /// Target side of an emulated atomic.
    Atomic,
}

/// Destination of the inbound payload.
pub enum RxDest {
    /// Endpoint-owned buffer handed to the application in the
    /// completion.
    Owned(Vec<u8>),
    /// Registered local region, written at the offsets the rma_iov list
    /// describes (one-sided targets).
    Region { mem: Region, iovs: Vec<RmaIov> },
    None,
}

impl RxDest {
    /// Copy `bytes` at logical offset `offset` of the destination.
    /// Returns false if the write falls outside the destination.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> bool {
        match self {
            RxDest::Owned(buf) => {
                // Overruns truncate: copy the prefix that fits.
                let room = buf.len().saturating_sub(offset);
                let n = bytes.len().min(room);
                buf[offset..offset + n].copy_from_slice(&bytes[..n]);
                n == bytes.len()
            }
            RxDest::Region { mem, iovs } => {
                // Walk the iov list to locate the logical offset.
                let mut mem = mem.borrow_mut();
                let mut remaining_skip = offset;
                let mut src = bytes;
                for iov in iovs.iter() {
                    let iov_len = iov.len as usize;
                    if remaining_skip >= iov_len {
                        remaining_skip -= iov_len;
                        continue;
                    }
                    let start = iov.addr as usize + remaining_skip;
                    let room = iov_len - remaining_skip;
                    let n = src.len().min(room);
                    if start + n > mem.len() {
                        return false;
                    }
                    mem[start..start + n].copy_from_slice(&src[..n]);
                    src = &src[n..];
                    remaining_skip = 0;
                    if src.is_empty() {
                        return true;
                    }
                }
                src.is_empty()
            }
            RxDest::None => false,
        }
    }

    pub fn take_owned(&mut self) -> Option<Vec<u8>> {
        match std::mem::replace(self, RxDest::None) {
            RxDest::Owned(buf) => Some(buf),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// One active inbound operation.
pub struct RxEntry {
    pub op: RxOp,
    pub state: RxState,
    /// Expected source, or None for any.
    pub addr: Option<FiAddr>,
    pub tag: u64,
    pub ignore: u64,

    pub dest: RxDest,
    /// Posted capacity.
    pub recv_len: usize,
    /// Total message length once known from the RTM.
    pub total_len: u64,
    pub bytes_received: u64,
    pub bytes_copied: u64,
    /// Bytes granted to the sender by the last CTS, not yet consumed.
    pub window: u64,
    /// Length reported in the completion (min of message and posted
    /// capacity; overruns are truncated).
    pub cq_len: usize,

    pub msg_id: Option<u32>,
    /// The sender's send_id, echoed in CTS/EOR/RECEIPT.
    pub peer_send_id: Option<u32>,
    /// Delivery-complete: answer with RECEIPT after the payload lands.
    pub dc: bool,
    pub cq_data: Option<u64>,

    /// Staged packets while unexpected (first packet plus any chained
    /// medium segments).
    pub unexp_pkts: Vec<PktId>,
    /// Packets deferred by EAGAIN or RNR.
    pub queued_pkts: Vec<PktId>,

    pub cancelled: bool,

    /// Multi-recv: children point at the parent; the parent counts live
    /// consumers and its next slice offset.
    pub multi_recv_parent: Option<usize>,
    pub mr_consumers: usize,
    pub mr_remaining: usize,
    pub is_multi_recv: bool,

    pub hmem: HmemDesc,
    pub context: u64,
    /// Internal entries write no application completion.
    pub silent: bool,
}

impl RxEntry {
    pub fn new(op: RxOp, addr: Option<FiAddr>, dest: RxDest, recv_len: usize, context: u64) -> Self {
        Self {
            op,
            state: RxState::Init,
            addr,
            tag: 0,
            ignore: 0,
            dest,
            recv_len,
            total_len: 0,
            bytes_received: 0,
            bytes_copied: 0,
            window: 0,
            cq_len: 0,
            msg_id: None,
            peer_send_id: None,
            dc: false,
            cq_data: None,
            unexp_pkts: Vec::new(),
            queued_pkts: Vec::new(),
            cancelled: false,
            multi_recv_parent: None,
            mr_consumers: 0,
            mr_remaining: 0,
            is_multi_recv: false,
            hmem: HmemDesc::default(),
            context,
            silent: false,
        }
    }

    #[inline]
    pub fn tagged(&self) -> bool {
        self.op == RxOp::Tagged
    }

    /// Whether a message from `src` with the given tagging matches this
    /// posted entry.
    pub fn matches(&self, src: FiAddr, tagged: bool, tag: Option<u64>) -> bool {
        if self.tagged() != tagged {
            return false;
        }
        if let Some(expected) = self.addr {
            if expected != src {
                return false;
            }
        }
        if tagged {
            let tag = tag.unwrap_or(0);
            if (tag ^ self.tag) & !self.ignore != 0 {
                return false;
            }
        }
        true
    }

    /// Record `n` received payload bytes.
    pub fn add_received(&mut self, n: u64) {
        self.bytes_received += n;
        debug_assert!(self.total_len == 0 || self.bytes_received <= self.total_len);
    }

    #[inline]
    pub fn complete_received(&self) -> bool {
        self.bytes_received >= self.total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(op: RxOp) -> RxEntry {
        RxEntry::new(op, None, RxDest::Owned(vec![0u8; 64]), 64, 0)
    }

    #[test]
    fn test_untagged_match() {
        let mut e = entry(RxOp::Msg);
        assert!(e.matches(FiAddr(3), false, None));
        assert!(!e.matches(FiAddr(3), true, Some(1)));
        e.addr = Some(FiAddr(2));
        assert!(!e.matches(FiAddr(3), false, None));
        assert!(e.matches(FiAddr(2), false, None));
    }

    #[test]
    fn test_tagged_match_with_ignore() {
        let mut e = entry(RxOp::Tagged);
        e.tag = 0xab00;
        e.ignore = 0x00ff;
        assert!(e.matches(FiAddr(0), true, Some(0xab12)));
        assert!(!e.matches(FiAddr(0), true, Some(0xac12)));
    }

    #[test]
    fn test_dest_owned_write() {
        let mut d = RxDest::Owned(vec![0u8; 8]);
        assert!(d.write(2, b"abc"));
        assert!(!d.write(7, b"xy"));
        assert_eq!(d.take_owned().unwrap(), vec![0, 0, b'a', b'b', b'c', 0, 0, 0]);
    }

    #[test]
    fn test_dest_region_write_across_iovs() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mem: Region = Rc::new(RefCell::new(vec![0u8; 16]));
        let mut d = RxDest::Region {
            mem: mem.clone(),
            iovs: vec![
                RmaIov {
                    addr: 0,
                    len: 4,
                    key: 0,
                },
                RmaIov {
                    addr: 8,
                    len: 4,
                    key: 0,
                },
            ],
        };
        // Six bytes starting at logical offset 2 span both iovs.
        assert!(d.write(2, b"abcdef"));
        assert_eq!(&mem.borrow()[..], b"\0\0ab\0\0\0\0cdef\0\0\0\0");
        // Past the end of the iov list fails.
        assert!(!d.write(6, b"ghi"));
    }
}
