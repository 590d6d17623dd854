//! Per-peer reliability state.
//!
//! A `Peer` holds everything needed to converse reliably with one remote
//! endpoint: the handshake/feature state, connid bookkeeping for QP-reuse
//! protection, credit accounting, RNR backoff, the lists of in-flight
//! entries that pin the peer in the address vector, and the msg_id
//! reorder window. All mutations go through methods; the counters carry
//! debug-checked postconditions.

use std::time::Instant;

use bitflags::bitflags;

use rand::Rng;

use crate::packet::{extra_feature, ExtraInfo};
use crate::pool::PktId;

/// Microsecond timestamp on a process-local monotonic clock.
pub(crate) fn current_time_us() -> u64 {
    use std::sync::OnceLock;
    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_micros() as u64
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeerFlags: u32 {
        /// We have sent at least one REQ to this peer.
        const REQ_SENT = 0x1;
        /// A HANDSHAKE from this peer has been received.
        const HANDSHAKE_RECEIVED = 0x2;
        /// We have sent (or queued) our HANDSHAKE to this peer.
        const HANDSHAKE_SENT = 0x4;
        /// HANDSHAKE send hit EAGAIN; the progress loop retries it.
        const HANDSHAKE_QUEUED = 0x8;
        /// Peer answered RNR; transmits are paused until the deadline.
        const IN_BACKOFF = 0x10;
    }
}

/// Disposition of an incoming ordered (RTM/RTA) msg_id against the
/// receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// The next expected id; process now.
    Expected,
    /// Ahead of expected but within the window; buffer for later.
    InWindow,
    /// Behind the window: a duplicate, drop silently.
    Duplicate,
    /// Further ahead than the window can hold: protocol error.
    TooFar,
}

/// Modular reorder window over 32-bit msg_ids.
///
/// Wraparound is legal: distances are computed with wrapping arithmetic,
/// so an expected id of `u32::MAX` followed by 0, 1, .. behaves the same
/// as any other position.
pub struct RecvWindow {
    expected: u32,
    size: u32,
    /// Each slot holds the packet chain staged for one msg_id. Medium
    /// messages chain several segments under a single id.
    slots: Vec<Vec<PktId>>,
}

impl RecvWindow {
    pub fn new(size: u32) -> Self {
        assert!(size > 0);
        Self {
            expected: 0,
            size,
            slots: vec![Vec::new(); size as usize],
        }
    }

    pub(crate) fn with_expected(size: u32, expected: u32) -> Self {
        let mut win = Self::new(size);
        win.expected = expected;
        win
    }

    #[inline]
    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn check(&self, msg_id: u32) -> SeqCheck {
        let dist = msg_id.wrapping_sub(self.expected);
        if dist == 0 {
            SeqCheck::Expected
        } else if dist < self.size {
            SeqCheck::InWindow
        } else if dist >= 1 << 31 {
            SeqCheck::Duplicate
        } else {
            SeqCheck::TooFar
        }
    }

    /// Stage an in-window packet. `chain` allows appending to an
    /// occupied slot (medium segments share their message's id); without
    /// it an occupied slot means a duplicate and the packet is refused.
    pub fn buffer(&mut self, msg_id: u32, pkt: PktId, chain: bool) -> bool {
        debug_assert_eq!(self.check(msg_id), SeqCheck::InWindow);
        let slot = (msg_id % self.size) as usize;
        if !self.slots[slot].is_empty() && !chain {
            return false;
        }
        self.slots[slot].push(pkt);
        true
    }

    /// Advance past the current expected id.
    pub fn advance(&mut self) {
        self.expected = self.expected.wrapping_add(1);
    }

    /// Take the staged chain for the current expected id, if any.
    pub fn take_expected(&mut self) -> Vec<PktId> {
        let slot = (self.expected % self.size) as usize;
        std::mem::take(&mut self.slots[slot])
    }

    /// Drain every staged packet (peer teardown).
    pub fn drain(&mut self) -> Vec<PktId> {
        self.slots.iter_mut().flat_map(std::mem::take).collect()
    }
}

/// Per-peer protocol state.
pub struct Peer {
    pub flags: PeerFlags,
    /// Feature/request bitmap learned from the peer's HANDSHAKE.
    pub extra_info: ExtraInfo,
    /// Connection id from the peer's raw address; packets carrying a
    /// different connid are from a destroyed predecessor QP.
    pub connid: u32,
    /// Connid of the peer this one evicted on insert, if any.
    pub prev_connid: Option<u32>,
    pub is_self: bool,
    pub is_local: bool,
    /// Intra-node address under the shm transport, when `is_local`.
    pub shm_fiaddr: Option<u64>,

    /// Next msg_id for ordered sends to this peer.
    next_msg_id: u32,
    /// Reorder window; allocated on the first ordered receive.
    pub recvwin: Option<RecvWindow>,

    /// Flow-control credits available for new long transfers.
    tx_credits: u32,
    /// Packets posted to the transport for this peer, not yet completed.
    tx_pending: u32,

    /// RNR backoff deadline bookkeeping (microseconds).
    pub rnr_backoff_begin: u64,
    pub rnr_backoff_wait: u64,
    /// Packets queued for retransmit due to RNR.
    pub rnr_queued_pkts: usize,

    /// In-flight entries referencing this peer. Non-empty lists make the
    /// AV entry BUSY for removal.
    pub tx_entries: Vec<usize>,
    pub rx_entries: Vec<usize>,
}

impl Peer {
    pub fn new(connid: u32, is_self: bool, is_local: bool, tx_credits: u32) -> Self {
        Self {
            flags: PeerFlags::empty(),
            extra_info: ExtraInfo::default(),
            connid,
            prev_connid: None,
            is_self,
            is_local,
            shm_fiaddr: None,
            next_msg_id: 0,
            recvwin: None,
            tx_credits,
            tx_pending: 0,
            rnr_backoff_begin: 0,
            rnr_backoff_wait: 0,
            rnr_queued_pkts: 0,
            tx_entries: Vec::new(),
            rx_entries: Vec::new(),
        }
    }

    /// Whether any in-flight entry still references this peer.
    #[inline]
    pub fn in_use(&self) -> bool {
        !self.tx_entries.is_empty() || !self.rx_entries.is_empty()
    }

    #[inline]
    pub fn handshake_received(&self) -> bool {
        self.flags.contains(PeerFlags::HANDSHAKE_RECEIVED)
    }

    #[inline]
    pub fn in_backoff(&self) -> bool {
        self.flags.contains(PeerFlags::IN_BACKOFF)
    }

    /// Record the peer's HANDSHAKE.
    pub fn set_handshake(&mut self, info: ExtraInfo) {
        self.flags |= PeerFlags::HANDSHAKE_RECEIVED;
        self.extra_info = info;
    }

    #[inline]
    pub fn supports(&self, feature: u64) -> bool {
        self.extra_info.has(feature)
    }

    /// Whether outgoing REQ packets still need the raw-address header.
    /// It is carried until the handshake arrives, and kept afterwards if
    /// the peer asked for constant header lengths.
    pub fn needs_raw_addr_hdr(&self) -> bool {
        !self.handshake_received() || self.supports(extra_feature::CONSTANT_HEADER_LENGTH)
    }

    /// Allocate the next ordered msg_id.
    pub fn next_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Roll back an allocated msg_id after a failed submit, so the peer
    /// sees no sequence gap.
    pub fn undo_msg_id(&mut self) {
        self.next_msg_id = self.next_msg_id.wrapping_sub(1);
    }

    /// Position both directions of the msg_id sequence. Harness hook for
    /// exercising wraparound without sending 2^32 messages.
    #[doc(hidden)]
    pub fn force_msg_id(&mut self, id: u32, recvwin_size: u32) {
        self.next_msg_id = id;
        self.recvwin = Some(RecvWindow::with_expected(recvwin_size, id));
    }

    /// The reorder window, created lazily on first ordered receive.
    pub fn recvwin_mut(&mut self, size: u32) -> &mut RecvWindow {
        self.recvwin.get_or_insert_with(|| RecvWindow::new(size))
    }

    #[inline]
    pub fn tx_credits(&self) -> u32 {
        self.tx_credits
    }

    #[inline]
    pub fn tx_pending(&self) -> u32 {
        self.tx_pending
    }

    pub fn inc_tx_pending(&mut self) {
        self.tx_pending += 1;
    }

    /// Tolerates zero: a completion may land on a peer slot that was
    /// recycled by a QP-reuse eviction.
    pub fn dec_tx_pending(&mut self) {
        self.tx_pending = self.tx_pending.saturating_sub(1);
    }

    /// Divide available credits among outstanding transfers and claim a
    /// request for a transfer of `total_len`. Returns 0 when no credit
    /// can be claimed; the caller queues the REQ for later.
    pub fn request_credits(&mut self, total_len: u64, max_data: usize, min_credits: u32) -> u32 {
        let pending = self.tx_pending + 1;
        let per_transfer = self.tx_credits.div_ceil(pending);
        let needed = (total_len as usize).div_ceil(max_data) as u32;
        let mut request = per_transfer.min(needed).max(min_credits);
        if self.tx_credits >= request {
            self.tx_credits -= request;
        } else {
            request = 0;
        }
        request
    }

    /// Return credits claimed by a finished transfer.
    pub fn return_credits(&mut self, credits: u32) {
        self.tx_credits += credits;
    }

    /// Enter (or extend) RNR backoff: exponential wait with a random
    /// initial jitter, capped.
    pub fn backoff(&mut self, now_us: u64, initial_us: u64, cap_us: u64) {
        self.rnr_backoff_begin = now_us;
        if self.rnr_backoff_wait == 0 {
            self.rnr_backoff_wait = 1 + rand::thread_rng().gen_range(0..initial_us.max(1));
        } else {
            self.rnr_backoff_wait = (self.rnr_backoff_wait * 2).min(cap_us);
        }
        self.flags |= PeerFlags::IN_BACKOFF;
    }

    #[inline]
    pub fn backoff_expired(&self, now_us: u64) -> bool {
        now_us >= self.rnr_backoff_begin + self.rnr_backoff_wait
    }

    /// A successful completion to this peer resets the backoff state.
    pub fn reset_backoff(&mut self) {
        self.rnr_backoff_wait = 0;
        self.rnr_backoff_begin = 0;
        self.flags -= PeerFlags::IN_BACKOFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolKind;

    fn pkt(key: usize) -> PktId {
        PktId {
            pool: PoolKind::Unexp,
            key,
        }
    }

    #[test]
    fn test_recvwin_in_order() {
        let mut win = RecvWindow::new(8);
        assert_eq!(win.check(0), SeqCheck::Expected);
        win.advance();
        assert_eq!(win.check(0), SeqCheck::Duplicate);
        assert_eq!(win.check(1), SeqCheck::Expected);
        assert_eq!(win.check(5), SeqCheck::InWindow);
        assert_eq!(win.check(9), SeqCheck::TooFar);
    }

    #[test]
    fn test_recvwin_wraparound() {
        let mut win = RecvWindow::with_expected(8, u32::MAX - 1);
        assert_eq!(win.check(u32::MAX - 1), SeqCheck::Expected);
        assert_eq!(win.check(u32::MAX), SeqCheck::InWindow);
        assert_eq!(win.check(3), SeqCheck::InWindow);
        assert_eq!(win.check(u32::MAX - 2), SeqCheck::Duplicate);

        assert!(win.buffer(u32::MAX, pkt(1), false));
        assert!(win.buffer(0, pkt(2), false));
        win.advance(); // expected = MAX
        assert_eq!(win.take_expected(), vec![pkt(1)]);
        win.advance(); // expected = 0, wrapped
        assert_eq!(win.expected(), 0);
        assert_eq!(win.take_expected(), vec![pkt(2)]);
    }

    #[test]
    fn test_recvwin_duplicate_slot() {
        let mut win = RecvWindow::new(4);
        assert!(win.buffer(2, pkt(1), false));
        assert!(!win.buffer(2, pkt(2), false));
    }

    #[test]
    fn test_recvwin_medium_chain() {
        let mut win = RecvWindow::new(4);
        assert!(win.buffer(2, pkt(1), true));
        assert!(win.buffer(2, pkt(2), true));
        win.advance();
        win.advance();
        assert_eq!(win.take_expected(), vec![pkt(1), pkt(2)]);
    }

    #[test]
    fn test_msg_id_wraps() {
        let mut peer = Peer::new(1, false, false, 64);
        peer.next_msg_id = u32::MAX;
        assert_eq!(peer.next_msg_id(), u32::MAX);
        assert_eq!(peer.next_msg_id(), 0);
        assert_eq!(peer.next_msg_id(), 1);
    }

    #[test]
    fn test_credit_division() {
        let mut peer = Peer::new(1, false, false, 64);
        // One huge transfer with nothing pending claims everything it
        // needs, bounded by the credit pool split.
        let got = peer.request_credits(1 << 20, 8192, 4);
        assert!(got >= 4);
        assert!(peer.tx_credits() <= 64);
        peer.return_credits(got);
        assert_eq!(peer.tx_credits(), 64);

        // Tiny transfer still gets the floor.
        let got = peer.request_credits(100, 8192, 4);
        assert_eq!(got, 4);
        peer.return_credits(got);
    }

    #[test]
    fn test_credit_exhaustion() {
        let mut peer = Peer::new(1, false, false, 2);
        assert_eq!(peer.request_credits(1 << 20, 8192, 4), 0);
        assert_eq!(peer.tx_credits(), 2);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut peer = Peer::new(1, false, false, 64);
        peer.backoff(1000, 100, 400);
        let first = peer.rnr_backoff_wait;
        assert!(first >= 1 && first <= 100);
        assert!(peer.in_backoff());
        peer.backoff(2000, 100, 400);
        assert_eq!(peer.rnr_backoff_wait, (first * 2).min(400));
        peer.backoff(3000, 100, 400);
        peer.backoff(4000, 100, 400);
        assert_eq!(peer.rnr_backoff_wait, 400);
        assert!(!peer.backoff_expired(4399));
        assert!(peer.backoff_expired(4400));
        peer.reset_backoff();
        assert!(!peer.in_backoff());
        assert_eq!(peer.rnr_backoff_wait, 0);
    }

    #[test]
    fn test_handshake_raw_addr_rule() {
        let mut peer = Peer::new(1, false, false, 64);
        assert!(peer.needs_raw_addr_hdr());
        let mut info = ExtraInfo::default();
        info.set(extra_feature::DELIVERY_COMPLETE);
        peer.set_handshake(info);
        assert!(!peer.needs_raw_addr_hdr());

        let mut peer2 = Peer::new(1, false, false, 64);
        let mut info2 = ExtraInfo::default();
        info2.set(extra_feature::CONSTANT_HEADER_LENGTH);
        peer2.set_handshake(info2);
        assert!(peer2.needs_raw_addr_hdr());
    }
}
