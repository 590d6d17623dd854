//! Address vector: the table of known peers.
//!
//! The AV owns three mappings: an ordered table of peers addressable by
//! `FiAddr` (a table index), a GID-keyed cache of shared address handles,
//! and an `(AHN, QPN) -> FiAddr` reverse map used to attribute incoming
//! packets. Address handles are reference-shared: peers behind one GID
//! hold clones of one `Rc<Ah>`, and the hardware handle is destroyed when
//! the last holder releases it.
//!
//! Inserting an address whose `(AHN, QPN)` is already present evicts the
//! prior peer: same GID and QPN with a different connid means the remote
//! QP was destroyed and recreated.

use std::collections::HashMap;
use std::rc::Rc;

use crate::addr::{AhHandle, FiAddr, Gid, RawAddr};
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::transport::Transport;

/// A cached, shared address handle.
pub struct Ah {
    pub handle: AhHandle,
    pub gid: Gid,
}

impl Ah {
    #[inline]
    pub fn ahn(&self) -> u16 {
        self.handle.ahn
    }
}

/// Residue of a released peer. The endpoint fails the listed entries
/// with error completions and returns staged packets to their pools; the
/// AV does not know how.
pub struct EvictedPeer {
    pub fi_addr: FiAddr,
    pub connid: u32,
    pub tx_entries: Vec<usize>,
    pub rx_entries: Vec<usize>,
    /// Packets parked in the peer's reorder buffer.
    pub staged_pkts: Vec<crate::pool::PktId>,
}

struct AvEntry {
    raw: RawAddr,
    ah: Rc<Ah>,
    shm_ah: Option<AhHandle>,
    peer: Peer,
}

/// The address vector.
#[derive(Default)]
pub struct AddressVector {
    entries: Vec<Option<AvEntry>>,
    ah_cache: HashMap<Gid, Rc<Ah>>,
    reverse: HashMap<(u16, u16), FiAddr>,
    addr_index: HashMap<(Gid, u16, u32), FiAddr>,
    /// shm-side address -> main fi_addr, for completions arriving on the
    /// shm transport.
    shm_map: HashMap<u64, FiAddr>,
    /// Reverse map under the shm transport's own AHN numbering.
    shm_reverse: HashMap<(u16, u16), FiAddr>,
    next_shm_fiaddr: u64,
    used: usize,
}

impl AddressVector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of live entries in the AH cache.
    #[inline]
    pub fn ah_cache_len(&self) -> usize {
        self.ah_cache.len()
    }

    /// Peers currently sharing the AH for `gid`.
    pub fn ah_used(&self, gid: &Gid) -> usize {
        self.ah_cache
            .get(gid)
            .map(|ah| Rc::strong_count(ah) - 1)
            .unwrap_or(0)
    }

    /// Insert one raw address.
    ///
    /// Validates the GID, reuses or creates the shared AH, evicts a stale
    /// duplicate occupying the same `(AHN, QPN)`, wires the reverse map,
    /// and initializes the peer record (self and intra-node detection,
    /// shm bridge). Re-inserting an existing address returns the existing
    /// `FiAddr`; no new AH is created.
    #[allow(clippy::too_many_arguments)]
    pub fn insert<T: Transport>(
        &mut self,
        tp: &mut T,
        shm: Option<&mut T>,
        raw: &RawAddr,
        self_raw: &RawAddr,
        local_gids: &[Gid],
        tx_credits: u32,
    ) -> Result<(FiAddr, Option<EvictedPeer>)> {
        if raw.gid.is_zero() {
            log::warn!("av: refusing to insert zero GID");
            return Err(Error::AddrNotAvailable);
        }

        if let Some(&fi) = self.addr_index.get(&(raw.gid, raw.qpn, raw.connid)) {
            log::debug!("av: insert of known address, returning fi_addr {}", fi);
            return Ok((fi, None));
        }

        let ah = match self.ah_cache.get(&raw.gid) {
            Some(ah) => ah.clone(),
            None => {
                let handle = tp.create_ah(raw.gid)?;
                let ah = Rc::new(Ah {
                    handle,
                    gid: raw.gid,
                });
                self.ah_cache.insert(raw.gid, ah.clone());
                ah
            }
        };

        // A live entry under the same (AHN, QPN) has the same GID and QPN
        // but a different connid: the remote QP was destroyed and
        // recreated. Evict the predecessor.
        let mut evicted = None;
        let mut prev_connid = None;
        if let Some(&prev_fi) = self.reverse.get(&(ah.ahn(), raw.qpn)) {
            let prev = self.entries[prev_fi.index()].as_ref().expect("reverse map entry");
            debug_assert_eq!(prev.raw.gid, raw.gid);
            debug_assert_eq!(prev.raw.qpn, raw.qpn);
            debug_assert_ne!(prev.raw.connid, raw.connid);
            log::warn!(
                "av: QP reuse detected, evicting peer {} (connid {:#x} -> {:#x})",
                prev_fi,
                prev.raw.connid,
                raw.connid
            );
            prev_connid = Some(prev.raw.connid);
            evicted = Some(self.release_entry(tp, prev_fi, true));
        }

        let is_self = raw.same_endpoint(self_raw);
        let is_local = local_gids.contains(&raw.gid);
        let mut peer = Peer::new(raw.connid, is_self, is_local, tx_credits);
        peer.prev_connid = prev_connid;

        let mut shm_ah = None;
        if is_local && !is_self {
            if let Some(shm_tp) = shm {
                // Bridge to the intra-node transport: the peer is known
                // there under the same gid:qpn identity.
                let handle = shm_tp.create_ah(raw.gid)?;
                let shm_fi = self.next_shm_fiaddr;
                self.next_shm_fiaddr += 1;
                peer.shm_fiaddr = Some(shm_fi);
                shm_ah = Some(handle);
                log::debug!("av: local peer bridged to shm address {}", shm_fi);
            }
        }

        let fi = match self.entries.iter().position(Option::is_none) {
            Some(idx) => FiAddr(idx as u64),
            None => {
                self.entries.push(None);
                FiAddr((self.entries.len() - 1) as u64)
            }
        };

        if let Some(shm_fi) = peer.shm_fiaddr {
            self.shm_map.insert(shm_fi, fi);
        }
        if let Some(shm_ah) = &shm_ah {
            self.shm_reverse.insert((shm_ah.ahn, raw.qpn), fi);
        }
        self.reverse.insert((ah.ahn(), raw.qpn), fi);
        self.addr_index.insert((raw.gid, raw.qpn, raw.connid), fi);
        self.entries[fi.index()] = Some(AvEntry {
            raw: *raw,
            ah,
            shm_ah,
            peer,
        });
        self.used += 1;
        log::debug!(
            "av: inserted {:?} qpn {} connid {:#x} as fi_addr {}",
            raw.gid,
            raw.qpn,
            raw.connid,
            fi
        );
        Ok((fi, evicted))
    }

    /// Look up the raw address for a `FiAddr`.
    pub fn lookup(&self, fi: FiAddr) -> Result<RawAddr> {
        self.entries
            .get(fi.index())
            .and_then(Option::as_ref)
            .map(|e| e.raw)
            .ok_or(Error::InvalidArgument("unknown fi_addr"))
    }

    /// Remove a peer. Fails with `Busy` while any in-flight entry still
    /// references it. The caller owns whatever the release left behind
    /// (staged reorder packets).
    pub fn remove<T: Transport>(&mut self, tp: &mut T, fi: FiAddr) -> Result<EvictedPeer> {
        let entry = self
            .entries
            .get(fi.index())
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidArgument("unknown fi_addr"))?;
        if entry.peer.in_use() {
            return Err(Error::Busy);
        }
        Ok(self.release_entry(tp, fi, false))
    }

    fn release_entry<T: Transport>(
        &mut self,
        tp: &mut T,
        fi: FiAddr,
        forced: bool,
    ) -> EvictedPeer {
        let mut entry = self.entries[fi.index()].take().expect("live av entry");
        self.reverse.remove(&(entry.ah.ahn(), entry.raw.qpn));
        self.addr_index
            .remove(&(entry.raw.gid, entry.raw.qpn, entry.raw.connid));
        if let Some(shm_fi) = entry.peer.shm_fiaddr {
            self.shm_map.remove(&shm_fi);
        }
        if let Some(shm_ah) = &entry.shm_ah {
            self.shm_reverse.remove(&(shm_ah.ahn, entry.raw.qpn));
        }

        let gid = entry.raw.gid;
        let connid = entry.raw.connid;
        let tx_entries = entry.peer.tx_entries.clone();
        let rx_entries = entry.peer.rx_entries.clone();
        let staged_pkts = entry
            .peer
            .recvwin
            .as_mut()
            .map(|win| win.drain())
            .unwrap_or_default();
        let ah = entry.ah;

        // Cache holds one reference; if ours is the only other one, the
        // handle is no longer shared and goes back to the device.
        if Rc::strong_count(&ah) == 2 {
            self.ah_cache.remove(&gid);
            let handle = ah.handle;
            drop(ah);
            if let Err(e) = tp.destroy_ah(handle) {
                log::warn!("av: destroy_ah failed: {}", e);
            }
        }

        self.used -= 1;
        if forced {
            log::debug!("av: evicted peer {} with {} tx / {} rx entries in flight",
                fi, tx_entries.len(), rx_entries.len());
        }
        EvictedPeer {
            fi_addr: fi,
            connid,
            tx_entries,
            rx_entries,
            staged_pkts,
        }
    }

    /// Reverse lookup from the identity the device stamps on received
    /// packets.
    #[inline]
    pub fn reverse_lookup(&self, ahn: u16, qpn: u16) -> Option<FiAddr> {
        self.reverse.get(&(ahn, qpn)).copied()
    }

    /// Translate an shm-side source address back to the main `FiAddr`.
    #[inline]
    pub fn shm_to_fi(&self, shm_fiaddr: u64) -> Option<FiAddr> {
        self.shm_map.get(&shm_fiaddr).copied()
    }

    /// Reverse lookup for packets arriving on the shm transport.
    #[inline]
    pub fn shm_reverse_lookup(&self, ahn: u16, qpn: u16) -> Option<FiAddr> {
        self.shm_reverse.get(&(ahn, qpn)).copied()
    }

    #[inline]
    pub fn peer(&self, fi: FiAddr) -> Option<&Peer> {
        self.entries
            .get(fi.index())
            .and_then(Option::as_ref)
            .map(|e| &e.peer)
    }

    #[inline]
    pub fn peer_mut(&mut self, fi: FiAddr) -> Option<&mut Peer> {
        self.entries
            .get_mut(fi.index())
            .and_then(Option::as_mut)
            .map(|e| &mut e.peer)
    }

    #[inline]
    pub fn ah(&self, fi: FiAddr) -> Option<&AhHandle> {
        self.entries
            .get(fi.index())
            .and_then(Option::as_ref)
            .map(|e| &e.ah.handle)
    }

    #[inline]
    pub fn shm_ah(&self, fi: FiAddr) -> Option<&AhHandle> {
        self.entries
            .get(fi.index())
            .and_then(Option::as_ref)
            .and_then(|e| e.shm_ah.as_ref())
    }

    #[inline]
    pub fn raw(&self, fi: FiAddr) -> Option<&RawAddr> {
        self.entries
            .get(fi.index())
            .and_then(Option::as_ref)
            .map(|e| &e.raw)
    }

    /// All live fi_addrs, for progress-loop sweeps.
    pub fn fi_addrs(&self) -> Vec<FiAddr> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| FiAddr(i as u64)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFabric;

    fn raw(gid_byte: u8, qpn: u16, connid: u32) -> RawAddr {
        RawAddr::new(Gid([gid_byte; 16]), qpn, connid)
    }

    fn self_raw() -> RawAddr {
        raw(0xff, 999, 1)
    }

    #[test]
    fn test_insert_lookup_roundtrip() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut av = AddressVector::new();

        let a = raw(1, 10, 100);
        let (fi, evicted) = av
            .insert(&mut tp, None, &a, &self_raw(), &[], 64)
            .unwrap();
        assert!(evicted.is_none());
        assert_eq!(av.lookup(fi).unwrap(), a);

        // Idempotent: same address returns the same fi_addr, no new AH.
        let (fi2, _) = av
            .insert(&mut tp, None, &a, &self_raw(), &[], 64)
            .unwrap();
        assert_eq!(fi, fi2);
        assert_eq!(av.ah_cache_len(), 1);
        assert_eq!(av.used(), 1);
    }

    #[test]
    fn test_zero_gid_rejected() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut av = AddressVector::new();
        let bad = RawAddr::new(Gid::default(), 1, 1);
        assert_eq!(
            av.insert(&mut tp, None, &bad, &self_raw(), &[], 64)
                .err()
                .unwrap(),
            Error::AddrNotAvailable
        );
    }

    #[test]
    fn test_ah_sharing_across_qpns() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut av = AddressVector::new();

        // Two peers behind one GID share one AH.
        let (fi1, _) = av
            .insert(&mut tp, None, &raw(1, 10, 100), &self_raw(), &[], 64)
            .unwrap();
        let (fi2, _) = av
            .insert(&mut tp, None, &raw(1, 11, 100), &self_raw(), &[], 64)
            .unwrap();
        assert_eq!(av.ah_cache_len(), 1);
        assert_eq!(av.ah_used(&Gid([1; 16])), 2);

        av.remove(&mut tp, fi1).unwrap();
        assert_eq!(av.ah_cache_len(), 1);
        assert_eq!(av.ah_used(&Gid([1; 16])), 1);
        av.remove(&mut tp, fi2).unwrap();
        assert_eq!(av.ah_cache_len(), 0);
        assert_eq!(av.used(), 0);
    }

    #[test]
    fn test_remove_while_in_use_is_busy() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut av = AddressVector::new();

        let (fi, _) = av
            .insert(&mut tp, None, &raw(1, 10, 100), &self_raw(), &[], 64)
            .unwrap();
        av.peer_mut(fi).unwrap().tx_entries.push(3);
        assert!(matches!(av.remove(&mut tp, fi), Err(Error::Busy)));
        av.peer_mut(fi).unwrap().tx_entries.clear();
        av.remove(&mut tp, fi).unwrap();
    }

    #[test]
    fn test_qp_reuse_evicts_predecessor() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut av = AddressVector::new();

        let (fi1, _) = av
            .insert(&mut tp, None, &raw(1, 10, 100), &self_raw(), &[], 64)
            .unwrap();
        av.peer_mut(fi1).unwrap().tx_entries.push(42);

        // Same GID + QPN, different connid: the old QP is gone.
        let (fi2, evicted) = av
            .insert(&mut tp, None, &raw(1, 10, 200), &self_raw(), &[], 64)
            .unwrap();
        let evicted = evicted.unwrap();
        assert_eq!(evicted.fi_addr, fi1);
        assert_eq!(evicted.connid, 100);
        assert_eq!(evicted.tx_entries, vec![42]);
        assert!(av.peer(fi1).is_none() || fi1 == fi2);
        assert_eq!(av.peer(fi2).unwrap().prev_connid, Some(100));
        assert_eq!(av.used(), 1);
        // Reverse map points at the new peer.
        let ahn = av.ah(fi2).unwrap().ahn;
        assert_eq!(av.reverse_lookup(ahn, 10), Some(fi2));
    }

    #[test]
    fn test_self_and_local_detection() {
        let fabric = SimFabric::new(1024);
        let mut tp = fabric.endpoint();
        let mut av = AddressVector::new();

        let me = self_raw();
        let (fi, _) = av
            .insert(&mut tp, None, &me, &me, &[me.gid], 64)
            .unwrap();
        assert!(av.peer(fi).unwrap().is_self);

        let neighbor = raw(0xff, 998, 7);
        let (fi2, _) = av
            .insert(&mut tp, None, &neighbor, &me, &[me.gid], 64)
            .unwrap();
        let peer = av.peer(fi2).unwrap();
        assert!(!peer.is_self);
        assert!(peer.is_local);
        // No shm transport supplied, so no bridge.
        assert!(peer.shm_fiaddr.is_none());
    }
}
