//! In-memory simulated fabric.
//!
//! `SimFabric` is a process-local datagram fabric with the same contract
//! the hardware transport has: unreliable in principle, unordered across
//! peers, MTU-limited, with RDMA read against registered regions. It is
//! what the test suite drives the provider with, and it doubles as the
//! intra-node transport when an endpoint is built with an shm path.
//!
//! Test rigging: receivers can be armed to answer the next N sends with
//! RNR completions, and senders can be armed to reject the next N posts
//! with `Error::Again` (a full transmit queue).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::addr::{AhHandle, Gid, GID_LEN};
use crate::error::{Error, Result};
use crate::transport::{Access, CompOp, CompStatus, Completion, MemDesc, Region, Transport};

/// Default cap on outstanding transmits per endpoint.
const SIM_MAX_OUTSTANDING_TX: usize = 128;

struct Datagram {
    src_gid: Gid,
    src_qpn: u16,
    bytes: Vec<u8>,
}

struct Node {
    gid: Gid,
    inbox: VecDeque<Datagram>,
    /// Answer the next N incoming sends with RNR.
    rnr_rig: usize,
    alive: bool,
}

struct FabricInner {
    mtu: usize,
    next_qpn: u16,
    next_key: u64,
    nodes: HashMap<u16, Node>,
    regions: HashMap<u64, Region>,
}

/// Handle to a shared in-memory fabric.
#[derive(Clone)]
pub struct SimFabric {
    inner: Rc<RefCell<FabricInner>>,
}

impl SimFabric {
    pub fn new(mtu: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(FabricInner {
                mtu,
                next_qpn: 1,
                next_key: 1,
                nodes: HashMap::new(),
                regions: HashMap::new(),
            })),
        }
    }

    /// Attach a new endpoint with a fresh GID and QPN.
    pub fn endpoint(&self) -> SimTransport {
        let qpn = {
            let mut inner = self.inner.borrow_mut();
            let qpn = inner.next_qpn;
            inner.next_qpn += 1;
            qpn
        };
        let mut gid = [0u8; GID_LEN];
        gid[0] = 0xfe;
        gid[14..16].copy_from_slice(&qpn.to_le_bytes());
        self.endpoint_with(Gid(gid), qpn)
    }

    /// Attach an endpoint with an explicit identity. Used to model two QPs
    /// behind one GID (intra-node peers) and QP reuse after destruction.
    pub fn endpoint_with(&self, gid: Gid, qpn: u16) -> SimTransport {
        let mut inner = self.inner.borrow_mut();
        let prev = inner.nodes.insert(
            qpn,
            Node {
                gid,
                inbox: VecDeque::new(),
                rnr_rig: 0,
                alive: true,
            },
        );
        assert!(
            prev.map_or(true, |n| !n.alive),
            "QPN {} is already attached",
            qpn
        );
        inner.next_qpn = inner.next_qpn.max(qpn + 1);
        SimTransport {
            fabric: self.inner.clone(),
            gid,
            qpn,
            next_ah: 1,
            ah_by_gid: HashMap::new(),
            ah_gid: HashMap::new(),
            posted_recvs: VecDeque::new(),
            completions: VecDeque::new(),
            outstanding_tx: 0,
            reject_sends: 0,
            rdma_read: true,
            mrs: HashMap::new(),
        }
    }
}

/// One endpoint's view of a [`SimFabric`].
pub struct SimTransport {
    fabric: Rc<RefCell<FabricInner>>,
    gid: Gid,
    qpn: u16,
    next_ah: u64,
    /// gid -> (ahn, refcount); the receive path stamps packets with the
    /// AHN this endpoint assigned to the sender's GID.
    ah_by_gid: HashMap<Gid, (u16, u32)>,
    ah_gid: HashMap<u64, Gid>,
    posted_recvs: VecDeque<(u64, Box<[u8]>)>,
    completions: VecDeque<Completion>,
    outstanding_tx: usize,
    reject_sends: usize,
    rdma_read: bool,
    mrs: HashMap<u64, Region>,
}

impl SimTransport {
    /// Arm this endpoint to answer the next `n` sends directed at it with
    /// RNR completions (delivered to the senders).
    pub fn rig_rnr(&self, n: usize) {
        let mut inner = self.fabric.borrow_mut();
        inner.nodes.get_mut(&self.qpn).unwrap().rnr_rig = n;
    }

    /// Arm this endpoint to reject the next `n` `post_send` calls with
    /// `Error::Again`, as a full device queue would.
    pub fn rig_reject_sends(&mut self, n: usize) {
        self.reject_sends = n;
    }

    /// Disable RDMA-read origination, forcing long-CTS fallbacks.
    pub fn set_rdma_read(&mut self, enabled: bool) {
        self.rdma_read = enabled;
    }

    /// Count of datagrams delivered to this endpoint but not yet matched
    /// to a posted receive.
    pub fn inbox_len(&self) -> usize {
        self.fabric.borrow().nodes[&self.qpn].inbox.len()
    }

    fn push_send_completion(&mut self, wr_id: u64, status: CompStatus, byte_len: usize) {
        self.completions.push_back(Completion {
            op: CompOp::Send,
            status,
            wr_id,
            byte_len,
            src: None,
            buf: None,
        });
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        let mut inner = self.fabric.borrow_mut();
        if let Some(node) = inner.nodes.get_mut(&self.qpn) {
            node.alive = false;
        }
    }
}

impl Transport for SimTransport {
    fn mtu(&self) -> usize {
        self.fabric.borrow().mtu
    }

    fn local_gid(&self) -> Gid {
        self.gid
    }

    fn local_qpn(&self) -> u16 {
        self.qpn
    }

    fn max_outstanding_tx(&self) -> usize {
        SIM_MAX_OUTSTANDING_TX
    }

    fn supports_rdma_read(&self) -> bool {
        self.rdma_read
    }

    fn max_rdma_size(&self) -> usize {
        1 << 30
    }

    fn create_ah(&mut self, gid: Gid) -> Result<AhHandle> {
        let handle = self.next_ah;
        self.next_ah += 1;
        let next_ahn = self.ah_by_gid.len() as u16;
        let entry = self.ah_by_gid.entry(gid).or_insert((next_ahn, 0));
        entry.1 += 1;
        let ahn = entry.0;
        self.ah_gid.insert(handle, gid);
        Ok(AhHandle { handle, ahn })
    }

    fn destroy_ah(&mut self, ah: AhHandle) -> Result<()> {
        let gid = self
            .ah_gid
            .remove(&ah.handle)
            .ok_or(Error::InvalidArgument("unknown address handle"))?;
        if let Some(entry) = self.ah_by_gid.get_mut(&gid) {
            entry.1 -= 1;
            if entry.1 == 0 {
                self.ah_by_gid.remove(&gid);
            }
        }
        Ok(())
    }

    fn register(&mut self, mem: Region, _access: Access) -> Result<MemDesc> {
        let mut inner = self.fabric.borrow_mut();
        let key = inner.next_key;
        inner.next_key += 1;
        inner.regions.insert(key, mem.clone());
        drop(inner);
        self.mrs.insert(key, mem);
        Ok(MemDesc {
            lkey: key as u32,
            rkey: key,
        })
    }

    fn mr_close(&mut self, desc: MemDesc) -> Result<()> {
        self.mrs
            .remove(&desc.rkey)
            .ok_or(Error::InvalidArgument("unknown memory registration"))?;
        self.fabric.borrow_mut().regions.remove(&desc.rkey);
        Ok(())
    }

    fn post_send(
        &mut self,
        ah: &AhHandle,
        qpn: u16,
        pkt: &[u8],
        _lkey: u32,
        wr_id: u64,
    ) -> Result<()> {
        if self.reject_sends > 0 {
            self.reject_sends -= 1;
            return Err(Error::Again);
        }
        if self.outstanding_tx >= SIM_MAX_OUTSTANDING_TX {
            return Err(Error::Again);
        }
        let dst_gid = *self
            .ah_gid
            .get(&ah.handle)
            .ok_or(Error::InvalidArgument("unknown address handle"))?;
        let mtu = self.fabric.borrow().mtu;
        if pkt.len() > mtu {
            return Err(Error::InvalidArgument("packet exceeds MTU"));
        }

        self.outstanding_tx += 1;
        let mut inner = self.fabric.borrow_mut();
        let status = match inner.nodes.get_mut(&qpn) {
            Some(node) if node.alive && node.gid == dst_gid => {
                if node.rnr_rig > 0 {
                    node.rnr_rig -= 1;
                    CompStatus::Rnr
                } else {
                    node.inbox.push_back(Datagram {
                        src_gid: self.gid,
                        src_qpn: self.qpn,
                        bytes: pkt.to_vec(),
                    });
                    CompStatus::Ok
                }
            }
            _ => CompStatus::Err,
        };
        drop(inner);
        self.push_send_completion(wr_id, status, pkt.len());
        Ok(())
    }

    fn post_recv(&mut self, buf: Box<[u8]>, _lkey: u32, wr_id: u64, _more: bool) -> Result<()> {
        self.posted_recvs.push_back((wr_id, buf));
        Ok(())
    }

    fn post_read(
        &mut self,
        len: usize,
        _lkey: u32,
        remote_addr: u64,
        rkey: u64,
        wr_id: u64,
    ) -> Result<()> {
        if !self.rdma_read {
            return Err(Error::NotSupported("RDMA read disabled"));
        }
        if self.outstanding_tx >= SIM_MAX_OUTSTANDING_TX {
            return Err(Error::Again);
        }
        self.outstanding_tx += 1;
        let inner = self.fabric.borrow();
        let completion = match inner.regions.get(&rkey) {
            Some(region) => {
                let mem = region.borrow();
                let start = remote_addr as usize;
                if start + len <= mem.len() {
                    Completion {
                        op: CompOp::Read,
                        status: CompStatus::Ok,
                        wr_id,
                        byte_len: len,
                        src: None,
                        buf: Some(mem[start..start + len].to_vec().into_boxed_slice()),
                    }
                } else {
                    Completion {
                        op: CompOp::Read,
                        status: CompStatus::Err,
                        wr_id,
                        byte_len: 0,
                        src: None,
                        buf: None,
                    }
                }
            }
            None => Completion {
                op: CompOp::Read,
                status: CompStatus::Err,
                wr_id,
                byte_len: 0,
                src: None,
                buf: None,
            },
        };
        drop(inner);
        self.completions.push_back(completion);
        Ok(())
    }

    fn poll_cq(&mut self, batch: usize) -> Vec<Completion> {
        // Marry delivered datagrams with posted receive buffers first.
        let mut inner = self.fabric.borrow_mut();
        if let Some(node) = inner.nodes.get_mut(&self.qpn) {
            while !node.inbox.is_empty() && !self.posted_recvs.is_empty() {
                let dgram = node.inbox.pop_front().unwrap();
                let (wr_id, mut buf) = self.posted_recvs.pop_front().unwrap();
                let n = dgram.bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&dgram.bytes[..n]);
                let ahn = self
                    .ah_by_gid
                    .get(&dgram.src_gid)
                    .map(|(ahn, _)| *ahn)
                    .unwrap_or(u16::MAX);
                self.completions.push_back(Completion {
                    op: CompOp::Recv,
                    status: CompStatus::Ok,
                    wr_id,
                    byte_len: n,
                    src: Some((ahn, dgram.src_qpn)),
                    buf: Some(buf),
                });
            }
        }
        drop(inner);

        let mut out = Vec::new();
        while out.len() < batch {
            let Some(c) = self.completions.pop_front() else {
                break;
            };
            if matches!(c.op, CompOp::Send | CompOp::Read) {
                self.outstanding_tx -= 1;
            }
            out.push(c);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv() {
        let fabric = SimFabric::new(512);
        let mut a = fabric.endpoint();
        let mut b = fabric.endpoint();

        // b posts a receive; a sends one datagram.
        b.post_recv(vec![0u8; 512].into_boxed_slice(), 0, 7, false)
            .unwrap();
        let ah = a.create_ah(b.local_gid()).unwrap();
        // b needs an AH for a's GID for source stamping.
        let b_ah_for_a = b.create_ah(a.local_gid()).unwrap();
        a.post_send(&ah, b.local_qpn(), b"ping", 0, 1).unwrap();

        let send_comps = a.poll_cq(8);
        assert_eq!(send_comps.len(), 1);
        assert_eq!(send_comps[0].status, CompStatus::Ok);

        let recv_comps = b.poll_cq(8);
        assert_eq!(recv_comps.len(), 1);
        let c = &recv_comps[0];
        assert_eq!(c.op, CompOp::Recv);
        assert_eq!(c.byte_len, 4);
        assert_eq!(c.src, Some((b_ah_for_a.ahn, a.local_qpn())));
        assert_eq!(&c.buf.as_ref().unwrap()[..4], b"ping");
    }

    #[test]
    fn test_rnr_rig() {
        let fabric = SimFabric::new(512);
        let mut a = fabric.endpoint();
        let b = fabric.endpoint();
        b.rig_rnr(1);

        let ah = a.create_ah(b.local_gid()).unwrap();
        a.post_send(&ah, b.local_qpn(), b"x", 0, 1).unwrap();
        a.post_send(&ah, b.local_qpn(), b"y", 0, 2).unwrap();
        let comps = a.poll_cq(8);
        assert_eq!(comps[0].status, CompStatus::Rnr);
        assert_eq!(comps[1].status, CompStatus::Ok);
    }

    #[test]
    fn test_reject_rig() {
        let fabric = SimFabric::new(512);
        let mut a = fabric.endpoint();
        let b = fabric.endpoint();
        let ah = a.create_ah(b.local_gid()).unwrap();
        a.rig_reject_sends(1);
        assert_eq!(
            a.post_send(&ah, b.local_qpn(), b"x", 0, 1),
            Err(Error::Again)
        );
        a.post_send(&ah, b.local_qpn(), b"x", 0, 2).unwrap();
    }

    #[test]
    fn test_rdma_read() {
        let fabric = SimFabric::new(512);
        let mut a = fabric.endpoint();
        let mut b = fabric.endpoint();

        let region: Region = Rc::new(RefCell::new(b"remote data".to_vec()));
        let desc = b.register(region, Access::REMOTE_READ).unwrap();

        a.post_read(4, 0, 7, desc.rkey, 9).unwrap();
        let comps = a.poll_cq(8);
        assert_eq!(comps[0].op, CompOp::Read);
        assert_eq!(&comps[0].buf.as_ref().unwrap()[..], b"data");
    }

    #[test]
    fn test_send_to_dead_qp_fails() {
        let fabric = SimFabric::new(512);
        let mut a = fabric.endpoint();
        let (gid, qpn) = {
            let b = fabric.endpoint();
            (b.local_gid(), b.local_qpn())
        };
        let ah = a.create_ah(gid).unwrap();
        a.post_send(&ah, qpn, b"x", 0, 1).unwrap();
        assert_eq!(a.poll_cq(8)[0].status, CompStatus::Err);
    }
}
