//! Address vector and peer lifecycle tests: insert semantics, busy
//! removal, QP reuse, and the intra-node shm path.

mod common;

use common::*;
use efa_rdm::{Endpoint, EndpointConfig, Error, SimFabric};

#[test]
fn test_insert_lookup_idempotent() {
    let mut p = pair();

    let raw = p.b.raw_addr();
    let fi = p.a.av_insert(&raw).unwrap();
    assert_eq!(fi, p.a_to_b);
    assert_eq!(p.a.av_lookup(fi).unwrap(), raw);
    assert_eq!(p.a.av().ah_cache_len(), 1);
}

#[test]
fn test_remove_while_busy_then_after() {
    let mut p = pair();
    warmup(&mut p);

    // Park the transfer: the peer answers RNR, so the send entry stays
    // in flight.
    p.a.transport_mut().rig_rnr(1);
    p.b.send(p.b_to_a, b"inflight", 1).unwrap();
    pump(&mut p, 3);

    assert_eq!(p.b.av_remove(p.b_to_a), Err(Error::Busy));

    // Deliver it (backoff is wall-clock).
    p.a.recv(8, 2).unwrap();
    for _ in 0..300 {
        std::thread::sleep(std::time::Duration::from_micros(100));
        p.a.progress();
        p.b.progress();
        if p.b.pop_completion().is_some() {
            break;
        }
    }

    // No entries reference the peer anymore: removal succeeds and the
    // address handle goes back to the device.
    p.b.av_remove(p.b_to_a).unwrap();
    assert_eq!(p.b.av().used(), 0);
    assert_eq!(p.b.av().ah_cache_len(), 0);
    assert!(p.b.av_lookup(p.b_to_a).is_err());
}

#[test]
fn test_qp_reuse_drops_stale_traffic() {
    init_logging();
    let fabric = SimFabric::new(1024);
    let cfg = small_cfg();

    let mut a = Endpoint::new(fabric.endpoint(), cfg.clone()).unwrap();

    // P1 opens, sends three eager messages, and dies with them still
    // undelivered.
    let (p1_gid, p1_qpn, p1_raw) = {
        let mut p1 = Endpoint::new(fabric.endpoint(), cfg.clone()).unwrap();
        let p1_to_a = p1.av_insert(&a.raw_addr()).unwrap();
        for i in 0..3u8 {
            p1.send(p1_to_a, &[i; 8], i as u64).unwrap();
        }
        p1.progress();
        (
            p1.raw_addr().gid,
            p1.raw_addr().qpn,
            p1.raw_addr(),
        )
    };
    // A knew P1.
    let a_to_p1 = a.av_insert(&p1_raw).unwrap();

    // P2 reuses the same GID and QPN with a fresh connid.
    let mut p2 = Endpoint::new(fabric.endpoint_with(p1_gid, p1_qpn), cfg).unwrap();
    assert_ne!(p2.raw_addr().connid, p1_raw.connid);
    let p2_to_a = p2.av_insert(&a.raw_addr()).unwrap();

    // Inserting P2 evicts the stale peer behind the same (AHN, QPN).
    let a_to_p2 = a.av_insert(&p2.raw_addr()).unwrap();
    assert_eq!(a.av().used(), 1);
    assert_eq!(
        a.av().peer(a_to_p2).unwrap().prev_connid,
        Some(p1_raw.connid)
    );

    // P2's message flows; P1's three stale packets are silently
    // dropped on the connid gate.
    a.recv(16, 42).unwrap();
    p2.send(p2_to_a, b"fresh qp", 1).unwrap();
    let recv = loop {
        a.progress();
        p2.progress();
        if let Some(entry) = a.pop_completion() {
            break entry;
        }
    };
    assert_eq!(recv.context, 42);
    assert_eq!(recv.buf.as_deref().unwrap(), b"fresh qp");

    for _ in 0..50 {
        a.progress();
        p2.progress();
    }
    assert!(a.pop_completion().is_none());
    assert!(a.pop_error().is_none());
    let _ = a_to_p1;
}

#[test]
fn test_ah_shared_between_peers() {
    init_logging();
    let fabric = SimFabric::new(1024);
    let cfg = EndpointConfig::default();
    let mut a = Endpoint::new(fabric.endpoint(), cfg.clone()).unwrap();

    // Two remote endpoints behind one GID (two QPs on one device).
    let gid = efa_rdm::Gid([0x77; 16]);
    let b = Endpoint::new(fabric.endpoint_with(gid, 500), cfg.clone()).unwrap();
    let c = Endpoint::new(fabric.endpoint_with(gid, 501), cfg).unwrap();

    let fi_b = a.av_insert(&b.raw_addr()).unwrap();
    let fi_c = a.av_insert(&c.raw_addr()).unwrap();
    assert_eq!(a.av().ah_cache_len(), 1);
    assert_eq!(a.av().ah_used(&gid), 2);

    a.av_remove(fi_b).unwrap();
    assert_eq!(a.av().ah_cache_len(), 1);
    a.av_remove(fi_c).unwrap();
    assert_eq!(a.av().ah_cache_len(), 0);
}

#[test]
fn test_shm_fast_path() {
    init_logging();
    // Two endpoints on one host: same GID on the main fabric, plus a
    // second in-memory fabric standing in for the shm transport.
    let fabric = SimFabric::new(1024);
    let shm_fabric = SimFabric::new(1024);
    let gid = efa_rdm::Gid([0x55; 16]);
    let cfg = EndpointConfig::default();

    let a_tp = fabric.endpoint_with(gid, 10);
    let a_shm = shm_fabric.endpoint_with(gid, 10);
    let b_tp = fabric.endpoint_with(gid, 11);
    let b_shm = shm_fabric.endpoint_with(gid, 11);

    let mut a = Endpoint::with_shm(a_tp, a_shm, cfg.clone()).unwrap();
    let mut b = Endpoint::with_shm(b_tp, b_shm, cfg).unwrap();

    let a_to_b = a.av_insert(&b.raw_addr()).unwrap();
    let b_to_a = b.av_insert(&a.raw_addr()).unwrap();
    assert!(a.av().peer(a_to_b).unwrap().is_local);
    assert!(a.av().peer(a_to_b).unwrap().shm_fiaddr.is_some());

    a.recv(16, 1).unwrap();
    b.send(b_to_a, b"via shared mem", 2).unwrap();
    let recv = loop {
        a.progress();
        b.progress();
        if let Some(entry) = a.pop_completion() {
            break entry;
        }
    };
    assert_eq!(recv.len, 14);
    assert_eq!(recv.buf.as_deref().unwrap(), b"via shared mem");
    assert_eq!(recv.src_addr, Some(a_to_b));

    let sent = loop {
        a.progress();
        b.progress();
        if let Some(entry) = b.pop_completion() {
            break entry;
        }
    };
    assert_eq!(sent.context, 2);
}

#[test]
fn test_zero_gid_insert_fails() {
    let mut p = pair();
    let bad = efa_rdm::RawAddr::new(efa_rdm::Gid::default(), 1, 1);
    assert_eq!(p.a.av_insert(&bad), Err(Error::AddrNotAvailable));
}

#[test]
fn test_implicit_insert_from_raw_addr_header() {
    init_logging();
    let fabric = SimFabric::new(1024);
    let cfg = EndpointConfig::default();
    let mut a = Endpoint::new(fabric.endpoint(), cfg.clone()).unwrap();
    let mut b = Endpoint::new(fabric.endpoint(), cfg).unwrap();

    // Only B knows A; A learns B from the REQ's raw-address header.
    let b_to_a = b.av_insert(&a.raw_addr()).unwrap();
    assert_eq!(a.av().used(), 0);

    a.recv(8, 1).unwrap();
    b.send(b_to_a, b"intro!!!", 2).unwrap();
    let recv = loop {
        a.progress();
        b.progress();
        if let Some(entry) = a.pop_completion() {
            break entry;
        }
    };
    assert_eq!(recv.buf.as_deref().unwrap(), b"intro!!!");
    assert_eq!(a.av().used(), 1);
    assert_eq!(a.av_lookup(recv.src_addr.unwrap()).unwrap(), b.raw_addr());
}
