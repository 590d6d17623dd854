//! Shared harness for the integration tests.
//!
//! Builds endpoint pairs over an in-memory simulated fabric and pumps
//! their progress engines until completions surface.

#![allow(dead_code)]

use efa_rdm::cq::CqEntry;
use efa_rdm::{Endpoint, EndpointConfig, FiAddr, SimFabric, SimTransport};

pub struct Pair {
    pub fabric: SimFabric,
    pub a: Endpoint<SimTransport>,
    pub b: Endpoint<SimTransport>,
    /// A's handle for B.
    pub a_to_b: FiAddr,
    /// B's handle for A.
    pub b_to_a: FiAddr,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A small-MTU configuration that forces multi-packet protocols with
/// test-sized messages.
pub fn small_cfg() -> EndpointConfig {
    EndpointConfig::default()
        .with_medium_threshold(2048)
        .with_longread_threshold(8192)
        .with_rnr_backoff_us(50, 400)
}

pub fn pair_with(mtu: usize, cfg: EndpointConfig) -> Pair {
    init_logging();
    let fabric = SimFabric::new(mtu);
    let mut a = Endpoint::new(fabric.endpoint(), cfg.clone()).expect("endpoint a");
    let mut b = Endpoint::new(fabric.endpoint(), cfg).expect("endpoint b");
    let a_to_b = a.av_insert(&b.raw_addr()).expect("insert b into a");
    let b_to_a = b.av_insert(&a.raw_addr()).expect("insert a into b");
    Pair {
        fabric,
        a,
        b,
        a_to_b,
        b_to_a,
    }
}

pub fn pair() -> Pair {
    pair_with(1024, small_cfg())
}

/// Drive both endpoints a fixed number of rounds.
pub fn pump(p: &mut Pair, rounds: usize) {
    for _ in 0..rounds {
        p.a.progress();
        p.b.progress();
    }
}

/// Pump until endpoint A yields a completion.
pub fn wait_completion_a(p: &mut Pair) -> CqEntry {
    for _ in 0..2000 {
        p.a.progress();
        p.b.progress();
        if let Some(entry) = p.a.pop_completion() {
            return entry;
        }
    }
    panic!("no completion on endpoint a");
}

/// Pump until endpoint B yields a completion.
pub fn wait_completion_b(p: &mut Pair) -> CqEntry {
    for _ in 0..2000 {
        p.a.progress();
        p.b.progress();
        if let Some(entry) = p.b.pop_completion() {
            return entry;
        }
    }
    panic!("no completion on endpoint b");
}

/// Exchange one eager round trip so both sides hold each other's
/// handshake (feature bitmaps, raw-address header dropped).
pub fn warmup(p: &mut Pair) {
    p.a.recv(8, 0xa0).unwrap();
    p.b.send(p.b_to_a, b"warmup_a", 0xb0).unwrap();
    wait_completion_a(p);
    wait_completion_b(p);

    p.b.recv(8, 0xb1).unwrap();
    p.a.send(p.a_to_b, b"warmup_b", 0xa1).unwrap();
    wait_completion_b(p);
    wait_completion_a(p);

    // Let trailing handshakes land.
    pump(p, 10);
    assert!(p.a.av().peer(p.a_to_b).unwrap().handshake_received());
    assert!(p.b.av().peer(p.b_to_a).unwrap().handshake_received());
}

/// Deterministic payload for content checks.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}
