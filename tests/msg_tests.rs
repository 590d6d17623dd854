//! Two-sided messaging integration tests against the simulated fabric.

mod common;

use common::*;
use efa_rdm::cq::CompFlags;
use efa_rdm::{Error, SendOpts};

// =============================================================================
// Eager
// =============================================================================

#[test]
fn test_eager_ping_pong() {
    let mut p = pair();

    p.a.recv(16, 1).unwrap();
    p.b.send(p.b_to_a, b"ABCDEFGHIJKLMNOP", 2).unwrap();

    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.context, 1);
    assert_eq!(recv.len, 16);
    assert!(recv.flags.contains(CompFlags::RECV | CompFlags::MSG));
    assert_eq!(recv.buf.as_deref().unwrap(), b"ABCDEFGHIJKLMNOP");
    assert_eq!(recv.src_addr, Some(p.a_to_b));

    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 2);
    assert!(sent.flags.contains(CompFlags::TRANSMIT | CompFlags::MSG));

    // A answered with its handshake; B now has A's feature bitmap and
    // stops sending the raw-address header.
    pump(&mut p, 10);
    assert!(p.b.av().peer(p.b_to_a).unwrap().handshake_received());
    assert!(!p.b.av().peer(p.b_to_a).unwrap().needs_raw_addr_hdr());

    // Reverse direction now flows too.
    p.b.recv(4, 3).unwrap();
    p.a.send(p.a_to_b, b"pong", 4).unwrap();
    let recv = wait_completion_b(&mut p);
    assert_eq!(recv.buf.as_deref().unwrap(), b"pong");
}

#[test]
fn test_unexpected_eager() {
    let mut p = pair();

    // Message first, receive later.
    p.b.send(p.b_to_a, b"early bird", 7).unwrap();
    pump(&mut p, 20);
    assert!(p.a.pop_completion().is_none());

    p.a.recv(32, 8).unwrap();
    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.context, 8);
    assert_eq!(recv.len, 10);
    assert_eq!(recv.buf.as_deref().unwrap(), b"early bird");
}

#[test]
fn test_eager_truncation() {
    let mut p = pair();
    p.a.recv(4, 1).unwrap();
    p.b.send(p.b_to_a, b"long payload", 2).unwrap();
    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.len, 4);
    assert_eq!(recv.buf.as_deref().unwrap(), b"long");
}

// =============================================================================
// Tagged
// =============================================================================

#[test]
fn test_tagged_matching() {
    let mut p = pair();

    p.a.trecv(None, 0x42, 0, 8, 1).unwrap();
    p.b.tsend(p.b_to_a, b"tagged!!", 0x42, 2).unwrap();
    let recv = wait_completion_a(&mut p);
    assert!(recv.flags.contains(CompFlags::TAGGED));
    assert_eq!(recv.tag, Some(0x42));
    assert_eq!(recv.buf.as_deref().unwrap(), b"tagged!!");
}

#[test]
fn test_tagged_ignore_mask() {
    let mut p = pair();

    // Low byte is ignored.
    p.a.trecv(None, 0xab00, 0x00ff, 8, 1).unwrap();
    p.b.tsend(p.b_to_a, b"masked..", 0xab12, 2).unwrap();
    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.tag, Some(0xab12));
}

#[test]
fn test_tagged_mismatch_stays_unexpected() {
    let mut p = pair();

    p.a.trecv(None, 1, 0, 8, 1).unwrap();
    p.b.tsend(p.b_to_a, b"tag_two!", 2, 2).unwrap();
    pump(&mut p, 30);
    // Wrong tag: the posted receive is still waiting.
    assert!(p.a.pop_completion().is_none());

    // A matching receive claims the staged message.
    p.a.trecv(None, 2, 0, 8, 3).unwrap();
    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.context, 3);
    assert_eq!(recv.buf.as_deref().unwrap(), b"tag_two!");
}

// =============================================================================
// Medium
// =============================================================================

#[test]
fn test_medium_message() {
    let mut p = pair();
    let msg = pattern(1500); // > eager for mtu 1024, <= medium threshold

    p.a.recv(2048, 1).unwrap();
    p.b.send(p.b_to_a, &msg, 2).unwrap();
    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.len, 1500);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
    wait_completion_b(&mut p);
}

#[test]
fn test_medium_out_of_order_segments() {
    let mut p = pair();
    warmup(&mut p);

    // Three segments: two full-size and a short tail. Rejecting the
    // first two posts makes the tail segment arrive first, so the
    // receiver learns the total from a segment whose own payload length
    // differs from the others and assembles purely by offset.
    let msg = pattern(2000);
    p.a.recv(2048, 1).unwrap();
    p.b.transport_mut().rig_reject_sends(2);
    p.b.send(p.b_to_a, &msg, 2).unwrap();

    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.len, 2000);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 2);
}

#[test]
fn test_medium_partial_send_redriven() {
    let mut p = pair();
    warmup(&mut p);

    let msg = pattern(1900);
    p.a.recv(2048, 1).unwrap();
    // The transport rejects the first segment post; the burst must not
    // abort, the progress loop re-drives the queued segment.
    p.b.transport_mut().rig_reject_sends(1);
    p.b.send(p.b_to_a, &msg, 2).unwrap();

    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.len, 1900);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 2);
}

// =============================================================================
// Long-CTS
// =============================================================================

#[test]
fn test_longcts_transfer() {
    let mut p = pair();
    let msg = pattern(100_000); // far beyond the 2048 medium threshold

    p.a.recv(100_000, 1).unwrap();
    p.b.send(p.b_to_a, &msg, 2).unwrap();

    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.len, 100_000);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 2);
}

#[test]
fn test_longcts_delivery_complete() {
    let mut p = pair();
    warmup(&mut p);

    let msg = pattern(6000);
    p.a.recv(6000, 1).unwrap();
    let opts = SendOpts {
        delivery_complete: true,
        ..Default::default()
    };
    // Keep it below the long-read threshold so the CTS flow carries it.
    p.b.send_opts(p.b_to_a, &msg, &opts, 2).unwrap();

    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
    // The RECEIPT releases the transmit completion.
    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 2);
}

#[test]
fn test_dc_rejected_without_peer_support() {
    let mut p = pair_with(
        1024,
        small_cfg(), // endpoint A config
    );
    // Rebuild B without delivery-complete support.
    let mut cfg = small_cfg();
    cfg.delivery_complete = false;
    let fabric = p.fabric.clone();
    let mut b2 = efa_rdm::Endpoint::new(fabric.endpoint(), cfg).unwrap();
    let a_to_b2 = p.a.av_insert(&b2.raw_addr()).unwrap();
    let b2_to_a = b2.av_insert(&p.a.raw_addr()).unwrap();

    // Exchange handshakes.
    b2.recv(8, 1).unwrap();
    p.a.send(a_to_b2, b"warmup!!", 2).unwrap();
    for _ in 0..200 {
        p.a.progress();
        b2.progress();
    }
    assert!(p.a.av().peer(a_to_b2).unwrap().handshake_received());
    let _ = b2.pop_completion();

    let opts = SendOpts {
        delivery_complete: true,
        ..Default::default()
    };
    assert!(matches!(
        p.a.send_opts(a_to_b2, b"x", &opts, 3),
        Err(Error::OpNotSupported(_))
    ));
    let _ = b2_to_a;
}

// =============================================================================
// Long-read
// =============================================================================

#[test]
fn test_longread_message() {
    let mut p = pair();
    warmup(&mut p);

    let msg = pattern(20_000); // >= 8192 long-read threshold
    p.a.recv(20_000, 1).unwrap();
    p.b.send(p.b_to_a, &msg, 2).unwrap();

    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.len, 20_000);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
    // EOR lets the sender complete and drop its registration.
    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 2);
}

#[test]
fn test_longread_delivery_complete() {
    let mut p = pair();
    warmup(&mut p);

    let msg = pattern(16_000);
    p.a.recv(16_000, 1).unwrap();
    let opts = SendOpts {
        delivery_complete: true,
        ..Default::default()
    };
    p.b.send_opts(p.b_to_a, &msg, &opts, 2).unwrap();

    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 2);
}

#[test]
fn test_longcts_fallback_without_rdma_read() {
    init_logging();
    let fabric = efa_rdm::SimFabric::new(1024);
    let mut a_tp = fabric.endpoint();
    a_tp.set_rdma_read(false);
    let mut b_tp = fabric.endpoint();
    b_tp.set_rdma_read(false);
    let mut p = {
        let mut a = efa_rdm::Endpoint::new(a_tp, small_cfg()).unwrap();
        let mut b = efa_rdm::Endpoint::new(b_tp, small_cfg()).unwrap();
        let a_to_b = a.av_insert(&b.raw_addr()).unwrap();
        let b_to_a = b.av_insert(&a.raw_addr()).unwrap();
        Pair {
            fabric,
            a,
            b,
            a_to_b,
            b_to_a,
        }
    };
    warmup(&mut p);

    let msg = pattern(20_000);
    p.a.recv(20_000, 1).unwrap();
    p.b.send(p.b_to_a, &msg, 2).unwrap();
    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.buf.as_deref().unwrap(), &msg[..]);
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_msg_id_wraparound_delivery() {
    let mut p = pair();
    warmup(&mut p);

    // Position both directions of the sequence just before wrap.
    let start = u32::MAX - 1;
    p.b.av_mut()
        .peer_mut(p.b_to_a)
        .unwrap()
        .force_msg_id(start, 64);
    p.a.av_mut()
        .peer_mut(p.a_to_b)
        .unwrap()
        .force_msg_id(start, 64);

    // Five messages cross the wrap; all arrive, in order.
    for i in 0..5u8 {
        p.a.recv(8, 100 + i as u64).unwrap();
    }
    for i in 0..5u8 {
        p.b.send(p.b_to_a, &[i; 4], i as u64).unwrap();
    }
    for i in 0..5u8 {
        let recv = wait_completion_a(&mut p);
        assert_eq!(recv.buf.as_deref().unwrap(), &[i; 4]);
    }
}

#[test]
fn test_many_messages_in_order() {
    let mut p = pair();
    for i in 0..50u8 {
        p.a.recv(4, i as u64).unwrap();
    }
    for i in 0..50u8 {
        p.b.send(p.b_to_a, &[i; 4], i as u64).unwrap();
    }
    for i in 0..50u8 {
        let recv = wait_completion_a(&mut p);
        assert_eq!(recv.buf.as_deref().unwrap(), &[i; 4], "message {}", i);
    }
}

// =============================================================================
// Cancel
// =============================================================================

#[test]
fn test_cancel_posted_recv() {
    let mut p = pair();

    p.a.recv(16, 9).unwrap();
    assert!(p.a.cancel_recv(9));
    let err = p.a.pop_error().expect("cancel error completion");
    assert_eq!(err.context, 9);
    assert_eq!(err.err, Error::Cancelled);

    // The entry is gone: a message now goes unexpected, no completion.
    p.b.send(p.b_to_a, b"nobody home!", 1).unwrap();
    pump(&mut p, 30);
    assert!(p.a.pop_completion().is_none());
    assert!(p.a.pop_error().is_none());

    // Unknown context cancels nothing.
    assert!(!p.a.cancel_recv(0xdead));
}

#[test]
fn test_cancel_after_match_sinks_data() {
    let mut p = pair();
    warmup(&mut p);

    let msg = pattern(7000); // long-CTS sized
    p.a.recv(7000, 5).unwrap();
    p.b.send(p.b_to_a, &msg, 6).unwrap();

    // One round each: B posts the RTM, A matches it and answers CTS,
    // but no DATA has been processed yet.
    p.b.progress();
    p.a.progress();

    assert!(p.a.cancel_recv(5));
    let err = p.a.pop_error().expect("cancel error");
    assert_eq!(err.context, 5);
    assert_eq!(err.err, Error::Cancelled);

    // The transfer drains silently; the sender still completes.
    let sent = wait_completion_b(&mut p);
    assert_eq!(sent.context, 6);
    pump(&mut p, 50);
    assert!(p.a.pop_completion().is_none());
    assert!(p.a.pop_error().is_none());
}

// =============================================================================
// Multi-recv
// =============================================================================

#[test]
fn test_multi_recv_slicing() {
    let mut p = pair();

    p.a.multi_recv(200, 77).unwrap();
    for i in 0..4u8 {
        p.b.send(p.b_to_a, &[i; 20], i as u64).unwrap();
    }
    for i in 0..4u8 {
        let recv = wait_completion_a(&mut p);
        assert_eq!(recv.context, 77);
        assert_eq!(recv.buf.as_deref().unwrap(), &[i; 20]);
    }

    // A large message drops the remaining space under the threshold and
    // retires the buffer.
    p.b.send(p.b_to_a, &pattern(110), 9).unwrap();
    let recv = wait_completion_a(&mut p);
    assert_eq!(recv.context, 77);
    assert_eq!(recv.len, 110);

    let fin = wait_completion_a(&mut p);
    assert!(fin.flags.contains(CompFlags::MULTI_RECV));
    assert_eq!(fin.context, 77);
}

// =============================================================================
// RNR backoff
// =============================================================================

#[test]
fn test_rnr_backoff_and_retransmit() {
    let mut p = pair();
    warmup(&mut p);

    // The next two sends toward A answer RNR.
    p.a.transport_mut().rig_rnr(2);

    p.a.recv(8, 1).unwrap();
    p.b.send(p.b_to_a, b"try hard", 2).unwrap();

    // Let the RNR completion land and the backoff engage. The deadline
    // is wall-clock and may already have expired by the next sweep, so
    // no state assertion here.
    pump(&mut p, 5);

    // Backoff deadlines are wall-clock; give them time to expire.
    for _ in 0..200 {
        std::thread::sleep(std::time::Duration::from_micros(100));
        p.a.progress();
        p.b.progress();
        if let Some(recv) = p.a.pop_completion() {
            assert_eq!(recv.buf.as_deref().unwrap(), b"try hard");
            let sent = wait_completion_b(&mut p);
            assert_eq!(sent.context, 2);
            assert!(!p.b.av().peer(p.b_to_a).unwrap().in_backoff());
            return;
        }
    }
    panic!("message never delivered after RNR backoff");
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_send_to_unknown_addr() {
    let mut p = pair();
    assert!(matches!(
        p.a.send(efa_rdm::FiAddr(999), b"x", 1),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_hmem_unsupported_iface() {
    let mut p = pair();
    let opts = SendOpts {
        hmem: efa_rdm::HmemDesc {
            iface: efa_rdm::HmemIface::Cuda,
            device: 0,
        },
        ..Default::default()
    };
    assert!(matches!(
        p.a.send_opts(p.a_to_b, b"x", &opts, 1),
        Err(Error::NotSupported(_))
    ));
}
