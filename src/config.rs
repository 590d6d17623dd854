//! Endpoint configuration.

/// Endpoint configuration.
///
/// Controls pool sizing, flow control, protocol thresholds and RNR
/// backoff behavior.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Transmit packet pool size.
    /// Default: 256
    pub tx_pool_size: usize,
    /// Receive packet pool size; also the posted-receive target the
    /// progress loop refills to.
    /// Default: 256
    pub rx_pool_size: usize,
    /// Pool for staging unexpected and out-of-order packets.
    /// Default: 512
    pub unexp_pool_size: usize,
    /// Pool for read-copy bounce buffers (device-memory receives).
    /// Default: 64
    pub readcopy_pool_size: usize,
    /// Reorder window size per peer, in messages.
    /// Default: 16384
    pub recvwin_size: u32,
    /// Flow-control credits per peer.
    /// Default: 64
    pub tx_max_credits: u32,
    /// Minimum credits granted to any long transfer.
    /// Default: 8
    pub tx_min_credits: u32,
    /// Cap on outstanding transmit work requests; clamped to the
    /// transport's own limit.
    /// Default: 128
    pub max_outstanding_tx: usize,
    /// Largest message sent with the medium protocol.
    /// Default: 65536
    pub medium_threshold: usize,
    /// Smallest message that prefers the long-read (RDMA) protocol when
    /// both sides support it.
    /// Default: 1048576
    pub longread_threshold: usize,
    /// Per-segment cap for RDMA reads.
    /// Default: 1 GiB
    pub read_segment_size: usize,
    /// Initial RNR backoff bound in microseconds (the first wait is
    /// randomized up to this).
    /// Default: 100
    pub rnr_backoff_initial_us: u64,
    /// RNR backoff cap in microseconds.
    /// Default: 1_000_000
    pub rnr_backoff_cap_us: u64,
    /// Completions polled from each transport CQ per progress call.
    /// Default: 50
    pub cq_poll_batch: usize,
    /// A multi-recv buffer is retired when its remaining space drops
    /// below this.
    /// Default: 64
    pub min_multi_recv: usize,
    /// Advertise delivery-complete support.
    /// Default: true
    pub delivery_complete: bool,
    /// Request constant REQ header lengths from peers.
    /// Default: false
    pub constant_header_length: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            tx_pool_size: 256,
            rx_pool_size: 256,
            unexp_pool_size: 512,
            readcopy_pool_size: 64,
            recvwin_size: 16384,
            tx_max_credits: 64,
            tx_min_credits: 8,
            max_outstanding_tx: 128,
            medium_threshold: 65536,
            longread_threshold: 1 << 20,
            read_segment_size: 1 << 30,
            rnr_backoff_initial_us: 100,
            rnr_backoff_cap_us: 1_000_000,
            cq_poll_batch: 50,
            min_multi_recv: 64,
            delivery_complete: true,
            constant_header_length: false,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reorder window size.
    pub fn with_recvwin_size(mut self, size: u32) -> Self {
        self.recvwin_size = size;
        self
    }

    /// Set the per-peer credit pool.
    pub fn with_tx_credits(mut self, max: u32, min: u32) -> Self {
        self.tx_max_credits = max;
        self.tx_min_credits = min;
        self
    }

    /// Set the medium-protocol threshold.
    pub fn with_medium_threshold(mut self, bytes: usize) -> Self {
        self.medium_threshold = bytes;
        self
    }

    /// Set the long-read protocol threshold.
    pub fn with_longread_threshold(mut self, bytes: usize) -> Self {
        self.longread_threshold = bytes;
        self
    }

    /// Set the RNR backoff bounds.
    pub fn with_rnr_backoff_us(mut self, initial: u64, cap: u64) -> Self {
        self.rnr_backoff_initial_us = initial;
        self.rnr_backoff_cap_us = cap;
        self
    }

    /// Set the pool sizes.
    pub fn with_pool_sizes(mut self, tx: usize, rx: usize, unexp: usize) -> Self {
        self.tx_pool_size = tx;
        self.rx_pool_size = rx;
        self.unexp_pool_size = unexp;
        self
    }
}
