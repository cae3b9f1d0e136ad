use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::message::MAX_MESSAGE_LEN;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of connected peers for one torrent
    pub max_peers_torrent: usize,
    /// Largest frame accepted from a peer
    pub max_message_len: usize,
    /// Timeout for establishing peer connections
    pub connect_timeout: Duration,
    /// Time allowed for the remote handshake to arrive
    pub handshake_timeout: Duration,
    /// Idle read timeout once running
    pub read_timeout: Duration,
    /// Send a keep-alive after this long without any outbound message
    pub keepalive_interval: Duration,
    /// Consecutive connect failures or disconnects before a peer is dropped
    pub max_failures: u32,
    /// Minimum wait before reconnecting a failed peer
    pub retry_interval: Duration,
    /// Requests in flight right after being unchoked
    pub initial_pipeline_depth: usize,
    /// Requests in flight once a latency sample exists
    pub max_pipeline_depth: usize,
    /// Latency samples are clamped to this
    pub max_block_delay: Duration,
    /// Largest REQUEST we serve
    pub max_request_len: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers_torrent: 50,
            max_message_len: MAX_MESSAGE_LEN,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(60),
            max_failures: 5,
            retry_interval: Duration::from_secs(30),
            initial_pipeline_depth: 1,
            max_pipeline_depth: 10,
            max_block_delay: Duration::from_secs(60),
            max_request_len: 128 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers_torrent = max;
        self
    }

    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_failures = max;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_pipeline_depth(mut self, initial: usize, max: usize) -> Self {
        self.initial_pipeline_depth = initial;
        self.max_pipeline_depth = max.max(1);
        self
    }

    pub fn with_max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len;
        self
    }
}

/// Connection budget shared by every engine in the process.
#[derive(Debug, Clone)]
pub struct PeerBudget {
    max: usize,
    active: Arc<AtomicUsize>,
}

impl PeerBudget {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn has_room(&self) -> bool {
        self.active() < self.max
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max).then_some(active + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                active.checked_sub(1)
            });
    }
}
