use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use tokio::time::Instant;

mod flags;
mod rate;
mod state;

pub use flags::{PieceFlags, PIECE_HAVE, PIECE_REJECTED};
pub use rate::{AverageFill, RateEstimator};
pub use state::{FlowControl, PeerState, Session, StateKind};

/// Stable handle for a peer. The serial makes a handle to a destroyed peer
/// useless even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey {
    pub(crate) slot: usize,
    pub(crate) serial: u64,
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.serial)
    }
}

/// 20 byte peer id as sent in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Azureus-style id: client prefix followed by random alphanumerics.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let prefix = b"-PW0100-";
        let mut id = [0u8; 20];
        id[..prefix.len()].copy_from_slice(prefix);

        for byte in id.iter_mut().skip(prefix.len()) {
            *byte = match rng.gen_range(0..3) {
                0 => rng.gen_range(b'A'..=b'Z'),
                1 => rng.gen_range(b'a'..=b'z'),
                _ => rng.gen_range(b'0'..=b'9'),
            };
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Cumulative counters, kept across reconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub bytes_received: u64,
    /// Blocks we got without asking (or after cancelling).
    pub wasted_blocks: u64,
    pub requests_sent: u64,
    pub cancels_sent: u64,
}

#[derive(Debug)]
pub struct Peer {
    pub(crate) serial: u64,
    addr: SocketAddr,
    name: String,
    pub(crate) state: PeerState,
    pub(crate) stats: PeerStats,
    pub(crate) download_rate: AverageFill,
    pub(crate) rate: RateEstimator,
    pub(crate) maxq: usize,
    pub(crate) connect_failures: u32,
    pub(crate) disconnects: u32,
    pub(crate) fail_time: Option<Instant>,
}

impl Peer {
    pub(crate) fn new(serial: u64, addr: SocketAddr, depths: usize) -> Self {
        Self {
            serial,
            addr,
            name: format!("BT Peer {addr}"),
            state: PeerState::Inactive,
            stats: PeerStats::default(),
            download_rate: AverageFill::new(),
            rate: RateEstimator::new(depths),
            maxq: 1,
            connect_failures: 0,
            disconnects: 0,
            fail_time: None,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn state_kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn session(&self) -> Option<&Session> {
        self.state.session()
    }

    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    pub fn rate(&self) -> &RateEstimator {
        &self.rate
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.bytes_per_second()
    }

    /// How many requests the scheduler should keep in flight to this peer.
    pub fn maxq(&self) -> usize {
        self.maxq
    }

    pub fn connect_failures(&self) -> u32 {
        self.connect_failures
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects
    }

    pub fn active_requests(&self) -> usize {
        self.session().map_or(0, Session::active_requests)
    }

    pub fn is_choking_us(&self) -> bool {
        self.session().map_or(true, |s| s.flow.peer_choking)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.session()
            .and_then(Session::piece_flags)
            .is_some_and(|flags| flags.has(index))
    }

    /// Pieces the peer announced, zero before any HAVE or BITFIELD.
    pub fn pieces_have(&self) -> u32 {
        self.session()
            .and_then(Session::piece_flags)
            .map_or(0, PieceFlags::have_count)
    }

    pub fn rejected_piece(&self, index: u32) -> bool {
        self.session()
            .and_then(Session::piece_flags)
            .is_some_and(|flags| flags.is_rejected(index))
    }
}
