//! The peer wire engine for one torrent.
//!
//! Sans-IO and single threaded: every method returns immediately, all
//! network work goes through a [`Transport`], and everything the scheduler
//! needs to react to is queued as an [`Event`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;

use slab::Slab;
use tokio::time::Instant;

use crate::config::{EngineConfig, PeerBudget};
use crate::message::{Bitfield, MessageCodec, PeerMessage, PieceIndex};
use crate::peer::{AverageFill, Peer, PeerId, PeerKey, Session, StateKind};
use crate::piece::{BlockInfo, Piece, PieceStore};
use crate::transport::{ConnId, Transport};

mod dispatch;
mod error;
mod interest;
mod lifecycle;
mod pieces;
mod request;

pub use error::{EngineError, ProtocolError};
pub use lifecycle::Exit;
pub use request::{Completion, Request, RequestKey};

pub(crate) const CONN: &str = "peerwire::conn";
pub(crate) const DOWNLOAD: &str = "peerwire::download";
pub(crate) const UPLOAD: &str = "peerwire::upload";

/// Things the scheduler gets told about. See [`crate::scheduler::pump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerUnchokedUs(PeerKey),
    PeerChokedUs(PeerKey),
    /// New HAVE, BITFIELD or HAVE_ALL information.
    Availability(PeerKey),
    BlockReceived { peer: PeerKey, block: BlockInfo },
    RequestRejected { peer: PeerKey, block: BlockInfo },
    /// All blocks of a piece arrived; it needs hashing.
    PieceCompleted(PieceIndex),
    PieceVerified { index: PieceIndex, ok: bool },
    /// A connection slot was freed.
    SlotsAvailable,
    /// The peer can take more requests.
    WantRequests(PeerKey),
    PeerDestroyed(PeerKey),
}

/// Torrent wide byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TorrentStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub wasted: u64,
}

pub struct Engine<T> {
    config: EngineConfig,
    transport: T,
    budget: PeerBudget,
    info_hash: [u8; 20],
    local_id: PeerId,
    num_pieces: u32,
    codec: MessageCodec,

    peers: Slab<Peer>,
    conns: HashMap<ConnId, PeerKey>,
    addrs: HashMap<SocketAddr, PeerKey>,
    requests: Slab<Request>,
    store: PieceStore,
    have: Bitfield,

    // Membership by lifecycle state. Connecting and WaitHandshake peers
    // only show up in `active_peers`.
    inactive: VecDeque<PeerKey>,
    connect_failed: VecDeque<PeerKey>,
    disconnected: VecDeque<PeerKey>,
    running: BTreeSet<PeerKey>,
    unchoked: BTreeSet<PeerKey>,
    active_peers: usize,

    stats: TorrentStats,
    download_rate: AverageFill,
    epoch: Instant,
    events: VecDeque<Event>,
    next_serial: u64,
}

impl<T: Transport> Engine<T> {
    pub fn new(
        info_hash: [u8; 20],
        local_id: PeerId,
        num_pieces: u32,
        config: EngineConfig,
        transport: T,
        budget: PeerBudget,
    ) -> Self {
        Self {
            codec: MessageCodec::new(config.max_message_len),
            config,
            transport,
            budget,
            info_hash,
            local_id,
            num_pieces,
            peers: Slab::new(),
            conns: HashMap::new(),
            addrs: HashMap::new(),
            requests: Slab::new(),
            store: PieceStore::new(),
            have: Bitfield::new(num_pieces),
            inactive: VecDeque::new(),
            connect_failed: VecDeque::new(),
            disconnected: VecDeque::new(),
            running: BTreeSet::new(),
            unchoked: BTreeSet::new(),
            active_peers: 0,
            stats: TorrentStats::default(),
            download_rate: AverageFill::new(),
            epoch: Instant::now(),
            events: VecDeque::new(),
            next_serial: 1,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    /// Pieces we have verified.
    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn stats(&self) -> TorrentStats {
        self.stats
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.bytes_per_second()
    }

    pub fn peer(&self, key: PeerKey) -> Option<&Peer> {
        self.peers
            .get(key.slot)
            .filter(|peer| peer.serial == key.serial)
    }

    pub(crate) fn peer_mut(&mut self, key: PeerKey) -> Option<&mut Peer> {
        self.peers
            .get_mut(key.slot)
            .filter(|peer| peer.serial == key.serial)
    }

    pub(crate) fn session_mut(&mut self, key: PeerKey) -> Option<&mut Session> {
        self.peer_mut(key).and_then(|peer| peer.state.session_mut())
    }

    pub fn peers(&self) -> impl Iterator<Item = (PeerKey, &Peer)> {
        self.peers.iter().map(|(slot, peer)| {
            (
                PeerKey {
                    slot,
                    serial: peer.serial,
                },
                peer,
            )
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers currently holding a connection slot.
    pub fn active_peers(&self) -> usize {
        self.active_peers
    }

    pub fn running_peers(&self) -> impl Iterator<Item = PeerKey> + '_ {
        self.running.iter().copied()
    }

    /// Running peers that currently let us download.
    pub fn unchoked_peers(&self) -> impl Iterator<Item = PeerKey> + '_ {
        self.unchoked.iter().copied()
    }

    pub fn peers_in(&self, kind: StateKind) -> Vec<PeerKey> {
        match kind {
            StateKind::Inactive => self.inactive.iter().copied().collect(),
            StateKind::ConnectFail => self.connect_failed.iter().copied().collect(),
            StateKind::Disconnected => self.disconnected.iter().copied().collect(),
            StateKind::Running => self.running.iter().copied().collect(),
            StateKind::Destroyed => Vec::new(),
            StateKind::Connecting | StateKind::WaitHandshake => self
                .peers()
                .filter(|(_, peer)| peer.state_kind() == kind)
                .map(|(key, _)| key)
                .collect(),
        }
    }

    /// Human readable state, `Destroyed` for handles whose peer is gone.
    pub fn state_text(&self, key: PeerKey) -> &'static str {
        self.peer(key)
            .map_or(StateKind::Destroyed, Peer::state_kind)
            .as_str()
    }

    /// Display name for log records, `-` once the peer is gone.
    pub(crate) fn peer_name(&self, key: PeerKey) -> &str {
        self.peer(key).map_or("-", Peer::name)
    }

    pub fn request(&self, key: RequestKey) -> Option<&Request> {
        self.requests
            .get(key.slot)
            .filter(|request| request.serial == key.serial)
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub fn piece(&self, index: PieceIndex) -> Option<&Piece> {
        self.store.piece(index)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Periodic housekeeping: keep-alives, rate sampling and refilling
    /// free connection slots.
    pub fn on_tick(&mut self) {
        let now = Instant::now();
        let due: Vec<PeerKey> = self
            .peers()
            .filter(|(_, peer)| peer.state.keepalive_at().is_some_and(|at| at <= now))
            .map(|(key, _)| key)
            .collect();
        for key in due {
            tracing::trace!(target: CONN, peer = %self.peer_name(key), %key, "keep-alive");
            self.send(key, &PeerMessage::KeepAlive, false);
        }

        let second = self.second(now);
        self.download_rate.fill(second, self.stats.downloaded);
        for (_, peer) in self.peers.iter_mut() {
            peer.download_rate.fill(second, peer.stats.bytes_received);
        }

        self.attempt_more_peers();
    }

    /// Encodes and sends one message, pushing out the keep-alive deadline.
    pub(crate) fn send(&mut self, key: PeerKey, message: &PeerMessage, more: bool) {
        let deadline = Instant::now() + self.config.keepalive_interval;
        let Some(conn) = self
            .peer_mut(key)
            .and_then(|peer| peer.state.arm_keepalive(deadline))
        else {
            return;
        };
        self.transport.send(conn, message.to_bytes(), more);
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }
}
