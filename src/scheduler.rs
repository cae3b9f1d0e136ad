//! Hooks for the torrent level scheduler that decides which blocks to ask
//! which peer for.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::engine::{Engine, Event};
use crate::message::PieceIndex;
use crate::peer::PeerKey;
use crate::piece::{BlockInfo, BlockKey};
use crate::transport::Transport;

/// Every hook defaults to doing nothing.
#[allow(unused_variables)]
pub trait Scheduler<T: Transport> {
    fn on_peer_unchoked_us(&mut self, engine: &mut Engine<T>, peer: PeerKey) {}

    fn on_peer_choked_us(&mut self, engine: &mut Engine<T>, peer: PeerKey) {}

    fn on_bitfield_or_have(&mut self, engine: &mut Engine<T>, peer: PeerKey) {}

    fn on_block_received(&mut self, engine: &mut Engine<T>, peer: PeerKey, block: BlockInfo) {}

    fn on_request_rejected(&mut self, engine: &mut Engine<T>, peer: PeerKey, block: BlockInfo) {}

    fn on_piece_completed(&mut self, engine: &mut Engine<T>, index: PieceIndex) {}

    fn on_piece_verified(&mut self, engine: &mut Engine<T>, index: PieceIndex, ok: bool) {}

    fn on_slots_available(&mut self, engine: &mut Engine<T>) {}

    fn on_want_requests(&mut self, engine: &mut Engine<T>, peer: PeerKey) {}

    fn on_peer_destroyed(&mut self, engine: &mut Engine<T>, peer: PeerKey) {}
}

/// Delivers queued engine events until the queue stays empty. Hooks may
/// call back into the engine; whatever that queues is delivered in the
/// same pass.
pub fn pump<T: Transport, S: Scheduler<T> + ?Sized>(engine: &mut Engine<T>, scheduler: &mut S) {
    loop {
        let events = engine.take_events();
        if events.is_empty() {
            return;
        }
        for event in events {
            trace!(?event, "scheduler event");
            match event {
                Event::PeerUnchokedUs(peer) => scheduler.on_peer_unchoked_us(engine, peer),
                Event::PeerChokedUs(peer) => scheduler.on_peer_choked_us(engine, peer),
                Event::Availability(peer) => scheduler.on_bitfield_or_have(engine, peer),
                Event::BlockReceived { peer, block } => {
                    scheduler.on_block_received(engine, peer, block)
                }
                Event::RequestRejected { peer, block } => {
                    scheduler.on_request_rejected(engine, peer, block)
                }
                Event::PieceCompleted(index) => scheduler.on_piece_completed(engine, index),
                Event::PieceVerified { index, ok } => {
                    scheduler.on_piece_verified(engine, index, ok)
                }
                Event::SlotsAvailable => scheduler.on_slots_available(engine),
                Event::WantRequests(peer) => scheduler.on_want_requests(engine, peer),
                Event::PeerDestroyed(peer) => scheduler.on_peer_destroyed(engine, peer),
            }
        }
    }
}

/// Length and expected hash of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSpec {
    pub length: u32,
    pub hash: Option<[u8; 20]>,
}

/// Downloads pieces in index order, keeping a small window active, and
/// keeps every unchoked peer's pipeline at its `maxq`.
///
/// Verified pieces stay in memory for serving, but only the most recent
/// `keep_verified` of them (the window size unless set). Older ones are
/// deactivated: they stay in our bitfield and requests for them are
/// rejected.
#[derive(Debug)]
pub struct InOrderScheduler {
    pieces: Vec<PieceSpec>,
    window: usize,
    target: usize,
    next_piece: usize,
    verified: usize,
    keep_verified: usize,
    kept: VecDeque<PieceIndex>,
}

impl InOrderScheduler {
    pub fn new(pieces: Vec<PieceSpec>, window: usize) -> Self {
        let target = pieces.len();
        Self {
            pieces,
            window: window.max(1),
            target,
            next_piece: 0,
            verified: 0,
            keep_verified: window.max(1),
            kept: VecDeque::new(),
        }
    }

    /// How many verified pieces stay loaded for serving.
    pub fn with_keep_verified(mut self, count: usize) -> Self {
        self.keep_verified = count;
        self
    }

    /// Stops after the first `count` pieces.
    pub fn with_target(mut self, count: usize) -> Self {
        self.target = count.min(self.pieces.len());
        self
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn verified(&self) -> usize {
        self.verified
    }

    pub fn is_done(&self) -> bool {
        self.verified >= self.target
    }

    /// Activates the first window of pieces.
    pub fn start<T: Transport>(&mut self, engine: &mut Engine<T>) {
        while self.activate_next(engine) {}
    }

    fn activate_next<T: Transport>(&mut self, engine: &mut Engine<T>) -> bool {
        let outstanding = engine
            .store()
            .pieces()
            .filter(|piece| piece.has_outstanding_blocks())
            .count();
        if outstanding >= self.window || self.next_piece >= self.target {
            return false;
        }

        let index = self.next_piece;
        self.next_piece += 1;
        let Some(spec) = self.pieces.get(index) else {
            return false;
        };
        match engine.activate_piece(index as PieceIndex, spec.length, spec.hash) {
            Ok(()) => true,
            Err(error) => {
                debug!(index, %error, "cannot activate piece");
                false
            }
        }
    }

    fn retire_verified<T: Transport>(&mut self, engine: &mut Engine<T>, index: PieceIndex) {
        self.kept.push_back(index);
        while self.kept.len() > self.keep_verified {
            let Some(old) = self.kept.pop_front() else {
                break;
            };
            debug!(index = old, "releasing verified piece");
            engine.deactivate_piece(old);
        }
    }

    /// First waiting block of an active piece this peer has and has not
    /// rejected.
    fn pick_block<T: Transport>(&self, engine: &Engine<T>, peer: PeerKey) -> Option<BlockKey> {
        let remote = engine.peer(peer)?;
        engine
            .store()
            .pieces()
            .filter(|piece| remote.has_piece(piece.index()) && !remote.rejected_piece(piece.index()))
            .find_map(|piece| piece.waiting().next())
    }

    fn fill<T: Transport>(&mut self, engine: &mut Engine<T>, peer: PeerKey) {
        loop {
            let Some(remote) = engine.peer(peer) else {
                return;
            };
            if remote.is_choking_us() || remote.active_requests() >= remote.maxq() {
                return;
            }

            let block = match self.pick_block(engine, peer) {
                Some(block) => block,
                None if self.activate_next(engine) => continue,
                None => return,
            };
            if let Err(error) = engine.send_request(peer, block) {
                debug!(peer = %engine.peer_name(peer), key = %peer, %error, "request failed");
                return;
            }
        }
    }

    fn fill_all<T: Transport>(&mut self, engine: &mut Engine<T>) {
        let unchoked: Vec<PeerKey> = engine.unchoked_peers().collect();
        for peer in unchoked {
            self.fill(engine, peer);
        }
    }
}

impl<T: Transport> Scheduler<T> for InOrderScheduler {
    fn on_peer_unchoked_us(&mut self, engine: &mut Engine<T>, peer: PeerKey) {
        self.fill(engine, peer);
    }

    fn on_peer_choked_us(&mut self, engine: &mut Engine<T>, _peer: PeerKey) {
        self.fill_all(engine);
    }

    fn on_request_rejected(&mut self, engine: &mut Engine<T>, _peer: PeerKey, _block: BlockInfo) {
        self.fill_all(engine);
    }

    fn on_piece_verified(&mut self, engine: &mut Engine<T>, index: PieceIndex, ok: bool) {
        if ok {
            if (index as usize) < self.target {
                self.verified += 1;
            }
            self.retire_verified(engine, index);
        }
        while self.activate_next(engine) {}
        self.fill_all(engine);
    }

    fn on_want_requests(&mut self, engine: &mut Engine<T>, peer: PeerKey) {
        self.fill(engine, peer);
    }

    fn on_peer_destroyed(&mut self, engine: &mut Engine<T>, _peer: PeerKey) {
        self.fill_all(engine);
    }
}
