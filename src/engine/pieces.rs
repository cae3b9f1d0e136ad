use tracing::{debug, info};

use super::{Engine, EngineError, Event, DOWNLOAD};
use crate::message::{PeerMessage, PieceIndex};
use crate::peer::PeerKey;
use crate::transport::Transport;

impl<T: Transport> Engine<T> {
    /// Makes a piece downloadable and refreshes interest in every peer.
    pub fn activate_piece(
        &mut self,
        index: PieceIndex,
        length: u32,
        expected_hash: Option<[u8; 20]>,
    ) -> Result<(), EngineError> {
        if index >= self.num_pieces {
            return Err(EngineError::UnknownPiece(index));
        }
        self.store.activate(index, length, expected_hash)?;
        debug!(target: DOWNLOAD, index, length, "piece activated");
        self.update_interest_all();
        Ok(())
    }

    /// Drops a piece. Requests still pointing at its blocks become orphans.
    pub fn deactivate_piece(&mut self, index: PieceIndex) {
        let orphans = self.store.deactivate(index);
        self.orphan(&orphans);
        self.update_interest_all();
    }

    /// Loads data we already hold, verified, so it can be served and is
    /// announced in our bitfield.
    pub fn seed_piece(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), EngineError> {
        if index >= self.num_pieces {
            return Err(EngineError::UnknownPiece(index));
        }
        self.store.seed(index, data)?;
        self.have.set_piece(index);
        Ok(())
    }

    /// Data and expected hash of a completed piece, to be checked off the
    /// event loop.
    pub fn verification_input(&self, index: PieceIndex) -> Option<(Vec<u8>, Option<[u8; 20]>)> {
        let piece = self.store.piece(index).filter(|piece| piece.is_complete())?;
        Some((piece.data().to_vec(), piece.expected_hash().copied()))
    }

    /// Accepts the hash verdict for a completed piece. A good piece is
    /// announced to every running peer; a bad one starts over.
    ///
    /// Verdicts for pieces that are missing blocks or already verified are
    /// refused: they belong to data that has since been reset or replaced.
    pub fn on_piece_verified(&mut self, index: PieceIndex, ok: bool) -> Result<(), EngineError> {
        let piece = self
            .store
            .piece(index)
            .ok_or(EngineError::UnknownPiece(index))?;
        if piece.hash_ok() {
            return Err(EngineError::PieceAlreadyVerified(index));
        }
        if !piece.is_complete() {
            return Err(EngineError::PieceIncomplete(index));
        }
        let length = piece.length();

        if ok {
            self.store.mark_verified(index);
            self.have.set_piece(index);
            let running: Vec<PeerKey> = self.running.iter().copied().collect();
            for key in running {
                self.send(key, &PeerMessage::Have(index), false);
            }
            info!(target: DOWNLOAD, index, "piece verified");
        } else {
            let stale = self.store.reset(index);
            self.orphan(&stale);
            self.stats.wasted += u64::from(length);
            debug!(target: DOWNLOAD, index, "piece failed hash check");
        }

        self.update_interest_all();
        self.push_event(Event::PieceVerified { index, ok });
        Ok(())
    }
}
