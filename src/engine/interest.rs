use tracing::debug;

use super::{Engine, EngineError, DOWNLOAD, UPLOAD};
use crate::message::PeerMessage;
use crate::peer::PeerKey;
use crate::transport::Transport;

impl<T: Transport> Engine<T> {
    /// Whether the peer has a piece we are still missing blocks of.
    pub fn wants_from(&self, key: PeerKey) -> bool {
        let Some(flags) = self
            .peer(key)
            .and_then(|peer| peer.session())
            .and_then(|session| session.piece_flags())
        else {
            return false;
        };
        self.store
            .pieces()
            .any(|piece| piece.has_outstanding_blocks() && flags.has(piece.index()))
    }

    /// Recomputes our interest in one peer, sending INTERESTED or
    /// NOT_INTERESTED on a change only.
    pub fn update_interest(&mut self, key: PeerKey) {
        let want = self.wants_from(key);
        let Some(session) = self.session_mut(key) else {
            return;
        };
        if session.flow.am_interested == want {
            return;
        }
        session.flow.am_interested = want;

        debug!(target: DOWNLOAD, peer = %self.peer_name(key), %key, interested = want, "interest");
        let message = if want {
            PeerMessage::Interested
        } else {
            PeerMessage::NotInterested
        };
        self.send(key, &message, false);
    }

    pub fn update_interest_all(&mut self) {
        let running: Vec<PeerKey> = self.running.iter().copied().collect();
        for key in running {
            self.update_interest(key);
        }
    }

    /// Chokes or unchokes a peer we upload to. Repeating the current state
    /// sends nothing.
    pub fn choke(&mut self, key: PeerKey, choke: bool) -> Result<(), EngineError> {
        let session = self
            .peer_mut(key)
            .ok_or(EngineError::UnknownPeer(key))?
            .state
            .session_mut()
            .ok_or(EngineError::PeerNotRunning(key))?;
        if session.flow.am_choking == choke {
            return Ok(());
        }
        session.flow.am_choking = choke;

        debug!(target: UPLOAD, peer = %self.peer_name(key), %key, choke, "choke");
        let message = if choke {
            PeerMessage::Choke
        } else {
            PeerMessage::Unchoke
        };
        self.send(key, &message, false);
        Ok(())
    }
}
