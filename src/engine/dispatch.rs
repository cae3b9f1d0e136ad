use tokio::time::Instant;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use super::{Engine, Event, Exit, ProtocolError, CONN, DOWNLOAD, UPLOAD};
use crate::message::{Bitfield, Handshake, PeerMessage, PieceIndex};
use crate::peer::{PeerKey, PeerState, Session, StateKind};
use crate::transport::{ConnId, Transport};

impl<T: Transport> Engine<T> {
    /// Feeds bytes read from `conn` into the peer's stream. Complete
    /// messages are handled in arrival order; a protocol violation drops
    /// the peer.
    pub fn on_readable(&mut self, conn: ConnId, data: &[u8]) {
        let Some(&key) = self.conns.get(&conn) else {
            return;
        };
        if let Err(error) = self.receive(key, data) {
            self.protocol_violation(key, error);
        }
    }

    fn protocol_violation(&mut self, key: PeerKey, error: ProtocolError) {
        let kind = self.peer(key).map(|peer| peer.state_kind());
        let exit = match (&error, kind) {
            (ProtocolError::Handshake(_), _) => Exit::Destroy,
            (_, Some(StateKind::Running)) => Exit::Disconnect,
            _ => Exit::ConnectFail,
        };
        debug!(target: CONN, peer = %self.peer_name(key), %key, %error, "protocol violation");
        self.shutdown(key, exit, true);
    }

    fn receive(&mut self, key: PeerKey, data: &[u8]) -> Result<(), ProtocolError> {
        let Some(peer) = self.peer_mut(key) else {
            return Ok(());
        };
        match &mut peer.state {
            PeerState::WaitHandshake { inbound, .. } => {
                inbound.extend_from_slice(data);
                if !self.recv_handshake(key)? {
                    return Ok(());
                }
            }
            PeerState::Running(session) => session.inbound.extend_from_slice(data),
            other => return Err(ProtocolError::NotRunning(other.kind().as_str())),
        }

        self.process_inbound(key)?;

        let deadline = Instant::now() + self.config.read_timeout;
        if let Some(conn) = self.peer(key).and_then(|peer| peer.state.conn()) {
            self.transport.set_timeout(conn, deadline);
        }
        Ok(())
    }

    /// Returns `true` once the peer is Running.
    fn recv_handshake(&mut self, key: PeerKey) -> Result<bool, ProtocolError> {
        let info_hash = self.info_hash;
        let initial_depth = self.config.initial_pipeline_depth;
        let Some(peer) = self.peer_mut(key) else {
            return Ok(false);
        };
        let PeerState::WaitHandshake {
            conn,
            inbound,
            keepalive_at,
        } = &mut peer.state
        else {
            return Ok(false);
        };

        let Some(handshake) = Handshake::decode_for(inbound, &info_hash)? else {
            return Ok(false);
        };
        let session = Session::new(
            *conn,
            handshake.peer_id,
            handshake.supports_fast(),
            std::mem::take(inbound),
            *keepalive_at,
        );

        // A completed handshake counts as proof of a healthy peer
        peer.connect_failures = 0;
        peer.disconnects = 0;
        peer.rate.reset();
        peer.maxq = initial_depth;
        debug!(
            target: CONN,
            peer = %peer.name(),
            %key,
            remote_id = %hex::encode(handshake.peer_id),
            fast = handshake.supports_fast(),
            "handshake complete"
        );

        self.transition(key, Some(PeerState::Running(Box::new(session))));
        self.send_initial_pieces(key);
        Ok(true)
    }

    /// Our piece set, sent once right after the handshake.
    fn send_initial_pieces(&mut self, key: PeerKey) {
        let fast = self
            .peer(key)
            .and_then(|peer| peer.session())
            .is_some_and(Session::fast_extension);
        let count = self.have.count();

        let message = if fast && count == 0 {
            PeerMessage::HaveNone
        } else if fast && self.have.is_complete() {
            PeerMessage::HaveAll
        } else if count > 0 {
            PeerMessage::Bitfield(Bytes::copy_from_slice(self.have.as_bytes()))
        } else {
            return;
        };
        self.send(key, &message, false);
    }

    fn process_inbound(&mut self, key: PeerKey) -> Result<(), ProtocolError> {
        loop {
            let Some(session) = self
                .peers
                .get_mut(key.slot)
                .filter(|peer| peer.serial == key.serial)
                .and_then(|peer| peer.state.session_mut())
            else {
                return Ok(());
            };
            let Some(message) = self.codec.decode(&mut session.inbound)? else {
                return Ok(());
            };
            self.handle_message(key, message)?;
        }
    }

    fn handle_message(&mut self, key: PeerKey, message: PeerMessage) -> Result<(), ProtocolError> {
        let fast = self
            .peer(key)
            .and_then(|peer| peer.session())
            .is_some_and(Session::fast_extension);
        if message.requires_fast_extension() && !fast {
            return Err(ProtocolError::FastExtensionRequired(
                message.message_id().unwrap_or_default(),
            ));
        }

        match message {
            PeerMessage::KeepAlive => {
                trace!(target: CONN, peer = %self.peer_name(key), %key, "keep-alive received")
            }
            PeerMessage::Choke => self.recv_choke(key),
            PeerMessage::Unchoke => self.recv_unchoke(key),
            PeerMessage::Interested => self.set_peer_interested(key, true),
            PeerMessage::NotInterested => self.set_peer_interested(key, false),
            PeerMessage::Have(index) => self.recv_have(key, index)?,
            PeerMessage::Bitfield(bits) => self.recv_bitfield(key, bits)?,
            PeerMessage::HaveAll => {
                let num_pieces = self.num_pieces;
                if let Some(session) = self.session_mut(key) {
                    session.flags_mut(num_pieces).set_all_have();
                }
                self.availability_changed(key);
            }
            PeerMessage::HaveNone => {
                let num_pieces = self.num_pieces;
                if let Some(session) = self.session_mut(key) {
                    session.flags_mut(num_pieces);
                }
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => self.recv_request(key, index, begin, length)?,
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                self.receive_piece(key, index, begin, block)?;
            }
            PeerMessage::Cancel { index, begin, .. } => {
                // Requests are answered as they arrive, nothing is queued
                trace!(target: UPLOAD, peer = %self.peer_name(key), %key, index, begin, "cancel");
            }
            PeerMessage::Reject {
                index,
                begin,
                length,
            } => self.receive_reject(key, index, begin, length),
            PeerMessage::Port(port) => {
                trace!(target: CONN, peer = %self.peer_name(key), %key, port, "dht port")
            }
            PeerMessage::AllowedFast(index) => {
                trace!(target: DOWNLOAD, peer = %self.peer_name(key), %key, index, "allowed fast")
            }
            PeerMessage::Unknown { id, payload } => {
                warn!(
                    target: CONN,
                    peer = %self.peer_name(key),
                    %key,
                    id,
                    len = payload.len(),
                    "unknown message",
                );
            }
        }
        Ok(())
    }

    fn recv_choke(&mut self, key: PeerKey) {
        let Some(session) = self.session_mut(key) else {
            return;
        };
        if session.flow.peer_choking {
            return;
        }
        session.flow.peer_choking = true;
        self.unchoked.remove(&key);
        self.abort_all(key);
        debug!(target: DOWNLOAD, peer = %self.peer_name(key), %key, "choked us");
        self.push_event(Event::PeerChokedUs(key));
    }

    fn recv_unchoke(&mut self, key: PeerKey) {
        let initial_depth = self.config.initial_pipeline_depth;
        let Some(peer) = self.peer_mut(key) else {
            return;
        };
        let Some(session) = peer.state.session_mut() else {
            return;
        };
        if !session.flow.peer_choking {
            return;
        }
        session.flow.peer_choking = false;
        peer.maxq = initial_depth;
        self.unchoked.insert(key);
        debug!(target: DOWNLOAD, peer = %self.peer_name(key), %key, "unchoked us");
        self.push_event(Event::PeerUnchokedUs(key));
    }

    fn set_peer_interested(&mut self, key: PeerKey, interested: bool) {
        if let Some(session) = self.session_mut(key) {
            session.flow.peer_interested = interested;
            trace!(target: UPLOAD, peer = %self.peer_name(key), %key, interested, "peer interest");
        }
    }

    fn recv_have(&mut self, key: PeerKey, index: PieceIndex) -> Result<(), ProtocolError> {
        let num_pieces = self.num_pieces;
        if index >= num_pieces {
            return Err(ProtocolError::PieceIndexOutOfRange { index, num_pieces });
        }
        let Some(session) = self.session_mut(key) else {
            return Ok(());
        };
        if session.flags_mut(num_pieces).set_have(index) {
            self.availability_changed(key);
        }
        Ok(())
    }

    fn recv_bitfield(&mut self, key: PeerKey, bits: Bytes) -> Result<(), ProtocolError> {
        if bits.is_empty() {
            return Ok(());
        }
        let num_pieces = self.num_pieces;
        let expected = Bitfield::byte_len(num_pieces);
        if bits.len() != expected {
            return Err(ProtocolError::BadBitfieldLength {
                got: bits.len(),
                expected,
            });
        }

        let bitfield = Bitfield::from_bytes(bits.to_vec(), num_pieces);
        let Some(session) = self.session_mut(key) else {
            return Ok(());
        };
        let flags = session.flags_mut(num_pieces);
        for index in bitfield.iter() {
            flags.set_have(index);
        }
        let pieces = flags.have_count();
        trace!(target: DOWNLOAD, peer = %self.peer_name(key), %key, pieces, "bitfield");
        self.availability_changed(key);
        Ok(())
    }

    fn availability_changed(&mut self, key: PeerKey) {
        self.update_interest(key);
        self.push_event(Event::Availability(key));
        if self.unchoked.contains(&key) {
            self.push_event(Event::WantRequests(key));
        }
    }

    fn recv_request(
        &mut self,
        key: PeerKey,
        index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<(), ProtocolError> {
        let out_of_range = ProtocolError::RequestOutOfRange {
            index,
            begin,
            length,
        };
        if index >= self.num_pieces {
            return Err(out_of_range);
        }

        let piece = self.store.piece(index).filter(|piece| piece.hash_ok());
        if let Some(piece) = piece {
            if u64::from(begin) + u64::from(length) > u64::from(piece.length()) {
                return Err(out_of_range);
            }
        }

        let data = match piece {
            Some(_) if length <= self.config.max_request_len => self
                .store
                .read(index, begin, length)
                .map(Bytes::copy_from_slice),
            _ => None,
        };
        let Some(block) = data else {
            trace!(
                target: UPLOAD,
                peer = %self.peer_name(key),
                %key,
                index,
                begin,
                length,
                "cannot serve request",
            );
            let fast = self
                .peer(key)
                .and_then(|peer| peer.session())
                .is_some_and(Session::fast_extension);
            if fast {
                self.send(
                    key,
                    &PeerMessage::Reject {
                        index,
                        begin,
                        length,
                    },
                    false,
                );
            }
            return Ok(());
        };

        self.send(
            key,
            &PeerMessage::Piece {
                index,
                begin,
                block,
            },
            false,
        );
        self.stats.uploaded += u64::from(length);
        trace!(target: UPLOAD, peer = %self.peer_name(key), %key, index, begin, length, "served");
        Ok(())
    }
}
