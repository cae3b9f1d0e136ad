use tokio::time::Instant;
use tokio_util::bytes::Bytes;
use tracing::{debug, trace};

use super::{Engine, EngineError, Event, ProtocolError, DOWNLOAD};
use crate::message::{PeerMessage, PieceIndex};
use crate::peer::PeerKey;
use crate::piece::{BlockInfo, BlockKey};
use crate::transport::Transport;

/// Handle for one outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub(crate) slot: usize,
    pub(crate) serial: u64,
}

impl RequestKey {
    #[cfg(test)]
    pub(crate) fn for_tests(slot: usize) -> Self {
        Self { slot, serial: 0 }
    }
}

/// A block asked from one peer. The peer owns it; the block only keeps its
/// key for lookup. `block` is cleared once the block was delivered by
/// somebody else, which leaves the request orphaned.
#[derive(Debug)]
pub struct Request {
    pub(crate) serial: u64,
    peer: PeerKey,
    block: Option<BlockKey>,
    info: BlockInfo,
    sent_at: Instant,
    qdepth: usize,
}

impl Request {
    pub fn peer(&self) -> PeerKey {
        self.peer
    }

    pub fn block(&self) -> Option<BlockKey> {
        self.block
    }

    pub fn info(&self) -> BlockInfo {
        self.info
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    /// Requests in flight to the peer when this one was sent.
    pub fn qdepth(&self) -> usize {
        self.qdepth
    }

    pub fn is_orphan(&self) -> bool {
        self.block.is_none()
    }
}

/// Outcome of a PIECE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Accepted,
    /// Nothing asked for this data.
    Unsolicited,
}

impl<T: Transport> Engine<T> {
    pub fn send_request(&mut self, key: PeerKey, block: BlockKey) -> Result<RequestKey, EngineError> {
        let info = self
            .store
            .block(block)
            .ok_or(EngineError::UnknownBlock)?
            .info();
        let qdepth = self
            .peer(key)
            .ok_or(EngineError::UnknownPeer(key))?
            .session()
            .ok_or(EngineError::PeerNotRunning(key))?
            .active_requests();

        let serial = self.next_serial();
        let slot = self.requests.insert(Request {
            serial,
            peer: key,
            block: Some(block),
            info,
            sent_at: Instant::now(),
            qdepth,
        });
        let request = RequestKey { slot, serial };
        if let Err(error) = self.store.attach(block, request) {
            self.requests.remove(slot);
            return Err(error.into());
        }

        if let Some(peer) = self.peer_mut(key) {
            peer.stats.requests_sent += 1;
            if let Some(session) = peer.state.session_mut() {
                session.requests.push(request);
            }
        }
        trace!(
            target: DOWNLOAD,
            peer = %self.peer_name(key),
            %key,
            block = %info,
            qdepth,
            "request",
        );
        self.send(
            key,
            &PeerMessage::Request {
                index: info.piece_index,
                begin: info.offset,
                length: info.length,
            },
            true,
        );
        Ok(request)
    }

    /// Resolves the request matching a PIECE message.
    pub(crate) fn receive_piece(
        &mut self,
        key: PeerKey,
        index: PieceIndex,
        begin: u32,
        data: Bytes,
    ) -> Result<Completion, ProtocolError> {
        let length = data.len();
        let Some((position, _)) =
            self.find_request(key, |info| info.matches(index, begin, length as u32))
        else {
            if let Some((_, expected)) = self.find_request(key, |info| {
                info.piece_index == index && info.offset == begin
            }) {
                return Err(ProtocolError::BlockLengthMismatch {
                    expected,
                    got: length,
                });
            }
            self.stats.wasted += length as u64;
            if let Some(peer) = self.peer_mut(key) {
                peer.stats.wasted_blocks += 1;
            }
            debug!(
                target: DOWNLOAD,
                peer = %self.peer_name(key),
                %key,
                index,
                begin,
                length,
                "unsolicited block",
            );
            return Ok(Completion::Unsolicited);
        };

        let Some((request_key, request)) = self.take_request(key, position) else {
            return Ok(Completion::Unsolicited);
        };

        let now = Instant::now();
        let delay = now
            .saturating_duration_since(request.sent_at)
            .min(self.config.max_block_delay);
        let max_depth = self.config.max_pipeline_depth;
        let second = self.second(now);
        let first = match self.peer_mut(key) {
            Some(peer) => {
                let first = peer.rate.record(request.qdepth, delay);
                peer.maxq = max_depth;
                peer.stats.bytes_received += length as u64;
                peer.download_rate.fill(second, peer.stats.bytes_received);
                first
            }
            None => false,
        };
        self.stats.downloaded += length as u64;
        self.download_rate.fill(second, self.stats.downloaded);

        match request.block {
            Some(block) => self.deliver(key, block, request_key, &data),
            None => {
                debug!(
                    target: DOWNLOAD,
                    peer = %self.peer_name(key),
                    %key,
                    block = %request.info,
                    "orphan completed",
                );
            }
        }

        if first {
            self.cancel_orphaned_requests(key, request.info);
        }
        self.push_event(Event::WantRequests(key));
        Ok(Completion::Accepted)
    }

    fn deliver(&mut self, key: PeerKey, block: BlockKey, request: RequestKey, data: &[u8]) {
        let stored = match self.store.store(block, request, data) {
            Ok(stored) => stored,
            Err(error) => {
                debug!(
                    target: DOWNLOAD,
                    peer = %self.peer_name(key),
                    %key,
                    %error,
                    "block not stored",
                );
                self.store.detach(block, request);
                return;
            }
        };

        self.orphan(&stored.orphaned);
        trace!(
            target: DOWNLOAD,
            peer = %self.peer_name(key),
            %key,
            block = %stored.info,
            "block received",
        );
        self.push_event(Event::BlockReceived {
            peer: key,
            block: stored.info,
        });

        if stored.piece_complete {
            debug!(
                target: DOWNLOAD,
                peer = %self.peer_name(key),
                %key,
                index = stored.info.piece_index,
                "piece complete",
            );
            self.push_event(Event::PieceCompleted(stored.info.piece_index));
            self.update_interest_all();
        }
    }

    /// Resolves a REJECT. No matching request is fine: a CANCEL may have
    /// crossed it on the wire.
    pub(crate) fn receive_reject(&mut self, key: PeerKey, index: PieceIndex, begin: u32, length: u32) {
        let Some((position, _)) =
            self.find_request(key, |info| info.matches(index, begin, length))
        else {
            trace!(
                target: DOWNLOAD,
                peer = %self.peer_name(key),
                %key,
                index,
                begin,
                length,
                "reject without request",
            );
            return;
        };

        let num_pieces = self.num_pieces;
        if let Some(session) = self.session_mut(key) {
            session.flags_mut(num_pieces).set_rejected(index);
        }
        let Some((request_key, request)) = self.take_request(key, position) else {
            return;
        };
        if let Some(block) = request.block {
            self.store.detach(block, request_key);
        }

        debug!(
            target: DOWNLOAD,
            peer = %self.peer_name(key),
            %key,
            block = %request.info,
            "rejected",
        );
        self.push_event(Event::RequestRejected {
            peer: key,
            block: request.info,
        });
    }

    /// Withdraws a request and tells the peer. Fails for requests that
    /// were already resolved, which is harmless.
    pub fn cancel(&mut self, request_key: RequestKey) -> Result<(), EngineError> {
        if self.request(request_key).is_none() {
            return Err(EngineError::UnknownRequest(request_key));
        }
        let Some(request) = self.requests.try_remove(request_key.slot) else {
            return Err(EngineError::UnknownRequest(request_key));
        };
        let peer = request.peer;

        if let Some(peer) = self.peer_mut(peer) {
            peer.stats.cancels_sent += 1;
            if let Some(session) = peer.state.session_mut() {
                session.requests.retain(|r| *r != request_key);
            }
        }
        if let Some(block) = request.block {
            self.store.detach(block, request_key);
        }

        trace!(
            target: DOWNLOAD,
            peer = %self.peer_name(peer),
            key = %peer,
            block = %request.info,
            "cancel",
        );
        self.send(
            peer,
            &PeerMessage::Cancel {
                index: request.info.piece_index,
                begin: request.info.offset,
                length: request.info.length,
            },
            false,
        );
        Ok(())
    }

    /// Drops every outstanding request of a peer without sending CANCEL.
    pub fn abort_all(&mut self, key: PeerKey) {
        let Some(requests) = self
            .session_mut(key)
            .map(|session| std::mem::take(&mut session.requests))
        else {
            return;
        };
        if !requests.is_empty() {
            trace!(
                target: DOWNLOAD,
                peer = %self.peer_name(key),
                %key,
                count = requests.len(),
                "abort requests",
            );
        }

        for request_key in requests {
            if let Some(request) = self.requests.try_remove(request_key.slot) {
                if let Some(block) = request.block {
                    self.store.detach(block, request_key);
                }
            }
        }
    }

    /// Cancels the peer's orphans and any other request it still has for
    /// `completed`.
    pub fn cancel_orphaned_requests(&mut self, key: PeerKey, completed: BlockInfo) {
        let stale: Vec<RequestKey> = self
            .peer(key)
            .and_then(|peer| peer.session())
            .map(|session| {
                session
                    .requests()
                    .iter()
                    .copied()
                    .filter(|r| {
                        self.request(*r)
                            .is_some_and(|request| request.is_orphan() || request.info == completed)
                    })
                    .collect()
            })
            .unwrap_or_default();

        for request in stale {
            let _ = self.cancel(request);
        }
    }

    /// Marks requests whose block no longer exists.
    pub(crate) fn orphan(&mut self, requests: &[RequestKey]) {
        for key in requests {
            if let Some(request) = self.requests.get_mut(key.slot) {
                request.block = None;
            }
        }
    }

    fn find_request(
        &self,
        key: PeerKey,
        matches: impl Fn(&BlockInfo) -> bool,
    ) -> Option<(usize, BlockInfo)> {
        let session = self.peer(key)?.session()?;
        session.requests().iter().enumerate().find_map(|(position, r)| {
            self.request(*r)
                .map(|request| request.info)
                .filter(|info| matches(info))
                .map(|info| (position, info))
        })
    }

    /// Unlinks the request at `position` from the peer and frees it.
    fn take_request(&mut self, key: PeerKey, position: usize) -> Option<(RequestKey, Request)> {
        let session = self.session_mut(key)?;
        if position >= session.requests.len() {
            return None;
        }
        let request_key = session.requests.remove(position);
        let request = self.requests.try_remove(request_key.slot)?;
        Some((request_key, request))
    }
}
