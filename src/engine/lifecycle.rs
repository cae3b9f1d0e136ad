use std::net::SocketAddr;

use tokio::time::Instant;
use tokio_util::bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use super::{Engine, Event, CONN};
use crate::message::Handshake;
use crate::peer::{Peer, PeerKey, PeerState, StateKind};
use crate::transport::{ConnId, Transport, TransportError};

/// How a peer leaves its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Never got as far as Running.
    ConnectFail,
    /// Dropped while Running.
    Disconnect,
    /// Gone for good.
    Destroy,
}

impl<T: Transport> Engine<T> {
    /// Registers a candidate address. Known addresses return the existing
    /// handle. The peer connects right away if both budgets allow,
    /// otherwise it waits in the inactive queue.
    pub fn add_peer(&mut self, addr: SocketAddr) -> PeerKey {
        if let Some(&key) = self.addrs.get(&addr) {
            return key;
        }

        let serial = self.next_serial();
        let slot = self
            .peers
            .insert(Peer::new(serial, addr, self.config.max_pipeline_depth));
        let key = PeerKey { slot, serial };
        self.addrs.insert(addr, key);
        self.inactive.push_back(key);
        debug!(target: CONN, peer = %self.peer_name(key), %key, "new peer");

        if self.has_slot() {
            self.connect(key);
        }
        key
    }

    /// Explicit teardown of one peer.
    pub fn remove_peer(&mut self, key: PeerKey) {
        self.shutdown(key, Exit::Destroy, true);
    }

    /// Destroys every peer without rescheduling, for torrent teardown.
    pub fn shutdown_all(&mut self) {
        let keys: Vec<PeerKey> = self.peers().map(|(key, _)| key).collect();
        for key in keys {
            self.shutdown(key, Exit::Destroy, false);
        }
        info!(target: CONN, "all peers shut down");
    }

    /// Fills free connection slots, first from never-tried peers, then from
    /// failed ones whose retry interval has passed. Returns how many
    /// connection attempts were started.
    pub fn attempt_more_peers(&mut self) -> usize {
        let mut started = 0;
        while self.has_slot() {
            let Some(key) = self.next_candidate() else {
                break;
            };
            if !self.connect(key) {
                break;
            }
            started += 1;
        }
        started
    }

    pub fn on_connected(&mut self, conn: ConnId) {
        let Some(&key) = self.conns.get(&conn) else {
            self.transport.close(conn);
            return;
        };
        if !matches!(
            self.peer(key).map(|peer| &peer.state),
            Some(PeerState::Connecting { .. })
        ) {
            return;
        }

        let now = Instant::now();
        self.transition(
            key,
            Some(PeerState::WaitHandshake {
                conn,
                inbound: BytesMut::new(),
                keepalive_at: now + self.config.keepalive_interval,
            }),
        );

        let handshake = Handshake::new(self.info_hash, self.local_id.0);
        self.transport
            .send(conn, Bytes::copy_from_slice(&handshake.to_bytes()), false);
        self.transport
            .set_timeout(conn, now + self.config.handshake_timeout);
        debug!(target: CONN, peer = %self.peer_name(key), %key, %conn, "connected, handshake sent");
    }

    pub fn on_transport_error(&mut self, conn: ConnId, error: TransportError) {
        let Some(&key) = self.conns.get(&conn) else {
            return;
        };
        let exit = match self.peer(key).map(Peer::state_kind) {
            Some(StateKind::Running) => Exit::Disconnect,
            _ => Exit::ConnectFail,
        };
        debug!(target: CONN, peer = %self.peer_name(key), %key, %error, ?exit, "transport error");
        self.shutdown(key, exit, true);
    }

    /// Leaves the current state. Outstanding requests are returned to
    /// their blocks, the connection is closed and the failure counters are
    /// bumped. Reaching the failure cap turns the exit into `Destroy`.
    pub fn shutdown(&mut self, key: PeerKey, exit: Exit, resched: bool) {
        let max_failures = self.config.max_failures;
        let Some(peer) = self.peer_mut(key) else {
            return;
        };
        let conn = peer.state.conn();

        let exit = match exit {
            Exit::ConnectFail => {
                peer.connect_failures += 1;
                if peer.connect_failures >= max_failures {
                    Exit::Destroy
                } else {
                    exit
                }
            }
            Exit::Disconnect => {
                peer.disconnects += 1;
                if peer.disconnects >= max_failures {
                    Exit::Destroy
                } else {
                    exit
                }
            }
            Exit::Destroy => Exit::Destroy,
        };
        peer.fail_time = Some(Instant::now());

        self.abort_all(key);
        if let Some(conn) = conn {
            self.transport.close(conn);
        }

        let next = match exit {
            Exit::ConnectFail => Some(PeerState::ConnectFail),
            Exit::Disconnect => Some(PeerState::Disconnected),
            Exit::Destroy => None,
        };
        debug!(target: CONN, peer = %self.peer_name(key), %key, ?exit, "peer shut down");
        self.transition(key, next);

        if exit == Exit::Destroy {
            self.push_event(Event::PeerDestroyed(key));
        }
        if resched && conn.is_some() {
            self.push_event(Event::SlotsAvailable);
            self.attempt_more_peers();
        }
    }

    /// Moves a peer into `next` (`None` destroys it), keeping the state
    /// collections, the connection map and the slot counters in step.
    pub(crate) fn transition(&mut self, key: PeerKey, next: Option<PeerState>) {
        let Some(peer) = self.peer_mut(key) else {
            return;
        };
        let old_kind = peer.state_kind();
        let old_conn = peer.state.conn();

        let (new_kind, new_conn) = match next {
            Some(state) => {
                peer.state = state;
                (peer.state_kind(), peer.state.conn())
            }
            None => (StateKind::Destroyed, None),
        };
        debug!(
            target: CONN,
            peer = %peer.name(),
            %key,
            from = %old_kind,
            to = %new_kind,
            "state change"
        );

        match old_kind {
            StateKind::Inactive => self.inactive.retain(|k| *k != key),
            StateKind::ConnectFail => self.connect_failed.retain(|k| *k != key),
            StateKind::Disconnected => self.disconnected.retain(|k| *k != key),
            StateKind::Running => {
                self.running.remove(&key);
                self.unchoked.remove(&key);
            }
            _ => {}
        }
        match new_kind {
            StateKind::Inactive => self.inactive.push_back(key),
            StateKind::ConnectFail => self.connect_failed.push_back(key),
            StateKind::Disconnected => self.disconnected.push_back(key),
            StateKind::Running => {
                self.running.insert(key);
            }
            StateKind::Destroyed => {
                let peer = self.peers.remove(key.slot);
                self.addrs.remove(&peer.address());
            }
            _ => {}
        }

        if old_conn != new_conn {
            if let Some(conn) = old_conn {
                self.conns.remove(&conn);
            }
            if let Some(conn) = new_conn {
                self.conns.insert(conn, key);
            }
        }

        // Slots are acquired from the shared budget in `connect`
        match (old_conn.is_some(), new_conn.is_some()) {
            (true, false) => {
                self.active_peers = self.active_peers.saturating_sub(1);
                self.budget.release();
            }
            (false, true) => self.active_peers += 1,
            _ => {}
        }
    }

    fn has_slot(&self) -> bool {
        self.active_peers < self.config.max_peers_torrent && self.budget.has_room()
    }

    fn connect(&mut self, key: PeerKey) -> bool {
        let Some(addr) = self.peer(key).map(Peer::address) else {
            return false;
        };
        if self.active_peers >= self.config.max_peers_torrent || !self.budget.try_acquire() {
            return false;
        }

        let conn = self.transport.connect(addr, self.config.connect_timeout);
        self.transition(key, Some(PeerState::Connecting { conn }));
        debug!(target: CONN, peer = %self.peer_name(key), %key, %conn, "connecting");
        true
    }

    fn next_candidate(&self) -> Option<PeerKey> {
        if let Some(&key) = self.inactive.front() {
            return Some(key);
        }

        let now = Instant::now();
        let retry = self.config.retry_interval;
        let ready = |key: &&PeerKey| {
            self.peer(**key)
                .and_then(|peer| peer.fail_time)
                .map_or(true, |at| now.saturating_duration_since(at) >= retry)
        };
        self.connect_failed
            .front()
            .filter(ready)
            .or_else(|| self.disconnected.front().filter(ready))
            .copied()
    }
}
