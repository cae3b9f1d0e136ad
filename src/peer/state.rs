use std::fmt;

use tokio::time::Instant;
use tokio_util::bytes::BytesMut;

use super::PieceFlags;
use crate::engine::RequestKey;
use crate::transport::ConnId;

/// The classic flow-control matrix. A fresh connection starts choked and
/// uninterested in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Everything that only exists while the handshake is done and the
/// connection is up.
#[derive(Debug)]
pub struct Session {
    pub(crate) conn: ConnId,
    pub(crate) remote_id: [u8; 20],
    pub(crate) fast_ext: bool,
    pub(crate) flow: FlowControl,
    pub(crate) piece_flags: Option<PieceFlags>,
    pub(crate) requests: Vec<RequestKey>,
    pub(crate) inbound: BytesMut,
    pub(crate) keepalive_at: Instant,
}

impl Session {
    pub(crate) fn new(
        conn: ConnId,
        remote_id: [u8; 20],
        fast_ext: bool,
        inbound: BytesMut,
        keepalive_at: Instant,
    ) -> Self {
        Self {
            conn,
            remote_id,
            fast_ext,
            flow: FlowControl::default(),
            piece_flags: None,
            requests: Vec::new(),
            inbound,
            keepalive_at,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn remote_id(&self) -> &[u8; 20] {
        &self.remote_id
    }

    pub fn fast_extension(&self) -> bool {
        self.fast_ext
    }

    pub fn flow(&self) -> FlowControl {
        self.flow
    }

    pub fn piece_flags(&self) -> Option<&PieceFlags> {
        self.piece_flags.as_ref()
    }

    /// Outstanding requests, oldest first.
    pub fn requests(&self) -> &[RequestKey] {
        &self.requests
    }

    pub fn active_requests(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn flags_mut(&mut self, num_pieces: u32) -> &mut PieceFlags {
        self.piece_flags
            .get_or_insert_with(|| PieceFlags::new(num_pieces))
    }
}

/// Lifecycle of one peer. `Destroyed` is not a variant: a destroyed peer
/// is removed from the engine altogether.
#[derive(Debug)]
pub enum PeerState {
    Inactive,
    Connecting {
        conn: ConnId,
    },
    ConnectFail,
    WaitHandshake {
        conn: ConnId,
        inbound: BytesMut,
        keepalive_at: Instant,
    },
    Running(Box<Session>),
    Disconnected,
}

impl PeerState {
    pub fn kind(&self) -> StateKind {
        match self {
            PeerState::Inactive => StateKind::Inactive,
            PeerState::Connecting { .. } => StateKind::Connecting,
            PeerState::ConnectFail => StateKind::ConnectFail,
            PeerState::WaitHandshake { .. } => StateKind::WaitHandshake,
            PeerState::Running(_) => StateKind::Running,
            PeerState::Disconnected => StateKind::Disconnected,
        }
    }

    pub fn conn(&self) -> Option<ConnId> {
        match self {
            PeerState::Connecting { conn } | PeerState::WaitHandshake { conn, .. } => Some(*conn),
            PeerState::Running(session) => Some(session.conn),
            _ => None,
        }
    }

    /// States that occupy a connection slot in the peer budgets.
    pub fn holds_slot(&self) -> bool {
        self.conn().is_some()
    }

    pub fn keepalive_at(&self) -> Option<Instant> {
        match self {
            PeerState::WaitHandshake { keepalive_at, .. } => Some(*keepalive_at),
            PeerState::Running(session) => Some(session.keepalive_at),
            _ => None,
        }
    }

    /// Pushes the keep-alive deadline out after something was sent.
    /// Returns the connection to send on, if the state has one that may carry data.
    pub(crate) fn arm_keepalive(&mut self, deadline: Instant) -> Option<ConnId> {
        match self {
            PeerState::WaitHandshake {
                conn, keepalive_at, ..
            } => {
                *keepalive_at = deadline;
                Some(*conn)
            }
            PeerState::Running(session) => {
                session.keepalive_at = deadline;
                Some(session.conn)
            }
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            PeerState::Running(session) => Some(session),
            _ => None,
        }
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            PeerState::Running(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Inactive,
    Connecting,
    ConnectFail,
    WaitHandshake,
    Running,
    Disconnected,
    Destroyed,
}

impl StateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StateKind::Inactive => "Inactive",
            StateKind::Connecting => "Connecting",
            StateKind::ConnectFail => "Connect fail",
            StateKind::WaitHandshake => "Wait Handshake",
            StateKind::Running => "Running",
            StateKind::Disconnected => "Disconnected",
            StateKind::Destroyed => "Destroyed",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
