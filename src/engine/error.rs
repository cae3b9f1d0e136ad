use crate::message::{DecodeError, HandshakeError, PieceIndex};
use crate::peer::PeerKey;
use crate::piece::{BlockInfo, StoreError};

use super::RequestKey;

/// Reasons a peer gets disconnected for misbehaving.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("bad handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("bitfield is {got} bytes, expected {expected}")]
    BadBitfieldLength { got: usize, expected: usize },

    #[error("piece index {index} out of range, torrent has {num_pieces}")]
    PieceIndexOutOfRange { index: PieceIndex, num_pieces: u32 },

    #[error("request {index}:{begin:#x}+{length:#x} out of range")]
    RequestOutOfRange {
        index: PieceIndex,
        begin: u32,
        length: u32,
    },

    #[error("request {expected} answered with {got} bytes")]
    BlockLengthMismatch { expected: BlockInfo, got: usize },

    #[error("data received in state {0}")]
    NotRunning(&'static str),

    #[error("message {0:#x} needs the fast extension")]
    FastExtensionRequired(u8),
}

/// Misuse of the engine API, typically by a scheduler holding stale handles.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerKey),

    #[error("peer {0} is not running")]
    PeerNotRunning(PeerKey),

    #[error("unknown block")]
    UnknownBlock,

    #[error("unknown request {0:?}")]
    UnknownRequest(RequestKey),

    #[error("piece {0} out of range")]
    UnknownPiece(PieceIndex),

    #[error("piece {0} is still missing blocks")]
    PieceIncomplete(PieceIndex),

    #[error("piece {0} is already verified")]
    PieceAlreadyVerified(PieceIndex),

    #[error(transparent)]
    Store(#[from] StoreError),
}
