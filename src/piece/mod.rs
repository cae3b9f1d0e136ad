use crate::message::PieceIndex;

mod store;
mod verify;

pub use store::{Block, BlockKey, Piece, PieceStore, StoreError, StoredBlock};
pub use verify::{piece_hash, verify_piece};

// 16 KB standard block size from https://wiki.theory.org/BitTorrentSpecification#Peer_wire_protocol_.28TCP.29
pub const BLOCK_SIZE: u32 = 16384;

/// A byte range inside a piece, the unit requested over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: PieceIndex, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    pub fn matches(&self, piece_index: PieceIndex, offset: u32, length: u32) -> bool {
        self.piece_index == piece_index && self.offset == offset && self.length == length
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:#x}+{:#x}", self.piece_index, self.offset, self.length)
    }
}
