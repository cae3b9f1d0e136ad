use std::collections::{BTreeMap, VecDeque};

use slab::Slab;

use super::{BlockInfo, BLOCK_SIZE};
use crate::engine::RequestKey;
use crate::message::PieceIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(usize);

/// A block that has not been received yet.
///
/// `requests` is a lookup list only: the requests themselves belong to the
/// peers that sent them.
#[derive(Debug)]
pub struct Block {
    info: BlockInfo,
    requests: Vec<RequestKey>,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        self.info
    }

    pub fn requests(&self) -> &[RequestKey] {
        &self.requests
    }
}

#[derive(Debug)]
pub struct Piece {
    index: PieceIndex,
    length: u32,
    expected_hash: Option<[u8; 20]>,
    hash_ok: bool,
    data: Vec<u8>,
    waiting: VecDeque<BlockKey>,
    sent: Vec<BlockKey>,
    num_blocks: u32,
    received: u32,
}

impl Piece {
    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn expected_hash(&self) -> Option<&[u8; 20]> {
        self.expected_hash.as_ref()
    }

    pub fn hash_ok(&self) -> bool {
        self.hash_ok
    }

    /// Blocks nobody has asked for, in request order.
    pub fn waiting(&self) -> impl Iterator<Item = BlockKey> + '_ {
        self.waiting.iter().copied()
    }

    /// Blocks with at least one request in flight.
    pub fn sent(&self) -> &[BlockKey] {
        &self.sent
    }

    pub fn has_outstanding_blocks(&self) -> bool {
        !self.waiting.is_empty() || !self.sent.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.num_blocks
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("piece {0} is already active")]
    AlreadyActive(PieceIndex),

    #[error("piece {0} has zero length")]
    EmptyPiece(PieceIndex),

    #[error("piece {0} does not fit in memory")]
    PieceTooLarge(PieceIndex),

    #[error("piece {0} is not active")]
    UnknownPiece(PieceIndex),

    #[error("unknown block")]
    UnknownBlock,

    #[error("block {info} got {got} bytes")]
    LengthMismatch { info: BlockInfo, got: usize },
}

/// Result of writing one block into its piece.
#[derive(Debug)]
pub struct StoredBlock {
    pub info: BlockInfo,
    /// Other requests that were still pointing at the block.
    pub orphaned: Vec<RequestKey>,
    pub piece_complete: bool,
}

/// The active piece set with its blocks.
#[derive(Debug, Default)]
pub struct PieceStore {
    pieces: BTreeMap<PieceIndex, Piece>,
    blocks: Slab<Block>,
}

impl PieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a piece downloadable: it is split into blocks which all start
    /// out on the waiting list.
    pub fn activate(
        &mut self,
        index: PieceIndex,
        length: u32,
        expected_hash: Option<[u8; 20]>,
    ) -> Result<(), StoreError> {
        if self.pieces.contains_key(&index) {
            return Err(StoreError::AlreadyActive(index));
        }
        if length == 0 {
            return Err(StoreError::EmptyPiece(index));
        }

        let mut piece = Piece {
            index,
            length,
            expected_hash,
            hash_ok: false,
            data: vec![0; length as usize],
            waiting: VecDeque::new(),
            sent: Vec::new(),
            num_blocks: 0,
            received: 0,
        };
        split_blocks(&mut self.blocks, &mut piece);
        self.pieces.insert(index, piece);
        Ok(())
    }

    /// Installs a piece whose data we already hold. It starts out verified
    /// and has no blocks to fetch.
    pub fn seed(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), StoreError> {
        if self.pieces.contains_key(&index) {
            return Err(StoreError::AlreadyActive(index));
        }
        let length = u32::try_from(data.len()).map_err(|_| StoreError::PieceTooLarge(index))?;
        if length == 0 {
            return Err(StoreError::EmptyPiece(index));
        }

        self.pieces.insert(
            index,
            Piece {
                index,
                length,
                expected_hash: None,
                hash_ok: true,
                data: data.to_vec(),
                waiting: VecDeque::new(),
                sent: Vec::new(),
                num_blocks: 0,
                received: 0,
            },
        );
        Ok(())
    }

    /// Drops a piece. Returns the requests that pointed at its blocks.
    pub fn deactivate(&mut self, index: PieceIndex) -> Vec<RequestKey> {
        let Some(piece) = self.pieces.remove(&index) else {
            return Vec::new();
        };

        piece
            .waiting
            .iter()
            .chain(piece.sent.iter())
            .filter_map(|key| self.blocks.try_remove(key.0))
            .flat_map(|block| block.requests)
            .collect()
    }

    pub fn piece(&self, index: PieceIndex) -> Option<&Piece> {
        self.pieces.get(&index)
    }

    pub fn pieces(&self) -> impl Iterator<Item = &Piece> {
        self.pieces.values()
    }

    pub fn block(&self, key: BlockKey) -> Option<&Block> {
        self.blocks.get(key.0)
    }

    /// Links a request to a block, moving the block to its piece's sent list.
    pub fn attach(&mut self, key: BlockKey, request: RequestKey) -> Result<BlockInfo, StoreError> {
        let block = self.blocks.get_mut(key.0).ok_or(StoreError::UnknownBlock)?;
        block.requests.push(request);
        let info = block.info;

        if block.requests.len() == 1 {
            if let Some(piece) = self.pieces.get_mut(&info.piece_index) {
                piece.waiting.retain(|k| *k != key);
                piece.sent.push(key);
            }
        }
        Ok(info)
    }

    /// Unlinks a request from a block. A block nobody asks for any more goes
    /// back to the head of the waiting list; returns `true` when that happened.
    pub fn detach(&mut self, key: BlockKey, request: RequestKey) -> bool {
        let Some(block) = self.blocks.get_mut(key.0) else {
            return false;
        };
        block.requests.retain(|r| *r != request);
        if !block.requests.is_empty() {
            return false;
        }

        let Some(piece) = self.pieces.get_mut(&block.info.piece_index) else {
            return false;
        };
        let before = piece.sent.len();
        piece.sent.retain(|k| *k != key);
        if piece.sent.len() == before {
            return false;
        }
        piece.waiting.push_front(key);
        true
    }

    /// Writes a received block into its piece and frees the block.
    pub fn store(
        &mut self,
        key: BlockKey,
        delivered_by: RequestKey,
        data: &[u8],
    ) -> Result<StoredBlock, StoreError> {
        let info = self.blocks.get(key.0).ok_or(StoreError::UnknownBlock)?.info;
        if data.len() != info.length as usize {
            return Err(StoreError::LengthMismatch {
                info,
                got: data.len(),
            });
        }
        let piece = self
            .pieces
            .get_mut(&info.piece_index)
            .ok_or(StoreError::UnknownPiece(info.piece_index))?;

        let start = info.offset as usize;
        piece.data[start..start + data.len()].copy_from_slice(data);
        piece.sent.retain(|k| *k != key);
        piece.waiting.retain(|k| *k != key);
        piece.received += 1;
        let piece_complete = piece.is_complete();

        let orphaned = self
            .blocks
            .try_remove(key.0)
            .map(|block| {
                block
                    .requests
                    .into_iter()
                    .filter(|r| *r != delivered_by)
                    .collect()
            })
            .unwrap_or_default();

        Ok(StoredBlock {
            info,
            orphaned,
            piece_complete,
        })
    }

    pub fn mark_verified(&mut self, index: PieceIndex) -> bool {
        match self.pieces.get_mut(&index) {
            Some(piece) => {
                piece.hash_ok = true;
                true
            }
            None => false,
        }
    }

    /// Starts a piece over after a failed hash check.
    pub fn reset(&mut self, index: PieceIndex) -> Vec<RequestKey> {
        let Some(piece) = self.pieces.get_mut(&index) else {
            return Vec::new();
        };

        let stale: Vec<RequestKey> = piece
            .waiting
            .drain(..)
            .chain(piece.sent.drain(..))
            .filter_map(|key| self.blocks.try_remove(key.0))
            .flat_map(|block| block.requests)
            .collect();

        piece.hash_ok = false;
        piece.data.iter_mut().for_each(|b| *b = 0);
        split_blocks(&mut self.blocks, piece);
        stale
    }

    /// Verified data for serving a REQUEST.
    pub fn read(&self, index: PieceIndex, offset: u32, length: u32) -> Option<&[u8]> {
        let piece = self.pieces.get(&index).filter(|p| p.hash_ok)?;
        let start = offset as usize;
        let end = start.checked_add(length as usize)?;
        piece.data.get(start..end)
    }
}

fn split_blocks(blocks: &mut Slab<Block>, piece: &mut Piece) {
    let mut offset = 0;
    let mut count = 0;
    while offset < piece.length {
        let length = BLOCK_SIZE.min(piece.length - offset);
        let key = blocks.insert(Block {
            info: BlockInfo::new(piece.index, offset, length),
            requests: Vec::new(),
        });
        piece.waiting.push_back(BlockKey(key));
        offset += length;
        count += 1;
    }
    piece.num_blocks = count;
    piece.received = 0;
}
