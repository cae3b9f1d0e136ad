use crate::message::PieceIndex;

pub const PIECE_HAVE: u8 = 0x1;
pub const PIECE_REJECTED: u8 = 0x2;

/// Per-piece flags for one remote peer.
///
/// Only allocated once the peer tells us something about its pieces
/// (HAVE, BITFIELD, HAVE_ALL) or rejects a request.
#[derive(Debug, Clone)]
pub struct PieceFlags {
    flags: Vec<u8>,
    have: u32,
}

impl PieceFlags {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            flags: vec![0; num_pieces as usize],
            have: 0,
        }
    }

    /// Returns `true` if the piece was not already marked.
    pub fn set_have(&mut self, index: PieceIndex) -> bool {
        match self.flags.get_mut(index as usize) {
            Some(flags) if *flags & PIECE_HAVE == 0 => {
                *flags |= PIECE_HAVE;
                self.have += 1;
                true
            }
            _ => false,
        }
    }

    pub fn set_all_have(&mut self) {
        self.flags.iter_mut().for_each(|flags| *flags |= PIECE_HAVE);
        self.have = self.flags.len() as u32;
    }

    pub fn set_rejected(&mut self, index: PieceIndex) {
        if let Some(flags) = self.flags.get_mut(index as usize) {
            *flags |= PIECE_REJECTED;
        }
    }

    pub fn get(&self, index: PieceIndex) -> u8 {
        self.flags.get(index as usize).copied().unwrap_or(0)
    }

    pub fn has(&self, index: PieceIndex) -> bool {
        self.get(index) & PIECE_HAVE != 0
    }

    pub fn is_rejected(&self, index: PieceIndex) -> bool {
        self.get(index) & PIECE_REJECTED != 0
    }

    pub fn have_count(&self) -> u32 {
        self.have
    }
}
