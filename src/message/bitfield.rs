/// Piece availability as sent in a BITFIELD message, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    data: Vec<u8>,
    num_pieces: u32,
}

impl Bitfield {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            data: vec![0; Self::byte_len(num_pieces)],
            num_pieces,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, num_pieces: u32) -> Self {
        Self {
            data: bytes,
            num_pieces,
        }
    }

    /// Number of bytes a bitfield for `num_pieces` takes on the wire.
    pub fn byte_len(num_pieces: u32) -> usize {
        (num_pieces as usize).div_ceil(8)
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = index as usize / 8;
        let bit_index = index % 8;

        if index >= self.num_pieces || byte_index >= self.data.len() {
            return false;
        }

        // Big endian bit ordering
        self.data[byte_index] & (0x80 >> bit_index) != 0
    }

    pub fn set_piece(&mut self, index: u32) {
        if index >= self.num_pieces {
            return;
        }
        let byte_index = index as usize / 8;
        if byte_index >= self.data.len() {
            self.data.resize(byte_index + 1, 0);
        }
        self.data[byte_index] |= 0x80 >> (index % 8);
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_pieces).filter(|&index| self.has_piece(index))
    }

    pub fn count(&self) -> u32 {
        self.iter().count() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
