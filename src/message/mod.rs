mod bitfield;
mod codec;
mod handshake;

pub use bitfield::Bitfield;
pub use codec::{DecodeError, MessageCodec, MAX_MESSAGE_LEN};
pub use handshake::{Handshake, HandshakeError, HANDSHAKE_LEN, PROTOCOL_IDENTIFIER};

use tokio_util::bytes::{BufMut, Bytes, BytesMut};

pub type PieceIndex = u32;

pub const MSG_CHOKE: u8 = 0x0;
pub const MSG_UNCHOKE: u8 = 0x1;
pub const MSG_INTERESTED: u8 = 0x2;
pub const MSG_NOT_INTERESTED: u8 = 0x3;
pub const MSG_HAVE: u8 = 0x4;
pub const MSG_BITFIELD: u8 = 0x5;
pub const MSG_REQUEST: u8 = 0x6;
pub const MSG_PIECE: u8 = 0x7;
pub const MSG_CANCEL: u8 = 0x8;
pub const MSG_PORT: u8 = 0x9;
pub const MSG_HAVE_ALL: u8 = 0xe;
pub const MSG_HAVE_NONE: u8 = 0xf;
pub const MSG_REJECT: u8 = 0x10;
pub const MSG_ALLOWED_FAST: u8 = 0x11;

/// A single peer wire message, everything after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bytes),
    Request {
        index: PieceIndex,
        begin: u32,
        length: u32,
    },
    Piece {
        index: PieceIndex,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: PieceIndex,
        begin: u32,
        length: u32,
    },
    Port(u16),
    // Fast extension (BEP 6)
    HaveAll,
    HaveNone,
    Reject {
        index: PieceIndex,
        begin: u32,
        length: u32,
    },
    AllowedFast(PieceIndex),
    /// Anything we don't understand. Kept so the stream stays in sync.
    Unknown {
        id: u8,
        payload: Bytes,
    },
}

impl PeerMessage {
    pub fn message_id(&self) -> Option<u8> {
        match self {
            PeerMessage::KeepAlive => None, // KeepAlive has no ID
            PeerMessage::Choke => Some(MSG_CHOKE),
            PeerMessage::Unchoke => Some(MSG_UNCHOKE),
            PeerMessage::Interested => Some(MSG_INTERESTED),
            PeerMessage::NotInterested => Some(MSG_NOT_INTERESTED),
            PeerMessage::Have(_) => Some(MSG_HAVE),
            PeerMessage::Bitfield(_) => Some(MSG_BITFIELD),
            PeerMessage::Request { .. } => Some(MSG_REQUEST),
            PeerMessage::Piece { .. } => Some(MSG_PIECE),
            PeerMessage::Cancel { .. } => Some(MSG_CANCEL),
            PeerMessage::Port(_) => Some(MSG_PORT),
            PeerMessage::HaveAll => Some(MSG_HAVE_ALL),
            PeerMessage::HaveNone => Some(MSG_HAVE_NONE),
            PeerMessage::Reject { .. } => Some(MSG_REJECT),
            PeerMessage::AllowedFast(_) => Some(MSG_ALLOWED_FAST),
            PeerMessage::Unknown { id, .. } => Some(*id),
        }
    }

    /// Messages that are only legal once both sides advertised the fast extension.
    pub fn requires_fast_extension(&self) -> bool {
        matches!(
            self,
            PeerMessage::HaveAll
                | PeerMessage::HaveNone
                | PeerMessage::Reject { .. }
                | PeerMessage::AllowedFast(_)
        )
    }

    /// Appends the exact wire layout of this message to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        match self {
            PeerMessage::KeepAlive => dst.put_u32(0),
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::HaveAll
            | PeerMessage::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(self.message_id().unwrap_or_default());
            }
            PeerMessage::Have(index) | PeerMessage::AllowedFast(index) => {
                dst.put_u32(5);
                dst.put_u8(self.message_id().unwrap_or_default());
                dst.put_u32(*index);
            }
            PeerMessage::Bitfield(bits) => {
                dst.put_u32(1 + bits.len() as u32);
                dst.put_u8(MSG_BITFIELD);
                dst.extend_from_slice(bits);
            }
            // <len=0013><id><index><begin><length>
            PeerMessage::Request {
                index,
                begin,
                length,
            }
            | PeerMessage::Cancel {
                index,
                begin,
                length,
            }
            | PeerMessage::Reject {
                index,
                begin,
                length,
            } => {
                dst.put_u32(13);
                dst.put_u8(self.message_id().unwrap_or_default());
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(9 + block.len() as u32);
                dst.put_u8(MSG_PIECE);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.extend_from_slice(block);
            }
            PeerMessage::Port(port) => {
                dst.put_u32(3);
                dst.put_u8(MSG_PORT);
                dst.put_u16(*port);
            }
            PeerMessage::Unknown { id, payload } => {
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(*id);
                dst.extend_from_slice(payload);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Full frame size including the 4 byte length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            PeerMessage::KeepAlive => 0,
            PeerMessage::Have(_) | PeerMessage::AllowedFast(_) => 5,
            PeerMessage::Bitfield(bits) => 1 + bits.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } | PeerMessage::Reject { .. } => {
                13
            }
            PeerMessage::Piece { block, .. } => 9 + block.len(),
            PeerMessage::Port(_) => 3,
            PeerMessage::Unknown { payload, .. } => 1 + payload.len(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_cancel_share_layout() {
        let request = PeerMessage::Request {
            index: 1,
            begin: 0x4000,
            length: 0x4000,
        }
        .to_bytes();
        let cancel = PeerMessage::Cancel {
            index: 1,
            begin: 0x4000,
            length: 0x4000,
        }
        .to_bytes();

        assert_eq!(request.len(), 17);
        assert_eq!(&request[..4], &[0, 0, 0, 13]);
        assert_eq!(request[4], MSG_REQUEST);
        assert_eq!(cancel[4], MSG_CANCEL);
        assert_eq!(request[5..], cancel[5..]);
        assert_eq!(&request[5..], &[0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]);
    }

    #[test]
    fn piece_frame_layout() {
        let bytes = PeerMessage::Piece {
            index: 7,
            begin: 16,
            block: Bytes::from_static(b"abc"),
        }
        .to_bytes();
        assert_eq!(
            &bytes[..],
            &[0, 0, 0, 12, 7, 0, 0, 0, 7, 0, 0, 0, 16, b'a', b'b', b'c']
        );
    }

    #[test]
    fn encoded_len_matches_output() {
        let messages = [
            PeerMessage::KeepAlive,
            PeerMessage::HaveNone,
            PeerMessage::Have(3),
            PeerMessage::Port(6881),
            PeerMessage::Bitfield(Bytes::from_static(&[0xff, 0x80])),
        ];
        for message in messages {
            assert_eq!(message.to_bytes().len(), message.encoded_len(), "{message:?}");
        }
    }

    #[test]
    fn fast_extension_messages() {
        assert!(PeerMessage::HaveAll.requires_fast_extension());
        assert!(PeerMessage::AllowedFast(2).requires_fast_extension());
        assert!(!PeerMessage::Have(2).requires_fast_extension());
        assert!(!PeerMessage::Choke.requires_fast_extension());
    }
}
