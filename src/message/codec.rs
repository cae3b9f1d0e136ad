use std::io;

use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::*;

// Anything bigger than this is a broken or hostile peer
pub const MAX_MESSAGE_LEN: usize = 0x100000;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message length {len} exceeds maximum allowed size {max}")]
    TooLarge { len: usize, max: usize },

    #[error("invalid payload length {len} for message id {id:#x}")]
    BadLength { id: u8, len: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Length-prefixed framing for [`PeerMessage`].
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_len: usize,
}

impl MessageCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_LEN)
    }
}

impl Decoder for MessageCodec {
    type Item = PeerMessage;

    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Length prefix is 4 bytes
            return Ok(None);
        }

        // Peek, nothing is consumed until the whole frame is buffered
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_len {
            return Err(DecodeError::TooLarge {
                len: length,
                max: self.max_len,
            });
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        if length == 0 {
            return Ok(Some(PeerMessage::KeepAlive));
        }

        let mut body = src.split_to(length).freeze();
        let id = body.get_u8();
        parse_body(id, body).map(Some)
    }
}

impl Encoder<PeerMessage> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}

fn expect_len(id: u8, body: &Bytes, len: usize) -> Result<(), DecodeError> {
    if body.len() != len {
        return Err(DecodeError::BadLength {
            id,
            len: body.len(),
        });
    }
    Ok(())
}

fn parse_triple(id: u8, body: &mut Bytes) -> Result<(u32, u32, u32), DecodeError> {
    expect_len(id, body, 12)?;
    let index = body.get_u32();
    let begin = body.get_u32();
    let length = body.get_u32();
    Ok((index, begin, length))
}

fn parse_body(id: u8, mut body: Bytes) -> Result<PeerMessage, DecodeError> {
    let message = match id {
        MSG_CHOKE | MSG_UNCHOKE | MSG_INTERESTED | MSG_NOT_INTERESTED | MSG_HAVE_ALL
        | MSG_HAVE_NONE => {
            expect_len(id, &body, 0)?;
            match id {
                MSG_CHOKE => PeerMessage::Choke,
                MSG_UNCHOKE => PeerMessage::Unchoke,
                MSG_INTERESTED => PeerMessage::Interested,
                MSG_NOT_INTERESTED => PeerMessage::NotInterested,
                MSG_HAVE_ALL => PeerMessage::HaveAll,
                _ => PeerMessage::HaveNone,
            }
        }
        MSG_HAVE => {
            expect_len(id, &body, 4)?;
            PeerMessage::Have(body.get_u32())
        }
        MSG_ALLOWED_FAST => {
            expect_len(id, &body, 4)?;
            PeerMessage::AllowedFast(body.get_u32())
        }
        MSG_BITFIELD => PeerMessage::Bitfield(body),
        MSG_REQUEST => {
            let (index, begin, length) = parse_triple(id, &mut body)?;
            PeerMessage::Request {
                index,
                begin,
                length,
            }
        }
        MSG_CANCEL => {
            let (index, begin, length) = parse_triple(id, &mut body)?;
            PeerMessage::Cancel {
                index,
                begin,
                length,
            }
        }
        MSG_REJECT => {
            let (index, begin, length) = parse_triple(id, &mut body)?;
            PeerMessage::Reject {
                index,
                begin,
                length,
            }
        }
        MSG_PIECE => {
            if body.len() < 8 {
                return Err(DecodeError::BadLength {
                    id,
                    len: body.len(),
                });
            }
            let index = body.get_u32();
            let begin = body.get_u32();
            PeerMessage::Piece {
                index,
                begin,
                block: body,
            }
        }
        MSG_PORT => {
            expect_len(id, &body, 2)?;
            PeerMessage::Port(body.get_u16())
        }
        _ => PeerMessage::Unknown { id, payload: body },
    };

    Ok(message)
}
