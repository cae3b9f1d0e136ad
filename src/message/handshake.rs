use tokio_util::bytes::{Buf, BytesMut};

const PROTOCOL_IDENTIFIER_LENGTH: u8 = 19;
pub const PROTOCOL_IDENTIFIER: [u8; 19] = *b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

// reserved[7] & 0x04, BEP 6
const FAST_EXTENSION_BIT: u8 = 0x04;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("wrong protocol")]
    Protocol,

    #[error("invalid info hash")]
    InfoHash,
}

/// The fixed 68 byte preamble exchanged once in each direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Our own handshake, advertising the fast extension.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0; 8];
        reserved[7] |= FAST_EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_EXTENSION_BIT != 0
    }

    pub fn to_bytes(self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PROTOCOL_IDENTIFIER_LENGTH;
        bytes[1..20].copy_from_slice(&PROTOCOL_IDENTIFIER);
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Takes one handshake off the front of `src`.
    ///
    /// Returns `Ok(None)` until all 68 bytes are buffered. The 68 bytes are
    /// consumed even when the protocol string turns out to be wrong; the
    /// connection is useless at that point anyway.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, HandshakeError> {
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let raw = src.split_to(HANDSHAKE_LEN);
        if raw[0] != PROTOCOL_IDENTIFIER_LENGTH || raw[1..20] != PROTOCOL_IDENTIFIER {
            return Err(HandshakeError::Protocol);
        }

        let mut rest = &raw[20..];
        let mut reserved = [0u8; 8];
        let mut info_hash = [0u8; 20];
        let mut peer_id = [0u8; 20];
        rest.copy_to_slice(&mut reserved);
        rest.copy_to_slice(&mut info_hash);
        rest.copy_to_slice(&mut peer_id);

        Ok(Some(Self {
            reserved,
            info_hash,
            peer_id,
        }))
    }

    /// Decodes and checks the info hash against the torrent we expect.
    pub fn decode_for(
        src: &mut BytesMut,
        info_hash: &[u8; 20],
    ) -> Result<Option<Self>, HandshakeError> {
        match Self::decode(src)? {
            Some(handshake) if handshake.info_hash != *info_hash => Err(HandshakeError::InfoHash),
            other => Ok(other),
        }
    }
}
