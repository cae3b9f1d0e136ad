#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use peerwire::config::{EngineConfig, PeerBudget};
use peerwire::engine::Engine;
use peerwire::message::{Handshake, MessageCodec, PeerMessage, HANDSHAKE_LEN};
use peerwire::peer::{PeerId, PeerKey};
use peerwire::transport::{ConnId, Transport};
use tokio::time::Instant;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

pub const INFO_HASH: [u8; 20] = [0xaa; 20];
pub const REMOTE_ID: [u8; 20] = *b"-XX0001-remote-peer!";

/// Captures everything the engine asks of the network.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    next: u64,
    pub connects: Vec<(ConnId, SocketAddr)>,
    pub sent: Vec<(ConnId, Bytes)>,
    pub timeouts: HashMap<ConnId, Instant>,
    pub closed: Vec<ConnId>,
}

impl RecordingTransport {
    pub fn last_conn(&self) -> ConnId {
        self.connects.last().expect("no connection attempt").0
    }

    /// Raw bytes sent on `conn` since the last call.
    pub fn take_bytes(&mut self, conn: ConnId) -> Vec<u8> {
        let mut out = Vec::new();
        self.sent.retain(|(c, data)| {
            if *c == conn {
                out.extend_from_slice(data);
                false
            } else {
                true
            }
        });
        out
    }

    /// Messages sent on `conn` since the last call. A leading handshake is
    /// skipped.
    pub fn take_messages(&mut self, conn: ConnId) -> Vec<PeerMessage> {
        let bytes = self.take_bytes(conn);
        let mut buf = BytesMut::from(&bytes[..]);
        if buf.len() >= HANDSHAKE_LEN && buf[0] == 19 && &buf[1..20] == b"BitTorrent protocol" {
            let _ = buf.split_to(HANDSHAKE_LEN);
        }
        let mut codec = MessageCodec::default();
        let mut messages = Vec::new();
        while let Some(message) = codec.decode(&mut buf).expect("engine sent a bad frame") {
            messages.push(message);
        }
        assert!(buf.is_empty(), "trailing partial frame");
        messages
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

impl Transport for RecordingTransport {
    fn connect(&mut self, addr: SocketAddr, _timeout: Duration) -> ConnId {
        self.next += 1;
        let conn = ConnId(self.next);
        self.connects.push((conn, addr));
        conn
    }

    fn send(&mut self, conn: ConnId, data: Bytes, _more: bool) {
        self.sent.push((conn, data));
    }

    fn set_timeout(&mut self, conn: ConnId, deadline: Instant) {
        self.timeouts.insert(conn, deadline);
    }

    fn close(&mut self, conn: ConnId) {
        self.timeouts.remove(&conn);
        self.closed.push(conn);
    }
}

pub type TestEngine = Engine<RecordingTransport>;

pub fn engine(num_pieces: u32) -> TestEngine {
    engine_with(EngineConfig::default(), num_pieces)
}

pub fn engine_with(config: EngineConfig, num_pieces: u32) -> TestEngine {
    Engine::new(
        INFO_HASH,
        PeerId(*b"-PW0100-localpeer123"),
        num_pieces,
        config,
        RecordingTransport::default(),
        PeerBudget::unlimited(),
    )
}

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 6881))
}

pub fn remote_handshake(fast: bool) -> Vec<u8> {
    let mut handshake = Handshake::new(INFO_HASH, REMOTE_ID);
    if !fast {
        handshake.reserved = [0; 8];
    }
    handshake.to_bytes().to_vec()
}

/// Adds a peer and walks it through connect and handshake.
pub fn running_peer(engine: &mut TestEngine, n: u8, fast: bool) -> (PeerKey, ConnId) {
    let key = engine.add_peer(addr(n));
    let conn = engine.transport().last_conn();
    engine.on_connected(conn);
    engine.on_readable(conn, &remote_handshake(fast));
    assert_eq!(engine.state_text(key), "Running");
    engine.transport_mut().take_bytes(conn);
    (key, conn)
}

pub fn feed(engine: &mut TestEngine, conn: ConnId, messages: &[PeerMessage]) {
    let mut buf = BytesMut::new();
    for message in messages {
        message.encode_into(&mut buf);
    }
    engine.on_readable(conn, &buf);
}

pub fn piece_msg(index: u32, begin: u32, len: usize) -> PeerMessage {
    PeerMessage::Piece {
        index,
        begin,
        block: Bytes::from(vec![index as u8; len]),
    }
}
