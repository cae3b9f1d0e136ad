//! Tokio TCP implementation of [`Transport`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::trace;

use crate::transport::{ConnId, Transport, TransportError};

mod driver;

pub use driver::run;

/// What a connection task reports back to the event loop.
#[derive(Debug)]
pub enum NetEvent {
    Connected(ConnId),
    Data(ConnId, Bytes),
    Error(ConnId, TransportError),
}

pub type NetReceiver = mpsc::UnboundedReceiver<NetEvent>;

struct Connection {
    outbound: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// One task per connection. Reads are forwarded as [`NetEvent`]s, writes
/// go through an unbounded queue so `send` never blocks the event loop.
pub struct TcpTransport {
    next_id: u64,
    conns: HashMap<ConnId, Connection>,
    deadlines: HashMap<ConnId, Instant>,
    events: mpsc::UnboundedSender<NetEvent>,
}

impl TcpTransport {
    pub fn new() -> (Self, NetReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            next_id: 1,
            conns: HashMap::new(),
            deadlines: HashMap::new(),
            events,
        };
        (transport, rx)
    }

    /// Connections whose read deadline has passed. Their deadlines are
    /// cleared.
    pub fn expired(&mut self, now: Instant) -> Vec<ConnId> {
        let expired: Vec<ConnId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in &expired {
            self.deadlines.remove(conn);
        }
        expired
    }

    pub fn open_connections(&self) -> usize {
        self.conns.len()
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> ConnId {
        let conn = ConnId(self.next_id);
        self.next_id += 1;

        let (outbound, rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            if let Err(error) = run_connection(conn, addr, timeout, rx, &events).await {
                let _ = events.send(NetEvent::Error(conn, error));
            }
        });
        self.conns.insert(conn, Connection { outbound, task });
        conn
    }

    fn send(&mut self, conn: ConnId, data: Bytes, _more: bool) {
        if let Some(connection) = self.conns.get(&conn) {
            let _ = connection.outbound.send(data);
        }
    }

    fn set_timeout(&mut self, conn: ConnId, deadline: Instant) {
        if self.conns.contains_key(&conn) {
            self.deadlines.insert(conn, deadline);
        }
    }

    fn close(&mut self, conn: ConnId) {
        self.deadlines.remove(&conn);
        if let Some(connection) = self.conns.remove(&conn) {
            connection.task.abort();
            trace!(%conn, "closed");
        }
    }
}

async fn run_connection(
    conn: ConnId,
    addr: SocketAddr,
    timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: &mpsc::UnboundedSender<NetEvent>,
) -> Result<(), TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => return Err(TransportError::Connect(error.to_string())),
        Err(_) => return Err(TransportError::Timeout),
    };
    stream.set_nodelay(true)?;
    let _ = events.send(NetEvent::Connected(conn));

    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, BytesCodec::new());
    let mut writer = FramedWrite::new(writer, BytesCodec::new());

    loop {
        tokio::select! {
            read = reader.next() => match read {
                Some(Ok(data)) => {
                    if events.send(NetEvent::Data(conn, data.freeze())).is_err() {
                        return Ok(());
                    }
                }
                Some(Err(error)) => return Err(error.into()),
                None => return Err(TransportError::Closed),
            },
            data = outbound.recv() => match data {
                Some(data) => writer.send(data).await?,
                None => return Ok(()),
            },
        }
    }
}
