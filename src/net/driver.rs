use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{NetEvent, NetReceiver, TcpTransport};
use crate::engine::Engine;
use crate::message::PieceIndex;
use crate::peer::PeerKey;
use crate::piece::{verify_piece, BlockInfo};
use crate::scheduler::{pump, Scheduler};
use crate::transport::TransportError;

type Verdict = (PieceIndex, bool);

/// Hands completed pieces to a blocking thread for hashing before passing
/// the event on.
struct Verifying<'a, S> {
    inner: &'a mut S,
    verdicts: mpsc::UnboundedSender<Verdict>,
}

impl<S: Scheduler<TcpTransport>> Scheduler<TcpTransport> for Verifying<'_, S> {
    fn on_peer_unchoked_us(&mut self, engine: &mut Engine<TcpTransport>, peer: PeerKey) {
        self.inner.on_peer_unchoked_us(engine, peer)
    }

    fn on_peer_choked_us(&mut self, engine: &mut Engine<TcpTransport>, peer: PeerKey) {
        self.inner.on_peer_choked_us(engine, peer)
    }

    fn on_bitfield_or_have(&mut self, engine: &mut Engine<TcpTransport>, peer: PeerKey) {
        self.inner.on_bitfield_or_have(engine, peer)
    }

    fn on_block_received(
        &mut self,
        engine: &mut Engine<TcpTransport>,
        peer: PeerKey,
        block: BlockInfo,
    ) {
        self.inner.on_block_received(engine, peer, block)
    }

    fn on_request_rejected(
        &mut self,
        engine: &mut Engine<TcpTransport>,
        peer: PeerKey,
        block: BlockInfo,
    ) {
        self.inner.on_request_rejected(engine, peer, block)
    }

    fn on_piece_completed(&mut self, engine: &mut Engine<TcpTransport>, index: PieceIndex) {
        if let Some((data, expected)) = engine.verification_input(index) {
            let verdicts = self.verdicts.clone();
            match expected {
                Some(expected) => {
                    tokio::task::spawn_blocking(move || {
                        let _ = verdicts.send((index, verify_piece(&data, &expected)));
                    });
                }
                None => {
                    let _ = verdicts.send((index, true));
                }
            }
        }
        self.inner.on_piece_completed(engine, index)
    }

    fn on_piece_verified(&mut self, engine: &mut Engine<TcpTransport>, index: PieceIndex, ok: bool) {
        self.inner.on_piece_verified(engine, index, ok)
    }

    fn on_slots_available(&mut self, engine: &mut Engine<TcpTransport>) {
        self.inner.on_slots_available(engine)
    }

    fn on_want_requests(&mut self, engine: &mut Engine<TcpTransport>, peer: PeerKey) {
        self.inner.on_want_requests(engine, peer)
    }

    fn on_peer_destroyed(&mut self, engine: &mut Engine<TcpTransport>, peer: PeerKey) {
        self.inner.on_peer_destroyed(engine, peer)
    }
}

/// Runs the event loop for one engine until `done` says so, every peer is
/// gone, or ctrl-c. All peers are shut down on the way out.
pub async fn run<S, F>(
    engine: &mut Engine<TcpTransport>,
    scheduler: &mut S,
    mut net: NetReceiver,
    mut done: F,
) -> Result<()>
where
    S: Scheduler<TcpTransport>,
    F: FnMut(&Engine<TcpTransport>, &S) -> bool,
{
    let (verdicts, mut verdict_rx) = mpsc::unbounded_channel::<Verdict>();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        {
            let mut verifying = Verifying {
                inner: &mut *scheduler,
                verdicts: verdicts.clone(),
            };
            pump(engine, &mut verifying);
        }
        if done(engine, scheduler) {
            info!("done");
            break;
        }
        if engine.peer_count() == 0 {
            warn!("no peers left");
            break;
        }

        tokio::select! {
            event = net.recv() => match event {
                Some(NetEvent::Connected(conn)) => engine.on_connected(conn),
                Some(NetEvent::Data(conn, data)) => engine.on_readable(conn, &data),
                Some(NetEvent::Error(conn, error)) => engine.on_transport_error(conn, error),
                None => break,
            },
            Some((index, ok)) = verdict_rx.recv() => {
                if let Err(error) = engine.on_piece_verified(index, ok) {
                    debug!(index, %error, "stale verdict");
                }
            }
            _ = tick.tick() => {
                engine.on_tick();
                for conn in engine.transport_mut().expired(Instant::now()) {
                    engine.on_transport_error(conn, TransportError::Timeout);
                }
            }
            result = &mut ctrl_c => {
                result?;
                info!("interrupted");
                break;
            }
        }
    }

    engine.shutdown_all();
    Ok(())
}
