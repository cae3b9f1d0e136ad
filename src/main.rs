use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerwire::config::{EngineConfig, PeerBudget};
use peerwire::engine::Engine;
use peerwire::metainfo::Metainfo;
use peerwire::net::{self, TcpTransport};
use peerwire::peer::PeerId;
use peerwire::scheduler::{InOrderScheduler, Scheduler};

#[derive(Debug, Parser)]
#[command(name = "peerwire", about = "BitTorrent peer wire client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download pieces of a torrent from the given peers
    Fetch {
        #[arg(long)]
        torrent: PathBuf,
        #[arg(long = "peer", required = true)]
        peers: Vec<SocketAddr>,
        /// Stop after this many pieces
        #[arg(long)]
        pieces: Option<usize>,
        #[arg(long, default_value_t = 50)]
        max_peers: usize,
        /// Pieces downloaded at the same time
        #[arg(long, default_value_t = 4)]
        window: usize,
    },
    /// Handshake with one peer and print its id
    Handshake {
        #[arg(long)]
        info_hash: String,
        #[arg(long)]
        peer: SocketAddr,
    },
}

/// Only drives the handshake.
struct HandshakeOnly;

impl Scheduler<TcpTransport> for HandshakeOnly {}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Fetch {
            torrent,
            peers,
            pieces,
            max_peers,
            window,
        } => fetch(torrent, peers, pieces, max_peers, window).await,
        Command::Handshake { info_hash, peer } => handshake(&info_hash, peer).await,
    }
}

async fn fetch(
    torrent: PathBuf,
    peers: Vec<SocketAddr>,
    pieces: Option<usize>,
    max_peers: usize,
    window: usize,
) -> Result<()> {
    let metainfo = Metainfo::open(&torrent).await?;
    let config = EngineConfig::default().with_max_peers(max_peers);
    let (transport, net_rx) = TcpTransport::new();
    let mut engine = Engine::new(
        metainfo.info_hash,
        PeerId::generate(),
        metainfo.num_pieces(),
        config,
        transport,
        PeerBudget::unlimited(),
    );

    let mut scheduler = InOrderScheduler::new(metainfo.piece_specs(), window);
    if let Some(count) = pieces {
        scheduler = scheduler.with_target(count);
    }
    scheduler.start(&mut engine);
    for addr in peers {
        engine.add_peer(addr);
    }

    let pb = ProgressBar::new(scheduler.target() as u64);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} pieces  {msg}")
            .context("bad progress template")?
            .progress_chars("##-"),
    );

    net::run(&mut engine, &mut scheduler, net_rx, |engine, scheduler| {
        pb.set_position(scheduler.verified() as u64);
        pb.set_message(format!(
            "{}  {}/s  {} peers",
            format_bytes(engine.stats().downloaded),
            format_bytes(engine.download_rate()),
            engine.running_peers().count()
        ));
        scheduler.is_done()
    })
    .await?;

    pb.finish_with_message(format!("{}  done", format_bytes(engine.stats().downloaded)));
    info!(
        verified = scheduler.verified(),
        target = scheduler.target(),
        wasted = engine.stats().wasted,
        "fetch finished"
    );
    Ok(())
}

async fn handshake(info_hash: &str, peer: SocketAddr) -> Result<()> {
    let bytes = hex::decode(info_hash).context("info hash is not hex")?;
    let Ok(info_hash) = <[u8; 20]>::try_from(bytes.as_slice()) else {
        bail!("info hash must be 20 bytes");
    };

    let (transport, net_rx) = TcpTransport::new();
    let mut engine = Engine::new(
        info_hash,
        PeerId::generate(),
        0,
        EngineConfig::default().with_max_failures(1),
        transport,
        PeerBudget::unlimited(),
    );
    let key = engine.add_peer(peer);

    let mut remote = None;
    net::run(&mut engine, &mut HandshakeOnly, net_rx, |engine, _| {
        remote = engine
            .peer(key)
            .and_then(|peer| peer.session())
            .map(|session| (*session.remote_id(), session.fast_extension()));
        remote.is_some()
    })
    .await?;

    match remote {
        Some((id, fast)) => {
            println!("Peer ID: {}", hex::encode(id));
            println!("Fast extension: {fast}");
            Ok(())
        }
        None => bail!("handshake with {peer} failed"),
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
