use std::fmt;
use std::path::Path;

use anyhow::{bail, Context};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use serde_derive::Deserialize;
use sha1::{Digest, Sha1};

use crate::scheduler::PieceSpec;

/// The parts of a `.torrent` file the peer engine needs.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: [u8; 20],
}

// Structure mainly from https://github.com/jonhoo/codecrafters-bittorrent-rust/blob/master/src/torrent.rs
#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    pub name: String,

    /// The number of bytes in each piece, the last one may be shorter.
    #[serde(rename = "piece length")]
    pub piece_length: u64,

    /// Concatenated 20 byte SHA-1 hashes, one per piece.
    pub pieces: ByteBuf,

    #[serde(default)]
    pub length: Option<u64>,

    #[serde(default)]
    pub files: Option<Vec<File>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTorrent {
    info: Value,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        let raw: RawTorrent =
            serde_bencode::from_bytes(buf).context("Failed parsing torrent file")?;

        // Hash the info dictionary as encoded, not our typed view of it
        let info_encoded =
            serde_bencode::to_bytes(&raw.info).context("Failed to re-encode info dictionary")?;
        let info_hash: [u8; 20] = Sha1::digest(&info_encoded).into();

        let info: Info =
            serde_bencode::from_bytes(&info_encoded).context("Failed parsing info dictionary")?;
        if info.pieces.len() % 20 != 0 {
            bail!("pieces field is {} bytes, not a multiple of 20", info.pieces.len());
        }
        if info.piece_length == 0 || info.piece_length > u64::from(u32::MAX) {
            bail!("invalid piece length {}", info.piece_length);
        }

        Ok(Self { info, info_hash })
    }

    #[tracing::instrument]
    pub async fn open(file: impl AsRef<Path> + fmt::Debug) -> anyhow::Result<Self> {
        let buf = tokio::fs::read(file)
            .await
            .context("Failed opening torrent file")?;
        let metainfo = Self::from_bytes(&buf)?;
        tracing::info!("Succesfully opened {}", metainfo.info.name);
        Ok(metainfo)
    }

    pub fn length(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(length), _) => *length,
            (None, Some(files)) => files.iter().map(|file| file.length).sum(),
            (None, None) => 0,
        }
    }

    pub fn num_pieces(&self) -> u32 {
        (self.info.pieces.len() / 20) as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<[u8; 20]> {
        let start = index as usize * 20;
        self.info
            .pieces
            .get(start..start + 20)
            .and_then(|hash| hash.try_into().ok())
    }

    pub fn piece_len(&self, index: u32) -> u32 {
        let start = u64::from(index) * self.info.piece_length;
        self.length()
            .saturating_sub(start)
            .min(self.info.piece_length) as u32
    }

    pub fn piece_specs(&self) -> Vec<PieceSpec> {
        (0..self.num_pieces())
            .map(|index| PieceSpec {
                length: self.piece_len(index),
                hash: self.piece_hash(index),
            })
            .collect()
    }
}
