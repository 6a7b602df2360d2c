use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Fsync policy of a persistent index or storage file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Every write is fsynced inline.
    #[default]
    Sync,
    /// Writes are coalesced; fsync happens on background flush and shutdown.
    LazySync,
    /// No fsync at all. Data loss on crash is tolerated.
    Unsafe,
}

impl std::str::FromStr for SyncMode {
    type Err = Error;

    // config uses "true" / "false" / "unsafe"
    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "true" | "sync" => SyncMode::Sync,
            "false" | "lazy" => SyncMode::LazySync,
            "unsafe" => SyncMode::Unsafe,
            _ => bail!("illegal sync mode '{s}'"),
        })
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncMode::Sync => "sync",
            SyncMode::LazySync => "lazy-sync",
            SyncMode::Unsafe => "unsafe",
        };
        write!(f, "{s}")
    }
}

/// Per-container compression codec, identified by the container header tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionType {
    #[default]
    None,
    Deflate,
    Bz2,
    Lz4,
    Snappy,
}

impl CompressionType {
    /// On-disk header tag.
    pub fn tag(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Deflate => 1,
            CompressionType::Bz2 => 2,
            CompressionType::Lz4 => 3,
            CompressionType::Snappy => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, Error> {
        Ok(match tag {
            0 => CompressionType::None,
            1 => CompressionType::Deflate,
            2 => CompressionType::Bz2,
            3 => CompressionType::Lz4,
            4 => CompressionType::Snappy,
            _ => bail!("unknown compression tag {tag}"),
        })
    }
}

impl std::str::FromStr for CompressionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "none" => CompressionType::None,
            "deflate" => CompressionType::Deflate,
            "bz2" => CompressionType::Bz2,
            "lz4" => CompressionType::Lz4,
            "snappy" => CompressionType::Snappy,
            _ => bail!("unknown compression type '{s}'"),
        })
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressionType::None => "none",
            CompressionType::Deflate => "deflate",
            CompressionType::Bz2 => "bz2",
            CompressionType::Lz4 => "lz4",
            CompressionType::Snappy => "snappy",
        };
        write!(f, "{s}")
    }
}

/// Placement strategy for the container write cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteCacheStrategy {
    #[default]
    RoundRobin,
    EarliestFree,
}

impl std::str::FromStr for WriteCacheStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "round-robin" => WriteCacheStrategy::RoundRobin,
            "earliest-free" => WriteCacheStrategy::EarliestFree,
            _ => bail!("unknown write cache strategy '{s}'"),
        })
    }
}

/// How the engine shuts down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopMode {
    /// Finish current operations, keep dirty state for the next dirty replay.
    Fast,
    /// Additionally write back all dirty state and drain the log; the engine
    /// is marked clean afterwards.
    Writeback,
}
