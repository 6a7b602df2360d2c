//! Inline content-addressed block-level deduplication engine.
//!
//! The engine exposes block-addressed volumes whose on-disk footprint is
//! the set of unique chunks discovered in written data. A block write is
//! chunked and fingerprinted; chunks already known to the chunk index
//! reference existing containers, new chunks are packed into open
//! containers. The updated block mapping is promoted to the persistent
//! block index once every container it references has been committed,
//! and the operation log makes the whole path replayable after a crash.
//!
//! This crate assembles the storage core from `dedup-index` (the
//! persistent hash index primitive) and `dedup-datastore` (operation
//! log, container store, chunk/block indexes, garbage collection) and
//! adds the process-level pieces: configuration, lock and dirty files,
//! the background log replayer and the JSON inspection surface.
//!
//! SCSI/iSCSI target plumbing, volume administration and the HTTP
//! monitor live outside this crate and talk to [engine::DedupEngine].

pub mod config;
pub mod content;
pub mod engine;
pub mod inspect;
pub mod lockfile;
pub mod replayer;

pub use config::EngineConfig;
pub use engine::DedupEngine;
pub use replayer::{LogReplayer, LogReplayerConfig, LogReplayerState};
