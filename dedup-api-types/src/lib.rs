//! Shared data model of the dedup engine.
//!
//! These types are used across the storage crates and by the inspection
//! surface; everything here is plain data with serde derives, no I/O.

mod fingerprint;
pub use fingerprint::{Fingerprint, FINGERPRINT_SIZE};

mod block_mapping;
pub use block_mapping::{BlockMapping, BlockMappingItem, BlockMappingPair};

mod chunk_mapping;
pub use chunk_mapping::ChunkMapping;

mod config;
pub use config::{CompressionType, StopMode, SyncMode, WriteCacheStrategy};

/// Default logical block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Container id reserved for "not stored in any container yet".
pub const ILLEGAL_CONTAINER_ID: u64 = u64::MAX;
