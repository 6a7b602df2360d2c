//! This crate implements the storage core of the deduplication engine.
//!
//! # Layers
//!
//! The [log] module is the bounded circular operation log: every state
//! transition of the store (container commits, block mapping updates,
//! merges, deletions) is a typed, checksummed log entry with a monotonic
//! id. Entries are published synchronously to the registered consumers
//! when committed and consumed again asynchronously by the background
//! replay, which drives garbage collection and recovery.
//!
//! The [container] module packs chunk payloads into fixed-size containers
//! with stable logical ids. Open containers live in a write cache;
//! committed containers are resolved through a metadata index that
//! survives merges (old ids become secondaries of the surviving primary).
//!
//! The [chunk_index] maps fingerprints to (container id, usage count) on
//! a disk hash index with a write-back cache; mappings of chunks in open
//! containers stay pinned until the container commit replay releases
//! them.
//!
//! The [block_index] maps block ids to chunk reference lists. Mappings
//! that reference open containers wait in a volatile store and are only
//! promoted to the persistent index after every referenced container
//! committed, so persistent mappings never point at storage a crash can
//! lose.
//!
//! The [gc] module consumes block mapping events, maintains per-chunk
//! usage counts and deletes chunks (and eventually containers, through
//! the container merge strategy) once they are unreferenced.

pub mod block_index;
pub mod chunk_index;
pub mod container;
pub mod gc;
pub mod idle;
pub mod log;

pub use block_index::{BlockIndex, VolatileBlockStore};
pub use chunk_index::ChunkIndex;
pub use container::{
    Container, ContainerAddress, ContainerStorage, ContainerStorageConfig, GreedyContainerGc,
    GreedyContainerGcConfig,
};
pub use gc::{mapping_diff, UsageCountGarbageCollector, UsageGcConfig};
pub use idle::{IdleDetector, IdleTickConsumer};
pub use log::{EventPayload, LogConfig, LogConsumer, LogEvent, OperationLog, ReplayMode};

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::{Path, PathBuf};

    /// Scratch directory for a single test, removed on drop.
    pub struct TestDir {
        path: PathBuf,
    }

    impl TestDir {
        pub fn new(name: &str) -> Self {
            let path = PathBuf::from(format!(".testdir-{name}"));
            if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
            std::fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            if let Err(_e) = std::fs::remove_dir_all(&self.path) { /* ignore */ }
        }
    }
}
