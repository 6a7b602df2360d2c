//! Append-structured chunk container store.
//!
//! Chunk payloads are packed into fixed-size containers with monotonic
//! logical ids. The metadata index maps logical ids to physical
//! addresses and keeps them stable across merges: after a merge the
//! surviving primary id is the lowest participating id and every other
//! id resolves to it as a secondary.

pub mod alloc;
pub mod format;
pub mod gc;
pub mod read_cache;
pub mod storage;

pub use alloc::{ContainerAddress, ContainerAllocator};
pub use format::{merged_fits, Container, ContainerItem};
pub use gc::{GreedyContainerGc, GreedyContainerGcConfig};
pub use read_cache::ContainerReadCache;
pub use storage::{
    ContainerMetaData, ContainerStorage, ContainerStorageConfig, StorageCommitCallback,
};
