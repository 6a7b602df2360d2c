//! Persistent page-structured hash index.
//!
//! The central type is [DiskHashIndex]: an open-addressing bucket table
//! persisted in one or more data files, with a write-back page cache,
//! a crash-consistent transaction log for page writes, striped page locks
//! and an overflow spill area. It backs the chunk index, the block index
//! and the container metadata index of the engine.
//!
//! Buckets are fixed-size pages; collisions inside a bucket are resolved
//! by a linear scan within the page. Entries displaced from a full page
//! spill to a secondary persistent index (the overflow area), which is
//! itself created through [create_index].

use anyhow::{bail, Error};

pub mod cache;
pub mod file;
pub mod framed;
pub mod page;
pub mod transaction;

mod disk_hash;
pub use disk_hash::{
    bucket_hash, parse_bool, parse_size, CacheDirtyMode, CacheLookupMethod, DiskHashIndex,
    DiskHashIndexConfig, DiskHashIndexIterator,
};

mod mem_hash;
pub use mem_hash::MemHashIndex;

/// Outcome of a conditional write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PutResult {
    /// The write was applied.
    Ok,
    /// An existing entry was kept; nothing was written.
    Keep,
}

/// Lazy entry sequence over a persistent index.
///
/// Iterators are finite and fail-fast: a concurrent mutation of the index
/// invalidates them with an error.
pub trait IndexIterator {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error>;
}

/// Capability interface of a pluggable persistent map.
///
/// Implementations are registered in [create_index] under a string name
/// read from the configuration; the factory returns started instances.
pub trait PersistentIndex: Send + Sync {
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutResult, Error>;
    /// Returns true if the key existed.
    fn delete(&self, key: &[u8]) -> Result<bool, Error>;
    fn iterate(&self) -> Result<Box<dyn IndexIterator + '_>, Error>;
    fn item_count(&self) -> u64;
    fn close(&self) -> Result<(), Error>;
}

/// Creates and starts a persistent index by registered type name.
pub fn create_index(
    type_name: &str,
    options: &[(String, String)],
    create: bool,
    force: bool,
) -> Result<Box<dyn PersistentIndex>, Error> {
    match type_name {
        "static-disk-hash" => Ok(Box::new(DiskHashIndex::start_options(
            options, create, force,
        )?)),
        "mem-hash" => Ok(Box::new(MemHashIndex::new())),
        _ => bail!("unknown index type '{type_name}'"),
    }
}

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
