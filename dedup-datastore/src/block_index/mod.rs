//! Block id to chunk reference list index.
//!
//! The persistent side maps a block id to its latest committed mapping.
//! The volatile side holds mappings whose referenced containers are not
//! all committed yet; a mapping is only promoted to the persistent index
//! after every container it depends on has been committed, which keeps
//! the invariant that a persistent mapping never references storage that
//! a crash could lose.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};

use dedup_api_types::{BlockMapping, BlockMappingPair};
use dedup_index::{DiskHashIndex, DiskHashIndexConfig};

use crate::container::ContainerStorage;
use crate::log::{EventPayload, LogConsumer, LogEvent, OperationLog, ReplayMode};

mod volatile;
pub use volatile::{UncommittedBlockEntry, VolatileBlockStore};

fn block_key(block_id: u64) -> [u8; 8] {
    block_id.to_le_bytes()
}

/// Persistent block mapping index with the volatile in-flight store.
pub struct BlockIndex {
    index: DiskHashIndex,
    volatile: Mutex<VolatileBlockStore>,
    storage: Arc<ContainerStorage>,
    log: Arc<OperationLog>,
    block_size: u32,
}

impl BlockIndex {
    pub fn start(
        config: DiskHashIndexConfig,
        storage: Arc<ContainerStorage>,
        log: Arc<OperationLog>,
        block_size: u32,
        create: bool,
        force: bool,
    ) -> Result<Self, Error> {
        let index = DiskHashIndex::start(config, create, force)?;
        Ok(Self {
            index,
            volatile: Mutex::new(VolatileBlockStore::new()),
            storage,
            log,
            block_size,
        })
    }

    fn lookup_persistent(&self, block_id: u64) -> Result<Option<BlockMapping>, Error> {
        match self.index.lookup(&block_key(block_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn install(&self, mapping: &BlockMapping) -> Result<(), Error> {
        self.index
            .put(&block_key(mapping.block_id), &serde_json::to_vec(mapping)?)
    }

    /// Stores an updated block mapping.
    ///
    /// If every container the mapping references is already committed,
    /// the update is logged and promoted immediately. Otherwise it enters
    /// the volatile store and waits for the missing container commits;
    /// the call does not block on them.
    pub fn store_block(
        &self,
        previous: BlockMapping,
        modified: BlockMapping,
    ) -> Result<(), Error> {
        modified.check()?;

        let open_containers: Vec<u64> = modified
            .referenced_containers()
            .into_iter()
            .filter(|id| self.storage.is_container_open(*id))
            .collect();

        if open_containers.is_empty() {
            // a still-pending older version is superseded; keep its
            // previous side so the diff runs against persisted state
            let previous = match self.volatile.lock().unwrap().remove(modified.block_id) {
                Some(replaced) => replaced.previous,
                None => previous,
            };
            return self.promote(BlockMappingPair::new(previous, modified));
        }

        let mut volatile = self.volatile.lock().unwrap();
        volatile.insert(previous, modified, &open_containers);
        Ok(())
    }

    /// Logs the mapping pair and installs the modified mapping.
    fn promote(&self, mut pair: BlockMappingPair) -> Result<(), Error> {
        let log_id = self
            .log
            .commit_event(EventPayload::BlockMappingWritten { pair: pair.clone() })
            .with_context(|| format!("block {} mapping write", pair.block_id()))?;
        pair.modified.event_log_id = Some(log_id);
        self.install(&pair.modified)
    }

    /// Processes a container commit: mappings whose last missing
    /// container just committed are promoted, in event order per block.
    pub fn commit_container(&self, container_id: u64) -> Result<(), Error> {
        let ready = {
            let mut volatile = self.volatile.lock().unwrap();
            volatile.container_committed(container_id)
        };
        // the volatile lock is released before the log commit below
        for entry in ready {
            self.promote(BlockMappingPair::new(entry.previous, entry.modified))?;
        }
        Ok(())
    }

    /// Processes a failed container commit: affected mappings are
    /// discarded and the failure is logged so the garbage collector can
    /// correct reference counts that were never realized.
    pub fn fail_container(&self, container_id: u64) -> Result<(), Error> {
        let failed = {
            let mut volatile = self.volatile.lock().unwrap();
            volatile.container_failed(container_id)
        };
        for entry in failed {
            log::warn!(
                "block {} write discarded, container {} failed",
                entry.modified.block_id,
                container_id
            );
            self.log.commit_event(EventPayload::BlockMappingWriteFailed {
                pair: BlockMappingPair::new(entry.previous, entry.modified),
                write_event_log_id: entry.block_write_log_id,
            })?;
        }
        Ok(())
    }

    /// The authoritative mapping for a block.
    ///
    /// In-flight mappings from the volatile store take precedence, so a
    /// writer observes its own uncommitted writes. A never-written block
    /// resolves to a filled empty mapping.
    pub fn read_block_info(&self, block_id: u64) -> Result<BlockMapping, Error> {
        {
            let volatile = self.volatile.lock().unwrap();
            if let Some(entry) = volatile.get(block_id) {
                return Ok(entry.modified.clone());
            }
        }
        match self.lookup_persistent(block_id)? {
            Some(mapping) => Ok(mapping),
            None => Ok(BlockMapping::new_empty(block_id, self.block_size)),
        }
    }

    /// Deletes a block mapping. Returns false if the block was unknown.
    pub fn delete_block_info(&self, block_id: u64) -> Result<bool, Error> {
        {
            let mut volatile = self.volatile.lock().unwrap();
            volatile.remove(block_id);
        }
        let previous = match self.lookup_persistent(block_id)? {
            Some(previous) => previous,
            None => return Ok(false),
        };
        self.log
            .commit_event(EventPayload::BlockMappingDeleted {
                previous: previous.clone(),
            })?;
        self.index.delete(&block_key(block_id))?;
        Ok(true)
    }

    pub fn open_block_count(&self) -> usize {
        self.volatile.lock().unwrap().block_count()
    }

    pub fn item_count(&self) -> u64 {
        self.index.item_count()
    }

    pub fn dirty_item_count(&self) -> u64 {
        self.index.dirty_item_count()
    }

    pub fn sync_files(&self) -> Result<(), Error> {
        self.index.sync_files()
    }

    pub fn close(&self) -> Result<(), Error> {
        let open = self.open_block_count();
        if open > 0 {
            log::warn!("{open} uncommitted block mappings discarded at close");
        }
        self.index.close()
    }
}

impl crate::container::StorageCommitCallback for BlockIndex {
    fn on_container_commit(&self, container_id: u64) -> Result<(), Error> {
        self.commit_container(container_id)
    }

    fn on_container_commit_failed(&self, container_id: u64) -> Result<(), Error> {
        self.fail_container(container_id)
    }
}

impl LogConsumer for BlockIndex {
    fn log_replay(&self, event: &LogEvent, mode: ReplayMode) -> Result<(), Error> {
        if mode == ReplayMode::Direct {
            return Ok(());
        }
        match &event.payload {
            EventPayload::ContainerCommitted { container_id, .. } => {
                if !self.storage.is_committed(*container_id)? {
                    // a crash between the metadata write and the log
                    // cursor update; rebuild the record from the blob
                    self.storage.restore_metadata(*container_id)?;
                }
                self.commit_container(*container_id)?;
            }
            EventPayload::BlockMappingWritten { pair } => {
                // idempotent re-application of the promotion
                let stored = self.lookup_persistent(pair.modified.block_id)?;
                let stored_version = stored.map(|m| m.version).unwrap_or(0);
                if pair.modified.version >= stored_version {
                    let mut mapping = pair.modified.clone();
                    mapping.event_log_id = Some(event.log_id);
                    self.install(&mapping)?;
                }
            }
            EventPayload::BlockMappingDeleted { previous } => {
                if let Some(stored) = self.lookup_persistent(previous.block_id)? {
                    if stored.version <= previous.version {
                        self.index.delete(&block_key(previous.block_id))?;
                    }
                }
            }
            _ => (),
        }
        Ok(())
    }
}
