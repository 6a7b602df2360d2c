//! Fingerprint to chunk mapping index.
//!
//! A disk hash index with a write-back cache, queried once per chunk on
//! the write path and once per chunk on a read miss. Mappings of chunks
//! in uncommitted containers stay pinned in the cache; the container
//! commit replay unpins them and forces them to the persistent pages.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Error};

use dedup_api_types::{ChunkMapping, Fingerprint};
use dedup_index::{
    CacheDirtyMode, CacheLookupMethod, DiskHashIndex, DiskHashIndexConfig, PutResult,
};

use crate::container::ContainerStorage;
use crate::log::{EventPayload, LogConsumer, LogEvent, ReplayMode};

/// data address (u64), usage count (u64), usage change log id (u64)
const CHUNK_VALUE_SIZE: usize = 24;

fn encode_value(mapping: &ChunkMapping) -> [u8; CHUNK_VALUE_SIZE] {
    let mut buf = [0u8; CHUNK_VALUE_SIZE];
    buf[0..8].copy_from_slice(&mapping.data_address.to_le_bytes());
    buf[8..16].copy_from_slice(&mapping.usage_count.to_le_bytes());
    buf[16..24].copy_from_slice(&mapping.usage_count_change_log_id.to_le_bytes());
    buf
}

fn decode_value(fingerprint: Fingerprint, value: &[u8]) -> Result<ChunkMapping, Error> {
    if value.len() != CHUNK_VALUE_SIZE {
        bail!("illegal chunk mapping value size {}", value.len());
    }
    Ok(ChunkMapping {
        fingerprint,
        data_address: u64::from_le_bytes(value[0..8].try_into().unwrap()),
        usage_count: u64::from_le_bytes(value[8..16].try_into().unwrap()),
        usage_count_change_log_id: u64::from_le_bytes(value[16..24].try_into().unwrap()),
    })
}

/// The persistent fingerprint → (container id, usage count) map.
pub struct ChunkIndex {
    index: DiskHashIndex,
    storage: Arc<ContainerStorage>,
    /// Fingerprints referenced by in-flight writes; the garbage collector
    /// defers deletions of these until the writes complete.
    in_combat: Mutex<HashSet<Fingerprint>>,
}

impl ChunkIndex {
    pub fn start(
        mut config: DiskHashIndexConfig,
        storage: Arc<ContainerStorage>,
        create: bool,
        force: bool,
    ) -> Result<Self, Error> {
        // the hot path depends on the write-back discipline
        config.write_cache = true;
        let index = DiskHashIndex::start(config, create, force)?;
        Ok(Self {
            index,
            storage,
            in_combat: Mutex::new(HashSet::new()),
        })
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<ChunkMapping>, Error> {
        match self.index.lookup(fingerprint.as_ref())? {
            Some(value) => Ok(Some(decode_value(*fingerprint, &value)?)),
            None => Ok(None),
        }
    }

    /// Registers a new chunk mapping in the write-back cache.
    ///
    /// The entry is pinned while its container is still open; the
    /// container commit replay unpins it.
    pub fn put_dirty(&self, mapping: &ChunkMapping, pinned: bool) -> Result<(), Error> {
        self.index
            .put_dirty(mapping.fingerprint.as_ref(), &encode_value(mapping), pinned)
    }

    /// Write-through upsert (replay and recovery paths).
    pub fn put(&self, mapping: &ChunkMapping) -> Result<(), Error> {
        self.index
            .put(mapping.fingerprint.as_ref(), &encode_value(mapping))
    }

    /// Updates a mapping in place, preserving its write-back state.
    pub fn update(&self, mapping: &ChunkMapping) -> Result<(), Error> {
        match self.index.cache_entry_state(mapping.fingerprint.as_ref())? {
            Some((true, pinned)) => self.put_dirty(mapping, pinned),
            _ => self.put(mapping),
        }
    }

    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<bool, Error> {
        self.index.delete(fingerprint.as_ref())
    }

    pub fn change_pin_state(&self, fingerprint: &Fingerprint, pinned: bool) -> Result<bool, Error> {
        self.index.change_pin_state(fingerprint.as_ref(), pinned)
    }

    pub fn ensure_persistent(&self, fingerprint: &Fingerprint) -> Result<PutResult, Error> {
        self.index.ensure_persistent(fingerprint.as_ref())
    }

    /// Cache-only probe used by the filter chain to classify chunks
    /// without touching the disk.
    pub fn lookup_cache_only(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ChunkMapping>, Error> {
        let value = self.index.lookup_with_mode(
            fingerprint.as_ref(),
            CacheLookupMethod::CacheOnly,
            CacheDirtyMode::AllowDirty,
        )?;
        match value {
            Some(value) => Ok(Some(decode_value(*fingerprint, &value)?)),
            None => Ok(None),
        }
    }

    pub fn item_count(&self) -> u64 {
        self.index.item_count()
    }

    pub fn dirty_item_count(&self) -> u64 {
        self.index.dirty_item_count()
    }

    pub fn total_item_count(&self) -> u64 {
        self.index.total_item_count()
    }

    pub fn estimated_max_item_count(&self) -> u64 {
        self.index.estimated_max_item_count()
    }

    pub fn sync_files(&self) -> Result<(), Error> {
        self.index.sync_files()
    }

    /// Iterates the persistent chunk mappings.
    pub fn iterate_mappings(&self) -> ChunkMappingIterator<'_> {
        ChunkMappingIterator {
            inner: self.index.iterate(),
        }
    }

    pub fn mark_in_combat(&self, fingerprint: Fingerprint) {
        self.in_combat.lock().unwrap().insert(fingerprint);
    }

    pub fn release_in_combat(&self, fingerprint: &Fingerprint) {
        self.in_combat.lock().unwrap().remove(fingerprint);
    }

    pub fn is_in_combat(&self, fingerprint: &Fingerprint) -> bool {
        self.in_combat.lock().unwrap().contains(fingerprint)
    }

    /// Flushes dirty entries; returns the number that stayed pinned.
    ///
    /// A non-zero count at shutdown means containers never committed and
    /// is reported as an inconsistency by the caller.
    pub fn flush_dirty(&self) -> Result<u64, Error> {
        self.index.flush_dirty()
    }

    pub fn close(&self) -> Result<(), Error> {
        self.index.close()
    }
}

pub struct ChunkMappingIterator<'a> {
    inner: dedup_index::DiskHashIndexIterator<'a>,
}

impl ChunkMappingIterator<'_> {
    pub fn next_mapping(&mut self) -> Result<Option<ChunkMapping>, Error> {
        match self.inner.next_entry()? {
            Some((key, value)) => {
                let fingerprint = Fingerprint::from_slice(&key)?;
                Ok(Some(decode_value(fingerprint, &value)?))
            }
            None => Ok(None),
        }
    }
}

impl ChunkIndex {
    /// Unpins and persists the mappings of every chunk in a committed
    /// container. Idempotent: re-delivery finds the entries unpinned.
    pub fn process_container_commit(&self, container_id: u64) -> Result<(), Error> {
        if !self.storage.is_committed(container_id)? {
            // the commit reached the log but the metadata record was
            // lost in a crash; restore it from the container blob
            self.storage
                .restore_metadata(container_id)
                .with_context(|| format!("container {container_id} metadata recovery"))?;
        }
        let container = match self.storage.read_container(container_id) {
            Ok(container) => container,
            Err(err) => {
                log::warn!("committed container {container_id} unreadable during replay - {err}");
                return Ok(());
            }
        };
        for item in container.items.iter().filter(|item| !item.deleted) {
            self.change_pin_state(&item.fingerprint, false)?;
            if self.lookup(&item.fingerprint)?.is_none() {
                // replay after a crash that lost the dirty cache entry
                let mapping = ChunkMapping::new(item.fingerprint, container_id);
                self.put(&mapping)?;
            } else {
                self.ensure_persistent(&item.fingerprint)?;
            }
        }
        Ok(())
    }
}

impl LogConsumer for ChunkIndex {
    fn log_replay(&self, event: &LogEvent, mode: ReplayMode) -> Result<(), Error> {
        if mode == ReplayMode::Direct {
            return Ok(());
        }
        if let EventPayload::ContainerCommitted { container_id, .. } = &event.payload {
            self.process_container_commit(*container_id)?;
        }
        Ok(())
    }
}

impl crate::container::StorageCommitCallback for ChunkIndex {
    fn on_container_commit(&self, container_id: u64) -> Result<(), Error> {
        self.process_container_commit(container_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::log::{LogConfig, OperationLog, ReplayMode};
    use crate::testutil::TestDir;
    use dedup_api_types::FINGERPRINT_SIZE;

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::new([b; FINGERPRINT_SIZE])
    }

    fn test_chunk_index(
        dir: &TestDir,
    ) -> (Arc<ChunkIndex>, Arc<ContainerStorage>, Arc<OperationLog>) {
        let log = Arc::new(
            OperationLog::start(
                LogConfig {
                    filename: dir.path().join("op.log"),
                    max_log_size: 1024 * 1024,
                    sync: false,
                    ..Default::default()
                },
                true,
            )
            .unwrap(),
        );

        let mut storage_config = crate::container::ContainerStorageConfig {
            container_size: 8 * 1024,
            sync: false,
            ..Default::default()
        };
        storage_config.filenames.push(dir.path().join("container.data"));
        storage_config.file_size = Some(16 * 8 * 1024);
        for (name, value) in [
            ("filename", dir.path().join("meta.data").display().to_string()),
            ("page-size", "4096".to_string()),
            ("size", (64 * 4096).to_string()),
            ("sync", "false".to_string()),
        ] {
            storage_config.meta_data.1.push((name.to_string(), value));
        }
        let storage = Arc::new(
            ContainerStorage::start(storage_config, Arc::clone(&log), true, false).unwrap(),
        );

        let mut index_config = DiskHashIndexConfig {
            page_size: 4096,
            size: 64 * 4096,
            sync_mode: dedup_api_types::SyncMode::LazySync,
            ..Default::default()
        };
        index_config.filenames.push(dir.path().join("chunk-index.data"));
        let chunk_index =
            Arc::new(ChunkIndex::start(index_config, Arc::clone(&storage), true, false).unwrap());
        (chunk_index, storage, log)
    }

    #[test]
    fn mapping_round_trip() {
        let dir = TestDir::new("chunk-index-roundtrip");
        let (chunk_index, _storage, _log) = test_chunk_index(&dir);

        let mut mapping = ChunkMapping::new(fp(1), 42);
        mapping.usage_count = 3;
        mapping.usage_count_change_log_id = 17;
        chunk_index.put(&mapping).unwrap();

        let loaded = chunk_index.lookup(&fp(1)).unwrap().unwrap();
        assert_eq!(loaded, mapping);
        assert!(chunk_index.lookup(&fp(2)).unwrap().is_none());
    }

    #[test]
    fn container_commit_unpins_and_persists() {
        let dir = TestDir::new("chunk-index-unpin");
        let (chunk_index, storage, log) = test_chunk_index(&dir);

        let container_id = storage.write_chunk(fp(9), &[9; 256]).unwrap();
        let mut mapping = ChunkMapping::new(fp(9), container_id);
        mapping.usage_count = 1;
        chunk_index.put_dirty(&mapping, true).unwrap();

        // pinned entries cannot be persisted yet
        assert_eq!(
            chunk_index.ensure_persistent(&fp(9)).unwrap(),
            PutResult::Keep
        );
        assert_eq!(chunk_index.item_count(), 0);

        storage.flush().unwrap();
        log.register_consumer("chunk-index", chunk_index.clone())
            .unwrap();
        log.replay_all(ReplayMode::Background).unwrap();

        assert_eq!(chunk_index.item_count(), 1);
        assert_eq!(chunk_index.dirty_item_count(), 0);
        let loaded = chunk_index.lookup(&fp(9)).unwrap().unwrap();
        assert_eq!(loaded.data_address, container_id);
    }

    #[test]
    fn in_combat_set_tracks_fingerprints() {
        let dir = TestDir::new("chunk-index-combat");
        let (chunk_index, _storage, _log) = test_chunk_index(&dir);

        assert!(!chunk_index.is_in_combat(&fp(3)));
        chunk_index.mark_in_combat(fp(3));
        assert!(chunk_index.is_in_combat(&fp(3)));
        chunk_index.release_in_combat(&fp(3));
        assert!(!chunk_index.is_in_combat(&fp(3)));
    }
}
