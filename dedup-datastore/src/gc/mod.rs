//! Usage-count garbage collection.
//!
//! The collector consumes block mapping events from the background
//! replay, diffs the mapping pairs into per-fingerprint reference count
//! deltas and applies them to the chunk index. Chunks whose count reaches
//! zero enter a persistent candidate index; idle processing re-checks the
//! count (and the in-combat set) and then removes the chunk from the
//! chunk index and from its container.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use dedup_api_types::{BlockMappingPair, Fingerprint, ILLEGAL_CONTAINER_ID};
use dedup_index::{create_index, PersistentIndex};

use crate::chunk_index::ChunkIndex;
use crate::container::{ContainerStorage, GreedyContainerGc};
use crate::idle::IdleTickConsumer;
use crate::log::{EventPayload, LogConsumer, LogEvent, ReplayMode};

/// Reserved candidate-index key holding the replay watermark.
const WATERMARK_KEY: &[u8] = b"\0watermark";

/// Configuration of the usage-count garbage collector.
#[derive(Clone, Debug)]
pub struct UsageGcConfig {
    /// Candidate index type name plus its options.
    pub index: (String, Vec<(String, String)>),
}

impl Default for UsageGcConfig {
    fn default() -> Self {
        Self {
            index: ("mem-hash".to_string(), Vec::new()),
        }
    }
}

impl UsageGcConfig {
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "type" => {
                if value != "usage-count" {
                    bail!("unknown gc type '{value}'");
                }
            }
            "index" => self.index = (value.to_string(), Vec::new()),
            // remaining options configure the candidate index
            _ => self.index.1.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }
}

/// Per-fingerprint reference count deltas of a block mapping update.
///
/// Stored items of the modified side count +1, stored items of the
/// previous side count -1; duplicate fingerprints within one mapping are
/// counted multiply, identical fingerprints on both sides cancel out.
pub fn mapping_diff(pair: &BlockMappingPair) -> BTreeMap<Fingerprint, i64> {
    let mut diff = BTreeMap::new();
    for item in &pair.modified.items {
        if item.container_id != ILLEGAL_CONTAINER_ID {
            *diff.entry(item.fingerprint).or_insert(0) += 1;
        }
    }
    for item in &pair.previous.items {
        if item.container_id != ILLEGAL_CONTAINER_ID {
            *diff.entry(item.fingerprint).or_insert(0) -= 1;
        }
    }
    diff.retain(|_, delta| *delta != 0);
    diff
}

struct GcState {
    /// Log id of the last fully applied event.
    watermark: u64,
}

/// The usage-count garbage collector.
pub struct UsageCountGarbageCollector {
    chunk_index: Arc<ChunkIndex>,
    storage: Arc<ContainerStorage>,
    container_gc: Option<Arc<GreedyContainerGc>>,
    candidates: Box<dyn PersistentIndex>,
    state: Mutex<GcState>,
}

impl UsageCountGarbageCollector {
    pub fn start(
        config: UsageGcConfig,
        chunk_index: Arc<ChunkIndex>,
        storage: Arc<ContainerStorage>,
        container_gc: Option<Arc<GreedyContainerGc>>,
        create: bool,
        force: bool,
    ) -> Result<Self, Error> {
        let (type_name, options) = &config.index;
        let candidates = create_index(type_name, options, create, force)?;

        let watermark = match candidates.lookup(WATERMARK_KEY)? {
            Some(value) => serde_json::from_slice(&value)?,
            None => 0,
        };
        Ok(Self {
            chunk_index,
            storage,
            container_gc,
            candidates,
            state: Mutex::new(GcState { watermark }),
        })
    }

    fn persist_watermark(&self, log_id: u64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if log_id > state.watermark {
            state.watermark = log_id;
            self.candidates
                .put(WATERMARK_KEY, &serde_json::to_vec(&log_id)?)?;
        }
        Ok(())
    }

    fn candidate_key(container_id: u64) -> [u8; 8] {
        container_id.to_le_bytes()
    }

    fn read_candidates(&self, container_id: u64) -> Result<Vec<Fingerprint>, Error> {
        match self.candidates.lookup(&Self::candidate_key(container_id))? {
            Some(value) => {
                let hex_list: Vec<String> = serde_json::from_slice(&value)?;
                hex_list.iter().map(|s| s.parse()).collect()
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_candidates(
        &self,
        container_id: u64,
        fingerprints: &[Fingerprint],
    ) -> Result<(), Error> {
        let key = Self::candidate_key(container_id);
        if fingerprints.is_empty() {
            self.candidates.delete(&key)?;
        } else {
            let hex_list: Vec<String> =
                fingerprints.iter().map(|fp| fp.to_string()).collect();
            self.candidates.put(&key, &serde_json::to_vec(&hex_list)?)?;
        }
        Ok(())
    }

    fn add_candidate(&self, container_id: u64, fingerprint: Fingerprint) -> Result<(), Error> {
        let mut fingerprints = self.read_candidates(container_id)?;
        if !fingerprints.contains(&fingerprint) {
            fingerprints.push(fingerprint);
            self.write_candidates(container_id, &fingerprints)?;
        }
        Ok(())
    }

    pub fn candidate_count(&self) -> Result<u64, Error> {
        let mut count = 0;
        let mut iter = self.candidates.iterate()?;
        while let Some((key, value)) = iter.next_entry()? {
            if key == WATERMARK_KEY {
                continue;
            }
            let hex_list: Vec<String> = serde_json::from_slice(&value)?;
            count += hex_list.len() as u64;
        }
        Ok(count)
    }

    /// Applies a reference count diff under the guard of the per-chunk
    /// change log id, so the same event is never applied twice.
    fn apply_diff(
        &self,
        log_id: u64,
        diff: &BTreeMap<Fingerprint, i64>,
        register_candidates: bool,
    ) -> Result<(), Error> {
        for (fingerprint, delta) in diff {
            let mut mapping = match self.chunk_index.lookup(fingerprint)? {
                Some(mapping) => mapping,
                None => {
                    if *delta > 0 {
                        log::warn!(
                            "usage count +{delta} for unknown chunk {fingerprint} (event {log_id})"
                        );
                    }
                    continue;
                }
            };
            if mapping.usage_count_change_log_id >= log_id {
                log::info!("current event has already been processed (event {log_id})");
                continue;
            }
            let count = mapping.usage_count as i64 + delta;
            mapping.usage_count = std::cmp::max(0, count) as u64;
            mapping.usage_count_change_log_id = log_id;
            self.chunk_index.update(&mapping)?;

            if mapping.usage_count == 0 && register_candidates {
                self.add_candidate(mapping.data_address, *fingerprint)?;
            }
        }
        Ok(())
    }

    /// Idle-time processing of the candidate set.
    ///
    /// Every candidate is re-checked: in-combat fingerprints and chunks
    /// that got re-referenced are kept alive, everything else is removed
    /// from the chunk index and deleted from its container.
    pub fn process_candidates(&self) -> Result<u64, Error> {
        let mut container_ids = Vec::new();
        {
            let mut iter = self.candidates.iterate()?;
            while let Some((key, _)) = iter.next_entry()? {
                if key == WATERMARK_KEY {
                    continue;
                }
                if let Ok(bytes) = <[u8; 8]>::try_from(key.as_slice()) {
                    container_ids.push(u64::from_le_bytes(bytes));
                }
            }
        }

        let mut deleted = 0;
        for container_id in container_ids {
            let fingerprints = self.read_candidates(container_id)?;
            let mut retained = Vec::new();
            for fingerprint in fingerprints {
                if self.chunk_index.is_in_combat(&fingerprint) {
                    // an in-flight write may re-reference the chunk
                    retained.push(fingerprint);
                    continue;
                }
                let mapping = match self.chunk_index.lookup(&fingerprint)? {
                    Some(mapping) => mapping,
                    None => continue, // already deleted
                };
                if mapping.usage_count > 0 {
                    // re-referenced since the candidate was registered
                    continue;
                }
                if let Err(err) = self.delete_chunk(&mapping.fingerprint, mapping.data_address) {
                    log::warn!("gc deletion of chunk {fingerprint} failed - {err}");
                    retained.push(fingerprint);
                    continue;
                }
                deleted += 1;
            }
            self.write_candidates(container_id, &retained)?;
        }
        Ok(deleted)
    }

    fn delete_chunk(&self, fingerprint: &Fingerprint, data_address: u64) -> Result<(), Error> {
        self.chunk_index.delete(fingerprint)?;
        let (item_count, active_data_size) =
            self.storage.delete_chunk(data_address, fingerprint)?;
        if let Some(container_gc) = &self.container_gc {
            container_gc.update_container(data_address, item_count, active_data_size)?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        self.candidates.close()
    }
}

impl LogConsumer for UsageCountGarbageCollector {
    fn log_replay(&self, event: &LogEvent, mode: ReplayMode) -> Result<(), Error> {
        if mode == ReplayMode::Direct {
            return Ok(());
        }
        let watermark = self.state.lock().unwrap().watermark;
        if event.log_id <= watermark {
            log::info!(
                "current event has already been processed (event {})",
                event.log_id
            );
            return Ok(());
        }

        match &event.payload {
            EventPayload::BlockMappingWritten { pair } => {
                self.apply_diff(event.log_id, &mapping_diff(pair), true)?;
                self.persist_watermark(event.log_id)?;
            }
            EventPayload::BlockMappingDeleted { previous } => {
                let pair = BlockMappingPair::new(
                    previous.clone(),
                    dedup_api_types::BlockMapping::new_empty(
                        previous.block_id,
                        previous.block_size,
                    ),
                );
                self.apply_diff(event.log_id, &mapping_diff(&pair), true)?;
                self.persist_watermark(event.log_id)?;
            }
            EventPayload::BlockMappingWriteFailed {
                pair,
                write_event_log_id,
            } => {
                // reverse the diff if the write event was ever applied
                if write_event_log_id.is_some() {
                    let reversed = BlockMappingPair::new(pair.modified.clone(), pair.previous.clone());
                    self.apply_diff(event.log_id, &mapping_diff(&reversed), true)?;
                }
                self.persist_watermark(event.log_id)?;
            }
            _ => (),
        }
        Ok(())
    }
}

impl IdleTickConsumer for UsageCountGarbageCollector {
    fn on_idle_tick(&self) {
        if let Err(err) = self.process_candidates() {
            log::warn!("gc candidate processing failed - {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dedup_api_types::{BlockMapping, BlockMappingItem, FINGERPRINT_SIZE};

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::new([b; FINGERPRINT_SIZE])
    }

    fn mapping(version: u64, fingerprints: &[Fingerprint]) -> BlockMapping {
        let size = 4096 / fingerprints.len() as u32;
        let items = fingerprints
            .iter()
            .enumerate()
            .map(|(i, fingerprint)| {
                BlockMappingItem::new(i as u32 * size, size, *fingerprint, 1)
            })
            .collect();
        BlockMapping::new(1, 4096, version, items)
    }

    #[test]
    fn diff_counts_multiplicity_and_cancels() {
        let previous = mapping(1, &[fp(1), fp(2), fp(1), fp(3)]);
        let modified = mapping(2, &[fp(1), fp(4), fp(4), fp(3)]);
        let diff = mapping_diff(&BlockMappingPair::new(previous, modified));

        assert_eq!(diff.get(&fp(1)), Some(&-1));
        assert_eq!(diff.get(&fp(2)), Some(&-1));
        assert_eq!(diff.get(&fp(3)), None); // cancelled
        assert_eq!(diff.get(&fp(4)), Some(&2));
    }

    #[test]
    fn diff_against_empty_mapping_counts_all_items() {
        let empty = BlockMapping::new_empty(1, 4096);
        let modified = mapping(1, &[fp(1), fp(1)]);
        let diff = mapping_diff(&BlockMappingPair::new(empty.clone(), modified.clone()));
        assert_eq!(diff.get(&fp(1)), Some(&2));

        // unstored items of the empty mapping never count
        let reverse = mapping_diff(&BlockMappingPair::new(modified, empty));
        assert_eq!(reverse.get(&fp(1)), Some(&-2));
    }

    #[test]
    fn duplicate_event_delivery_is_a_no_op() {
        use crate::container::ContainerStorageConfig;
        use crate::log::{LogConfig, LogEvent, OperationLog};
        use crate::testutil::TestDir;
        use dedup_api_types::ChunkMapping;
        use dedup_index::DiskHashIndexConfig;

        let dir = TestDir::new("gc-duplicate-delivery");
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

        let mut storage_config = ContainerStorageConfig {
            container_size: 8 * 1024,
            sync: false,
            ..Default::default()
        };
        storage_config.filenames.push(dir.path().join("container.data"));
        storage_config.file_size = Some(8 * 8 * 1024);
        for (name, value) in [
            ("filename", dir.path().join("meta.data").display().to_string()),
            ("page-size", "4096".to_string()),
            ("size", (32 * 4096).to_string()),
            ("sync", "false".to_string()),
        ] {
            storage_config.meta_data.1.push((name.to_string(), value));
        }
        let storage = Arc::new(
            ContainerStorage::start(storage_config, Arc::clone(&log), true, false).unwrap(),
        );

        let mut index_config = DiskHashIndexConfig {
            page_size: 4096,
            size: 32 * 4096,
            sync_mode: dedup_api_types::SyncMode::Unsafe,
            ..Default::default()
        };
        index_config.filenames.push(dir.path().join("chunk-index.data"));
        let chunk_index = Arc::new(
            ChunkIndex::start(index_config, Arc::clone(&storage), true, false).unwrap(),
        );
        chunk_index.put(&ChunkMapping::new(fp(1), 1)).unwrap();

        let gc = UsageCountGarbageCollector::start(
            UsageGcConfig::default(),
            Arc::clone(&chunk_index),
            storage,
            None,
            true,
            false,
        )
        .unwrap();

        let event = LogEvent {
            log_id: 7,
            payload: EventPayload::BlockMappingWritten {
                pair: BlockMappingPair::new(
                    BlockMapping::new_empty(1, 4096),
                    mapping(1, &[fp(1), fp(1)]),
                ),
            },
        };

        gc.log_replay(&event, ReplayMode::Background).unwrap();
        let counted = chunk_index.lookup(&fp(1)).unwrap().unwrap();
        assert_eq!(counted.usage_count, 2);
        assert_eq!(counted.usage_count_change_log_id, 7);

        // re-delivery of the same event changes nothing
        gc.log_replay(&event, ReplayMode::Background).unwrap();
        assert_eq!(chunk_index.lookup(&fp(1)).unwrap().unwrap(), counted);

        // and direct delivery never applies diffs
        gc.log_replay(&event, ReplayMode::Direct).unwrap();
        assert_eq!(chunk_index.lookup(&fp(1)).unwrap().unwrap(), counted);
    }
}
