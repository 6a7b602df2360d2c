use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Error};

use dedup_index::{create_index, parse_size, PersistentIndex};

use crate::log::{EventPayload, LogConsumer, LogEvent, ReplayMode};

use super::format::merged_fits;
use super::storage::ContainerStorage;

/// Configuration of the greedy container merge strategy.
#[derive(Clone, Debug)]
pub struct GreedyContainerGcConfig {
    /// Containers with less active data than this are merge candidates.
    pub threshold: u32,
    /// Candidates must not hold more live items than this.
    pub item_count_threshold: u32,
    /// Width of the data-size buckets of the candidate index.
    pub bucket_size: u32,
    /// Recently touched containers are skipped.
    pub eviction_timeout: Duration,
    /// Candidate index type name plus its options.
    pub index: (String, Vec<(String, String)>),
}

impl Default for GreedyContainerGcConfig {
    fn default() -> Self {
        Self {
            threshold: 64 * 1024,
            item_count_threshold: 1024,
            bucket_size: 8 * 1024,
            eviction_timeout: Duration::from_secs(5),
            index: ("mem-hash".to_string(), Vec::new()),
        }
    }
}

impl GreedyContainerGcConfig {
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "type" => {
                if value != "greedy" {
                    bail!("unknown container gc type '{value}'");
                }
            }
            "threshold" => self.threshold = parse_size(value)? as u32,
            "item-count-threshold" => self.item_count_threshold = value.parse()?,
            "bucket-size" => self.bucket_size = parse_size(value)? as u32,
            "eviction-timeout" => {
                self.eviction_timeout = Duration::from_secs(value.parse()?);
            }
            "index" => self.index = (value.to_string(), Vec::new()),
            // remaining options configure the candidate index
            _ => self.index.1.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }
}

fn bucket_key(bucket: u32) -> [u8; 4] {
    bucket.to_le_bytes()
}

/// Merging garbage collector for sparsely filled containers.
///
/// Committed containers whose active data size falls below the threshold
/// are indexed by data-size bucket. Idle processing scans the buckets from
/// the sparsest upward, picks one candidate and a partner whose combined
/// content fits one container, and merges them (or deletes a lone empty
/// candidate).
pub struct GreedyContainerGc {
    config: GreedyContainerGcConfig,
    candidates: Box<dyn PersistentIndex>,
    storage: Arc<ContainerStorage>,
    touch: Mutex<HashMap<u64, Instant>>,
    /// Serializes idle processing against event updates.
    scan_lock: Mutex<()>,
}

impl GreedyContainerGc {
    pub fn start(
        config: GreedyContainerGcConfig,
        storage: Arc<ContainerStorage>,
        create: bool,
        force: bool,
    ) -> Result<Self, Error> {
        let (type_name, options) = &config.index;
        let candidates = create_index(type_name, options, create, force)?;
        Ok(Self {
            config,
            candidates,
            storage,
            touch: Mutex::new(HashMap::new()),
            scan_lock: Mutex::new(()),
        })
    }

    fn bucket_of(&self, active_data_size: u32) -> u32 {
        active_data_size / self.config.bucket_size
    }

    fn is_candidate(&self, item_count: u32, active_data_size: u32) -> bool {
        active_data_size < self.config.threshold
            && item_count <= self.config.item_count_threshold
    }

    fn read_bucket(&self, bucket: u32) -> Result<Vec<u64>, Error> {
        match self.candidates.lookup(&bucket_key(bucket))? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Ok(Vec::new()),
        }
    }

    fn write_bucket(&self, bucket: u32, ids: &[u64]) -> Result<(), Error> {
        if ids.is_empty() {
            self.candidates.delete(&bucket_key(bucket))?;
        } else {
            self.candidates
                .put(&bucket_key(bucket), &serde_json::to_vec(ids)?)?;
        }
        Ok(())
    }

    fn add_candidate(&self, container_id: u64, active_data_size: u32) -> Result<(), Error> {
        let bucket = self.bucket_of(active_data_size);
        let mut ids = self.read_bucket(bucket)?;
        if !ids.contains(&container_id) {
            ids.push(container_id);
            ids.sort_unstable();
            self.write_bucket(bucket, &ids)?;
        }
        Ok(())
    }

    fn remove_candidate(&self, container_id: u64) -> Result<(), Error> {
        // the id may sit in any bucket after stale updates
        let buckets = self.all_buckets()?;
        for (bucket, mut ids) in buckets {
            if let Some(pos) = ids.iter().position(|id| *id == container_id) {
                ids.remove(pos);
                self.write_bucket(bucket, &ids)?;
            }
        }
        Ok(())
    }

    fn all_buckets(&self) -> Result<Vec<(u32, Vec<u64>)>, Error> {
        let mut buckets = Vec::new();
        let mut iter = self.candidates.iterate()?;
        while let Some((key, value)) = iter.next_entry()? {
            let bucket = u32::from_le_bytes(
                key.as_slice()
                    .try_into()
                    .map_err(|_| anyhow::format_err!("illegal gc bucket key"))?,
            );
            let ids: Vec<u64> = serde_json::from_slice(&value)?;
            buckets.push((bucket, ids));
        }
        buckets.sort_by_key(|(bucket, _)| *bucket);
        Ok(buckets)
    }

    fn touch_container(&self, container_id: u64) {
        self.touch
            .lock()
            .unwrap()
            .insert(container_id, Instant::now());
    }

    fn recently_touched(&self, container_id: u64) -> bool {
        match self.touch.lock().unwrap().get(&container_id) {
            Some(at) => at.elapsed() < self.config.eviction_timeout,
            None => false,
        }
    }

    /// Re-registers a container after its active counts changed.
    pub fn update_container(
        &self,
        container_id: u64,
        item_count: u32,
        active_data_size: u32,
    ) -> Result<(), Error> {
        let _guard = self.scan_lock.lock().unwrap();
        self.remove_candidate(container_id)?;
        if self.is_candidate(item_count, active_data_size) {
            self.add_candidate(container_id, active_data_size)?;
        }
        self.touch_container(container_id);
        Ok(())
    }

    pub fn candidate_count(&self) -> Result<u64, Error> {
        let mut count = 0;
        for (_, ids) in self.all_buckets()? {
            count += ids.len() as u64;
        }
        Ok(count)
    }

    /// One garbage collection step: merge one pair or delete one empty
    /// container. Returns true if progress was made.
    pub fn on_idle(&self) -> Result<bool, Error> {
        let _guard = self.scan_lock.lock().unwrap();

        // validate candidates bucket by bucket, sparsest first
        let mut valid: Vec<(u64, u32, u32)> = Vec::new(); // (id, item_count, active)
        for (bucket, ids) in self.all_buckets()? {
            for id in ids {
                let resolved = self.storage.resolve(id)?;
                let (primary_id, record) = match resolved {
                    Some(resolved) => resolved,
                    None => {
                        // the container is gone; drop the stale entry
                        self.remove_from_bucket(bucket, id)?;
                        continue;
                    }
                };
                if primary_id != id {
                    // secondary ids are not merge candidates
                    self.remove_from_bucket(bucket, id)?;
                    continue;
                }
                if self.bucket_of(record.active_data_size) != bucket {
                    // stale bucket assignment; re-register
                    self.remove_from_bucket(bucket, id)?;
                    if self.is_candidate(record.item_count, record.active_data_size) {
                        self.add_candidate(id, record.active_data_size)?;
                    }
                    continue;
                }
                if self.recently_touched(id) {
                    continue;
                }
                valid.push((id, record.item_count, record.active_data_size));
            }
        }

        let (candidate_id, candidate_items, candidate_data) = match valid.first() {
            Some(first) => *first,
            None => return Ok(false),
        };

        if candidate_items == 0 && candidate_data == 0 {
            self.storage.delete_container(candidate_id)?;
            self.remove_candidate(candidate_id)?;
            self.touch.lock().unwrap().remove(&candidate_id);
            return Ok(true);
        }

        let partner = valid.iter().skip(1).find(|(id, items, data)| {
            *id != candidate_id
                && merged_fits(
                    self.storage.container_size(),
                    candidate_items + items,
                    candidate_data + data,
                )
        });
        let (partner_id, _, _) = match partner {
            Some(partner) => *partner,
            None => return Ok(false),
        };

        // deterministic pair order
        let (first, second) = (
            std::cmp::min(candidate_id, partner_id),
            std::cmp::max(candidate_id, partner_id),
        );
        let new_primary = self.storage.merge_containers(first, second)?;
        self.remove_candidate(first)?;
        self.remove_candidate(second)?;
        if let Some((_, record)) = self.storage.resolve(new_primary)? {
            if self.is_candidate(record.item_count, record.active_data_size) {
                self.add_candidate(new_primary, record.active_data_size)?;
            }
        }
        self.touch_container(new_primary);
        Ok(true)
    }

    fn remove_from_bucket(&self, bucket: u32, container_id: u64) -> Result<(), Error> {
        let mut ids = self.read_bucket(bucket)?;
        if let Some(pos) = ids.iter().position(|id| *id == container_id) {
            ids.remove(pos);
            self.write_bucket(bucket, &ids)?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        self.candidates.close()
    }
}

impl crate::idle::IdleTickConsumer for GreedyContainerGc {
    fn on_idle_tick(&self) {
        match self.on_idle() {
            Ok(true) => log::debug!("container gc made progress"),
            Ok(false) => (),
            Err(err) => log::warn!("container gc failed - {err:#}"),
        }
    }
}

impl LogConsumer for GreedyContainerGc {
    fn log_replay(&self, event: &LogEvent, mode: ReplayMode) -> Result<(), Error> {
        if mode == ReplayMode::Direct {
            return Ok(());
        }
        let _guard = self.scan_lock.lock().unwrap();
        match &event.payload {
            EventPayload::ContainerCommitted {
                container_id,
                item_count,
                active_data_size,
            } => {
                if self.is_candidate(*item_count, *active_data_size) {
                    self.add_candidate(*container_id, *active_data_size)?;
                }
                self.touch_container(*container_id);
            }
            EventPayload::ContainerMerged {
                first_id,
                second_id,
                new_primary_id,
                item_count,
                active_data_size,
            } => {
                self.remove_candidate(*first_id)?;
                self.remove_candidate(*second_id)?;
                if self.is_candidate(*item_count, *active_data_size) {
                    self.add_candidate(*new_primary_id, *active_data_size)?;
                }
                self.touch_container(*new_primary_id);
            }
            EventPayload::ContainerDeleted { container_id } => {
                self.remove_candidate(*container_id)?;
                self.touch.lock().unwrap().remove(container_id);
            }
            _ => (),
        }
        Ok(())
    }
}
