use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use dedup_api_types::{CompressionType, Fingerprint, WriteCacheStrategy};
use dedup_index::file::DataFile;
use dedup_index::{create_index, parse_bool, parse_size, PersistentIndex};

use crate::log::{EventPayload, OperationLog};

use super::alloc::{ContainerAddress, ContainerAllocator};
use super::format::Container;
use super::read_cache::ContainerReadCache;

/// Persistent metadata record of one logical container id.
///
/// The record under a primary id carries the physical address; the record
/// under a secondary id only points at the primary. Resolution is one
/// pointer hop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerMetaData {
    pub primary_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<ContainerAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_ids: Vec<u64>,
    pub item_count: u32,
    pub active_data_size: u32,
}

/// Configuration of the [ContainerStorage].
#[derive(Clone, Debug)]
pub struct ContainerStorageConfig {
    pub container_size: usize,
    pub size: u64,
    pub filenames: Vec<PathBuf>,
    pub file_size: Option<u64>,
    pub write_container_count: usize,
    pub write_cache_strategy: WriteCacheStrategy,
    /// Read cache capacity in containers.
    pub read_cache_size: usize,
    pub compression: CompressionType,
    pub checksum: bool,
    pub meta_data: (String, Vec<(String, String)>),
    pub alloc_filename: Option<PathBuf>,
    pub sync: bool,
}

impl Default for ContainerStorageConfig {
    fn default() -> Self {
        Self {
            container_size: 512 * 1024,
            size: 0,
            filenames: Vec::new(),
            file_size: None,
            write_container_count: 4,
            write_cache_strategy: WriteCacheStrategy::default(),
            read_cache_size: 16,
            compression: CompressionType::None,
            checksum: true,
            meta_data: ("static-disk-hash".to_string(), Vec::new()),
            alloc_filename: None,
            sync: true,
        }
    }
}

impl ContainerStorageConfig {
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "container-size" => self.container_size = parse_size(value)? as usize,
            "size" => self.size = parse_size(value)?,
            "filename" => self.filenames.push(PathBuf::from(value)),
            "filesize" => self.file_size = Some(parse_size(value)?),
            "write-container-count" => self.write_container_count = value.parse()?,
            "write-cache.strategy" => self.write_cache_strategy = value.parse()?,
            "read-cache-size" => self.read_cache_size = value.parse()?,
            "compression" => self.compression = value.parse()?,
            "checksum" => self.checksum = parse_bool(value)?,
            "meta-data" => self.meta_data = (value.to_string(), Vec::new()),
            "alloc.filename" => self.alloc_filename = Some(PathBuf::from(value)),
            "alloc" => {
                if value != "bitmap" {
                    bail!("unknown container allocator '{value}'");
                }
            }
            "sync" => self.sync = parse_bool(value)?,
            _ => {
                if let Some(sub) = name.strip_prefix("meta-data.") {
                    self.meta_data.1.push((sub.to_string(), value.to_string()));
                } else {
                    bail!("unknown container storage option '{name}'");
                }
            }
        }
        Ok(())
    }

    fn file_slot_counts(&self) -> Result<Vec<u64>, Error> {
        if self.filenames.is_empty() {
            bail!("container storage has no data files");
        }
        let per_file = match self.file_size {
            Some(size) => size,
            None => self.size / self.filenames.len() as u64,
        };
        let slots = per_file / self.container_size as u64;
        if slots == 0 {
            bail!(
                "container file size {} smaller than the container size {}",
                per_file,
                self.container_size
            );
        }
        Ok(vec![slots; self.filenames.len()])
    }
}

fn meta_key(container_id: u64) -> [u8; 8] {
    container_id.to_le_bytes()
}

/// Synchronous observer of container commits.
///
/// Callbacks run on the committing thread right after the commit event
/// was logged; the log replay of `ContainerCommitted` delivers the same
/// information again for crash recovery, so implementations must be
/// idempotent.
pub trait StorageCommitCallback: Send + Sync {
    fn on_container_commit(&self, container_id: u64) -> Result<(), Error>;

    fn on_container_commit_failed(&self, _container_id: u64) -> Result<(), Error> {
        Ok(())
    }
}

/// Append-structured chunk container store.
///
/// Chunk payloads are packed into fixed-size containers identified by
/// monotonic logical ids. Open containers live in the write cache;
/// committed containers are reachable through the metadata index, which
/// keeps logical ids stable across merges.
pub struct ContainerStorage {
    config: ContainerStorageConfig,
    files: Vec<DataFile>,
    meta: Box<dyn PersistentIndex>,
    allocator: ContainerAllocator,
    read_cache: ContainerReadCache,
    write_slots: Vec<Mutex<Option<Container>>>,
    next_slot: AtomicUsize,
    open_ids: RwLock<HashSet<u64>>,
    next_container_id: AtomicU64,
    log: Arc<OperationLog>,
    commit_callbacks: RwLock<Vec<(String, Arc<dyn StorageCommitCallback>)>>,
}

impl ContainerStorage {
    pub fn start(
        config: ContainerStorageConfig,
        log: Arc<OperationLog>,
        create: bool,
        force: bool,
    ) -> Result<Self, Error> {
        let file_slots = config.file_slot_counts()?;

        let mut files = Vec::new();
        for (i, filename) in config.filenames.iter().enumerate() {
            let file = DataFile::open(filename, create)?;
            let wanted = file_slots[i] * config.container_size as u64;
            if file.size()? < wanted {
                file.allocate(wanted)?;
            }
            files.push(file);
        }

        let (meta_type, meta_options) = &config.meta_data;
        let meta = create_index(meta_type, meta_options, create, force)?;

        let alloc_path = config
            .alloc_filename
            .clone()
            .unwrap_or_else(|| config.filenames[0].with_extension("alloc"));
        let allocator = ContainerAllocator::open(
            alloc_path,
            config.container_size as u64,
            file_slots,
            create,
        )?;

        let read_cache = ContainerReadCache::new(std::cmp::max(8, config.read_cache_size));
        let write_slots = (0..std::cmp::max(1, config.write_container_count))
            .map(|_| Mutex::new(None))
            .collect();

        let mut storage = Self {
            config,
            files,
            meta,
            allocator,
            read_cache,
            write_slots,
            next_slot: AtomicUsize::new(0),
            open_ids: RwLock::new(HashSet::new()),
            next_container_id: AtomicU64::new(1),
            log,
            commit_callbacks: RwLock::new(Vec::new()),
        };
        if !create {
            storage.verify_and_restore()?;
        }
        Ok(storage)
    }

    /// Restores the next container id and reconciles the allocator bitmap
    /// with the metadata index after a restart.
    fn verify_and_restore(&mut self) -> Result<(), Error> {
        let mut max_id = 0u64;
        let mut addresses = HashSet::new();
        {
            let mut iter = self.meta.iterate()?;
            while let Some((key, value)) = iter.next_entry()? {
                let id = u64::from_le_bytes(
                    key.as_slice()
                        .try_into()
                        .map_err(|_| format_err!("illegal container meta key"))?,
                );
                max_id = std::cmp::max(max_id, id);
                let record: ContainerMetaData = serde_json::from_slice(&value)?;
                if let Some(address) = record.address {
                    addresses.insert(address);
                }
            }
        }
        self.next_container_id = AtomicU64::new(max_id + 1);

        for address in &addresses {
            if self.allocator.is_free(*address)? {
                log::warn!(
                    "allocator lost slot for container address {:?}, re-marking",
                    address
                );
                self.allocator.mark_allocated(*address)?;
            }
        }
        for slot in 0..self.allocator.total_slots() {
            let address = self.allocator.slot_address(slot);
            if !self.allocator.is_free(address)? && !addresses.contains(&address) {
                log::warn!(
                    "allocator slot {:?} has no committed container, releasing",
                    address
                );
                self.allocator.free(address)?;
            }
        }
        Ok(())
    }

    pub fn container_size(&self) -> usize {
        self.config.container_size
    }

    pub fn free_container_count(&self) -> u64 {
        self.allocator.free_count()
    }

    /// True while the container is open in the write cache.
    pub fn is_container_open(&self, container_id: u64) -> bool {
        self.open_ids.read().unwrap().contains(&container_id)
    }

    /// True once the container has a committed metadata record.
    pub fn is_committed(&self, container_id: u64) -> Result<bool, Error> {
        Ok(self.resolve(container_id)?.is_some())
    }

    /// Appends a chunk to an open container and returns the container id.
    ///
    /// A write that no longer fits commits the open container and opens a
    /// new one.
    pub fn write_chunk(&self, fingerprint: Fingerprint, data: &[u8]) -> Result<u64, Error> {
        let slot_idx = match self.config.write_cache_strategy {
            WriteCacheStrategy::RoundRobin => {
                self.next_slot.fetch_add(1, Ordering::SeqCst) % self.write_slots.len()
            }
            WriteCacheStrategy::EarliestFree => {
                let mut found = None;
                for (i, slot) in self.write_slots.iter().enumerate() {
                    if slot.try_lock().is_ok() {
                        found = Some(i);
                        break;
                    }
                }
                // all slots locked: block on the rotation slot
                found.unwrap_or(self.next_slot.fetch_add(1, Ordering::SeqCst) % self.write_slots.len())
            }
        };

        let mut slot = self.write_slots[slot_idx].lock().unwrap();

        if let Some(container) = slot.as_ref() {
            if !container.has_room(data.len()) {
                let full = slot.take().unwrap();
                self.commit_container(full)?;
            }
        }
        if slot.is_none() {
            let id = self.next_container_id.fetch_add(1, Ordering::SeqCst);
            self.open_ids.write().unwrap().insert(id);
            *slot = Some(Container::new(id, self.config.container_size));
        }

        let container = slot.as_mut().unwrap();
        if !container.has_room(data.len()) {
            bail!(
                "chunk of {} bytes does not fit into an empty container",
                data.len()
            );
        }
        container.add_item(fingerprint, data.to_vec())?;
        Ok(container.primary_id)
    }

    /// Commits one container: allocate, write, install metadata, log.
    ///
    /// Readers never observe a partially written container because the
    /// metadata record is installed only after the write completed.
    fn commit_container(&self, container: Container) -> Result<(), Error> {
        let container_id = container.primary_id;
        match self.commit_container_inner(&container) {
            Ok(()) => Ok(()),
            Err(err) => {
                // the container content is lost; cascade to the failure
                // callbacks so dependent block mappings revert
                self.open_ids.write().unwrap().remove(&container_id);
                let callbacks = self.commit_callbacks.read().unwrap();
                for (name, callback) in callbacks.iter() {
                    if let Err(cb_err) = callback.on_container_commit_failed(container_id) {
                        log::error!("commit failure callback '{name}' failed - {cb_err:#}");
                    }
                }
                Err(err).with_context(|| format!("commit of container {container_id} failed"))
            }
        }
    }

    fn commit_container_inner(&self, container: &Container) -> Result<(), Error> {
        let buf = container.serialize(self.config.compression, self.config.checksum)?;
        let address = self
            .allocator
            .allocate(false)?
            .ok_or_else(|| format_err!("container storage full"))?;

        let file = &self.files[address.file_index as usize];
        if let Err(err) = file.write_at(address.file_offset, &buf) {
            let _ = self.allocator.free(address);
            return Err(err);
        }
        if self.config.sync {
            file.sync()?;
        }

        let record = ContainerMetaData {
            primary_id: container.primary_id,
            address: Some(address),
            secondary_ids: Vec::new(),
            item_count: container.items.len() as u32,
            active_data_size: container.active_data_size(),
        };
        self.meta
            .put(&meta_key(container.primary_id), &serde_json::to_vec(&record)?)?;

        self.read_cache
            .insert(container.primary_id, Arc::new(container.clone()));
        self.log.commit_event(EventPayload::ContainerCommitted {
            container_id: container.primary_id,
            item_count: record.item_count,
            active_data_size: record.active_data_size,
        })?;
        // from here on the container counts as committed; block mapping
        // promotions always follow the commit event in the log
        self.open_ids.write().unwrap().remove(&container.primary_id);

        let callbacks = self.commit_callbacks.read().unwrap();
        for (name, callback) in callbacks.iter() {
            callback
                .on_container_commit(container.primary_id)
                .with_context(|| format!("commit callback '{name}'"))?;
        }
        Ok(())
    }

    pub fn register_commit_callback(&self, name: &str, callback: Arc<dyn StorageCommitCallback>) {
        self.commit_callbacks
            .write()
            .unwrap()
            .push((name.to_string(), callback));
    }

    /// Fails an open container: its content is discarded and the commit
    /// failure callbacks run (block mappings revert, reference changes
    /// get corrected).
    pub fn fail_container(&self, container_id: u64) -> Result<(), Error> {
        if !self.discard_open_container(container_id) {
            bail!("container {container_id} is not open");
        }
        let callbacks = self.commit_callbacks.read().unwrap();
        for (name, callback) in callbacks.iter() {
            callback
                .on_container_commit_failed(container_id)
                .with_context(|| format!("commit failure callback '{name}'"))?;
        }
        Ok(())
    }

    /// Commits every open container. Returns the committed ids.
    pub fn flush(&self) -> Result<Vec<u64>, Error> {
        let mut committed = Vec::new();
        for slot in &self.write_slots {
            let container = slot.lock().unwrap().take();
            if let Some(container) = container {
                let id = container.primary_id;
                self.commit_container(container)?;
                committed.push(id);
            }
        }
        Ok(committed)
    }

    /// Drops one open container without committing it (failure path).
    pub fn discard_open_container(&self, container_id: u64) -> bool {
        for slot in &self.write_slots {
            let mut slot = slot.lock().unwrap();
            if slot.as_ref().map(|c| c.primary_id) == Some(container_id) {
                *slot = None;
                self.open_ids.write().unwrap().remove(&container_id);
                return true;
            }
        }
        false
    }

    /// Drops open containers without committing them (fast stop).
    pub fn discard_open(&self) -> Vec<u64> {
        let mut discarded = Vec::new();
        for slot in &self.write_slots {
            if let Some(container) = slot.lock().unwrap().take() {
                discarded.push(container.primary_id);
            }
        }
        self.open_ids.write().unwrap().clear();
        discarded
    }

    /// Resolves a logical id to its primary id and metadata (one hop).
    pub fn resolve(&self, container_id: u64) -> Result<Option<(u64, ContainerMetaData)>, Error> {
        let value = match self.meta.lookup(&meta_key(container_id))? {
            Some(value) => value,
            None => return Ok(None),
        };
        let record: ContainerMetaData = serde_json::from_slice(&value)?;
        if record.primary_id == container_id {
            return Ok(Some((container_id, record)));
        }
        let primary_id = record.primary_id;
        match self.meta.lookup(&meta_key(primary_id))? {
            Some(value) => {
                let primary: ContainerMetaData = serde_json::from_slice(&value)?;
                Ok(Some((primary_id, primary)))
            }
            None => bail!(
                "container {} points at missing primary {}",
                container_id,
                primary_id
            ),
        }
    }

    /// Loads a committed container, going through the read cache.
    pub fn read_container(&self, container_id: u64) -> Result<Arc<Container>, Error> {
        let (primary_id, record) = self
            .resolve(container_id)?
            .ok_or_else(|| format_err!("container {container_id} not committed"))?;

        if let Some(container) = self.read_cache.get(primary_id) {
            return Ok(container);
        }

        let address = record
            .address
            .ok_or_else(|| format_err!("container {primary_id} record has no address"))?;
        let mut buf = vec![0u8; self.config.container_size];
        self.files[address.file_index as usize].read_at(address.file_offset, &mut buf)?;
        let mut container = Container::parse(&buf)
            .with_context(|| format!("container {primary_id} at {:?}", address))?;
        if container.primary_id != primary_id {
            bail!(
                "container at {:?} has id {} instead of {}",
                address,
                container.primary_id,
                primary_id
            );
        }
        container.secondary_ids = record.secondary_ids.clone();

        let container = Arc::new(container);
        self.read_cache.insert(primary_id, Arc::clone(&container));
        Ok(container)
    }

    /// Reads one chunk payload, checking open containers first.
    pub fn read_chunk(&self, container_id: u64, fingerprint: &Fingerprint) -> Result<Vec<u8>, Error> {
        for slot in &self.write_slots {
            let slot = slot.lock().unwrap();
            if let Some(container) = slot.as_ref() {
                if container.primary_id == container_id {
                    if let Some(item) = container.find_item(fingerprint) {
                        return Ok(item.payload.clone());
                    }
                    bail!(
                        "chunk {} not found in open container {}",
                        fingerprint,
                        container_id
                    );
                }
            }
        }

        let container = self.read_container(container_id)?;
        match container.find_item(fingerprint) {
            Some(item) => Ok(item.payload.clone()),
            None => bail!(
                "chunk {} not found in container {}",
                fingerprint,
                container_id
            ),
        }
    }

    /// Removes a chunk from its committed container (garbage collection).
    ///
    /// The container is rewritten in place at its current address; the
    /// metadata record is updated with the reduced active counts.
    /// Returns the new (item_count, active_data_size) of the container.
    pub fn delete_chunk(
        &self,
        container_id: u64,
        fingerprint: &Fingerprint,
    ) -> Result<(u32, u32), Error> {
        let (primary_id, mut record) = self
            .resolve(container_id)?
            .ok_or_else(|| format_err!("container {container_id} not committed"))?;
        let address = record
            .address
            .ok_or_else(|| format_err!("container {primary_id} record has no address"))?;

        let current = self.read_container(primary_id)?;
        let mut container = (*current).clone();
        if !container.delete_item(fingerprint) {
            bail!(
                "chunk {} not found in container {}",
                fingerprint,
                primary_id
            );
        }

        let buf = container.serialize(self.config.compression, self.config.checksum)?;
        let file = &self.files[address.file_index as usize];
        file.write_at(address.file_offset, &buf)?;
        if self.config.sync {
            file.sync()?;
        }

        record.item_count = container.active_item_count();
        record.active_data_size = container.active_data_size();
        self.meta
            .put(&meta_key(primary_id), &serde_json::to_vec(&record)?)?;
        self.read_cache.invalidate(primary_id);

        Ok((record.item_count, record.active_data_size))
    }

    /// Merges two committed containers into a freshly allocated one.
    ///
    /// The surviving primary id is the lower one; every other involved id
    /// becomes a secondary resolving to it. No client address becomes
    /// invalid.
    pub fn merge_containers(&self, first: u64, second: u64) -> Result<u64, Error> {
        let (first, second) = (std::cmp::min(first, second), std::cmp::max(first, second));
        if first == second {
            bail!("cannot merge container {first} with itself");
        }
        let (first_primary, first_record) = self
            .resolve(first)?
            .ok_or_else(|| format_err!("container {first} not committed"))?;
        let (second_primary, second_record) = self
            .resolve(second)?
            .ok_or_else(|| format_err!("container {second} not committed"))?;
        if first_primary == second_primary {
            bail!("containers {first} and {second} already merged");
        }

        let first_container = self.read_container(first_primary)?;
        let second_container = self.read_container(second_primary)?;

        let new_primary = std::cmp::min(first_primary, second_primary);
        let mut merged = Container::new(new_primary, self.config.container_size);
        for source in [&first_container, &second_container] {
            for item in source.items.iter().filter(|item| !item.deleted) {
                merged.add_item(item.fingerprint, item.payload.clone()).with_context(
                    || format!("merge of containers {first_primary} and {second_primary}"),
                )?;
            }
        }

        let address = self
            .allocator
            .allocate(true)?
            .ok_or_else(|| format_err!("container storage full (merge)"))?;
        let buf = merged.serialize(self.config.compression, self.config.checksum)?;
        let file = &self.files[address.file_index as usize];
        if let Err(err) = file.write_at(address.file_offset, &buf) {
            let _ = self.allocator.free(address);
            return Err(err);
        }
        if self.config.sync {
            file.sync()?;
        }

        // every involved id resolves to the new primary afterwards
        let mut all_ids: Vec<u64> = vec![first_primary, second_primary];
        all_ids.extend(&first_record.secondary_ids);
        all_ids.extend(&second_record.secondary_ids);
        all_ids.sort_unstable();
        all_ids.dedup();
        let secondary_ids: Vec<u64> =
            all_ids.iter().copied().filter(|id| *id != new_primary).collect();

        let record = ContainerMetaData {
            primary_id: new_primary,
            address: Some(address),
            secondary_ids: secondary_ids.clone(),
            item_count: merged.active_item_count(),
            active_data_size: merged.active_data_size(),
        };
        self.meta
            .put(&meta_key(new_primary), &serde_json::to_vec(&record)?)?;
        for id in &secondary_ids {
            let pointer = ContainerMetaData {
                primary_id: new_primary,
                address: None,
                secondary_ids: Vec::new(),
                item_count: 0,
                active_data_size: 0,
            };
            self.meta.put(&meta_key(*id), &serde_json::to_vec(&pointer)?)?;
        }

        for (old_record, old_primary) in [
            (&first_record, first_primary),
            (&second_record, second_primary),
        ] {
            if let Some(old_address) = old_record.address {
                self.allocator.free(old_address)?;
            }
            self.read_cache.invalidate(old_primary);
        }
        self.read_cache.insert(new_primary, Arc::new(merged));

        self.log.commit_event(EventPayload::ContainerMerged {
            first_id: first_primary,
            second_id: second_primary,
            new_primary_id: new_primary,
            item_count: record.item_count,
            active_data_size: record.active_data_size,
        })?;
        Ok(new_primary)
    }

    /// Deletes an empty committed container and all its ids.
    pub fn delete_container(&self, container_id: u64) -> Result<(), Error> {
        let (primary_id, record) = self
            .resolve(container_id)?
            .ok_or_else(|| format_err!("container {container_id} not committed"))?;
        if record.item_count != 0 || record.active_data_size != 0 {
            bail!("container {primary_id} is not empty");
        }
        if let Some(address) = record.address {
            self.allocator.free(address)?;
        }
        self.meta.delete(&meta_key(primary_id))?;
        for id in &record.secondary_ids {
            self.meta.delete(&meta_key(*id))?;
        }
        self.read_cache.invalidate(primary_id);
        self.log
            .commit_event(EventPayload::ContainerDeleted {
                container_id: primary_id,
            })?;
        Ok(())
    }

    /// Re-creates a metadata record lost in a crash, from the replayed
    /// `ContainerCommitted` event and the container blob found on disk.
    ///
    /// Startup verification may already have released the orphaned slot,
    /// so the scan covers free slots too and re-marks the one it finds.
    pub fn restore_metadata(&self, container_id: u64) -> Result<bool, Error> {
        if self.resolve(container_id)?.is_some() {
            return Ok(false);
        }
        for slot in 0..self.allocator.total_slots() {
            let address = self.allocator.slot_address(slot);
            let mut buf = vec![0u8; self.config.container_size];
            self.files[address.file_index as usize].read_at(address.file_offset, &mut buf)?;
            let container = match Container::parse(&buf) {
                Ok(container) => container,
                Err(_) => continue,
            };
            if container.primary_id != container_id {
                continue;
            }
            let record = ContainerMetaData {
                primary_id: container_id,
                address: Some(address),
                secondary_ids: Vec::new(),
                item_count: container.items.len() as u32,
                active_data_size: container.active_data_size(),
            };
            self.allocator.mark_allocated(address)?;
            self.meta
                .put(&meta_key(container_id), &serde_json::to_vec(&record)?)?;
            log::info!("restored metadata record for container {container_id}");
            return Ok(true);
        }
        Ok(false)
    }

    /// Inspection dump of one container.
    pub fn container_info(&self, container_id: u64) -> Result<serde_json::Value, Error> {
        let (primary_id, record) = self
            .resolve(container_id)?
            .ok_or_else(|| format_err!("container {container_id} not committed"))?;
        let container = self.read_container(primary_id)?;
        let items: Vec<serde_json::Value> = container
            .items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "fingerprint": item.fingerprint.to_string(),
                    "size": item.payload.len(),
                    "deleted": item.deleted,
                })
            })
            .collect();
        Ok(serde_json::json!({
            "primary-id": primary_id,
            "secondary-ids": record.secondary_ids,
            "address": record.address,
            "item-count": record.item_count,
            "active-data-size": record.active_data_size,
            "items": items,
        }))
    }

    pub fn committed_container_count(&self) -> u64 {
        self.meta.item_count()
    }

    pub fn close(&self) -> Result<(), Error> {
        for file in &self.files {
            file.sync()?;
        }
        self.allocator.sync()?;
        self.meta.close()?;
        Ok(())
    }

    /// Drops a metadata record, leaving the container blob in place.
    ///
    /// Crash-injection hook for the recovery tests; never called in
    /// production code paths.
    #[doc(hidden)]
    pub fn drop_metadata_record(&self, container_id: u64) -> Result<bool, Error> {
        self.read_cache.invalidate(container_id);
        self.meta.delete(&meta_key(container_id))
    }

}
