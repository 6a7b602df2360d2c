use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use dedup_api_types::SyncMode;

use crate::cache::{CachePage, CacheStripe};
use crate::file::DataFile;
use crate::framed::{read_framed_file, write_framed_file};
use crate::page::{DiskHashPage, PAGE_HEADER_SIZE};
use crate::transaction::TransactionArea;
use crate::{create_index, IndexIterator, PersistentIndex, PutResult};

/// How a lookup interacts with the write-back cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheLookupMethod {
    /// Prefer the cache, fall back to disk, populate on miss.
    Default,
    /// Always read the persistent page.
    Bypass,
    /// Only consult the cache; a miss is reported as not found.
    CacheOnly,
}

/// Whether dirty cache entries are visible to a lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheDirtyMode {
    AllowDirty,
    IgnoreDirty,
}

const FILE_SYNC_CLEAN: u8 = 0;
const FILE_SYNC_DIRTY: u8 = 1;
const FILE_SYNC_IN_SYNC: u8 = 2;

/// Per-file lazy-sync state machine. Writers hold the read side while the
/// flusher holds the write side during fsync.
struct FileSyncState {
    state: AtomicU8,
    lock: RwLock<()>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexInfo {
    page_size: u32,
    size: u64,
    filenames: Vec<String>,
    overflow_area: bool,
}

/// Configuration of a [DiskHashIndex], assembled from dotted config options.
#[derive(Clone, Debug)]
pub struct DiskHashIndexConfig {
    pub page_size: usize,
    /// Total table size in bytes across all files.
    pub size: u64,
    pub filenames: Vec<PathBuf>,
    pub sync_mode: SyncMode,
    pub page_lock_count: usize,
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub checksum: bool,
    pub estimated_max_fill_ratio: f64,
    pub write_cache: bool,
    pub write_cache_max_page_count: usize,
    /// Overflow index type name plus its sub-options.
    pub overflow_area: Option<(String, Vec<(String, String)>)>,
    pub transaction_filename: Option<PathBuf>,
    pub transaction_slot_count: u64,
}

impl Default for DiskHashIndexConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            size: 0,
            filenames: Vec::new(),
            sync_mode: SyncMode::Sync,
            page_lock_count: 64,
            max_key_size: 512,
            max_value_size: 1024,
            checksum: true,
            estimated_max_fill_ratio: 0.8,
            write_cache: false,
            write_cache_max_page_count: 1024,
            overflow_area: None,
            transaction_filename: None,
            transaction_slot_count: 128,
        }
    }
}

impl DiskHashIndexConfig {
    /// Applies one dotted config option (`page-size`, `filename`, ...).
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "page-size" => self.page_size = parse_size(value)? as usize,
            "size" => self.size = parse_size(value)?,
            "filename" => self.filenames.push(PathBuf::from(value)),
            "sync" => self.sync_mode = value.parse()?,
            "page-lock-count" => self.page_lock_count = value.parse()?,
            "max-key-size" => self.max_key_size = value.parse()?,
            "max-value-size" => self.max_value_size = value.parse()?,
            "checksum" => self.checksum = parse_bool(value)?,
            "estimated-max-fill-ratio" => self.estimated_max_fill_ratio = value.parse()?,
            "write-cache" => self.write_cache = parse_bool(value)?,
            "write-cache.max-page-count" => self.write_cache_max_page_count = value.parse()?,
            "write-cache.max-item-count" => {
                // accepted for compatibility; the page count is the limit
            }
            "overflow-area" => {
                self.overflow_area = Some((value.to_string(), Vec::new()));
            }
            "transactions.filename" => self.transaction_filename = Some(PathBuf::from(value)),
            "transactions.area-size" => self.transaction_slot_count = value.parse()?,
            _ => {
                if let Some(sub) = name.strip_prefix("overflow-area.") {
                    match self.overflow_area.as_mut() {
                        Some((_, options)) => {
                            options.push((sub.to_string(), value.to_string()));
                        }
                        None => bail!("overflow-area sub option before overflow-area type"),
                    }
                } else {
                    bail!("unknown disk hash index option '{name}'");
                }
            }
        }
        Ok(())
    }

    fn check(&self) -> Result<(), Error> {
        if self.filenames.is_empty() {
            bail!("disk hash index has no data files");
        }
        if self.page_size < PAGE_HEADER_SIZE + 16 {
            bail!("illegal page size {}", self.page_size);
        }
        if self.size == 0 || self.size % self.page_size as u64 != 0 {
            bail!(
                "index size {} is not a multiple of the page size {}",
                self.size,
                self.page_size
            );
        }
        if self.page_lock_count == 0 {
            bail!("page lock count must be positive");
        }
        Ok(())
    }
}

/// Parses a strict "true"/"false" config value.
pub fn parse_bool(value: &str) -> Result<bool, Error> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("illegal boolean value '{value}'"),
    }
}

/// Parses a byte size with an optional K/M/G suffix.
pub fn parse_size(value: &str) -> Result<u64, Error> {
    let (digits, factor) = match value.as_bytes().last() {
        Some(b'K') => (&value[..value.len() - 1], 1024u64),
        Some(b'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format_err!("illegal size value '{value}'"))?;
    Ok(n * factor)
}

/// 64-bit FNV-1a. Stable across runs and platforms, which the bucket
/// assignment on disk depends on.
pub fn bucket_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Persistent open-addressing hash table at bucket (page) granularity.
///
/// Every bucket is one page in one of the data files. Page writes go
/// through the transaction area and are atomic against crashes. An
/// optional write-back cache holds recently used pages with per-entry
/// dirty and pinned state; an optional overflow index receives entries
/// displaced from full pages.
pub struct DiskHashIndex {
    config: DiskHashIndexConfig,
    bucket_count: u64,
    files: Vec<DataFile>,
    file_sync: Vec<FileSyncState>,
    stripes: Vec<RwLock<CacheStripe>>,
    tx: TransactionArea,
    overflow: Option<Box<dyn PersistentIndex>>,
    /// Entries stored in bucket pages (excluding the overflow area).
    local_item_count: AtomicU64,
    /// Bumped on every mutation; iterators fail on change.
    version: AtomicU64,
    info_path: PathBuf,
}

impl DiskHashIndex {
    /// Opens or creates the index described by `config`.
    ///
    /// On open the stored info file must match the configuration (page
    /// size, total size, file names, overflow presence) unless `force`
    /// is set. The transaction area is recovered before first use.
    pub fn start(config: DiskHashIndexConfig, create: bool, force: bool) -> Result<Self, Error> {
        config.check()?;

        let info_path = config.filenames[0].with_extension("info");
        let info = IndexInfo {
            page_size: config.page_size as u32,
            size: config.size,
            filenames: config
                .filenames
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            overflow_area: config.overflow_area.is_some(),
        };

        if create {
            if read_framed_file::<IndexInfo, _>(&info_path)?.is_some() {
                bail!("index info file {:?} already exists", info_path);
            }
            write_framed_file(&info_path, &info)?;
        } else {
            let stored: IndexInfo = read_framed_file(&info_path)?
                .ok_or_else(|| format_err!("index info file {:?} missing", info_path))?;
            if stored != info {
                if force {
                    log::warn!(
                        "index configuration mismatch for {:?} overridden by force",
                        info_path
                    );
                } else {
                    bail!(
                        "index configuration mismatch for {:?}: stored {:?}, configured {:?}",
                        info_path,
                        stored,
                        info
                    );
                }
            }
        }

        let bucket_count = config.size / config.page_size as u64;
        let file_count = config.filenames.len() as u64;

        let mut files = Vec::new();
        for (i, filename) in config.filenames.iter().enumerate() {
            let file = DataFile::open(filename, create)?;
            let buckets_in_file =
                bucket_count / file_count + u64::from((i as u64) < bucket_count % file_count);
            let wanted = buckets_in_file * config.page_size as u64;
            if file.size()? < wanted {
                file.allocate(wanted)?;
            }
            files.push(file);
        }

        let tx_path = config
            .transaction_filename
            .clone()
            .unwrap_or_else(|| config.filenames[0].with_extension("trans"));
        let tx = TransactionArea::open(
            tx_path,
            config.page_size,
            config.transaction_slot_count,
            config.sync_mode == SyncMode::Sync,
            true,
        )?;

        let overflow = match &config.overflow_area {
            Some((type_name, options)) => Some(create_index(type_name, options, create, force)?),
            None => None,
        };

        let stripe_slots = if config.write_cache {
            std::cmp::max(1, config.write_cache_max_page_count / config.page_lock_count)
        } else {
            0
        };
        let stripes = (0..config.page_lock_count)
            .map(|_| RwLock::new(CacheStripe::new(stripe_slots)))
            .collect();

        let file_sync = (0..files.len())
            .map(|_| FileSyncState {
                state: AtomicU8::new(FILE_SYNC_CLEAN),
                lock: RwLock::new(()),
            })
            .collect();

        let mut index = Self {
            config,
            bucket_count,
            files,
            file_sync,
            stripes,
            tx,
            overflow,
            local_item_count: AtomicU64::new(0),
            version: AtomicU64::new(0),
            info_path,
        };

        if !create {
            index.recover()?;
            index.local_item_count = AtomicU64::new(index.count_persistent_items()?);
        }
        Ok(index)
    }

    /// Convenience start from dotted options (factory path).
    pub fn start_options(
        options: &[(String, String)],
        create: bool,
        force: bool,
    ) -> Result<Self, Error> {
        let mut config = DiskHashIndexConfig::default();
        for (name, value) in options {
            config.set_option(name, value)?;
        }
        Self::start(config, create, force)
    }

    fn recover(&mut self) -> Result<(), Error> {
        let recovered = self.tx.recover()?;
        if recovered.is_empty() {
            return Ok(());
        }
        log::info!(
            "recovering {} page transactions for {:?}",
            recovered.len(),
            self.info_path
        );
        for (bucket_id, image) in recovered {
            if bucket_id >= self.bucket_count {
                log::warn!("skipping transaction for out-of-range bucket {bucket_id}");
                continue;
            }
            // re-applying the post image is idempotent
            DiskHashPage::parse(&image, self.config.checksum)
                .with_context(|| format!("recovered image for bucket {bucket_id} corrupt"))?;
            let (file_idx, offset) = self.bucket_position(bucket_id);
            self.files[file_idx].write_at(offset, &image)?;
            self.files[file_idx].sync()?;
        }
        self.tx.clear()?;
        Ok(())
    }

    fn count_persistent_items(&self) -> Result<u64, Error> {
        let mut count = 0;
        for bucket_id in 0..self.bucket_count {
            count += self.read_page(bucket_id)?.entries.len() as u64;
        }
        Ok(count)
    }

    fn bucket_position(&self, bucket_id: u64) -> (usize, u64) {
        let file_count = self.files.len() as u64;
        let file_idx = (bucket_id % file_count) as usize;
        let offset = (bucket_id / file_count) * self.config.page_size as u64;
        (file_idx, offset)
    }

    fn bucket_of(&self, key: &[u8]) -> u64 {
        bucket_hash(key) % self.bucket_count
    }

    fn stripe_of(&self, bucket_id: u64) -> usize {
        (bucket_id % self.config.page_lock_count as u64) as usize
    }

    fn check_key(&self, key: &[u8]) -> Result<(), Error> {
        if key.is_empty() || key.len() > self.config.max_key_size {
            bail!("illegal key size {}", key.len());
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<(), Error> {
        if value.len() > self.config.max_value_size {
            bail!("illegal value size {}", value.len());
        }
        Ok(())
    }

    fn read_page(&self, bucket_id: u64) -> Result<DiskHashPage, Error> {
        let (file_idx, offset) = self.bucket_position(bucket_id);
        let mut buf = vec![0u8; self.config.page_size];
        self.files[file_idx].read_at(offset, &mut buf)?;
        DiskHashPage::parse(&buf, self.config.checksum)
            .with_context(|| format!("bucket {bucket_id} corrupt"))
    }

    /// Writes a page through the two-phase transaction protocol and
    /// applies the configured sync policy.
    fn write_page(
        &self,
        bucket_id: u64,
        old_page: &DiskHashPage,
        new_page: &DiskHashPage,
    ) -> Result<(), Error> {
        let old_buf = old_page.serialize(self.config.checksum)?;
        let new_buf = new_page.serialize(self.config.checksum)?;
        self.tx.begin(
            bucket_id,
            &old_buf[..old_page.byte_size()],
            &new_buf[..new_page.byte_size()],
        )?;

        let (file_idx, offset) = self.bucket_position(bucket_id);
        {
            let _write_guard = self.file_sync[file_idx].lock.read().unwrap();
            self.files[file_idx].write_at(offset, &new_buf)?;
            match self.config.sync_mode {
                SyncMode::Sync => self.files[file_idx].sync()?,
                SyncMode::LazySync => {
                    self.file_sync[file_idx]
                        .state
                        .store(FILE_SYNC_DIRTY, Ordering::SeqCst);
                }
                SyncMode::Unsafe => (),
            }
        }
        self.tx.commit(bucket_id)?;
        Ok(())
    }

    /// Flushes files dirtied under the lazy sync policy.
    ///
    /// Writers concurrently entering `write_page` wait on the read side of
    /// the per-file lock while the fsync runs.
    pub fn sync_files(&self) -> Result<(), Error> {
        for (i, state) in self.file_sync.iter().enumerate() {
            if state
                .state
                .compare_exchange(
                    FILE_SYNC_DIRTY,
                    FILE_SYNC_IN_SYNC,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                let _guard = state.lock.write().unwrap();
                self.files[i].sync()?;
                state.state.store(FILE_SYNC_CLEAN, Ordering::SeqCst);
            }
        }
        self.tx.sync()?;
        Ok(())
    }

    /// Merges the dirty unpinned entries of a cache page into its
    /// persistent page. Returns the number of merged entries.
    ///
    /// Entries that no longer fit are displaced to the overflow area and
    /// the page is marked overflowed. Caller holds the stripe write lock.
    fn merge_cache_page(&self, cache_page: &mut CachePage) -> Result<u64, Error> {
        let bucket_id = cache_page.bucket_id;
        let old_page = self.read_page(bucket_id)?;
        let mut new_page = old_page.clone();
        new_page.overflow |= cache_page.overflow;

        let mut merged = 0u64;
        let mut added_local: i64 = 0;
        let mut merged_keys: Vec<Vec<u8>> = Vec::new();

        for entry in cache_page.entries.iter() {
            if !entry.dirty || entry.pinned {
                continue;
            }
            let existed = new_page.find(&entry.key).is_some();
            let in_overflow =
                !existed && new_page.overflow && self.overflow_lookup(&entry.key)?.is_some();
            if in_overflow {
                // the entry already lives in the overflow area
                self.overflow_put(&entry.key, &entry.value)?;
            } else if existed || new_page.fits(entry.key.len(), entry.value.len()) {
                let is_new = new_page.upsert(&entry.key, &entry.value);
                if new_page.byte_size() > self.config.page_size {
                    // replacement grew past the page; displace to overflow
                    new_page.remove(&entry.key);
                    self.overflow_put(&entry.key, &entry.value)?;
                    new_page.overflow = true;
                    if !is_new {
                        added_local -= 1;
                    }
                } else if is_new {
                    added_local += 1;
                }
            } else {
                self.overflow_put(&entry.key, &entry.value)?;
                new_page.overflow = true;
            }
            merged += 1;
            merged_keys.push(entry.key.clone());
        }

        if merged == 0 {
            return Ok(0);
        }

        self.write_page(bucket_id, &old_page, &new_page)?;
        cache_page.overflow = new_page.overflow;
        for key in merged_keys {
            if let Some(entry) = cache_page.find_mut(&key) {
                entry.dirty = false;
                entry.on_disk = true;
            }
        }
        if added_local >= 0 {
            self.local_item_count
                .fetch_add(added_local as u64, Ordering::SeqCst);
        } else {
            self.local_item_count
                .fetch_sub((-added_local) as u64, Ordering::SeqCst);
        }
        Ok(merged)
    }

    fn overflow_put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        match &self.overflow {
            Some(overflow) => overflow.put(key, value),
            None => bail!(
                "bucket full and no overflow area configured ({:?})",
                self.info_path
            ),
        }
    }

    fn overflow_lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match &self.overflow {
            Some(overflow) => overflow.lookup(key),
            None => Ok(None),
        }
    }

    /// Installs a page into the stripe cache, writing back an evicted
    /// dirty page first. Caller holds the stripe write lock.
    fn cache_install(&self, stripe: &mut CacheStripe, page: CachePage) -> Result<(), Error> {
        if let Some(mut evicted) = stripe.insert(page)? {
            self.merge_cache_page(&mut evicted)?;
        }
        Ok(())
    }

    /// Write-back upsert: the entry lands in the cache only and is merged
    /// later by `ensure_persistent`, eviction, or `flush_dirty`.
    pub fn put_dirty(&self, key: &[u8], value: &[u8], pinned: bool) -> Result<(), Error> {
        if !self.config.write_cache {
            bail!("put_dirty needs the write cache");
        }
        self.check_key(key)?;
        self.check_value(value)?;

        let bucket_id = self.bucket_of(key);
        let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();

        if stripe.get_mut(bucket_id).is_none() {
            let disk_page = self.read_page(bucket_id)?;
            let page = CachePage::from_disk_page(bucket_id, &disk_page);
            self.cache_install(&mut stripe, page)?;
        }
        let page = stripe
            .get_mut(bucket_id)
            .ok_or_else(|| format_err!("cache page vanished for bucket {bucket_id}"))?;
        page.upsert_dirty(key, value, pinned);
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Forces the dirty entry for `key` to the persistent page.
    pub fn ensure_persistent(&self, key: &[u8]) -> Result<PutResult, Error> {
        self.check_key(key)?;
        let bucket_id = self.bucket_of(key);
        let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();

        let page = match stripe.get_mut(bucket_id) {
            Some(page) => page,
            None => return Ok(PutResult::Keep),
        };
        match page.find(key) {
            Some(entry) if entry.dirty && !entry.pinned => (),
            Some(entry) if entry.dirty && entry.pinned => {
                log::debug!("ensure_persistent: entry still pinned");
                return Ok(PutResult::Keep);
            }
            _ => return Ok(PutResult::Keep),
        }
        self.merge_cache_page(page)?;
        Ok(PutResult::Ok)
    }

    /// Flips the pin state of a cached entry.
    ///
    /// Returns true if the key exists (cached or persistent); persistent
    /// entries are never pinned, so flipping them is a no-op.
    pub fn change_pin_state(&self, key: &[u8], pinned: bool) -> Result<bool, Error> {
        self.check_key(key)?;
        let bucket_id = self.bucket_of(key);
        let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();

        if let Some(page) = stripe.get_mut(bucket_id) {
            if let Some(entry) = page.find_mut(key) {
                entry.pinned = pinned;
                return Ok(true);
            }
        }
        drop(stripe);
        Ok(self.lookup_with_mode(key, CacheLookupMethod::Bypass, CacheDirtyMode::AllowDirty)?
            .is_some())
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.lookup_with_mode(key, CacheLookupMethod::Default, CacheDirtyMode::AllowDirty)
    }

    /// Write-back state `(dirty, pinned)` of a cached entry, if any.
    pub fn cache_entry_state(&self, key: &[u8]) -> Result<Option<(bool, bool)>, Error> {
        self.check_key(key)?;
        let bucket_id = self.bucket_of(key);
        let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();
        if let Some(page) = stripe.get_mut(bucket_id) {
            if let Some(entry) = page.find(key) {
                return Ok(Some((entry.dirty, entry.pinned)));
            }
        }
        Ok(None)
    }

    pub fn lookup_with_mode(
        &self,
        key: &[u8],
        method: CacheLookupMethod,
        dirty_mode: CacheDirtyMode,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.check_key(key)?;
        let bucket_id = self.bucket_of(key);

        match method {
            CacheLookupMethod::Bypass => return self.lookup_disk(bucket_id, key),
            CacheLookupMethod::CacheOnly => {
                let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();
                if let Some(page) = stripe.get_mut(bucket_id) {
                    if let Some(entry) = page.find(key) {
                        if entry.dirty && dirty_mode == CacheDirtyMode::IgnoreDirty {
                            return Ok(None);
                        }
                        return Ok(Some(entry.value.clone()));
                    }
                }
                return Ok(None);
            }
            CacheLookupMethod::Default => (),
        }

        if !self.config.write_cache {
            return self.lookup_disk(bucket_id, key);
        }

        // cache state may be updated on a miss, so take the write lock
        let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();
        if let Some(page) = stripe.get_mut(bucket_id) {
            if let Some(entry) = page.find(key) {
                if !(entry.dirty && dirty_mode == CacheDirtyMode::IgnoreDirty) {
                    return Ok(Some(entry.value.clone()));
                }
            } else if !page.overflow {
                return Ok(None);
            }
            // dirty-invisible hit or possible overflow spill
            drop(stripe);
            return self.lookup_disk(bucket_id, key);
        }

        let disk_page = self.read_page(bucket_id)?;
        let result = match disk_page.find(key) {
            Some(value) => Some(value.to_vec()),
            None if disk_page.overflow => match &self.overflow {
                Some(overflow) => overflow.lookup(key)?,
                None => None,
            },
            None => None,
        };
        let page = CachePage::from_disk_page(bucket_id, &disk_page);
        self.cache_install(&mut stripe, page)?;
        Ok(result)
    }

    fn lookup_disk(&self, bucket_id: u64, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let page = {
            let _stripe = self.stripes[self.stripe_of(bucket_id)].read().unwrap();
            self.read_page(bucket_id)?
        };
        if let Some(value) = page.find(key) {
            return Ok(Some(value.to_vec()));
        }
        if page.overflow {
            if let Some(overflow) = &self.overflow {
                return overflow.lookup(key);
            }
        }
        Ok(None)
    }

    /// Write-through upsert. Supersedes any dirty cache state for the key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.put_internal(key, value, false).map(|_| ())
    }

    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutResult, Error> {
        self.put_internal(key, value, true)
    }

    fn put_internal(&self, key: &[u8], value: &[u8], if_absent: bool) -> Result<PutResult, Error> {
        self.check_key(key)?;
        self.check_value(value)?;
        let bucket_id = self.bucket_of(key);
        let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();

        if if_absent {
            if let Some(page) = stripe.get_mut(bucket_id) {
                if page.find(key).is_some() {
                    return Ok(PutResult::Keep);
                }
            }
        }

        let old_page = self.read_page(bucket_id)?;
        let in_page = old_page.find(key).is_some();
        let in_overflow = !in_page
            && old_page.overflow
            && match &self.overflow {
                Some(overflow) => overflow.lookup(key)?.is_some(),
                None => false,
            };

        if if_absent && (in_page || in_overflow) {
            return Ok(PutResult::Keep);
        }

        let mut new_page = old_page.clone();
        if in_overflow {
            self.overflow_put(key, value)?;
        } else if in_page || new_page.fits(key.len(), value.len()) {
            let is_new = new_page.upsert(key, value);
            if new_page.byte_size() > self.config.page_size {
                new_page.remove(key);
                self.overflow_put(key, value)?;
                new_page.overflow = true;
                if !is_new {
                    self.local_item_count.fetch_sub(1, Ordering::SeqCst);
                }
                self.write_page(bucket_id, &old_page, &new_page)?;
            } else {
                self.write_page(bucket_id, &old_page, &new_page)?;
                if is_new {
                    self.local_item_count.fetch_add(1, Ordering::SeqCst);
                }
            }
        } else {
            self.overflow_put(key, value)?;
            new_page.overflow = true;
            self.write_page(bucket_id, &old_page, &new_page)?;
        }

        if let Some(page) = stripe.get_mut(bucket_id) {
            page.overflow |= new_page.overflow;
            match page.find_mut(key) {
                Some(entry) => {
                    entry.value = value.to_vec();
                    entry.dirty = false;
                    entry.pinned = false;
                    entry.on_disk = true;
                }
                None => {
                    page.entries.push(crate::cache::CacheEntry {
                        key: key.to_vec(),
                        value: value.to_vec(),
                        dirty: false,
                        pinned: false,
                        on_disk: true,
                    });
                }
            }
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(PutResult::Ok)
    }

    /// Deletes the key from the cache, the page and the overflow area.
    pub fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        self.check_key(key)?;
        let bucket_id = self.bucket_of(key);
        let mut stripe = self.stripes[self.stripe_of(bucket_id)].write().unwrap();

        let mut deleted = false;
        if let Some(page) = stripe.get_mut(bucket_id) {
            if page.remove(key).is_some() {
                deleted = true;
            }
        }

        let old_page = self.read_page(bucket_id)?;
        let mut new_page = old_page.clone();
        if new_page.remove(key) {
            self.write_page(bucket_id, &old_page, &new_page)?;
            self.local_item_count.fetch_sub(1, Ordering::SeqCst);
            deleted = true;
        }
        if old_page.overflow {
            if let Some(overflow) = &self.overflow {
                deleted |= overflow.delete(key)?;
            }
        }
        if deleted {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        Ok(deleted)
    }

    /// Number of entries in persistent pages plus the overflow area.
    pub fn item_count(&self) -> u64 {
        let overflow = self
            .overflow
            .as_ref()
            .map(|index| index.item_count())
            .unwrap_or(0);
        self.local_item_count.load(Ordering::SeqCst) + overflow
    }

    /// Number of dirty (not yet merged) cache entries.
    pub fn dirty_item_count(&self) -> u64 {
        self.stripes
            .iter()
            .map(|stripe| {
                stripe
                    .read()
                    .unwrap()
                    .pages()
                    .map(|page| page.dirty_count())
                    .sum::<u64>()
            })
            .sum()
    }

    /// Persistent items plus dirty-new cache entries.
    pub fn total_item_count(&self) -> u64 {
        let dirty_new: u64 = self
            .stripes
            .iter()
            .map(|stripe| {
                stripe
                    .read()
                    .unwrap()
                    .pages()
                    .map(|page| page.dirty_new_count())
                    .sum::<u64>()
            })
            .sum();
        self.item_count() + dirty_new
    }

    /// Capacity estimate from file size, page size, entry sizes and the
    /// configured fill ratio.
    pub fn estimated_max_item_count(&self) -> u64 {
        let entry_size = 8 + self.config.max_key_size + self.config.max_value_size;
        let per_page = (self.config.page_size - PAGE_HEADER_SIZE) / entry_size;
        ((self.bucket_count * per_page as u64) as f64 * self.config.estimated_max_fill_ratio) as u64
    }

    /// Merges all dirty unpinned entries to their persistent pages.
    ///
    /// Returns the number of entries that stayed dirty because they are
    /// still pinned; a non-zero count at shutdown is an inconsistency.
    pub fn flush_dirty(&self) -> Result<u64, Error> {
        let mut still_pinned = 0;
        for stripe in &self.stripes {
            let mut stripe = stripe.write().unwrap();
            for page in stripe.pages_mut() {
                self.merge_cache_page(page)?;
                still_pinned += page
                    .entries
                    .iter()
                    .filter(|entry| entry.dirty && entry.pinned)
                    .count() as u64;
            }
        }
        Ok(still_pinned)
    }

    /// Iterates the persistent entries (pages, then the overflow area).
    ///
    /// The iterator is fail-fast: a concurrent mutation invalidates it.
    pub fn iterate(&self) -> DiskHashIndexIterator<'_> {
        DiskHashIndexIterator {
            index: self,
            version: self.version.load(Ordering::SeqCst),
            bucket_id: 0,
            entries: Vec::new(),
            overflow_iter: None,
        }
    }

    /// Flushes dirty state and syncs all files.
    pub fn close(&self) -> Result<(), Error> {
        if self.config.write_cache {
            let pinned = self.flush_dirty()?;
            if pinned > 0 {
                log::error!(
                    "{} dirty entries still pinned at close of {:?}",
                    pinned,
                    self.info_path
                );
            }
        }
        self.sync_files()?;
        if let Some(overflow) = &self.overflow {
            overflow.close()?;
        }
        for file in &self.files {
            if self.config.sync_mode != SyncMode::Unsafe {
                file.sync()?;
            }
        }
        Ok(())
    }
}

/// Lazy persistent-state iterator, fail-fast under concurrent mutation.
pub struct DiskHashIndexIterator<'a> {
    index: &'a DiskHashIndex,
    version: u64,
    bucket_id: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    overflow_iter: Option<Box<dyn IndexIterator + 'a>>,
}

impl DiskHashIndexIterator<'_> {
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        if self.index.version.load(Ordering::SeqCst) != self.version {
            bail!("concurrent modification during index iteration");
        }
        loop {
            if let Some(entry) = self.entries.pop() {
                return Ok(Some(entry));
            }
            if let Some(overflow_iter) = &mut self.overflow_iter {
                return overflow_iter.next_entry();
            }
            if self.bucket_id >= self.index.bucket_count {
                let index = self.index;
                match &index.overflow {
                    Some(overflow) => {
                        self.overflow_iter = Some(overflow.iterate()?);
                        continue;
                    }
                    None => return Ok(None),
                }
            }
            let page = self.index.read_page(self.bucket_id)?;
            self.bucket_id += 1;
            self.entries = page.entries;
            self.entries.reverse();
        }
    }
}

impl PersistentIndex for DiskHashIndex {
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        DiskHashIndex::lookup(self, key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        DiskHashIndex::put(self, key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutResult, Error> {
        DiskHashIndex::put_if_absent(self, key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        DiskHashIndex::delete(self, key)
    }

    fn iterate(&self) -> Result<Box<dyn IndexIterator + '_>, Error> {
        Ok(Box::new(DiskHashIndex::iterate(self)))
    }

    fn item_count(&self) -> u64 {
        DiskHashIndex::item_count(self)
    }

    fn close(&self) -> Result<(), Error> {
        DiskHashIndex::close(self)
    }
}

impl IndexIterator for DiskHashIndexIterator<'_> {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        DiskHashIndexIterator::next_entry(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TestDir;

    fn test_config(dir: &TestDir, write_cache: bool) -> DiskHashIndexConfig {
        let mut config = DiskHashIndexConfig {
            page_size: 512,
            size: 64 * 512,
            sync_mode: SyncMode::LazySync,
            write_cache,
            write_cache_max_page_count: 128,
            ..Default::default()
        };
        config.filenames.push(dir.path().join("hash.data"));
        config
    }

    #[test]
    fn put_lookup_delete_survive_restart() {
        let dir = TestDir::new("dhi-restart");
        let config = test_config(&dir, false);

        let index = DiskHashIndex::start(config.clone(), true, false).unwrap();
        index.put(b"block-1", b"mapping-1").unwrap();
        index.put(b"block-2", b"mapping-2").unwrap();
        assert_eq!(index.item_count(), 2);
        assert!(index.delete(b"block-2").unwrap());
        index.close().unwrap();
        drop(index);

        let index = DiskHashIndex::start(config, false, false).unwrap();
        assert_eq!(index.lookup(b"block-1").unwrap().unwrap(), b"mapping-1");
        assert!(index.lookup(b"block-2").unwrap().is_none());
        assert_eq!(index.item_count(), 1);
    }

    #[test]
    fn put_if_absent_keeps_existing() {
        let dir = TestDir::new("dhi-put-if-absent");
        let index = DiskHashIndex::start(test_config(&dir, false), true, false).unwrap();

        assert_eq!(index.put_if_absent(b"key", b"a").unwrap(), PutResult::Ok);
        assert_eq!(index.put_if_absent(b"key", b"b").unwrap(), PutResult::Keep);
        assert_eq!(index.lookup(b"key").unwrap().unwrap(), b"a");
    }

    #[test]
    fn config_mismatch_rejected_unless_forced() {
        let dir = TestDir::new("dhi-config");
        let config = test_config(&dir, false);
        let index = DiskHashIndex::start(config.clone(), true, false).unwrap();
        index.close().unwrap();
        drop(index);

        let mut changed = config.clone();
        changed.size = 32 * 512;
        assert!(DiskHashIndex::start(changed.clone(), false, false).is_err());
        // the force flag overrides the stored parameters
        assert!(DiskHashIndex::start(changed, false, true).is_ok());
    }

    #[test]
    fn write_back_entries_merge_on_ensure_persistent() {
        let dir = TestDir::new("dhi-write-back");
        let index = DiskHashIndex::start(test_config(&dir, true), true, false).unwrap();

        index.put_dirty(b"fp-1", b"count-1", false).unwrap();
        assert_eq!(index.dirty_item_count(), 1);
        assert_eq!(index.item_count(), 0);
        assert_eq!(index.total_item_count(), 1);

        // dirty state is visible through the cache, not on disk
        assert_eq!(index.lookup(b"fp-1").unwrap().unwrap(), b"count-1");
        assert!(index
            .lookup_with_mode(b"fp-1", CacheLookupMethod::Bypass, CacheDirtyMode::AllowDirty)
            .unwrap()
            .is_none());

        assert_eq!(index.ensure_persistent(b"fp-1").unwrap(), PutResult::Ok);
        assert_eq!(index.dirty_item_count(), 0);
        assert_eq!(index.item_count(), 1);
        assert!(index
            .lookup_with_mode(b"fp-1", CacheLookupMethod::Bypass, CacheDirtyMode::AllowDirty)
            .unwrap()
            .is_some());
    }

    #[test]
    fn pinned_entries_stay_dirty() {
        let dir = TestDir::new("dhi-pinned");
        let index = DiskHashIndex::start(test_config(&dir, true), true, false).unwrap();

        index.put_dirty(b"fp-pinned", b"v", true).unwrap();
        assert_eq!(index.ensure_persistent(b"fp-pinned").unwrap(), PutResult::Keep);
        assert_eq!(index.flush_dirty().unwrap(), 1);
        assert_eq!(index.item_count(), 0);

        assert!(index.change_pin_state(b"fp-pinned", false).unwrap());
        assert_eq!(index.ensure_persistent(b"fp-pinned").unwrap(), PutResult::Ok);
        assert_eq!(index.item_count(), 1);
    }

    #[test]
    fn cache_only_lookup_misses_uncached_keys() {
        let dir = TestDir::new("dhi-cache-only");
        let index = DiskHashIndex::start(test_config(&dir, true), true, false).unwrap();

        index.put(b"persistent", b"x").unwrap();
        index.put_dirty(b"cached", b"y", false).unwrap();

        assert!(index
            .lookup_with_mode(
                b"persistent",
                CacheLookupMethod::CacheOnly,
                CacheDirtyMode::AllowDirty
            )
            .unwrap()
            .is_some());
        assert_eq!(
            index
                .lookup_with_mode(
                    b"cached",
                    CacheLookupMethod::CacheOnly,
                    CacheDirtyMode::IgnoreDirty
                )
                .unwrap(),
            None
        );
    }

    #[test]
    fn iteration_sees_persistent_entries_and_fails_on_mutation() {
        let dir = TestDir::new("dhi-iterate");
        let index = DiskHashIndex::start(test_config(&dir, false), true, false).unwrap();

        for i in 0..20u32 {
            index
                .put(format!("key-{i}").as_bytes(), &i.to_le_bytes())
                .unwrap();
        }

        let mut iter = index.iterate();
        let mut seen = 0;
        while iter.next_entry().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 20);

        let mut iter = index.iterate();
        iter.next_entry().unwrap();
        index.put(b"key-new", b"x").unwrap();
        assert!(iter.next_entry().is_err());
    }

    #[test]
    fn overflow_spill_and_delete() {
        let dir = TestDir::new("dhi-overflow");
        let mut config = DiskHashIndexConfig {
            page_size: 64,
            size: 64, // a single tiny bucket
            sync_mode: SyncMode::Unsafe,
            max_key_size: 16,
            max_value_size: 16,
            checksum: false,
            overflow_area: Some(("mem-hash".to_string(), Vec::new())),
            ..Default::default()
        };
        config.filenames.push(dir.path().join("hash.data"));

        let index = DiskHashIndex::start(config, true, false).unwrap();
        for i in 0..8u32 {
            index
                .put(format!("key-{i}").as_bytes(), &[i as u8; 8])
                .unwrap();
        }
        for i in 0..8u32 {
            assert!(
                index.lookup(format!("key-{i}").as_bytes()).unwrap().is_some(),
                "key-{i} lost"
            );
        }
        assert_eq!(index.item_count(), 8);

        for i in 0..8u32 {
            assert!(index.delete(format!("key-{i}").as_bytes()).unwrap());
        }
        assert_eq!(index.item_count(), 0);
    }

    #[test]
    fn cache_pressure_writes_dirty_pages_back() {
        let dir = TestDir::new("dhi-eviction");
        let mut config = DiskHashIndexConfig {
            page_size: 512,
            size: 64 * 512,
            sync_mode: SyncMode::Unsafe,
            // a single one-slot stripe forces eviction on the second page
            page_lock_count: 1,
            write_cache: true,
            write_cache_max_page_count: 1,
            ..Default::default()
        };
        config.filenames.push(dir.path().join("hash.data"));
        let index = DiskHashIndex::start(config, true, false).unwrap();

        let first = b"evicted-key".to_vec();
        index.put_dirty(&first, b"1", false).unwrap();

        // any key in another bucket displaces the first page
        let first_bucket = bucket_hash(&first) % 64;
        let mut second = Vec::new();
        for i in 0..1000u32 {
            let key = format!("other-{i}").into_bytes();
            if bucket_hash(&key) % 64 != first_bucket {
                second = key;
                break;
            }
        }
        index.put_dirty(&second, b"2", false).unwrap();

        // the evicted dirty page was merged to disk
        assert_eq!(index.item_count(), 1);
        assert_eq!(index.dirty_item_count(), 1);
        assert_eq!(
            index
                .lookup_with_mode(&first, CacheLookupMethod::Bypass, CacheDirtyMode::AllowDirty)
                .unwrap()
                .unwrap(),
            b"1"
        );
    }

    #[test]
    fn torn_page_write_recovers_from_transaction_area() {
        let dir = TestDir::new("dhi-torn-page");
        let mut config = test_config(&dir, false);
        config.sync_mode = SyncMode::Unsafe;

        let index = DiskHashIndex::start(config.clone(), true, false).unwrap();
        index.put(b"victim", b"payload").unwrap();

        let bucket_id = bucket_hash(b"victim") % (config.size / config.page_size as u64);
        let offset = bucket_id * config.page_size as u64;

        // capture the valid page, stage it in the transaction area, then
        // tear the in-place image as a crashed write would
        let file = DataFile::open(dir.path().join("hash.data"), false).unwrap();
        let mut valid = vec![0u8; config.page_size];
        file.read_at(offset, &mut valid).unwrap();

        let tx = TransactionArea::open(
            dir.path().join("hash.trans"),
            config.page_size,
            config.transaction_slot_count,
            false,
            false,
        )
        .unwrap();
        tx.begin(bucket_id, &[], &valid).unwrap();
        file.write_at(offset, &vec![0xffu8; config.page_size]).unwrap();
        drop(index);

        let index = DiskHashIndex::start(config, false, false).unwrap();
        assert_eq!(index.lookup(b"victim").unwrap().unwrap(), b"payload");
    }
}

