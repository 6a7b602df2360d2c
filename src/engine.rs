use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Error};

use dedup_api_types::{BlockMapping, BlockMappingItem, StopMode, ILLEGAL_CONTAINER_ID};
use dedup_datastore::container::GreedyContainerGc;
use dedup_datastore::{
    BlockIndex, ChunkIndex, ContainerStorage, IdleDetector, OperationLog, ReplayMode,
    UsageCountGarbageCollector,
};

use crate::config::EngineConfig;
use crate::content::{ChunkIndexFilter, Filter, FilterResult, FixedChunker};
use crate::lockfile::{DirtyFile, Lockfile};
use crate::replayer::LogReplayer;

/// The engine root object.
///
/// Owns every subsystem and drives the lifecycle: construction in
/// dependency order (file layer up to the garbage collectors), start of
/// the background threads, stop in reverse order.
pub struct DedupEngine {
    config: EngineConfig,
    _lockfile: Lockfile,
    dirty_file: Mutex<DirtyFile>,
    log: Arc<OperationLog>,
    storage: Arc<ContainerStorage>,
    chunk_index: Arc<ChunkIndex>,
    block_index: Arc<BlockIndex>,
    container_gc: Arc<GreedyContainerGc>,
    gc: Arc<UsageCountGarbageCollector>,
    idle: Arc<IdleDetector>,
    replayer: LogReplayer,
    chunker: FixedChunker,
    filter: ChunkIndexFilter,
    ticker: Mutex<Option<JoinHandle<()>>>,
    ticker_stop: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl DedupEngine {
    /// Creates a fresh engine instance, formatting all on-disk state.
    pub fn create(config: EngineConfig) -> Result<Self, Error> {
        Self::start(config, true, false)
    }

    /// Opens an existing engine instance.
    ///
    /// The configuration must match the one stored in the dirty file; an
    /// unclean previous stop triggers the dirty log replay.
    pub fn open(config: EngineConfig, force: bool) -> Result<Self, Error> {
        Self::start(config, false, force)
    }

    fn start(config: EngineConfig, create: bool, force: bool) -> Result<Self, Error> {
        let lockfile = Lockfile::acquire(&config.lockfile)?;

        if !create {
            if let Some(stored) = DirtyFile::stored_config(&config.dirtyfile)? {
                if stored != config.raw {
                    if force {
                        log::warn!("configuration change overridden by force");
                    } else {
                        bail!("configuration does not match the stored configuration");
                    }
                }
            }
        }
        let (dirty_file, dirty) = DirtyFile::open(&config.dirtyfile, &config.raw)?;
        if dirty {
            log::info!("engine was not shut down cleanly, scheduling dirty replay");
        }

        // construction in dependency order
        let log = Arc::new(
            OperationLog::start(config.log.clone(), create).context("operation log start")?,
        );
        let storage = Arc::new(
            ContainerStorage::start(config.storage.clone(), Arc::clone(&log), create, force)
                .context("container storage start")?,
        );
        let chunk_index = Arc::new(
            ChunkIndex::start(
                config.chunk_index.clone(),
                Arc::clone(&storage),
                create,
                force,
            )
            .context("chunk index start")?,
        );
        let block_index = Arc::new(
            BlockIndex::start(
                config.block_index.clone(),
                Arc::clone(&storage),
                Arc::clone(&log),
                config.block_size,
                create,
                force,
            )
            .context("block index start")?,
        );
        let container_gc = Arc::new(
            GreedyContainerGc::start(
                config.container_gc.clone(),
                Arc::clone(&storage),
                create,
                force,
            )
            .context("container gc start")?,
        );
        let gc = Arc::new(
            UsageCountGarbageCollector::start(
                config.gc.clone(),
                Arc::clone(&chunk_index),
                Arc::clone(&storage),
                Some(Arc::clone(&container_gc)),
                create,
                force,
            )
            .context("garbage collector start")?,
        );

        // replay delivery order matches the registration order
        log.register_consumer("chunk-index", chunk_index.clone())?;
        log.register_consumer("block-index", block_index.clone())?;
        log.register_consumer("container-gc", container_gc.clone())?;
        log.register_consumer("gc", gc.clone())?;

        // synchronous commit notification on the committing thread;
        // the replay consumers above redeliver it after a crash
        storage.register_commit_callback("chunk-index", chunk_index.clone());
        storage.register_commit_callback("block-index", block_index.clone());

        let idle = Arc::new(IdleDetector::new(Duration::from_millis(500)));
        idle.register_consumer("gc", gc.clone());
        idle.register_consumer("container-gc", container_gc.clone());

        let replayer = LogReplayer::new(
            config.log_replay.clone(),
            Arc::clone(&log),
            Arc::clone(&idle),
        );

        let chunker = FixedChunker::new(config.chunk_size)?;
        let filter = ChunkIndexFilter::new(Arc::clone(&chunk_index));

        let engine = Self {
            config,
            _lockfile: lockfile,
            dirty_file: Mutex::new(dirty_file),
            log,
            storage,
            chunk_index,
            block_index,
            container_gc,
            gc,
            idle,
            replayer,
            chunker,
            filter,
            ticker: Mutex::new(None),
            ticker_stop: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
        };

        if dirty {
            engine
                .log
                .commit_event(dedup_datastore::EventPayload::ReplayStarted)?;
            engine
                .log
                .replay_all(ReplayMode::DirtyStart)
                .context("dirty replay")?;
        }
        engine.dirty_file.lock().unwrap().mark_running()?;
        Ok(engine)
    }

    /// Starts the background threads (log replayer, idle ticker).
    pub fn run(&self) -> Result<(), Error> {
        self.replayer.start()?;

        let idle = Arc::clone(&self.idle);
        let stop = Arc::clone(&self.ticker_stop);
        let chunk_index = Arc::clone(&self.chunk_index);
        let block_index = Arc::clone(&self.block_index);
        let handle = std::thread::Builder::new()
            .name("idle-ticker".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    idle.tick();
                    // flush files dirtied under the lazy sync policy
                    if let Err(err) = chunk_index.sync_files() {
                        log::error!("chunk index sync failed - {err:#}");
                    }
                    if let Err(err) = block_index.sync_files() {
                        log::error!("block index sync failed - {err:#}");
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            })?;
        *self.ticker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the engine.
    ///
    /// A fast stop persists only what consistency needs; the engine is
    /// marked dirty and will dirty-replay on the next start. A writeback
    /// stop additionally commits open containers, drains the log,
    /// flushes all dirty index state and marks the engine clean.
    pub fn stop(&self, mode: StopMode) -> Result<(), Error> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.ticker_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.replayer.stop()?;

        let clean = match mode {
            StopMode::Fast => {
                let discarded = self.storage.discard_open();
                if !discarded.is_empty() {
                    log::info!("fast stop discarded open containers {discarded:?}");
                }
                false
            }
            StopMode::Writeback => {
                self.storage.flush()?;
                self.log.replay_all(ReplayMode::Background)?;
                self.gc.process_candidates()?;
                true
            }
        };

        let pinned = self.chunk_index.flush_dirty()?;
        if pinned > 0 {
            if clean {
                log::error!("{pinned} chunk mappings still pinned at writeback stop");
            } else {
                log::info!("{pinned} pinned chunk mappings discarded by fast stop");
            }
        }

        // teardown in reverse construction order
        self.gc.close()?;
        self.container_gc.close()?;
        self.block_index.close()?;
        self.chunk_index.close()?;
        self.storage.close()?;
        self.log.close()?;

        self.dirty_file
            .lock()
            .unwrap()
            .mark_stopped(clean && pinned == 0)?;
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// Writes one block: chunk, fingerprint, filter, store.
    pub fn write_block(&self, block_id: u64, data: &[u8]) -> Result<(), Error> {
        if data.len() != self.config.block_size as usize {
            bail!(
                "illegal block write of {} bytes (block size {})",
                data.len(),
                self.config.block_size
            );
        }
        self.idle.notify_activity();

        let previous = self.block_index.read_block_info(block_id)?;

        let chunks = self.chunker.split(data);
        let mut fingerprints = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let fp = crate::content::fingerprint(chunk.data);
            self.chunk_index.mark_in_combat(fp);
            fingerprints.push(fp);
        }

        let result = self.write_block_chunks(block_id, previous, &chunks, &fingerprints);

        for fp in &fingerprints {
            self.chunk_index.release_in_combat(fp);
        }
        result
    }

    fn write_block_chunks(
        &self,
        block_id: u64,
        previous: BlockMapping,
        chunks: &[crate::content::Chunk<'_>],
        fingerprints: &[dedup_api_types::Fingerprint],
    ) -> Result<(), Error> {
        let mut items = Vec::with_capacity(chunks.len());
        for (chunk, fp) in chunks.iter().zip(fingerprints) {
            let container_id = match self.filter.check(fp)? {
                FilterResult::Existing(mapping) => mapping.data_address,
                FilterResult::NotExisting => {
                    let container_id = self.storage.write_chunk(*fp, chunk.data)?;
                    let mapping = dedup_api_types::ChunkMapping::new(*fp, container_id);
                    let pinned = self.storage.is_container_open(container_id);
                    self.chunk_index.put_dirty(&mapping, pinned)?;
                    container_id
                }
            };
            items.push(BlockMappingItem::new(
                chunk.offset,
                chunk.data.len() as u32,
                *fp,
                container_id,
            ));
        }

        let modified = BlockMapping::new(
            block_id,
            self.config.block_size,
            previous.version + 1,
            items,
        );
        self.block_index.store_block(previous, modified)
    }

    /// Reads one block by gathering the chunks of its mapping.
    pub fn read_block(&self, block_id: u64) -> Result<Vec<u8>, Error> {
        self.idle.notify_activity();

        let mapping = self.block_index.read_block_info(block_id)?;
        let mut data = vec![0u8; self.config.block_size as usize];
        for item in &mapping.items {
            if item.container_id == ILLEGAL_CONTAINER_ID {
                continue; // never written; reads as zeros
            }
            let payload = self
                .storage
                .read_chunk(item.container_id, &item.fingerprint)
                .with_context(|| format!("block {} read", block_id))?;
            if payload.len() != item.size as usize {
                bail!(
                    "chunk {} has {} bytes instead of {}",
                    item.fingerprint,
                    payload.len(),
                    item.size
                );
            }
            let start = item.offset as usize;
            data[start..start + payload.len()].copy_from_slice(&payload);
        }
        Ok(data)
    }

    /// Deletes a block mapping (volume deletion, discard).
    pub fn delete_block(&self, block_id: u64) -> Result<bool, Error> {
        self.idle.notify_activity();
        self.block_index.delete_block_info(block_id)
    }

    /// Commits all open containers.
    pub fn flush(&self) -> Result<(), Error> {
        self.storage.flush()?;
        Ok(())
    }

    /// Records a volume attach (called by the target layer).
    pub fn attach_volume(&self, volume_id: u32) -> Result<u64, Error> {
        self.log
            .commit_event(dedup_datastore::EventPayload::VolumeAttached { volume_id })
    }

    /// Records a volume detach (called by the target layer).
    pub fn detach_volume(&self, volume_id: u32) -> Result<u64, Error> {
        self.log
            .commit_event(dedup_datastore::EventPayload::VolumeDetached { volume_id })
    }

    /// Fails an open container: the container content is discarded and
    /// affected block mappings revert to their previous version.
    pub fn fail_container(&self, container_id: u64) -> Result<(), Error> {
        self.storage.fail_container(container_id)
    }

    /// Drains the operation log synchronously (tests, writeback stop).
    pub fn replay_pending(&self) -> Result<u64, Error> {
        self.log.replay_all(ReplayMode::Background)
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    pub fn storage(&self) -> &Arc<ContainerStorage> {
        &self.storage
    }

    pub fn chunk_index(&self) -> &Arc<ChunkIndex> {
        &self.chunk_index
    }

    pub fn block_index(&self) -> &Arc<BlockIndex> {
        &self.block_index
    }

    pub fn garbage_collector(&self) -> &Arc<UsageCountGarbageCollector> {
        &self.gc
    }

    pub fn container_gc(&self) -> &Arc<GreedyContainerGc> {
        &self.container_gc
    }

    pub fn idle_detector(&self) -> &Arc<IdleDetector> {
        &self.idle
    }

    pub fn replayer(&self) -> &LogReplayer {
        &self.replayer
    }
}
