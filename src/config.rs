use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};

use dedup_datastore::container::GreedyContainerGcConfig;
use dedup_datastore::{ContainerStorageConfig, LogConfig, UsageGcConfig};
use dedup_index::{parse_size, DiskHashIndexConfig};

use crate::replayer::LogReplayerConfig;

/// Complete engine configuration, assembled from dotted `key=value`
/// options.
///
/// Lines starting with `#` and empty lines are ignored. Every option is
/// routed to its subsystem by prefix (`log.`, `chunk-index.`,
/// `block-index.`, `storage.`, `gc.`, `log-replay.`, `daemon.`).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub lockfile: PathBuf,
    pub dirtyfile: PathBuf,
    pub max_memory: Option<u64>,
    pub memory_parachute: Option<u64>,
    pub block_size: u32,
    pub chunk_size: u32,
    pub log: LogConfig,
    pub log_replay: LogReplayerConfig,
    pub chunk_index: DiskHashIndexConfig,
    pub block_index: DiskHashIndexConfig,
    pub storage: ContainerStorageConfig,
    pub container_gc: GreedyContainerGcConfig,
    pub gc: UsageGcConfig,
    /// `stats.persist-interval` in seconds.
    pub stats_persist_interval: u64,
    /// `update.log-interval` in seconds.
    pub update_log_interval: u64,
    /// The raw option text; stored in the dirty file and compared on
    /// restart.
    pub raw: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lockfile: PathBuf::from("daemon.lockfile"),
            dirtyfile: PathBuf::from("daemon.dirtyfile"),
            max_memory: None,
            memory_parachute: None,
            block_size: dedup_api_types::DEFAULT_BLOCK_SIZE,
            chunk_size: 8 * 1024,
            log: LogConfig::default(),
            log_replay: LogReplayerConfig::default(),
            chunk_index: DiskHashIndexConfig::default(),
            block_index: DiskHashIndexConfig::default(),
            storage: ContainerStorageConfig::default(),
            container_gc: GreedyContainerGcConfig::default(),
            gc: UsageGcConfig::default(),
            stats_persist_interval: 60,
            update_log_interval: 5,
            raw: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format_err!("illegal config line {}: '{}'", line_no + 1, line))?;
            config
                .set_option(key.trim(), value.trim())
                .with_context(|| format!("config line {}", line_no + 1))?;
        }
        config.raw = text.to_string();
        Ok(config)
    }

    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if let Some(sub) = key.strip_prefix("daemon.") {
            match sub {
                "lockfile" => self.lockfile = PathBuf::from(value),
                "dirtyfile" => self.dirtyfile = PathBuf::from(value),
                "max-memory" => self.max_memory = Some(parse_size(value)?),
                "memory-parachute" => self.memory_parachute = Some(parse_size(value)?),
                _ => bail!("unknown daemon option '{key}'"),
            }
            return Ok(());
        }
        if let Some(sub) = key.strip_prefix("log-replay.") {
            return self.log_replay.set_option(sub, value);
        }
        if let Some(sub) = key.strip_prefix("log.") {
            return self.log.set_option(sub, value);
        }
        if let Some(sub) = key.strip_prefix("chunk-index.") {
            return self.chunk_index.set_option(sub, value);
        }
        if let Some(sub) = key.strip_prefix("block-index.") {
            return self.block_index.set_option(sub, value);
        }
        if let Some(sub) = key.strip_prefix("storage.") {
            if let Some(gc_sub) = sub.strip_prefix("gc.") {
                return self.container_gc.set_option(gc_sub, value);
            }
            if sub == "gc" {
                return self.container_gc.set_option("type", value);
            }
            return self.storage.set_option(sub, value);
        }
        if let Some(sub) = key.strip_prefix("gc.") {
            return self.gc.set_option(sub, value);
        }
        match key {
            "gc" => self.gc.set_option("type", value),
            "block-size" => {
                self.block_size = parse_size(value)? as u32;
                Ok(())
            }
            "chunk-size" => {
                self.chunk_size = parse_size(value)? as u32;
                Ok(())
            }
            "stats.persist-interval" => {
                self.stats_persist_interval = value.parse()?;
                Ok(())
            }
            "update.log-interval" => {
                self.update_log_interval = value.parse()?;
                Ok(())
            }
            _ => bail!("unknown config option '{key}'"),
        }
    }

    /// A complete small-footprint configuration rooted in a directory.
    /// Used by the tests and as a documentation of the option set.
    pub fn example(root: &Path) -> String {
        let r = root.display();
        format!(
            "daemon.lockfile={r}/daemon.lockfile\n\
             daemon.dirtyfile={r}/daemon.dirtyfile\n\
             block-size=65536\n\
             chunk-size=8192\n\
             log.filename={r}/op.log\n\
             log.max-log-size=8M\n\
             log.info.filename={r}/op.log.info\n\
             log.sync=false\n\
             log-replay.throttle.default=10\n\
             log-replay.throttle.nearly-full=0\n\
             log-replay.area-size-system-idle=64\n\
             log-replay.area-size-log-full=1024\n\
             chunk-index.filename={r}/chunk-index.data\n\
             chunk-index.page-size=4096\n\
             chunk-index.size=4M\n\
             chunk-index.sync=false\n\
             chunk-index.write-cache=true\n\
             chunk-index.write-cache.max-page-count=4096\n\
             chunk-index.overflow-area=static-disk-hash\n\
             chunk-index.overflow-area.filename={r}/chunk-index-overflow.data\n\
             chunk-index.overflow-area.page-size=4096\n\
             chunk-index.overflow-area.size=1M\n\
             chunk-index.overflow-area.sync=false\n\
             block-index.filename={r}/block-index.data\n\
             block-index.page-size=4096\n\
             block-index.size=4M\n\
             block-index.sync=false\n\
             block-index.max-value-size=3500\n\
             block-index.overflow-area=static-disk-hash\n\
             block-index.overflow-area.filename={r}/block-index-overflow.data\n\
             block-index.overflow-area.page-size=4096\n\
             block-index.overflow-area.size=1M\n\
             block-index.overflow-area.sync=false\n\
             block-index.overflow-area.max-value-size=3500\n\
             storage.filename={r}/container.data\n\
             storage.container-size=512K\n\
             storage.size=64M\n\
             storage.checksum=true\n\
             storage.compression=deflate\n\
             storage.write-container-count=4\n\
             storage.write-cache.strategy=round-robin\n\
             storage.read-cache-size=16\n\
             storage.sync=false\n\
             storage.meta-data=static-disk-hash\n\
             storage.meta-data.filename={r}/container-meta.data\n\
             storage.meta-data.page-size=4096\n\
             storage.meta-data.size=1M\n\
             storage.meta-data.sync=false\n\
             storage.alloc.filename={r}/container.alloc\n\
             storage.gc=greedy\n\
             storage.gc.threshold=64K\n\
             storage.gc.bucket-size=8K\n\
             storage.gc.eviction-timeout=0\n\
             storage.gc.index=static-disk-hash\n\
             storage.gc.filename={r}/container-gc.data\n\
             storage.gc.page-size=4096\n\
             storage.gc.size=256K\n\
             storage.gc.sync=false\n\
             gc=usage-count\n\
             gc.index=static-disk-hash\n\
             gc.filename={r}/gc-candidates.data\n\
             gc.page-size=4096\n\
             gc.size=256K\n\
             gc.sync=false\n\
             gc.max-key-size=64\n\
             stats.persist-interval=60\n\
             update.log-interval=5\n"
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn example_config_parses() {
        let text = EngineConfig::example(Path::new("/tmp/engine"));
        let config = EngineConfig::parse(&text).unwrap();

        assert_eq!(config.block_size, 65536);
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.chunk_index.write_cache_max_page_count, 4096);
        assert_eq!(config.lockfile, PathBuf::from("/tmp/engine/daemon.lockfile"));
        assert_eq!(config.storage.container_size, 512 * 1024);
        assert!(config.chunk_index.write_cache);
        assert_eq!(config.log_replay.area_size_log_full, 1024);
        assert_eq!(config.container_gc.threshold, 64 * 1024);
        assert_eq!(config.gc.index.0, "static-disk-hash");
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(EngineConfig::parse("no-such-option=1").is_err());
        assert!(EngineConfig::parse("daemon.no-such=1").is_err());
        assert!(EngineConfig::parse("not a key value line").is_err());
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let config = EngineConfig::parse("# a comment\n\nblock-size=32768\n").unwrap();
        assert_eq!(config.block_size, 32768);
    }
}
