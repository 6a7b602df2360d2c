use std::collections::BTreeMap;

use dedup_api_types::BlockMapping;

/// A block mapping waiting for container commits.
#[derive(Clone, Debug)]
pub struct UncommittedBlockEntry {
    /// Last persisted mapping; reference diffs are computed against it.
    pub previous: BlockMapping,
    pub modified: BlockMapping,
    /// Referenced containers that are still open.
    pub open_container_count: usize,
    /// Log id of the promotion event once it was logged.
    pub block_write_log_id: Option<u64>,
}

/// In-memory holding area for block mappings with uncommitted containers.
///
/// Two maps instead of a bidirectional graph: the block map owns the
/// entries, the container map holds block ids as stable handles into it.
pub struct VolatileBlockStore {
    uncommitted_blocks: BTreeMap<u64, UncommittedBlockEntry>,
    uncommitted_containers: BTreeMap<u64, Vec<u64>>,
}

impl VolatileBlockStore {
    pub fn new() -> Self {
        Self {
            uncommitted_blocks: BTreeMap::new(),
            uncommitted_containers: BTreeMap::new(),
        }
    }

    pub fn get(&self, block_id: u64) -> Option<&UncommittedBlockEntry> {
        self.uncommitted_blocks.get(&block_id)
    }

    pub fn block_count(&self) -> usize {
        self.uncommitted_blocks.len()
    }

    /// Registers an in-flight mapping.
    ///
    /// An overwrite of a still-pending mapping replaces it; the previous
    /// side is kept from the replaced entry, so the eventual diff runs
    /// against the last persisted version, not the skipped one.
    pub fn insert(
        &mut self,
        previous: BlockMapping,
        modified: BlockMapping,
        open_containers: &[u64],
    ) {
        let block_id = modified.block_id;
        let previous = match self.take(block_id) {
            Some(replaced) => {
                log::debug!(
                    "block {} overwritten while still pending (version {} skipped)",
                    block_id,
                    replaced.modified.version
                );
                replaced.previous
            }
            None => previous,
        };
        self.uncommitted_blocks.insert(
            block_id,
            UncommittedBlockEntry {
                previous,
                modified,
                open_container_count: open_containers.len(),
                block_write_log_id: None,
            },
        );
        for container_id in open_containers {
            self.uncommitted_containers
                .entry(*container_id)
                .or_default()
                .push(block_id);
        }
    }

    /// Removes an entry and all its container back references.
    fn take(&mut self, block_id: u64) -> Option<UncommittedBlockEntry> {
        let entry = self.uncommitted_blocks.remove(&block_id)?;
        self.uncommitted_containers.retain(|_, blocks| {
            blocks.retain(|id| *id != block_id);
            !blocks.is_empty()
        });
        Some(entry)
    }

    pub fn remove(&mut self, block_id: u64) -> Option<UncommittedBlockEntry> {
        self.take(block_id)
    }

    /// Marks a container committed. Returns the entries whose last open
    /// container this was, in registration order; the caller promotes
    /// them to the persistent index.
    pub fn container_committed(&mut self, container_id: u64) -> Vec<UncommittedBlockEntry> {
        let block_ids = match self.uncommitted_containers.remove(&container_id) {
            Some(block_ids) => block_ids,
            None => return Vec::new(),
        };
        let mut ready = Vec::new();
        for block_id in block_ids {
            if let Some(entry) = self.uncommitted_blocks.get_mut(&block_id) {
                entry.open_container_count -= 1;
                if entry.open_container_count == 0 {
                    ready.push(self.uncommitted_blocks.remove(&block_id).unwrap());
                }
            }
        }
        ready
    }

    /// Marks a container failed. Every entry referencing it is discarded
    /// and returned so the failure can be logged.
    pub fn container_failed(&mut self, container_id: u64) -> Vec<UncommittedBlockEntry> {
        let block_ids = match self.uncommitted_containers.remove(&container_id) {
            Some(block_ids) => block_ids,
            None => return Vec::new(),
        };
        let mut failed = Vec::new();
        for block_id in block_ids {
            if let Some(entry) = self.take(block_id) {
                failed.push(entry);
            }
        }
        failed
    }

    /// Container ids that still block at least one mapping.
    pub fn open_container_ids(&self) -> Vec<u64> {
        self.uncommitted_containers.keys().copied().collect()
    }
}

impl Default for VolatileBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dedup_api_types::{BlockMappingItem, Fingerprint, FINGERPRINT_SIZE};

    fn mapping(block_id: u64, version: u64, containers: &[u64]) -> BlockMapping {
        let size = 4096 / containers.len() as u32;
        let items = containers
            .iter()
            .enumerate()
            .map(|(i, container_id)| {
                BlockMappingItem::new(
                    i as u32 * size,
                    size,
                    Fingerprint::new([version as u8; FINGERPRINT_SIZE]),
                    *container_id,
                )
            })
            .collect();
        BlockMapping::new(block_id, 4096, version, items)
    }

    #[test]
    fn entry_released_after_last_container_commit() {
        let mut store = VolatileBlockStore::new();
        store.insert(mapping(1, 0, &[9]), mapping(1, 1, &[10, 11]), &[10, 11]);
        assert_eq!(store.block_count(), 1);

        assert!(store.container_committed(10).is_empty());
        let ready = store.container_committed(11);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].modified.version, 1);
        assert_eq!(store.block_count(), 0);
    }

    #[test]
    fn overwrite_keeps_original_previous() {
        let mut store = VolatileBlockStore::new();
        let persisted = mapping(2, 0, &[5]);
        store.insert(persisted.clone(), mapping(2, 1, &[10]), &[10]);
        store.insert(mapping(2, 1, &[10]), mapping(2, 2, &[11]), &[11]);

        assert_eq!(store.block_count(), 1);
        // the handle for the replaced version is gone
        assert!(store.container_committed(10).is_empty());

        let ready = store.container_committed(11);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].previous, persisted);
        assert_eq!(ready[0].modified.version, 2);
    }

    #[test]
    fn failure_discards_all_referencing_entries() {
        let mut store = VolatileBlockStore::new();
        store.insert(mapping(1, 0, &[5]), mapping(1, 1, &[10]), &[10]);
        store.insert(mapping(2, 0, &[5]), mapping(2, 1, &[10, 11]), &[10, 11]);

        let failed = store.container_failed(10);
        assert_eq!(failed.len(), 2);
        assert_eq!(store.block_count(), 0);
        // the second entry's other handle is cleaned up as well
        assert!(store.container_committed(11).is_empty());
    }
}
