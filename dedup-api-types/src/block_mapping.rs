use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::{Fingerprint, ILLEGAL_CONTAINER_ID};

/// One entry of a block mapping: a chunk reference covering a byte range
/// of the block.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BlockMappingItem {
    /// Offset of the chunk within the block.
    pub offset: u32,
    /// Size of the chunk in bytes.
    pub size: u32,
    pub fingerprint: Fingerprint,
    /// Logical id of the container holding the chunk payload.
    pub container_id: u64,
}

impl BlockMappingItem {
    pub fn new(offset: u32, size: u32, fingerprint: Fingerprint, container_id: u64) -> Self {
        Self {
            offset,
            size,
            fingerprint,
            container_id,
        }
    }
}

/// Mapping of a logical block to an ordered chunk reference list.
///
/// The items tile the block exactly: contiguous offsets starting at zero,
/// sizes summing to the block size. The mapping with the highest committed
/// version is authoritative for its block id.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BlockMapping {
    pub block_id: u64,
    pub block_size: u32,
    /// Monotonically increasing per block id.
    pub version: u64,
    pub items: Vec<BlockMappingItem>,
    /// Log id of the event that recorded the write intent, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log_id: Option<u64>,
}

impl BlockMapping {
    /// A version 0 mapping with a single unstored item covering the whole
    /// block. This is what a read of a never-written block resolves to.
    pub fn new_empty(block_id: u64, block_size: u32) -> Self {
        Self {
            block_id,
            block_size,
            version: 0,
            items: vec![BlockMappingItem::new(
                0,
                block_size,
                Fingerprint::new([0u8; crate::FINGERPRINT_SIZE]),
                ILLEGAL_CONTAINER_ID,
            )],
            event_log_id: None,
        }
    }

    pub fn new(block_id: u64, block_size: u32, version: u64, items: Vec<BlockMappingItem>) -> Self {
        Self {
            block_id,
            block_size,
            version,
            items,
            event_log_id: None,
        }
    }

    /// True if no item of this mapping has been stored in a container.
    pub fn is_empty(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.container_id == ILLEGAL_CONTAINER_ID)
    }

    /// Verifies the tiling invariant: contiguous items from offset zero,
    /// summing to the block size.
    pub fn check(&self) -> Result<(), Error> {
        let mut offset: u32 = 0;
        for item in &self.items {
            if item.offset != offset {
                bail!(
                    "block {} mapping not contiguous at offset {} (item offset {})",
                    self.block_id,
                    offset,
                    item.offset
                );
            }
            if item.size == 0 {
                bail!("block {} mapping has empty item", self.block_id);
            }
            offset = offset
                .checked_add(item.size)
                .ok_or_else(|| anyhow::format_err!("block {} mapping overflows", self.block_id))?;
        }
        if offset != self.block_size {
            bail!(
                "block {} mapping covers {} of {} bytes",
                self.block_id,
                offset,
                self.block_size
            );
        }
        Ok(())
    }

    /// All distinct container ids referenced by stored items.
    pub fn referenced_containers(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .items
            .iter()
            .map(|item| item.container_id)
            .filter(|id| *id != ILLEGAL_CONTAINER_ID)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// The unit logged for a block update: the authoritative mapping before the
/// write and the mapping the write produced. The garbage collector diffs
/// the two sides to derive usage-count changes.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BlockMappingPair {
    pub previous: BlockMapping,
    pub modified: BlockMapping,
}

impl BlockMappingPair {
    pub fn new(previous: BlockMapping, modified: BlockMapping) -> Self {
        Self { previous, modified }
    }

    pub fn block_id(&self) -> u64 {
        self.modified.block_id
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FINGERPRINT_SIZE;

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::new([b; FINGERPRINT_SIZE])
    }

    #[test]
    fn empty_mapping_tiles_block() {
        let mapping = BlockMapping::new_empty(7, 65536);
        mapping.check().unwrap();
        assert!(mapping.is_empty());
        assert!(mapping.referenced_containers().is_empty());
    }

    #[test]
    fn check_rejects_gaps_and_short_covers() {
        let mut mapping = BlockMapping::new(
            1,
            8192,
            1,
            vec![
                BlockMappingItem::new(0, 4096, fp(1), 10),
                BlockMappingItem::new(4096, 4096, fp(2), 10),
            ],
        );
        mapping.check().unwrap();
        assert_eq!(mapping.referenced_containers(), vec![10]);

        mapping.items[1].offset = 8192;
        assert!(mapping.check().is_err());

        mapping.items.pop();
        mapping.items[0].offset = 0;
        assert!(mapping.check().is_err());
    }
}
