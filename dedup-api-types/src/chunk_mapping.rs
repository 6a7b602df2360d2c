use serde::{Deserialize, Serialize};

use crate::Fingerprint;

/// Persistent state of a single deduplicated chunk.
///
/// A chunk with `usage_count == 0` is a garbage collection candidate.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ChunkMapping {
    pub fingerprint: Fingerprint,
    /// Logical id of the container holding the chunk payload.
    pub data_address: u64,
    /// Number of references from committed block mappings.
    pub usage_count: u64,
    /// Log id of the last usage-count change applied to this chunk.
    ///
    /// Stored with the count itself, so replaying the same event twice
    /// is detected without a separate journal.
    pub usage_count_change_log_id: u64,
}

impl ChunkMapping {
    pub fn new(fingerprint: Fingerprint, data_address: u64) -> Self {
        Self {
            fingerprint,
            data_address,
            usage_count: 0,
            usage_count_change_log_id: 0,
        }
    }
}
