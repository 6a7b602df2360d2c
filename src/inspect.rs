//! Read-only inspection surface.
//!
//! These methods back the administrative monitor endpoints. They return
//! JSON values and never change persistent state.

use anyhow::Error;
use serde_json::json;

use dedup_api_types::Fingerprint;

use crate::engine::DedupEngine;

impl DedupEngine {
    /// Contents and metadata of one container.
    pub fn inspect_container(&self, container_id: u64) -> Result<serde_json::Value, Error> {
        self.storage().container_info(container_id)
    }

    /// Committed log events starting at a virtual log position.
    pub fn inspect_log(&self, position: u64, max: usize) -> Result<serde_json::Value, Error> {
        let events: Vec<serde_json::Value> = self
            .log()
            .read_events(position, max)?
            .into_iter()
            .map(|event| {
                json!({
                    "log-id": event.log_id,
                    "type": event.payload.type_name(),
                    "payload": serde_json::to_value(&event.payload).unwrap_or_default(),
                })
            })
            .collect();
        Ok(json!(events))
    }

    /// The authoritative mapping of one block.
    pub fn inspect_block(&self, block_id: u64) -> Result<serde_json::Value, Error> {
        let mapping = self.block_index().read_block_info(block_id)?;
        Ok(serde_json::to_value(&mapping)?)
    }

    /// The chunk mapping of one fingerprint.
    pub fn inspect_chunk(&self, fingerprint: &Fingerprint) -> Result<serde_json::Value, Error> {
        match self.chunk_index().lookup(fingerprint)? {
            Some(mapping) => Ok(serde_json::to_value(&mapping)?),
            None => Ok(json!(null)),
        }
    }

    /// Cursor and fill state of the operation log.
    pub fn inspect_log_info(&self) -> serde_json::Value {
        self.log().info()
    }

    /// Coarse engine health summary.
    pub fn inspect_status(&self) -> serde_json::Value {
        json!({
            "replayer-state": format!("{:?}", self.replayer().state()),
            "log-empty": self.log().is_empty(),
            "log-fill-ratio": self.log().fill_ratio(),
            "replay-failures": self.log().replay_failure_count(),
            "committed-containers": self.storage().committed_container_count(),
            "free-containers": self.storage().free_container_count(),
            "open-blocks": self.block_index().open_block_count(),
        })
    }

    /// Dirty (not yet written back) item counts per index.
    pub fn inspect_dirty_counts(&self) -> serde_json::Value {
        json!({
            "chunk-index": {
                "persistent": self.chunk_index().item_count(),
                "dirty": self.chunk_index().dirty_item_count(),
                "total": self.chunk_index().total_item_count(),
            },
            "block-index": {
                "persistent": self.block_index().item_count(),
                "dirty": self.block_index().dirty_item_count(),
            },
        })
    }

    /// Candidate counts of both garbage collectors.
    pub fn inspect_gc_candidates(&self) -> Result<serde_json::Value, Error> {
        Ok(json!({
            "chunk-candidates": self.garbage_collector().candidate_count()?,
            "container-merge-candidates": self.container_gc().candidate_count()?,
        }))
    }
}
