use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use dedup_api_types::{BlockMapping, BlockMappingPair};

/// Typed payload of one operation log entry.
///
/// The on-disk frame carries the numeric event type next to the encoded
/// payload, so unknown future types can be skipped without parsing them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum EventPayload {
    ContainerCommitted {
        container_id: u64,
        item_count: u32,
        active_data_size: u32,
    },
    ContainerMoved {
        container_id: u64,
        old_file_index: u32,
        old_file_offset: u64,
        new_file_index: u32,
        new_file_offset: u64,
    },
    ContainerMerged {
        first_id: u64,
        second_id: u64,
        new_primary_id: u64,
        item_count: u32,
        active_data_size: u32,
    },
    ContainerDeleted {
        container_id: u64,
    },
    BlockMappingWritten {
        pair: BlockMappingPair,
    },
    BlockMappingWriteFailed {
        pair: BlockMappingPair,
        #[serde(skip_serializing_if = "Option::is_none")]
        write_event_log_id: Option<u64>,
    },
    BlockMappingDeleted {
        previous: BlockMapping,
    },
    VolumeAttached {
        volume_id: u32,
    },
    VolumeDetached {
        volume_id: u32,
    },
    ReplayStarted,
    LogEmpty,
}

impl EventPayload {
    pub fn event_type(&self) -> u16 {
        match self {
            EventPayload::ContainerCommitted { .. } => 1,
            EventPayload::ContainerMoved { .. } => 2,
            EventPayload::ContainerMerged { .. } => 3,
            EventPayload::ContainerDeleted { .. } => 4,
            EventPayload::BlockMappingWritten { .. } => 5,
            EventPayload::BlockMappingWriteFailed { .. } => 6,
            EventPayload::BlockMappingDeleted { .. } => 7,
            EventPayload::VolumeAttached { .. } => 8,
            EventPayload::VolumeDetached { .. } => 9,
            EventPayload::ReplayStarted => 10,
            EventPayload::LogEmpty => 11,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::ContainerCommitted { .. } => "container-committed",
            EventPayload::ContainerMoved { .. } => "container-moved",
            EventPayload::ContainerMerged { .. } => "container-merged",
            EventPayload::ContainerDeleted { .. } => "container-deleted",
            EventPayload::BlockMappingWritten { .. } => "block-mapping-written",
            EventPayload::BlockMappingWriteFailed { .. } => "block-mapping-write-failed",
            EventPayload::BlockMappingDeleted { .. } => "block-mapping-deleted",
            EventPayload::VolumeAttached { .. } => "volume-attached",
            EventPayload::VolumeDetached { .. } => "volume-detached",
            EventPayload::ReplayStarted => "replay-started",
            EventPayload::LogEmpty => "log-empty",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(event_type: u16, payload: &[u8]) -> Result<Self, Error> {
        let event: EventPayload = serde_json::from_slice(payload)?;
        if event.event_type() != event_type {
            bail!(
                "event type mismatch (frame {}, payload {})",
                event_type,
                event.event_type()
            );
        }
        Ok(event)
    }
}

/// One committed operation log entry.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    pub log_id: u64,
    pub payload: EventPayload,
}

/// Which delivery path handed an event to a consumer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplayMode {
    /// Synchronous publication on the committing thread.
    Direct,
    /// Startup replay after an unclean shutdown.
    DirtyStart,
    /// Background replay during normal operation.
    Background,
}

/// Consumer of operation log events.
///
/// Direct delivery happens exactly once, on the committing thread, in
/// `log_id` order. Replay delivery is at-least-once in `log_id` order;
/// consumers must be idempotent.
pub trait LogConsumer: Send + Sync {
    fn log_replay(&self, event: &LogEvent, mode: ReplayMode) -> Result<(), Error>;
}
