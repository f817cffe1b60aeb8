//! Capture Log Records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{DataId, RowEvent};

/// One captured change, as persisted in the capture log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Strictly increasing across the whole log
    pub data_id: DataId,
    pub channel_id: String,
    pub create_time: DateTime<Utc>,
    pub event: RowEvent,
}

impl CaptureRecord {
    pub fn new(data_id: DataId, channel_id: impl Into<String>, event: RowEvent) -> Self {
        Self {
            data_id,
            channel_id: channel_id.into(),
            create_time: Utc::now(),
            event: event.with_source_data_id(data_id),
        }
    }

    /// Serialize record to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize record from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
