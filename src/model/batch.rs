//! Batch Types
//!
//! Ordered groups of row events bound for one node on one channel, and
//! the lifecycle state machine every batch moves through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BinaryEncoding, DataId, RowEvent};
use crate::error::{Error, ErrorClass, Result};

/// Batch identifier, increasing per (source, target, channel)
pub type BatchId = u64;

/// Lifecycle state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    New,
    Routed,
    ReadyToSend,
    Transmitting,
    Loading,
    Ok,
    Error,
    Resend,
    Ignored,
}

impl BatchStatus {
    /// Two-letter code persisted in status tables
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Routed => "RT",
            BatchStatus::ReadyToSend => "RD",
            BatchStatus::Transmitting => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
            BatchStatus::Resend => "RS",
            BatchStatus::Ignored => "IG",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "NE" => BatchStatus::New,
            "RT" => BatchStatus::Routed,
            "RD" => BatchStatus::ReadyToSend,
            "SE" => BatchStatus::Transmitting,
            "LD" => BatchStatus::Loading,
            "OK" => BatchStatus::Ok,
            "ER" => BatchStatus::Error,
            "RS" => BatchStatus::Resend,
            "IG" => BatchStatus::Ignored,
            _ => return None,
        })
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (New, Routed)
                | (Routed, ReadyToSend)
                | (ReadyToSend, Transmitting)
                | (Transmitting, Loading)
                | (Loading, Ok)
                | (Transmitting, Error)
                | (Loading, Error)
                | (Error, Resend)
                | (Error, Ignored)
                | (Resend, Transmitting)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Ok | BatchStatus::Ignored)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchStatus::New => "NEW",
            BatchStatus::Routed => "ROUTED",
            BatchStatus::ReadyToSend => "READY_TO_SEND",
            BatchStatus::Transmitting => "TRANSMITTING",
            BatchStatus::Loading => "LOADING",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ERROR",
            BatchStatus::Resend => "RESEND",
            BatchStatus::Ignored => "IGNORED",
        };
        write!(f, "{}", name)
    }
}

/// The ordering sequence a batch belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub source_node_id: String,
    pub target_node_id: String,
    pub channel_id: String,
}

impl BatchKey {
    pub fn new(
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{}/{}",
            self.source_node_id, self.target_node_id, self.channel_id
        )
    }
}

/// Batch metadata carried at the top of a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub batch_id: BatchId,
    pub source_node_id: String,
    pub target_node_id: Option<String>,
    pub channel_id: String,
    pub binary_encoding: BinaryEncoding,
    pub initial_load: bool,
    /// Notice that the sender gave up on this batch
    pub ignored: bool,
}

impl BatchHeader {
    /// Node-qualified batch name used in logs
    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.source_node_id, self.batch_id)
    }
}

/// Diagnostic persisted with a failed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub class: ErrorClass,
    pub message: String,
    pub source_data_id: Option<DataId>,
    pub table: Option<String>,
    /// 1-based position of the failing event within the batch
    pub event_index: Option<u64>,
}

impl BatchFailure {
    pub fn from_error(error: &Error) -> Self {
        let event = error.event();
        Self {
            class: error.class(),
            message: error.to_string(),
            source_data_id: event.map(|e| e.source_data_id).filter(|id| *id > 0),
            table: event.map(|e| e.table.qualified_name()),
            event_index: None,
        }
    }

    pub fn at_event(mut self, index: u64) -> Self {
        self.event_index = Some(index);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// An ordered, atomically applied unit of row changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub source_node_id: String,
    /// Absent until the batch is routed
    pub target_node_id: Option<String>,
    pub channel_id: String,
    pub status: BatchStatus,
    pub initial_load: bool,
    pub binary_encoding: BinaryEncoding,
    pub create_time: DateTime<Utc>,
    pub events: Vec<RowEvent>,
    pub byte_count: u64,
    pub retry_count: u32,
    pub failure: Option<BatchFailure>,
}

impl Batch {
    pub fn new(
        source_node_id: impl Into<String>,
        target_node_id: Option<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            batch_id: 0,
            source_node_id: source_node_id.into(),
            target_node_id,
            channel_id: channel_id.into(),
            status: BatchStatus::New,
            initial_load: false,
            binary_encoding: BinaryEncoding::None,
            create_time: Utc::now(),
            events: Vec::new(),
            byte_count: 0,
            retry_count: 0,
            failure: None,
        }
    }

    /// Append an event, preserving arrival order
    pub fn push(&mut self, event: RowEvent) {
        self.byte_count += event.estimated_size();
        self.events.push(event);
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn key(&self) -> Option<BatchKey> {
        self.target_node_id.as_ref().map(|target| BatchKey {
            source_node_id: self.source_node_id.clone(),
            target_node_id: target.clone(),
            channel_id: self.channel_id.clone(),
        })
    }

    pub fn header(&self) -> BatchHeader {
        BatchHeader {
            batch_id: self.batch_id,
            source_node_id: self.source_node_id.clone(),
            target_node_id: self.target_node_id.clone(),
            channel_id: self.channel_id.clone(),
            binary_encoding: self.binary_encoding,
            initial_load: self.initial_load,
            ignored: self.status == BatchStatus::Ignored,
        }
    }

    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.source_node_id, self.batch_id)
    }

    /// Move the batch to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                batch: self.node_batch_id(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("Batch {} {} -> {}", self.node_batch_id(), self.status, next);
        self.status = next;
        Ok(())
    }
}
