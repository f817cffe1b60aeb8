//! Batch Pipeline
//!
//! Ties the pieces together on each node:
//! - extraction reads the capture log, routes events and stages sealed batches
//! - push transmits staged batches in id order per target and channel
//! - load applies incoming payloads to the local database
//!
//! [`SyncEngine`] runs all three on timers until stopped.

mod engine;
mod extract;
mod load;
mod push;

pub use engine::SyncEngine;
pub use extract::{ExtractSettings, Extractor};
pub use load::Loader;
pub use push::{PushSettings, Pusher};

use crate::model::{BatchId, BatchKey, DataId};

/// Outcome of one routing pass over a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingReport {
    pub channel_id: String,
    /// Capture records read from the log
    pub events_read: usize,
    /// Records that matched at least one target
    pub events_routed: usize,
    /// Records left for the next pass to keep a transaction whole
    pub events_held_back: usize,
    pub batches: Vec<(BatchKey, BatchId)>,
    /// Channel cursor after the pass
    pub cursor: DataId,
}

/// Outcome of one push pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub sent: usize,
    pub failed: usize,
    pub ignored: usize,
    /// Sequences waiting for a retry backoff to pass
    pub waiting: usize,
}

impl PushReport {
    fn merge(&mut self, other: PushReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.ignored += other.ignored;
        self.waiting += other.waiting;
    }
}
