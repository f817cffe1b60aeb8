//! WolfSync - Change-Capture Batch Pipeline
//!
//! Captures row-level changes on a source database, packs them into ordered
//! batches per target node and channel, and replays each batch
//! transactionally on the target with conflict detection and resolution.
//!
//! # Architecture
//!
//! Changes flow through the pipeline in this order:
//!
//! - **capture**: durable, ordered change log written by the capture side
//! - **reader**: lazy, non-restartable event sources (capture log, snapshot, payload)
//! - **route**: subscription evaluation and per-target batch assembly
//! - **stage**: memory or disk home of payloads between steps
//! - **transport**: moves staged payloads between nodes
//! - **writer**: applies a batch in one transaction on the target
//!
//! Batch lifecycle state lives in the [`state::BatchStore`] on the sending
//! node and in the incoming ledger table on the target database.

pub mod capture;
pub mod config;
pub mod error;
pub mod extension;
pub mod model;
pub mod pipeline;
pub mod platform;
pub mod protocol;
pub mod reader;
pub mod route;
pub mod stage;
pub mod state;
pub mod transport;
pub mod writer;

pub use config::WolfSyncConfig;
pub use error::{Error, ErrorClass, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::capture::{CaptureLog, CaptureLogWriter};
    pub use crate::config::WolfSyncConfig;
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::extension::ExtensionRegistry;
    pub use crate::model::{Batch, BatchHeader, BatchKey, BatchStatus, EventType, RowEvent, TableIdentity};
    pub use crate::pipeline::SyncEngine;
    pub use crate::platform::Platform;
    pub use crate::reader::{DataContext, DataReader, ReaderScope};
    pub use crate::route::{Node, RouterService, Subscription};
    pub use crate::stage::StagingManager;
    pub use crate::state::BatchStore;
    pub use crate::transport::Transport;
    pub use crate::writer::DatabaseWriter;
}
