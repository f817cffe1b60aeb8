//! Data Model
//!
//! Row events, batches and the batch lifecycle.

mod batch;
mod encoding;
mod event;

pub use batch::{Batch, BatchFailure, BatchHeader, BatchId, BatchKey, BatchStatus};
pub use encoding::BinaryEncoding;
pub use event::{DataId, EventType, Row, RowEvent, TableIdentity};
