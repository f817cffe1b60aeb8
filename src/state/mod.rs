//! State Management Module
//!
//! Persistent lifecycle state of outgoing batches.

mod store;

pub use store::{BatchStore, OutgoingBatch};
