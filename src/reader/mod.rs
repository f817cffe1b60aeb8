//! Data Readers
//!
//! A data reader produces a forward-only sequence of batches, tables within
//! each batch, and row events within each table. Sequences are finite and
//! cannot be restarted; `close` must run on every exit path, which
//! [`ReaderScope`] guarantees.

mod capture;
mod memory;
mod snapshot;

pub use capture::{CaptureLogReader, CaptureSelection};
pub use memory::{BatchDataReader, EventCursor};
pub use snapshot::{SnapshotReader, SnapshotTable};

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{BatchHeader, RowEvent, TableIdentity};

/// Stop signal shared between a pipeline and its readers/writers
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with a retryable cancellation error once the stop signal is set
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-run context handed to readers and writers
#[derive(Debug, Clone, Default)]
pub struct DataContext {
    pub source_node_id: Option<String>,
    pub target_node_id: Option<String>,
    pub channel_id: Option<String>,
    pub cancel: CancelFlag,
}

impl DataContext {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn for_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn for_target(mut self, target_node_id: impl Into<String>) -> Self {
        self.target_node_id = Some(target_node_id.into());
        self
    }
}

/// Counters a reader keeps while it runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStatistics {
    pub batches: u64,
    pub tables: u64,
    pub events: u64,
}

/// Lazy, non-restartable source of row events
#[async_trait]
pub trait DataReader: Send {
    /// Acquire underlying resources
    async fn open(&mut self, context: &DataContext) -> Result<()>;

    /// Next batch header, or `None` when the source is exhausted
    async fn next_batch(&mut self) -> Result<Option<BatchHeader>>;

    /// Next table of the current batch, or `None` at the end of the batch
    async fn next_table(&mut self) -> Result<Option<TableIdentity>>;

    /// Next event of the current table, or `None` at the end of the table
    async fn next_event(&mut self) -> Result<Option<RowEvent>>;

    /// Release underlying resources; safe to call more than once
    fn close(&mut self);

    fn statistics(&self) -> ReaderStatistics {
        ReaderStatistics::default()
    }
}

/// Open reader that is closed when the scope ends
pub struct ReaderScope<'a, R: DataReader + ?Sized> {
    reader: &'a mut R,
}

impl<'a, R: DataReader + ?Sized> ReaderScope<'a, R> {
    /// Open `reader`, closing it again if opening fails
    pub async fn open(reader: &'a mut R, context: &DataContext) -> Result<ReaderScope<'a, R>> {
        if let Err(e) = reader.open(context).await {
            reader.close();
            return Err(e);
        }
        Ok(Self { reader })
    }

    /// Drain every remaining event of the current batch, in order
    pub async fn read_batch_events(&mut self) -> Result<Vec<RowEvent>> {
        let mut events = Vec::new();
        while self.reader.next_table().await?.is_some() {
            while let Some(event) = self.reader.next_event().await? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl<R: DataReader + ?Sized> Deref for ReaderScope<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.reader
    }
}

impl<R: DataReader + ?Sized> DerefMut for ReaderScope<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        self.reader
    }
}

impl<R: DataReader + ?Sized> Drop for ReaderScope<'_, R> {
    fn drop(&mut self) {
        self.reader.close();
    }
}
