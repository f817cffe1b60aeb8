//! Capture log reader
//!
//! Replays captured changes in data id order. A channel read resumes
//! strictly after the caller's cursor, so a crash between routing passes
//! re-reads exactly the unacknowledged records.

use async_trait::async_trait;

use super::{CancelFlag, DataContext, DataReader, EventCursor, ReaderStatistics};
use crate::capture::{CaptureLog, CaptureRecord};
use crate::error::{Error, Result};
use crate::model::{BatchHeader, BinaryEncoding, DataId, RowEvent, TableIdentity};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Which capture records a reader yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSelection {
    /// Records of one channel with ids greater than `after`, at most `max`
    Channel {
        channel_id: String,
        after: DataId,
        max: usize,
    },
    /// Exactly the listed records, in id order
    DataIds(Vec<DataId>),
}

/// Reads capture log records as a single batch
pub struct CaptureLogReader<'a> {
    log: &'a CaptureLog,
    selection: CaptureSelection,
    header: Option<BatchHeader>,
    page_size: usize,
    cursor: EventCursor,
    /// Highest data id handed to the cursor so far
    read_through: Option<DataId>,
    remaining: usize,
    exhausted: bool,
    cancel: CancelFlag,
    batches: u64,
}

impl<'a> CaptureLogReader<'a> {
    pub fn new(log: &'a CaptureLog, selection: CaptureSelection) -> Self {
        Self {
            log,
            selection,
            header: None,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: EventCursor::default(),
            read_through: None,
            remaining: 0,
            exhausted: false,
            cancel: CancelFlag::default(),
            batches: 0,
        }
    }

    /// Use a fixed header instead of one derived from the context
    pub fn with_header(mut self, header: BatchHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Highest data id read so far; the next channel cursor position
    pub fn last_data_id(&self) -> Option<DataId> {
        self.read_through
    }

    fn accept(&mut self, records: Vec<CaptureRecord>) -> Result<()> {
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            record.event.validate()?;
            self.read_through = Some(record.data_id);
            events.push(record.event);
        }
        self.cursor.extend(events);
        Ok(())
    }

    /// Pull the next page into the cursor once it runs dry
    fn refill(&mut self) -> Result<()> {
        if self.exhausted || !self.cursor.is_empty() {
            return Ok(());
        }

        match &self.selection {
            CaptureSelection::Channel { channel_id, after, .. } => {
                if self.remaining == 0 {
                    self.exhausted = true;
                    return Ok(());
                }
                let after = self.read_through.unwrap_or(*after);
                let want = self.remaining.min(self.page_size);
                let records = self.log.read_after(Some(channel_id.as_str()), after, want)?;
                if records.len() < want {
                    self.exhausted = true;
                }
                self.remaining -= records.len();
                self.accept(records)
            }
            CaptureSelection::DataIds(ids) => {
                let records = self.log.read_ids(ids)?;
                if records.len() != ids.len() {
                    tracing::warn!(
                        "Capture log holds {} of {} requested records",
                        records.len(),
                        ids.len()
                    );
                }
                self.exhausted = true;
                self.accept(records)
            }
        }
    }
}

#[async_trait]
impl DataReader for CaptureLogReader<'_> {
    async fn open(&mut self, context: &DataContext) -> Result<()> {
        self.cancel = context.cancel.clone();
        self.cursor = EventCursor::default();
        self.read_through = None;
        self.exhausted = false;
        if let CaptureSelection::Channel { max, .. } = &self.selection {
            self.remaining = *max;
        }

        if self.header.is_none() {
            let channel_id = match &self.selection {
                CaptureSelection::Channel { channel_id, .. } => channel_id.clone(),
                CaptureSelection::DataIds(_) => context
                    .channel_id
                    .clone()
                    .ok_or_else(|| Error::Internal("capture read by id needs a channel".into()))?,
            };
            self.header = Some(BatchHeader {
                batch_id: 0,
                source_node_id: context.source_node_id.clone().unwrap_or_default(),
                target_node_id: context.target_node_id.clone(),
                channel_id,
                binary_encoding: BinaryEncoding::default(),
                initial_load: false,
                ignored: false,
            });
        }
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<BatchHeader>> {
        let header = self.header.take();
        if header.is_some() {
            self.batches += 1;
        }
        Ok(header)
    }

    async fn next_table(&mut self) -> Result<Option<TableIdentity>> {
        self.refill()?;
        Ok(self.cursor.next_table())
    }

    async fn next_event(&mut self) -> Result<Option<RowEvent>> {
        self.cancel.check()?;
        self.refill()?;
        Ok(self.cursor.next_event())
    }

    fn close(&mut self) {
        self.header = None;
        self.cursor = EventCursor::default();
        self.exhausted = true;
    }

    fn statistics(&self) -> ReaderStatistics {
        ReaderStatistics {
            batches: self.batches,
            ..self.cursor.statistics()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureLogWriter;
    use crate::config::CaptureConfig;
    use crate::reader::ReaderScope;
    use tempfile::tempdir;

    fn event(table: &str, id: u64) -> RowEvent {
        RowEvent::insert(
            TableIdentity::new(table),
            vec!["id".into()],
            vec!["id".into()],
            vec![Some(id.to_string())],
        )
    }

    async fn populate(dir: &std::path::Path) -> CaptureLog {
        let config = CaptureConfig {
            flush_interval_ms: 10,
            fsync: false,
            ..CaptureConfig::default()
        };
        let writer = CaptureLogWriter::open(dir.to_path_buf(), config.clone()).await.unwrap();
        for i in 1..=9u64 {
            let table = if i <= 5 { "a" } else { "b" };
            let channel = if i == 4 { "other" } else { "main" };
            writer.append(channel, event(table, i)).await.unwrap();
        }
        writer.flush().await.unwrap();
        CaptureLog::open(dir.to_path_buf(), config.compression).unwrap()
    }

    #[tokio::test]
    async fn test_channel_read_preserves_order_across_pages() {
        let dir = tempdir().unwrap();
        let log = populate(dir.path()).await;

        let mut reader = CaptureLogReader::new(
            &log,
            CaptureSelection::Channel {
                channel_id: "main".into(),
                after: 1,
                max: 100,
            },
        )
        .with_page_size(2);

        let context = DataContext::default();
        let mut scope = ReaderScope::open(&mut reader, &context).await.unwrap();
        let header = scope.next_batch().await.unwrap().unwrap();
        assert_eq!(header.channel_id, "main");

        let events = scope.read_batch_events().await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.source_data_id).collect();
        assert_eq!(ids, vec![2, 3, 5, 6, 7, 8, 9]);
        assert_eq!(scope.last_data_id(), Some(9));
        assert!(scope.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_read_respects_max() {
        let dir = tempdir().unwrap();
        let log = populate(dir.path()).await;

        let mut reader = CaptureLogReader::new(
            &log,
            CaptureSelection::Channel {
                channel_id: "main".into(),
                after: 0,
                max: 3,
            },
        );
        let context = DataContext::default();
        let mut scope = ReaderScope::open(&mut reader, &context).await.unwrap();
        scope.next_batch().await.unwrap();
        let events = scope.read_batch_events().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(scope.last_data_id(), Some(3));
    }

    #[tokio::test]
    async fn test_read_by_ids_with_header() {
        let dir = tempdir().unwrap();
        let log = populate(dir.path()).await;

        let header = BatchHeader {
            batch_id: 7,
            source_node_id: "src".into(),
            target_node_id: Some("dst".into()),
            channel_id: "main".into(),
            binary_encoding: BinaryEncoding::Base64,
            initial_load: false,
            ignored: false,
        };
        let mut reader =
            CaptureLogReader::new(&log, CaptureSelection::DataIds(vec![8, 2, 6])).with_header(header);
        let context = DataContext::default();
        let mut scope = ReaderScope::open(&mut reader, &context).await.unwrap();
        assert_eq!(scope.next_batch().await.unwrap().unwrap().batch_id, 7);

        assert_eq!(scope.next_table().await.unwrap().unwrap().name, "a");
        assert_eq!(scope.next_event().await.unwrap().unwrap().source_data_id, 2);
        assert!(scope.next_event().await.unwrap().is_none());
        assert_eq!(scope.next_table().await.unwrap().unwrap().name, "b");
        assert_eq!(scope.next_event().await.unwrap().unwrap().source_data_id, 6);
        assert_eq!(scope.next_event().await.unwrap().unwrap().source_data_id, 8);
        assert!(scope.next_table().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_between_events() {
        let dir = tempdir().unwrap();
        let log = populate(dir.path()).await;

        let mut reader = CaptureLogReader::new(
            &log,
            CaptureSelection::Channel {
                channel_id: "main".into(),
                after: 0,
                max: 100,
            },
        );
        let context = DataContext::default();
        let mut scope = ReaderScope::open(&mut reader, &context).await.unwrap();
        scope.next_batch().await.unwrap();
        scope.next_table().await.unwrap();
        scope.next_event().await.unwrap().unwrap();
        context.cancel.cancel();
        let err = scope.next_event().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
