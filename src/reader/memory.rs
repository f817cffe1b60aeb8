//! In-memory event sequences

use std::collections::VecDeque;

use async_trait::async_trait;

use super::{CancelFlag, DataContext, DataReader, ReaderStatistics};
use crate::error::Result;
use crate::model::{Batch, BatchHeader, RowEvent, TableIdentity};

/// Splits an ordered event list into runs of the same table
#[derive(Debug, Default)]
pub struct EventCursor {
    events: VecDeque<RowEvent>,
    current_table: Option<TableIdentity>,
    stats: ReaderStatistics,
}

impl EventCursor {
    pub fn new(events: impl IntoIterator<Item = RowEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            current_table: None,
            stats: ReaderStatistics::default(),
        }
    }

    /// Append more events to the end of the sequence
    pub fn extend(&mut self, events: impl IntoIterator<Item = RowEvent>) {
        self.events.extend(events);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Move to the next table run, skipping whatever is left of the current one
    pub fn next_table(&mut self) -> Option<TableIdentity> {
        if let Some(current) = self.current_table.take() {
            while self.events.front().map_or(false, |e| e.table == current) {
                self.events.pop_front();
            }
        }
        let table = self.events.front()?.table.clone();
        self.current_table = Some(table.clone());
        self.stats.tables += 1;
        Some(table)
    }

    pub fn next_event(&mut self) -> Option<RowEvent> {
        let current = self.current_table.as_ref()?;
        if self.events.front().map_or(false, |e| &e.table == current) {
            self.stats.events += 1;
            self.events.pop_front()
        } else {
            None
        }
    }

    pub fn statistics(&self) -> ReaderStatistics {
        self.stats
    }
}

/// Reads one already materialized batch
pub struct BatchDataReader {
    header: Option<BatchHeader>,
    cursor: EventCursor,
    cancel: CancelFlag,
    batches: u64,
}

impl BatchDataReader {
    pub fn new(batch: Batch) -> Self {
        let header = batch.header();
        Self::from_parts(header, batch.events)
    }

    pub fn from_parts(header: BatchHeader, events: Vec<RowEvent>) -> Self {
        Self {
            header: Some(header),
            cursor: EventCursor::new(events),
            cancel: CancelFlag::default(),
            batches: 0,
        }
    }
}

#[async_trait]
impl DataReader for BatchDataReader {
    async fn open(&mut self, context: &DataContext) -> Result<()> {
        self.cancel = context.cancel.clone();
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
        Ok(self.cursor.next_table())
    }

    async fn next_event(&mut self) -> Result<Option<RowEvent>> {
        self.cancel.check()?;
        Ok(self.cursor.next_event())
    }

    fn close(&mut self) {
        self.header = None;
        self.cursor = EventCursor::default();
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
    use crate::reader::ReaderScope;

    fn event(table: &str, id: &str) -> RowEvent {
        RowEvent::insert(
            TableIdentity::new(table),
            vec!["id".into()],
            vec!["id".into()],
            vec![Some(id.into())],
        )
    }

    #[test]
    fn test_cursor_groups_table_runs() {
        let mut cursor = EventCursor::new(vec![
            event("a", "1"),
            event("a", "2"),
            event("b", "3"),
            event("a", "4"),
        ]);

        assert_eq!(cursor.next_table().unwrap().name, "a");
        assert_eq!(cursor.next_event().unwrap().value("id"), Some("1"));
        assert_eq!(cursor.next_event().unwrap().value("id"), Some("2"));
        assert!(cursor.next_event().is_none());
        assert_eq!(cursor.next_table().unwrap().name, "b");
        assert_eq!(cursor.next_table().unwrap().name, "a");
        assert_eq!(cursor.next_event().unwrap().value("id"), Some("4"));
        assert!(cursor.next_table().is_none());
    }

    #[tokio::test]
    async fn test_batch_reader_preserves_order() {
        let mut batch = Batch::new("src", Some("tgt".into()), "default");
        for i in 0..5 {
            batch.push(event(if i % 2 == 0 { "x" } else { "y" }, &i.to_string()));
        }

        let mut reader = BatchDataReader::new(batch);
        let mut scope = ReaderScope::open(&mut reader, &DataContext::default()).await.unwrap();
        let header = scope.next_batch().await.unwrap().unwrap();
        assert_eq!(header.channel_id, "default");

        let events = scope.read_batch_events().await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.value("id").unwrap().to_string()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);
        assert!(scope.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_reader_stops_between_events() {
        let mut batch = Batch::new("src", Some("tgt".into()), "default");
        batch.push(event("x", "1"));
        let cancel = CancelFlag::new();
        let mut reader = BatchDataReader::new(batch);
        let mut scope = ReaderScope::open(&mut reader, &DataContext::new(cancel.clone())).await.unwrap();
        scope.next_batch().await.unwrap();
        scope.next_table().await.unwrap();
        cancel.cancel();
        let err = scope.next_event().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
