//! Snapshot reader
//!
//! Synthesizes row events from the current contents of source tables,
//! one page of rows at a time, ordered by primary key.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use super::{CancelFlag, DataContext, DataReader, ReaderStatistics};
use crate::error::{Error, Result};
use crate::model::{BatchHeader, BinaryEncoding, EventType, RowEvent, TableIdentity};
use crate::platform::{Platform, TableMeta};

const DEFAULT_PAGE_SIZE: u64 = 500;

/// A table to extract, optionally restricted by a SQL condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTable {
    pub table: TableIdentity,
    pub condition: Option<String>,
}

impl SnapshotTable {
    pub fn new(table: TableIdentity) -> Self {
        Self {
            table,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

struct TableScan {
    meta: TableMeta,
    select: String,
    offset: u64,
    done: bool,
}

/// Reads live table contents as one initial-load batch
pub struct SnapshotReader {
    platform: Arc<dyn Platform>,
    pending: VecDeque<SnapshotTable>,
    header: Option<BatchHeader>,
    event_type: EventType,
    encoding: BinaryEncoding,
    page_size: u64,
    scan: Option<TableScan>,
    buffered: VecDeque<RowEvent>,
    cancel: CancelFlag,
    stats: ReaderStatistics,
}

impl SnapshotReader {
    pub fn new(platform: Arc<dyn Platform>, tables: Vec<SnapshotTable>) -> Self {
        Self {
            platform,
            pending: tables.into(),
            header: None,
            event_type: EventType::Insert,
            encoding: BinaryEncoding::default(),
            page_size: DEFAULT_PAGE_SIZE,
            scan: None,
            buffered: VecDeque::new(),
            cancel: CancelFlag::default(),
            stats: ReaderStatistics::default(),
        }
    }

    /// Emit RELOAD events instead of INSERT
    pub fn reloading(mut self) -> Self {
        self.event_type = EventType::Reload;
        self
    }

    pub fn with_header(mut self, header: BatchHeader) -> Self {
        self.encoding = header.binary_encoding;
        self.header = Some(header);
        self
    }

    pub fn with_encoding(mut self, encoding: BinaryEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn build_select(&self, meta: &TableMeta, condition: Option<&str>) -> String {
        let platform = &self.platform;
        let columns: Vec<String> = meta
            .columns
            .iter()
            .map(|c| {
                if c.is_binary() {
                    platform.quote_identifier(&c.name)
                } else {
                    platform.select_column(&c.name)
                }
            })
            .collect();

        let order: Vec<String> = if meta.primary_keys.is_empty() {
            meta.columns.iter().map(|c| platform.quote_identifier(&c.name)).collect()
        } else {
            meta.primary_keys.iter().map(|k| platform.quote_identifier(k)).collect()
        };

        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            platform.qualified_table(&meta.table)
        );
        if let Some(condition) = condition.filter(|c| !c.trim().is_empty()) {
            sql.push_str(" WHERE ");
            sql.push_str(condition);
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
        sql
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let Some(scan) = self.scan.as_mut() else {
            return Ok(());
        };
        if scan.done {
            return Ok(());
        }

        let sql = format!(
            "{}{}",
            scan.select,
            self.platform.limit_offset(self.page_size, scan.offset)
        );
        let rows = self.platform.query(&sql, &[]).await?;
        let fetched = rows.len() as u64;
        scan.offset += fetched;
        if fetched < self.page_size {
            scan.done = true;
        }

        let columns = scan.meta.column_names();
        for row in rows {
            let values = row.into_iter().map(|v| v.into_encoded(self.encoding)).collect();
            let event = match self.event_type {
                EventType::Reload => RowEvent::reload(
                    scan.meta.table.clone(),
                    columns.clone(),
                    scan.meta.primary_keys.clone(),
                    values,
                ),
                _ => RowEvent::insert(
                    scan.meta.table.clone(),
                    columns.clone(),
                    scan.meta.primary_keys.clone(),
                    values,
                ),
            }
            .with_encoding(self.encoding);
            event.validate()?;
            self.buffered.push_back(event);
        }
        Ok(())
    }
}

#[async_trait]
impl DataReader for SnapshotReader {
    async fn open(&mut self, context: &DataContext) -> Result<()> {
        self.cancel = context.cancel.clone();
        if self.header.is_none() {
            self.header = Some(BatchHeader {
                batch_id: 0,
                source_node_id: context.source_node_id.clone().unwrap_or_default(),
                target_node_id: context.target_node_id.clone(),
                channel_id: context.channel_id.clone().unwrap_or_else(|| "reload".into()),
                binary_encoding: self.encoding,
                initial_load: true,
                ignored: false,
            });
        }
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<BatchHeader>> {
        let header = self.header.take();
        if header.is_some() {
            self.stats.batches += 1;
        }
        Ok(header)
    }

    async fn next_table(&mut self) -> Result<Option<TableIdentity>> {
        self.buffered.clear();
        self.scan = None;

        let Some(next) = self.pending.pop_front() else {
            return Ok(None);
        };
        let meta = self
            .platform
            .table_metadata(&next.table)
            .await?
            .ok_or_else(|| Error::TableMissing {
                table: next.table.qualified_name(),
                event: None,
            })?;

        let select = self.build_select(&meta, next.condition.as_deref());
        tracing::debug!("Snapshot of {}: {}", next.table, select);
        self.scan = Some(TableScan {
            meta,
            select,
            offset: 0,
            done: false,
        });
        self.stats.tables += 1;
        Ok(Some(next.table))
    }

    async fn next_event(&mut self) -> Result<Option<RowEvent>> {
        self.cancel.check()?;
        if self.buffered.is_empty() {
            self.fetch_page().await?;
        }
        let event = self.buffered.pop_front();
        if event.is_some() {
            self.stats.events += 1;
        }
        Ok(event)
    }

    fn close(&mut self) {
        self.header = None;
        self.pending.clear();
        self.buffered.clear();
        self.scan = None;
    }

    fn statistics(&self) -> ReaderStatistics {
        self.stats
    }
}
