//! Database Writer
//!
//! Applies the events of a batch to the target database inside one
//! transaction per batch. Conflicts are settled through the registered
//! resolver, missing tables through the table-missing handlers, and
//! unhandled failures through the error handler chain.

mod dml;
pub mod ledger;

pub use dml::Statement;
pub use ledger::{IncomingBatch, LEDGER_TABLE};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extension::{
    ConflictKind, ExtensionRegistry, FilterAction, Resolution, TableMissingAction, WriteContext,
};
use crate::model::{BatchFailure, BatchHeader, BatchStatus, EventType, RowEvent, TableIdentity};
use crate::platform::{Platform, PlatformTransaction, TableMeta};
use crate::reader::{CancelFlag, DataContext, DataReader, ReaderScope};

/// How UPDATE and DELETE statements locate their row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDetection {
    /// Match on primary key values
    #[default]
    PrimaryKey,
    /// Match on every pre-image column
    OldData,
}

/// Writer tuning
#[derive(Debug, Clone, Default)]
pub struct WriterSettings {
    /// Commit after this many rows; `None` keeps one transaction per batch
    pub max_rows_before_commit: Option<u64>,
    pub conflict_detection: ConflictDetection,
    /// Log resolved conflicts at info level
    pub log_conflicts: bool,
}

/// Counters for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStatistics {
    pub events: u64,
    pub statements: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub scripts: u64,
    pub fallback_inserts: u64,
    pub fallback_updates: u64,
    pub missing_deletes: u64,
    pub ignored_conflicts: u64,
    pub skipped: u64,
    pub handled_errors: u64,
    pub early_commits: u64,
    /// Events passed over because an earlier attempt already committed them
    pub resumed: u64,
}

/// What `start_batch` decided about an incoming batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStart {
    /// Apply the events
    Apply,
    /// Already loaded or ignored; nothing to do
    Duplicate,
    /// Ignore notice recorded
    Ignored,
}

/// Result of writing one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Skipped,
    /// Failed, but an error handler took responsibility
    Handled,
}

struct BatchInProgress {
    header: BatchHeader,
    tx: Option<Box<dyn PlatformTransaction>>,
    /// Events seen so far, including skipped ones
    event_index: u64,
    /// Events committed by an earlier attempt
    resume_after: u64,
    uncommitted: u64,
    current: Option<RowEvent>,
}

/// Applies batches to one target database
pub struct DatabaseWriter {
    platform: Arc<dyn Platform>,
    extensions: Arc<ExtensionRegistry>,
    settings: WriterSettings,
    target_node_id: Option<String>,
    cancel: CancelFlag,
    metadata: HashMap<TableIdentity, TableMeta>,
    batch: Option<BatchInProgress>,
    stats: WriterStatistics,
    opened: bool,
}

impl DatabaseWriter {
    pub fn new(
        platform: Arc<dyn Platform>,
        extensions: Arc<ExtensionRegistry>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            platform,
            extensions,
            settings,
            target_node_id: None,
            cancel: CancelFlag::default(),
            metadata: HashMap::new(),
            batch: None,
            stats: WriterStatistics::default(),
            opened: false,
        }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Node this writer loads for, once opened
    pub fn target_node_id(&self) -> Option<&str> {
        self.target_node_id.as_deref()
    }

    /// Prepare for loading on behalf of `target_node_id`
    pub async fn open(&mut self, target_node_id: &str, context: &DataContext) -> Result<()> {
        ledger::ensure_table(self.platform.as_ref()).await?;
        self.target_node_id = Some(target_node_id.to_string());
        self.cancel = context.cancel.clone();
        self.opened = true;
        tracing::debug!(
            "Writer opened for node {} on {}",
            target_node_id,
            self.platform.name()
        );
        Ok(())
    }

    /// Begin a batch, enforcing the per source/channel load order
    pub async fn start_batch(&mut self, header: &BatchHeader) -> Result<BatchStart> {
        if !self.opened {
            return Err(Error::Internal("writer is not open".into()));
        }
        if let Some(previous) = self.batch.take() {
            tracing::warn!(
                "Batch {} was never finished; rolling it back",
                previous.header.node_batch_id()
            );
            if let Some(tx) = previous.tx {
                tx.rollback().await?;
            }
        }

        let platform = Arc::clone(&self.platform);
        let mut tx = platform.begin().await?;
        let settled = ledger::last_settled(
            platform.as_ref(),
            tx.as_mut(),
            &header.source_node_id,
            &header.channel_id,
        )
        .await?;

        if header.batch_id <= settled {
            tx.rollback().await?;
            tracing::info!(
                "Batch {} already settled on this node, acknowledging",
                header.node_batch_id()
            );
            return Ok(BatchStart::Duplicate);
        }
        if header.batch_id != settled + 1 {
            tx.rollback().await?;
            return Err(Error::OutOfOrder {
                expected: settled + 1,
                received: header.batch_id,
            });
        }

        if header.ignored {
            let row = IncomingBatch::new(
                &header.source_node_id,
                &header.channel_id,
                header.batch_id,
                BatchStatus::Ignored,
            );
            ledger::record(platform.as_ref(), tx.as_mut(), &row).await?;
            tx.commit().await?;
            tracing::warn!("Batch {} ignored by its sender", header.node_batch_id());
            return Ok(BatchStart::Ignored);
        }

        let resume_after = match ledger::find(
            platform.as_ref(),
            tx.as_mut(),
            &header.source_node_id,
            &header.channel_id,
            header.batch_id,
        )
        .await?
        {
            Some(row) if row.committed_count > 0 => {
                tracing::info!(
                    "Resuming batch {} after {} committed events",
                    header.node_batch_id(),
                    row.committed_count
                );
                row.committed_count
            }
            _ => 0,
        };

        self.batch = Some(BatchInProgress {
            header: header.clone(),
            tx: Some(tx),
            event_index: 0,
            resume_after,
            uncommitted: 0,
            current: None,
        });
        self.stats = WriterStatistics::default();
        Ok(BatchStart::Apply)
    }

    /// Apply one event of the current batch
    pub async fn write(&mut self, mut event: RowEvent) -> Result<WriteOutcome> {
        self.cancel.check()?;
        let extensions = Arc::clone(&self.extensions);
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| Error::Internal("write outside of a batch".into()))?;
        batch.event_index += 1;
        batch.current = Some(event.clone());
        self.stats.events += 1;

        if batch.event_index <= batch.resume_after {
            self.stats.resumed += 1;
            return Ok(WriteOutcome::Skipped);
        }

        let header = batch.header.clone();
        let context = WriteContext {
            header: &header,
            event_index: batch.event_index,
        };

        if let Err(e) = event.validate() {
            return self.handle_failure(&context, &event, e);
        }

        for filter in extensions.filters() {
            match filter.before_write(&context, &mut event) {
                Ok(FilterAction::Continue) => {}
                Ok(FilterAction::Skip) => {
                    tracing::debug!("Filter {} skipped {}", filter.name(), event.describe());
                    self.stats.skipped += 1;
                    return Ok(WriteOutcome::Skipped);
                }
                Err(e) if e.is_fatal_extension() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Filter {} failed on {}, skipping the event: {}",
                        filter.name(),
                        event.describe(),
                        e
                    );
                    self.stats.skipped += 1;
                    return Ok(WriteOutcome::Skipped);
                }
            }
        }

        let outcome = match self.apply(&mut event).await {
            Ok(outcome) => outcome,
            Err(e) => return self.handle_failure(&context, &event, e),
        };

        if outcome == WriteOutcome::Applied {
            for filter in extensions.filters() {
                if let Err(e) = filter.after_write(&context, &event) {
                    if e.is_fatal_extension() {
                        return Err(e);
                    }
                    tracing::warn!("Filter {} failed after {}: {}", filter.name(), event.describe(), e);
                }
            }
        }

        self.commit_if_due().await?;
        Ok(outcome)
    }

    /// Offer a failure to the error handler chain; the first taker wins
    fn handle_failure(
        &mut self,
        context: &WriteContext<'_>,
        event: &RowEvent,
        error: Error,
    ) -> Result<WriteOutcome> {
        let extensions = Arc::clone(&self.extensions);
        let handler = extensions
            .error_handlers()
            .iter()
            .find(|h| h.handle(context, event, &error));
        match handler {
            Some(handler) => {
                tracing::warn!(
                    "Error handler {} took over failure on {}: {}",
                    handler.name(),
                    event.describe(),
                    error
                );
                self.stats.handled_errors += 1;
                Ok(WriteOutcome::Handled)
            }
            None => Err(error),
        }
    }

    /// Commit the rows so far when the early-commit threshold is reached
    async fn commit_if_due(&mut self) -> Result<()> {
        let Some(limit) = self.settings.max_rows_before_commit else {
            return Ok(());
        };
        let platform = Arc::clone(&self.platform);
        let Some(batch) = self.batch.as_mut() else {
            return Ok(());
        };
        batch.uncommitted += 1;
        if batch.uncommitted < limit.max(1) {
            return Ok(());
        }

        let mut tx = batch
            .tx
            .take()
            .ok_or_else(|| Error::Internal("batch has no open transaction".into()))?;
        let mut row = IncomingBatch::new(
            &batch.header.source_node_id,
            &batch.header.channel_id,
            batch.header.batch_id,
            BatchStatus::Loading,
        );
        row.committed_count = batch.event_index;
        ledger::record(platform.as_ref(), tx.as_mut(), &row).await?;
        tx.commit().await?;

        batch.uncommitted = 0;
        self.stats.early_commits += 1;
        tracing::debug!(
            "Early commit of batch {} at event {}",
            batch.header.node_batch_id(),
            batch.event_index
        );
        batch.tx = Some(platform.begin().await?);
        Ok(())
    }

    /// Commit the batch together with its OK ledger row
    pub async fn finish_batch(&mut self) -> Result<WriterStatistics> {
        let mut batch = self
            .batch
            .take()
            .ok_or_else(|| Error::Internal("finish outside of a batch".into()))?;
        let mut tx = batch
            .tx
            .take()
            .ok_or_else(|| Error::Internal("batch has no open transaction".into()))?;

        let mut row = IncomingBatch::new(
            &batch.header.source_node_id,
            &batch.header.channel_id,
            batch.header.batch_id,
            BatchStatus::Ok,
        );
        row.committed_count = batch.event_index;
        ledger::record(self.platform.as_ref(), tx.as_mut(), &row).await?;
        tx.commit().await?;

        let stats = std::mem::take(&mut self.stats);
        tracing::debug!(
            "Batch {} committed: {} events, {} statements",
            batch.header.node_batch_id(),
            stats.events,
            stats.statements
        );
        Ok(stats)
    }

    /// Roll back the current batch and record the failure in the ledger
    pub async fn abort_batch(&mut self, error: &Error) -> Result<BatchFailure> {
        let failure = self.failure(error);
        let Some(mut batch) = self.batch.take() else {
            return Ok(failure);
        };
        if let Some(tx) = batch.tx.take() {
            tx.rollback().await?;
        }

        let platform = self.platform.as_ref();
        let mut tx = platform.begin().await?;
        let mut row = ledger::find(
            platform,
            tx.as_mut(),
            &batch.header.source_node_id,
            &batch.header.channel_id,
            batch.header.batch_id,
        )
        .await?
        .unwrap_or_else(|| {
            IncomingBatch::new(
                &batch.header.source_node_id,
                &batch.header.channel_id,
                batch.header.batch_id,
                BatchStatus::Error,
            )
        });
        row.status = BatchStatus::Error;
        row.failure = Some(failure.message.clone());
        ledger::record(platform, tx.as_mut(), &row).await?;
        tx.commit().await?;

        tracing::error!(
            "Batch {} failed at event {}: {}",
            batch.header.node_batch_id(),
            batch.event_index,
            error
        );
        Ok(failure)
    }

    /// Diagnostic for `error`, pointing at the event being written
    pub fn failure(&self, error: &Error) -> BatchFailure {
        let mut failure = BatchFailure::from_error(error);
        if let Some(batch) = &self.batch {
            if let Some(event) = &batch.current {
                if failure.table.is_none() {
                    failure.table = Some(event.table.qualified_name());
                }
                if failure.source_data_id.is_none() && event.source_data_id > 0 {
                    failure.source_data_id = Some(event.source_data_id);
                }
            }
            if batch.event_index > 0 {
                failure = failure.at_event(batch.event_index);
            }
        }
        failure
    }

    /// Counters of the current or last started batch
    pub fn statistics(&self) -> WriterStatistics {
        self.stats
    }

    /// Release the writer; an unfinished batch is rolled back
    pub async fn close(&mut self) {
        if let Some(mut batch) = self.batch.take() {
            if let Some(tx) = batch.tx.take() {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!("Rollback on close failed: {}", e);
                }
            }
        }
        self.metadata.clear();
        self.opened = false;
    }

    /// Load every batch a reader produces, one transaction each
    pub async fn load<R: DataReader + ?Sized>(
        &mut self,
        reader: &mut R,
        context: &DataContext,
    ) -> Result<Vec<(BatchHeader, LoadResult)>> {
        let mut results = Vec::new();
        let mut scope = ReaderScope::open(reader, context).await?;
        while let Some(header) = scope.next_batch().await? {
            let result = self.load_batch(&mut *scope, &header).await?;
            results.push((header, result));
        }
        Ok(results)
    }

    /// Load the current batch of `reader`; data failures are reported, not raised
    pub async fn load_batch<R: DataReader + ?Sized>(
        &mut self,
        reader: &mut R,
        header: &BatchHeader,
    ) -> Result<LoadResult> {
        match self.start_batch(header).await? {
            BatchStart::Duplicate => return Ok(LoadResult::Duplicate),
            BatchStart::Ignored => return Ok(LoadResult::Ignored),
            BatchStart::Apply => {}
        }

        let applied: Result<()> = async {
            while reader.next_table().await?.is_some() {
                while let Some(event) = reader.next_event().await? {
                    self.write(event).await?;
                }
            }
            Ok(())
        }
        .await;

        match applied {
            Ok(()) => Ok(LoadResult::Loaded(self.finish_batch().await?)),
            Err(e) => {
                let failure = self.abort_batch(&e).await?;
                Ok(LoadResult::Failed(failure))
            }
        }
    }

    async fn table_metadata(&mut self, table: &TableIdentity) -> Result<Option<TableMeta>> {
        if let Some(meta) = self.metadata.get(table) {
            return Ok(Some(meta.clone()));
        }
        let platform = Arc::clone(&self.platform);
        let tx = self.transaction()?;
        let (sql, params) = platform.metadata_query(table);
        let rows = tx.query(&sql, &params).await?;
        let meta = platform.parse_metadata(table, rows);
        if let Some(meta) = &meta {
            self.metadata.insert(table.clone(), meta.clone());
        }
        Ok(meta)
    }

    fn transaction(&mut self) -> Result<&mut Box<dyn PlatformTransaction>> {
        self.batch
            .as_mut()
            .and_then(|b| b.tx.as_mut())
            .ok_or_else(|| Error::Internal("no open batch transaction".into()))
    }

    /// Find the target table, consulting the table-missing handlers
    async fn resolve_table(&mut self, event: &mut RowEvent) -> Result<Option<TableMeta>> {
        if let Some(meta) = self.table_metadata(&event.table).await? {
            return Ok(Some(meta));
        }

        let platform = Arc::clone(&self.platform);
        let extensions = Arc::clone(&self.extensions);
        for handler in extensions.table_missing_handlers() {
            let tx = self.transaction()?;
            let action = match handler.handle(platform.as_ref(), tx.as_mut(), event).await {
                Ok(action) => action,
                Err(e) if e.is_fatal_extension() => return Err(e),
                Err(e) => {
                    tracing::warn!("Table-missing handler {} failed: {}", handler.name(), e);
                    continue;
                }
            };
            match action {
                TableMissingAction::Unhandled => continue,
                TableMissingAction::Skip => {
                    tracing::debug!("Handler {} skipped {}", handler.name(), event.describe());
                    return Ok(None);
                }
                TableMissingAction::Created => {
                    self.metadata.remove(&event.table);
                    if let Some(meta) = self.table_metadata(&event.table).await? {
                        tracing::info!("Handler {} created table {}", handler.name(), event.table);
                        return Ok(Some(meta));
                    }
                }
                TableMissingAction::Remap(table) => {
                    tracing::debug!("Handler {} remapped {} to {}", handler.name(), event.table, table);
                    event.table = table;
                    if let Some(meta) = self.table_metadata(&event.table).await? {
                        return Ok(Some(meta));
                    }
                }
            }
        }

        Err(Error::TableMissing {
            table: event.table.qualified_name(),
            event: Some(Box::new(event.clone())),
        })
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let tx = self.transaction()?;
        let count = tx.execute(&statement.sql, &statement.params).await?;
        self.stats.statements += 1;
        Ok(count)
    }

    fn log_conflict(&self, kind: ConflictKind, resolution: Resolution, event: &RowEvent) {
        if self.settings.log_conflicts {
            tracing::info!("Conflict ({}) on {}: {:?}", kind, event.describe(), resolution);
        } else {
            tracing::debug!("Conflict ({}) on {}: {:?}", kind, event.describe(), resolution);
        }
    }

    fn unresolved(kind: ConflictKind, event: &RowEvent, detail: &str) -> Error {
        Error::Conflict {
            reason: format!("{}: {}", kind, detail),
            event: Box::new(event.clone()),
        }
    }

    async fn apply(&mut self, event: &mut RowEvent) -> Result<WriteOutcome> {
        if event.event_type.is_script() {
            let script = event.script().unwrap_or_default().to_string();
            self.transaction()?.execute_script(&script).await?;
            if event.event_type == EventType::Create {
                self.metadata.remove(&event.table);
            }
            self.stats.scripts += 1;
            self.stats.statements += 1;
            return Ok(WriteOutcome::Applied);
        }

        let Some(meta) = self.resolve_table(event).await? else {
            self.stats.skipped += 1;
            return Ok(WriteOutcome::Skipped);
        };
        let platform = Arc::clone(&self.platform);
        let detection = self.settings.conflict_detection;
        let resolver = self.extensions.conflict_resolver();

        match event.event_type {
            EventType::Insert | EventType::Reload => {
                let insert = dml::insert(platform.as_ref(), &meta, event)?;
                match self.execute(&insert).await {
                    Ok(_) => self.stats.inserts += 1,
                    Err(e) if e.is_unique_violation() => {
                        let kind = ConflictKind::InsertCollision;
                        let resolution = resolver.resolve(kind, event);
                        self.log_conflict(kind, resolution, event);
                        match resolution {
                            Resolution::Fallback => {
                                let update = dml::update(
                                    platform.as_ref(),
                                    &meta,
                                    event,
                                    ConflictDetection::PrimaryKey,
                                )?;
                                if self.execute(&update).await? == 0 {
                                    return Err(Self::unresolved(kind, event, "fallback update matched no row"));
                                }
                                self.stats.fallback_updates += 1;
                            }
                            Resolution::Ignore => self.stats.ignored_conflicts += 1,
                            Resolution::Fail => return Err(Self::unresolved(kind, event, &e.to_string())),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            EventType::Update => {
                let update = dml::update(platform.as_ref(), &meta, event, detection)?;
                if self.execute(&update).await? > 0 {
                    self.stats.updates += 1;
                } else {
                    let kind = ConflictKind::UpdateMissing;
                    let resolution = resolver.resolve(kind, event);
                    self.log_conflict(kind, resolution, event);
                    match resolution {
                        Resolution::Fallback => {
                            let insert = dml::insert(platform.as_ref(), &meta, event)?;
                            match self.execute(&insert).await {
                                Ok(_) => self.stats.fallback_inserts += 1,
                                Err(e) if e.is_unique_violation() => {
                                    return Err(Self::unresolved(
                                        kind,
                                        event,
                                        "fallback insert collided with an existing row",
                                    ))
                                }
                                Err(e) => return Err(e),
                            }
                        }
                        Resolution::Ignore => self.stats.ignored_conflicts += 1,
                        Resolution::Fail => {
                            return Err(Self::unresolved(kind, event, "no row matched"))
                        }
                    }
                }
            }
            EventType::Delete => {
                let delete = dml::delete(platform.as_ref(), &meta, event, detection)?;
                if self.execute(&delete).await? > 0 {
                    self.stats.deletes += 1;
                } else {
                    let kind = ConflictKind::DeleteMissing;
                    let resolution = resolver.resolve(kind, event);
                    self.log_conflict(kind, resolution, event);
                    match resolution {
                        // nothing left to delete
                        Resolution::Fallback | Resolution::Ignore => {
                            self.stats.missing_deletes += 1
                        }
                        Resolution::Fail => {
                            return Err(Self::unresolved(kind, event, "no row matched"))
                        }
                    }
                }
            }
            EventType::Sql | EventType::Create => {}
        }
        Ok(WriteOutcome::Applied)
    }
}

/// Outcome of loading one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
    Loaded(WriterStatistics),
    Duplicate,
    Ignored,
    Failed(BatchFailure),
}
