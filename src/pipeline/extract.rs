//! Extraction and routing
//!
//! One routing pass per channel: read capture records after the channel
//! cursor, route each event, pack routed events into per-target batches,
//! persist the outcome in one store transaction and stage the payloads.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::RoutingReport;
use crate::capture::CaptureLog;
use crate::config::WolfSyncConfig;
use crate::error::{Error, Result};
use crate::model::{
    Batch, BatchHeader, BatchId, BatchKey, BatchStatus, BinaryEncoding, RowEvent,
};
use crate::platform::Platform;
use crate::protocol::PayloadWriter;
use crate::reader::{
    CancelFlag, CaptureLogReader, CaptureSelection, DataContext, DataReader, ReaderScope,
    SnapshotReader, SnapshotTable,
};
use crate::route::{OutgoingBatcher, RouterService};
use crate::stage::{StageKey, StagedResource, StagingManager};
use crate::state::{BatchStore, OutgoingBatch};

/// Batching limits for extraction
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub max_batch_events: usize,
    /// Per-channel overrides of `max_batch_events`
    pub channel_max_events: HashMap<String, usize>,
    pub max_batch_bytes: u64,
    /// Capture records read per pass and channel
    pub read_batch_size: usize,
    pub binary_encoding: BinaryEncoding,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            max_batch_events: 1000,
            channel_max_events: HashMap::new(),
            max_batch_bytes: 4 * 1024 * 1024,
            read_batch_size: 10_000,
            binary_encoding: BinaryEncoding::Base64,
        }
    }
}

impl From<&WolfSyncConfig> for ExtractSettings {
    fn from(config: &WolfSyncConfig) -> Self {
        Self {
            max_batch_events: config.routing.max_batch_events,
            channel_max_events: config
                .channels()
                .into_iter()
                .filter_map(|c| c.max_batch_events.map(|max| (c.id, max)))
                .collect(),
            max_batch_bytes: config.routing.max_batch_bytes,
            read_batch_size: config.routing.read_batch_size.max(1),
            binary_encoding: config.capture.binary_encoding,
        }
    }
}

impl ExtractSettings {
    fn max_events(&self, channel_id: &str) -> usize {
        self.channel_max_events
            .get(channel_id)
            .copied()
            .unwrap_or(self.max_batch_events)
    }
}

/// Builds and stages the outgoing batches of this node
pub struct Extractor {
    capture: Arc<RwLock<CaptureLog>>,
    router: Arc<RouterService>,
    store: Arc<BatchStore>,
    staging: StagingManager,
    platform: Option<Arc<dyn Platform>>,
    settings: ExtractSettings,
    cancel: CancelFlag,
    /// Serializes id allocation between routing passes and reloads
    allocation: Mutex<()>,
}

impl Extractor {
    pub fn new(
        capture: Arc<RwLock<CaptureLog>>,
        router: Arc<RouterService>,
        store: Arc<BatchStore>,
        staging: StagingManager,
        settings: ExtractSettings,
    ) -> Self {
        Self {
            capture,
            router,
            store,
            staging,
            platform: None,
            settings,
            cancel: CancelFlag::default(),
            allocation: Mutex::new(()),
        }
    }

    /// Source database for reload extraction
    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    fn source_node_id(&self) -> &str {
        &self.router.source_node().id
    }

    /// Route everything captured on `channel_id` since the last pass
    pub async fn route_channel(&self, channel_id: &str) -> Result<RoutingReport> {
        let _allocation = self.allocation.lock().await;
        let after = self.store.cursor(channel_id).await?;
        self.capture.write().await.refresh_index()?;

        let read_limit = self.settings.read_batch_size;
        let mut events = {
            let log = self.capture.read().await;
            let mut reader = CaptureLogReader::new(
                &log,
                CaptureSelection::Channel {
                    channel_id: channel_id.to_string(),
                    after,
                    max: read_limit,
                },
            );
            let context = DataContext::new(self.cancel.clone()).for_channel(channel_id);
            let mut scope = ReaderScope::open(&mut reader, &context).await?;
            match scope.next_batch().await? {
                Some(_) => scope.read_batch_events().await?,
                None => Vec::new(),
            }
        };

        let mut report = RoutingReport {
            channel_id: channel_id.to_string(),
            events_read: events.len(),
            cursor: after,
            ..Default::default()
        };

        // A full read may have cut the last transaction short
        if events.len() >= read_limit {
            let trailing = trailing_transaction_len(&events);
            if trailing < events.len() {
                events.truncate(events.len() - trailing);
                report.events_held_back = trailing;
            }
        }
        let Some(cursor) = events.last().map(|e| e.source_data_id) else {
            return Ok(report);
        };

        let source = self.source_node_id().to_string();
        let mut batcher = OutgoingBatcher::new(
            source,
            channel_id,
            self.settings.max_events(channel_id),
            self.settings.max_batch_bytes,
        )
        .with_encoding(self.settings.binary_encoding);
        for node in self.router.nodes().await.iter() {
            let next = self.store.next_batch_id(&node.id, channel_id).await?;
            batcher = batcher.with_next_id(node.id.clone(), next);
        }

        let mut open_transaction: Option<Option<String>> = None;
        for event in events {
            self.cancel.check()?;
            // Commit boundary: an untagged event is a transaction of its own
            if let Some(previous) = &open_transaction {
                if event.transaction_id.is_none() || *previous != event.transaction_id {
                    batcher.seal_all()?;
                }
            }
            open_transaction = Some(event.transaction_id.clone());

            let targets = self.router.route(channel_id, &event).await?;
            if targets.is_empty() {
                tracing::trace!("No target for {}", event.describe());
                continue;
            }
            report.events_routed += 1;
            for target in &targets {
                batcher.append(target, event.clone())?;
            }
        }

        let batches = batcher.finish()?;
        self.store
            .record_routing(channel_id, &batches, Some(cursor))
            .await?;
        report.cursor = cursor;

        for batch in &batches {
            if let Some(key) = self.stage_routed(batch).await? {
                report.batches.push((key, batch.batch_id));
            }
        }

        if !batches.is_empty() {
            tracing::info!(
                "Routed {} of {} events on channel {} into {} batches",
                report.events_routed,
                report.events_read,
                channel_id,
                batches.len()
            );
        }
        Ok(report)
    }

    /// Build an initial-load batch of `tables` for exactly `target_node_id`
    ///
    /// Returns the batch id, or `None` when the tables are empty.
    pub async fn reload(
        &self,
        target_node_id: &str,
        channel_id: &str,
        tables: Vec<SnapshotTable>,
    ) -> Result<Option<BatchId>> {
        let platform = self
            .platform
            .clone()
            .ok_or_else(|| Error::Config("reload needs a source database".into()))?;
        if !self
            .router
            .nodes()
            .await
            .iter()
            .any(|n| n.id == target_node_id)
        {
            return Err(Error::Routing(format!("unknown node '{}'", target_node_id)));
        }

        let _allocation = self.allocation.lock().await;
        let batch_id = self.store.next_batch_id(target_node_id, channel_id).await?;
        let header = BatchHeader {
            batch_id,
            source_node_id: self.source_node_id().to_string(),
            target_node_id: Some(target_node_id.to_string()),
            channel_id: channel_id.to_string(),
            binary_encoding: self.settings.binary_encoding,
            initial_load: true,
            ignored: false,
        };

        let mut reader = SnapshotReader::new(platform, tables)
            .reloading()
            .with_header(header);
        let context = DataContext::new(self.cancel.clone())
            .for_channel(channel_id)
            .for_target(target_node_id);
        let events = {
            let mut scope = ReaderScope::open(&mut reader, &context).await?;
            match scope.next_batch().await? {
                Some(_) => scope.read_batch_events().await?,
                None => Vec::new(),
            }
        };
        if events.is_empty() {
            tracing::info!("Nothing to reload for {} on {}", target_node_id, channel_id);
            return Ok(None);
        }

        let mut batcher = OutgoingBatcher::new(
            self.source_node_id(),
            channel_id,
            usize::MAX,
            u64::MAX,
        )
        .with_encoding(self.settings.binary_encoding)
        .initial_load()
        .with_next_id(target_node_id, batch_id);
        let targets = self.router.route_initial_load(target_node_id);
        for event in events {
            for target in &targets {
                batcher.append(target, event.clone())?;
            }
        }

        let batches = batcher.finish()?;
        self.store.record_routing(channel_id, &batches, None).await?;
        for batch in &batches {
            self.stage_routed(batch).await?;
        }

        tracing::info!(
            "Reload batch {} queued for {} on {}",
            batch_id,
            target_node_id,
            channel_id
        );
        Ok(Some(batch_id))
    }

    /// Stage a freshly routed batch and mark it ready to send
    ///
    /// A staging failure leaves the batch ROUTED; the push pass stages it
    /// again from its data ids.
    async fn stage_routed(&self, batch: &Batch) -> Result<Option<BatchKey>> {
        let Some(key) = batch.key() else {
            return Ok(None);
        };
        match stage_batch(&self.staging, &batch.header(), &key, &batch.events).await {
            Ok(resource) => {
                tracing::debug!(
                    "Staged batch {} ({} bytes{})",
                    batch.node_batch_id(),
                    resource.size_bytes,
                    if resource.in_memory() { ", in memory" } else { "" }
                );
                self.store
                    .transition(&key, batch.batch_id, BatchStatus::ReadyToSend)
                    .await?;
            }
            Err(e) => {
                tracing::warn!("Staging batch {} failed: {}", batch.node_batch_id(), e);
            }
        }
        Ok(Some(key))
    }

    /// Stage a routed batch again from the capture log
    pub async fn restage(&self, batch: &OutgoingBatch) -> Result<StagedResource> {
        if batch.initial_load {
            return Err(Error::Staging(format!(
                "payload of reload batch {} is gone; request the reload again",
                batch.node_batch_id()
            )));
        }

        let ids = self.store.data_ids(&batch.key, batch.batch_id).await?;
        let header = BatchHeader {
            batch_id: batch.batch_id,
            source_node_id: batch.key.source_node_id.clone(),
            target_node_id: Some(batch.key.target_node_id.clone()),
            channel_id: batch.key.channel_id.clone(),
            binary_encoding: self.settings.binary_encoding,
            initial_load: false,
            ignored: false,
        };

        let events = {
            let log = self.capture.read().await;
            let mut reader = CaptureLogReader::new(&log, CaptureSelection::DataIds(ids.clone()))
                .with_header(header.clone());
            let context = DataContext::new(self.cancel.clone()).for_channel(&batch.key.channel_id);
            let mut scope = ReaderScope::open(&mut reader, &context).await?;
            match scope.next_batch().await? {
                Some(_) => scope.read_batch_events().await?,
                None => Vec::new(),
            }
        };
        if events.len() != ids.len() || ids.is_empty() {
            return Err(Error::CaptureLog(format!(
                "capture records of batch {} are no longer available",
                batch.node_batch_id()
            )));
        }

        tracing::info!("Restaging batch {} from the capture log", batch.node_batch_id());
        stage_batch(&self.staging, &header, &batch.key, &events).await
    }
}

/// Number of trailing events sharing the last event's transaction
fn trailing_transaction_len(events: &[RowEvent]) -> usize {
    let Some(last) = events.last().and_then(|e| e.transaction_id.as_deref()) else {
        return 0;
    };
    events
        .iter()
        .rev()
        .take_while(|e| e.transaction_id.as_deref() == Some(last))
        .count()
}

/// Write a batch payload into the staging area
pub(crate) async fn stage_batch(
    staging: &StagingManager,
    header: &BatchHeader,
    key: &BatchKey,
    events: &[RowEvent],
) -> Result<StagedResource> {
    let writer = staging
        .start_writing(StageKey::outgoing(key, header.batch_id))
        .await?;
    let mut payload = PayloadWriter::new(writer);
    let written = encode_into(&mut payload, header, events);
    let writer = payload.into_inner();
    match written {
        Ok(()) => staging.finish_writing(writer).await,
        Err(e) => {
            staging.abandon(writer).await?;
            Err(e)
        }
    }
}

fn encode_into<W: std::io::Write>(
    payload: &mut PayloadWriter<W>,
    header: &BatchHeader,
    events: &[RowEvent],
) -> Result<()> {
    payload.start_batch(header)?;
    if header.ignored {
        payload.ignore()?;
    } else {
        for event in events {
            payload.write_event(event)?;
        }
    }
    payload.commit()?;
    payload.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureLogWriter;
    use crate::config::CaptureConfig;
    use crate::extension::ExtensionRegistry;
    use crate::model::TableIdentity;
    use crate::route::{Node, Subscription};
    use crate::stage::StagingSettings;
    use tempfile::tempdir;

    fn event(id: u64, tx: &str) -> RowEvent {
        RowEvent::insert(
            TableIdentity::new("item"),
            vec!["id".into(), "name".into()],
            vec!["id".into()],
            vec![Some(id.to_string()), Some(format!("item {}", id))],
        )
        .with_transaction(tx)
    }

    fn capture_config() -> CaptureConfig {
        CaptureConfig {
            flush_interval_ms: 1,
            fsync: false,
            ..Default::default()
        }
    }

    async fn extractor(dir: &std::path::Path, settings: ExtractSettings) -> (Extractor, Arc<BatchStore>) {
        let router = Arc::new(RouterService::new(
            Node::new("corp", "corp"),
            vec![Node::new("corp", "corp"), Node::new("s1", "store")],
            vec![Subscription::new("corp-store", "corp", "store", "default")],
            ExtensionRegistry::builder().build(),
        ));
        let capture = CaptureLog::open(dir.join("capture"), capture_config().compression).unwrap();
        let store = Arc::new(BatchStore::open_in_memory("corp").unwrap());
        let staging = StagingManager::open(dir.join("staging"), StagingSettings::default()).unwrap();
        let extractor = Extractor::new(
            Arc::new(RwLock::new(capture)),
            router,
            Arc::clone(&store),
            staging,
            settings,
        );
        (extractor, store)
    }

    #[test]
    fn test_trailing_transaction() {
        let events = vec![event(1, "a"), event(2, "b"), event(3, "b")];
        assert_eq!(trailing_transaction_len(&events), 2);
        let untagged = vec![RowEvent::sql(TableIdentity::new("t"), "select 1")];
        assert_eq!(trailing_transaction_len(&untagged), 0);
    }

    #[tokio::test]
    async fn test_route_stage_and_resume() {
        let dir = tempdir().unwrap();
        let writer = CaptureLogWriter::open(dir.path().join("capture"), capture_config())
            .await
            .unwrap();
        writer
            .append_transaction("default", vec![event(1, "t1"), event(2, "t1")])
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let (extractor, store) = extractor(dir.path(), ExtractSettings::default()).await;
        let report = extractor.route_channel("default").await.unwrap();
        assert_eq!(report.events_read, 2);
        assert_eq!(report.events_routed, 2);
        assert_eq!(report.batches.len(), 1);

        let (key, id) = &report.batches[0];
        assert_eq!(key.target_node_id, "s1");
        let batch = store.get(key, *id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::ReadyToSend);
        assert_eq!(batch.event_count, 2);
        assert!(extractor.staging.exists(&StageKey::outgoing(key, *id)).await);

        // Nothing new: the cursor holds
        let again = extractor.route_channel("default").await.unwrap();
        assert_eq!(again.events_read, 0);
        assert_eq!(again.cursor, report.cursor);
    }

    #[tokio::test]
    async fn test_commit_boundary_seals_batch() {
        let dir = tempdir().unwrap();
        let writer = CaptureLogWriter::open(dir.path().join("capture"), capture_config())
            .await
            .unwrap();
        writer
            .append_transaction("default", vec![event(1, "t1"), event(2, "t1")])
            .await
            .unwrap();
        writer.append("default", event(3, "t2")).await.unwrap();
        writer
            .append_transaction("default", vec![RowEvent::sql(TableIdentity::new("t"), "select 1")])
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let (extractor, store) = extractor(dir.path(), ExtractSettings::default()).await;
        let report = extractor.route_channel("default").await.unwrap();
        let ids: Vec<_> = report.batches.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let key = &report.batches[0].0;
        assert_eq!(store.data_ids(key, 1).await.unwrap(), vec![1, 2]);
        assert_eq!(store.data_ids(key, 2).await.unwrap(), vec![3]);
        assert_eq!(store.data_ids(key, 3).await.unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn test_full_read_holds_back_open_transaction() {
        let dir = tempdir().unwrap();
        let writer = CaptureLogWriter::open(dir.path().join("capture"), capture_config())
            .await
            .unwrap();
        writer.append("default", event(1, "t1")).await.unwrap();
        writer
            .append_transaction("default", vec![event(2, "t2"), event(3, "t2")])
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let settings = ExtractSettings {
            read_batch_size: 2,
            ..Default::default()
        };
        let (extractor, store) = extractor(dir.path(), settings).await;
        let report = extractor.route_channel("default").await.unwrap();
        assert_eq!(report.events_held_back, 1);
        assert_eq!(report.cursor, 1);
        assert_eq!(store.cursor("default").await.unwrap(), 1);

        let next = extractor.route_channel("default").await.unwrap();
        assert_eq!(next.events_routed, 2);
        assert_eq!(next.batches[0].1, 2);
    }

    #[tokio::test]
    async fn test_restage_from_capture_log() {
        let dir = tempdir().unwrap();
        let writer = CaptureLogWriter::open(dir.path().join("capture"), capture_config())
            .await
            .unwrap();
        writer.append("default", event(1, "t1")).await.unwrap();
        writer.flush().await.unwrap();

        let (extractor, store) = extractor(dir.path(), ExtractSettings::default()).await;
        let report = extractor.route_channel("default").await.unwrap();
        let (key, id) = report.batches[0].clone();
        let stage_key = StageKey::outgoing(&key, id);
        let original = extractor.staging.read_all(&stage_key).await.unwrap();

        extractor.staging.delete(&stage_key).await.unwrap();
        let batch = store.get(&key, id).await.unwrap().unwrap();
        extractor.restage(&batch).await.unwrap();
        assert_eq!(extractor.staging.read_all(&stage_key).await.unwrap(), original);
    }
}
