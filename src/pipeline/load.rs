//! Incoming load
//!
//! Stages each delivered payload, then replays it into the local database.
//! At most one batch per (source node, channel) is written at a time; other
//! sources and channels load in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::extension::ExtensionRegistry;
use crate::model::BatchFailure;
use crate::platform::Platform;
use crate::protocol::ProtocolDataReader;
use crate::reader::{CancelFlag, DataContext};
use crate::stage::{StageKey, StagingManager};
use crate::transport::{Acknowledgement, Delivery, Transport};
use crate::writer::{DatabaseWriter, LoadResult, WriterSettings};

type PairLocks = HashMap<(String, String), Arc<Mutex<()>>>;

/// Applies incoming batches to the local database
pub struct Loader {
    node_id: String,
    platform: Arc<dyn Platform>,
    extensions: Arc<ExtensionRegistry>,
    settings: WriterSettings,
    staging: StagingManager,
    cancel: CancelFlag,
    locks: Mutex<PairLocks>,
}

impl Loader {
    pub fn new(
        node_id: impl Into<String>,
        platform: Arc<dyn Platform>,
        extensions: Arc<ExtensionRegistry>,
        settings: WriterSettings,
        staging: StagingManager,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            platform,
            extensions,
            settings,
            staging,
            cancel: CancelFlag::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    async fn pair_lock(&self, source_node_id: &str, channel_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry((source_node_id.to_string(), channel_id.to_string()))
                .or_default(),
        )
    }

    /// Load one delivery and acknowledge it to the sender
    pub async fn handle(&self, mut delivery: Delivery) -> Acknowledgement {
        let ack = match self.load_delivery(&mut delivery).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(
                    "Loading {} from {} failed: {}",
                    delivery.resource.key,
                    delivery.source_node_id,
                    e
                );
                Acknowledgement::Failed(BatchFailure::from_error(&e))
            }
        };
        delivery.acknowledge(ack.clone());
        ack
    }

    async fn load_delivery(&self, delivery: &mut Delivery) -> Result<Acknowledgement> {
        let sent = &delivery.resource.key;
        let key = StageKey::incoming(&delivery.source_node_id, &sent.channel_id, sent.batch_id);
        let payload = delivery.take_payload();
        self.staging.store(key.clone(), &payload).await?;
        drop(payload);

        let lock = self.pair_lock(&delivery.source_node_id, &key.channel_id).await;
        let _guard = lock.lock().await;

        let input = self.staging.open_for_read(&key).await?;
        let mut reader = ProtocolDataReader::new(input);
        let mut context = DataContext::new(self.cancel.clone()).for_channel(&key.channel_id);
        context.source_node_id = Some(delivery.source_node_id.clone());

        let mut writer = DatabaseWriter::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.extensions),
            self.settings.clone(),
        );
        writer.open(&self.node_id, &context).await?;
        let loaded = writer.load(&mut reader, &context).await;
        writer.close().await;
        let results = loaded?;

        if results.is_empty() {
            return Err(Error::Malformed {
                reason: format!("payload {} holds no batch", key),
                event: None,
            });
        }

        for (header, result) in &results {
            if header.source_node_id != delivery.source_node_id {
                tracing::warn!(
                    "Batch {} arrived from {} but names {} as its source",
                    header.batch_id,
                    delivery.source_node_id,
                    header.source_node_id
                );
            }
            match result {
                LoadResult::Loaded(stats) => tracing::info!(
                    "Loaded batch {} on {}: {} events, {} statements",
                    header.node_batch_id(),
                    header.channel_id,
                    stats.events,
                    stats.statements
                ),
                LoadResult::Duplicate => tracing::debug!(
                    "Batch {} was already loaded",
                    header.node_batch_id()
                ),
                LoadResult::Ignored => {}
                LoadResult::Failed(failure) => {
                    tracing::error!(
                        "Batch {} failed to load: {}",
                        header.node_batch_id(),
                        failure.message
                    );
                    return Ok(Acknowledgement::Failed(failure.clone()));
                }
            }
        }

        if let Err(e) = self.staging.mark_done(&key).await {
            tracing::warn!("Cannot mark {} done: {}", key, e);
        }
        Ok(Acknowledgement::Ok)
    }

    /// Serve deliveries until the transport closes or the loader is cancelled
    pub async fn run(self: Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        tracing::info!("Loader for {} started", self.node_id);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(delivery) = transport.receive().await? else {
                break;
            };
            let loader = Arc::clone(&self);
            tokio::spawn(async move {
                loader.handle(delivery).await;
            });
        }
        tracing::info!("Loader for {} stopped", self.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchHeader, BatchKey, BinaryEncoding, RowEvent, TableIdentity};
    use crate::platform::SqlitePlatform;
    use crate::protocol::encode_batch;
    use crate::stage::{StageState, StagedResource, StagingSettings};
    use crate::writer::ledger;
    use chrono::Utc;
    use tempfile::tempdir;

    fn header(batch_id: u64) -> BatchHeader {
        BatchHeader {
            batch_id,
            source_node_id: "corp".into(),
            target_node_id: Some("s1".into()),
            channel_id: "default".into(),
            binary_encoding: BinaryEncoding::Base64,
            initial_load: false,
            ignored: false,
        }
    }

    fn delivery(batch_id: u64, payload: Vec<u8>) -> Delivery {
        let resource = StagedResource {
            key: StageKey::outgoing(&BatchKey::new("corp", "s1", "default"), batch_id),
            state: StageState::Ready,
            size_bytes: payload.len() as u64,
            create_time: Utc::now(),
            path: None,
        };
        Delivery::new("corp", resource, payload).0
    }

    fn insert(id: u64) -> RowEvent {
        RowEvent::insert(
            TableIdentity::new("item"),
            vec!["id".into(), "name".into()],
            vec!["id".into()],
            vec![Some(id.to_string()), Some("x".into())],
        )
        .with_source_data_id(id)
    }

    async fn loader(dir: &std::path::Path) -> (Loader, SqlitePlatform) {
        let platform = SqlitePlatform::open_in_memory().unwrap();
        platform
            .execute_batch("CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT);")
            .await
            .unwrap();
        let staging = StagingManager::open(dir.to_path_buf(), StagingSettings::default()).unwrap();
        let loader = Loader::new(
            "s1",
            Arc::new(platform.clone()),
            ExtensionRegistry::builder().build(),
            WriterSettings::default(),
            staging,
        );
        (loader, platform)
    }

    #[tokio::test]
    async fn test_load_in_order_and_reject_gaps() {
        let dir = tempdir().unwrap();
        let (loader, platform) = loader(dir.path()).await;

        let payload = encode_batch(&header(2), &[insert(2)]).unwrap();
        match loader.handle(delivery(2, payload)).await {
            Acknowledgement::Failed(failure) => assert!(failure.is_retryable()),
            other => panic!("expected out-of-order failure, got {:?}", other),
        }

        let payload = encode_batch(&header(1), &[insert(1)]).unwrap();
        assert_eq!(loader.handle(delivery(1, payload.clone())).await, Acknowledgement::Ok);
        // Duplicate delivery is acknowledged without reapplying
        assert_eq!(loader.handle(delivery(1, payload)).await, Acknowledgement::Ok);

        let rows = ledger::list(&platform, "corp").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(loader
            .staging
            .get(&StageKey::incoming("corp", "default", 1))
            .await
            .map_or(false, |r| r.state == StageState::Done));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_refused() {
        let dir = tempdir().unwrap();
        let (loader, _platform) = loader(dir.path()).await;
        match loader.handle(delivery(1, b"nonsense,\"x\"\n".to_vec())).await {
            Acknowledgement::Failed(failure) => assert!(!failure.is_retryable()),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
