//! End-to-end pipeline tests
//!
//! A source node captures, routes, stages and pushes batches over the
//! in-process transport to a target node loading into SQLite.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::sync::RwLock;

use wolfsync::capture::{CaptureLog, CaptureLogWriter};
use wolfsync::config::{CaptureConfig, WolfSyncConfig};
use wolfsync::error::{Error, ErrorClass, Result};
use wolfsync::extension::{ExtensionRegistry, WriteContext, WriteFilter};
use wolfsync::model::{BatchHeader, BatchKey, BatchStatus, BinaryEncoding, RowEvent, TableIdentity};
use wolfsync::pipeline::{ExtractSettings, Extractor, Loader, SyncEngine};
use wolfsync::platform::{Platform, SqlitePlatform};
use wolfsync::protocol::encode_batch;
use wolfsync::reader::SnapshotTable;
use wolfsync::route::{Node, RouterService, RouterType, Subscription};
use wolfsync::stage::{StageKey, StageState, StagedResource, StagingManager, StagingSettings};
use wolfsync::state::BatchStore;
use wolfsync::transport::{Acknowledgement, ChannelTransport, Delivery, InProcessNetwork, Transport};
use wolfsync::writer::{ledger, WriterSettings};

const TARGET_SCHEMA: &str = "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);";

fn config(dir: &Path, max_batch_events: usize) -> WolfSyncConfig {
    WolfSyncConfig::from_str(&format!(
        r#"
[node]
id = "corp"
group_id = "corp"
data_dir = "{dir}"

[database]
kind = "sqlite"
path = "{dir}/corp.db"

[capture]
flush_interval_ms = 1
fsync = false

[routing]
max_batch_events = {max_batch_events}

[push]
max_retries = 3
initial_backoff_ms = 0
max_backoff_ms = 0

[[nodes]]
id = "s1"
group_id = "store"

[[subscriptions]]
id = "corp_to_store"
source_group = "corp"
target_group = "store"
"#,
        dir = dir.display(),
        max_batch_events = max_batch_events
    ))
    .unwrap()
}

fn columns() -> Vec<String> {
    vec!["id".into(), "name".into()]
}

fn insert(id: u64, name: &str) -> RowEvent {
    RowEvent::insert(
        TableIdentity::new("t"),
        columns(),
        vec!["id".into()],
        vec![Some(id.to_string()), Some(name.to_string())],
    )
}

fn update(id: u64, name: &str) -> RowEvent {
    RowEvent::update(
        TableIdentity::new("t"),
        columns(),
        vec!["id".into()],
        vec![Some(id.to_string()), Some(name.to_string())],
        None,
    )
}

/// Records the source data id of every applied event, in apply order
struct RecordApplied(Arc<Mutex<Vec<u64>>>);

impl WriteFilter for RecordApplied {
    fn name(&self) -> &str {
        "record-applied"
    }

    fn after_write(&self, _context: &WriteContext<'_>, event: &RowEvent) -> Result<()> {
        self.0.lock().unwrap().push(event.source_data_id);
        Ok(())
    }
}

struct Target {
    platform: SqlitePlatform,
    applied: Arc<Mutex<Vec<u64>>>,
    _dir: TempDir,
}

impl Target {
    async fn rows(&self) -> Vec<(String, Option<String>)> {
        self.platform
            .query("SELECT id, name FROM t ORDER BY id", &[])
            .await
            .unwrap()
            .into_iter()
            .map(|row| {
                (
                    row[0].as_text().unwrap_or_default().to_string(),
                    row[1].as_text().map(str::to_string),
                )
            })
            .collect()
    }

    async fn ledger(&self) -> Vec<(u64, BatchStatus)> {
        ledger::list(&self.platform, "corp")
            .await
            .unwrap()
            .into_iter()
            .map(|row| (row.batch_id, row.status))
            .collect()
    }
}

async fn start_target(network: &InProcessNetwork) -> Target {
    let dir = tempdir().unwrap();
    let platform = SqlitePlatform::open_in_memory().unwrap();
    platform.execute_batch(TARGET_SCHEMA).await.unwrap();

    let applied = Arc::new(Mutex::new(Vec::new()));
    let extensions = ExtensionRegistry::builder()
        .filter(RecordApplied(Arc::clone(&applied)))
        .build();
    let staging = StagingManager::open(dir.path().to_path_buf(), StagingSettings::default()).unwrap();
    let loader = Arc::new(Loader::new(
        "s1",
        Arc::new(platform.clone()),
        extensions,
        WriterSettings::default(),
        staging,
    ));
    let transport: Arc<dyn Transport> = Arc::new(network.join("s1").await);
    tokio::spawn(loader.run(transport));

    Target {
        platform,
        applied,
        _dir: dir,
    }
}

async fn start_source(
    dir: &Path,
    max_batch_events: usize,
    platform: SqlitePlatform,
    transport: Arc<dyn Transport>,
) -> SyncEngine {
    SyncEngine::open(
        config(dir, max_batch_events),
        Arc::new(platform),
        ExtensionRegistry::builder().build(),
    )
    .await
    .unwrap()
    .with_transport(transport)
}

async fn capture(engine: &SyncEngine, events: Vec<RowEvent>) -> Vec<u64> {
    let ids = engine
        .capture()
        .append_transaction("default", events)
        .await
        .unwrap();
    engine.capture().flush().await.unwrap();
    ids
}

/// Fails the first send of the listed batch ids
struct FlakyTransport {
    inner: ChannelTransport,
    fail_once: Mutex<HashSet<u64>>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(
        &self,
        target_node_id: &str,
        resource: &StagedResource,
        payload: Vec<u8>,
    ) -> Result<Acknowledgement> {
        let fail = self.fail_once.lock().unwrap().remove(&resource.key.batch_id);
        if fail {
            return Err(Error::Transport("connection reset mid-send".into()));
        }
        self.inner.send(target_node_id, resource, payload).await
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        self.inner.receive().await
    }
}

#[tokio::test]
async fn test_insert_then_update_in_one_transaction() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();
    let source = start_source(
        dir.path(),
        100,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(network.join("corp").await),
    )
    .await;

    capture(
        &source,
        vec![
            insert(1, "a").with_transaction("tx-1"),
            update(1, "b").with_transaction("tx-1"),
        ],
    )
    .await;

    let reports = source.route_once().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].batches.len(), 1);
    let (key, batch_id) = reports[0].batches[0].clone();
    assert_eq!(key.target_node_id, "s1");
    let batch = source.store().get(&key, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.event_count, 2);

    let push = source.push_once().await.unwrap();
    assert_eq!(push.sent, 1);
    assert_eq!(target.rows().await, vec![("1".to_string(), Some("b".to_string()))]);

    let batch = source.store().get(&key, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Ok);
    assert_eq!(target.ledger().await, vec![(batch_id, BatchStatus::Ok)]);
}

#[tokio::test]
async fn test_update_of_missing_row_falls_back_to_insert() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();
    let source = start_source(
        dir.path(),
        100,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(network.join("corp").await),
    )
    .await;

    capture(&source, vec![update(99, "z")]).await;
    source.route_once().await;
    let push = source.push_once().await.unwrap();

    assert_eq!(push.sent, 1);
    assert_eq!(push.failed, 0);
    assert_eq!(target.rows().await, vec![("99".to_string(), Some("z".to_string()))]);
}

#[tokio::test]
async fn test_failed_send_is_retried_and_blocks_later_batches() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();
    let transport = FlakyTransport {
        inner: network.join("corp").await,
        fail_once: Mutex::new(HashSet::from([42])),
    };
    let source = start_source(
        dir.path(),
        1,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(transport),
    )
    .await;

    let mut captured = Vec::new();
    for id in 1..=43u64 {
        captured.extend(capture(&source, vec![insert(id, "row")]).await);
    }

    let reports = source.route_once().await;
    assert_eq!(reports[0].batches.len(), 43);
    let key = BatchKey::new("corp", "s1", "default");

    let first = source.push_once().await.unwrap();
    assert_eq!(first.sent, 41);
    assert_eq!(first.failed, 1);

    let failed = source.store().get(&key, 42).await.unwrap().unwrap();
    assert_eq!(failed.status, BatchStatus::Error);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.failure.as_ref().unwrap().is_retryable());

    let waiting = source.store().get(&key, 43).await.unwrap().unwrap();
    assert_eq!(waiting.status, BatchStatus::ReadyToSend);
    assert_eq!(target.rows().await.len(), 41);
    assert!(target.ledger().await.iter().all(|(id, _)| *id <= 41));

    let second = source.push_once().await.unwrap();
    assert_eq!(second.sent, 2);
    for id in [42, 43] {
        let batch = source.store().get(&key, id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Ok);
    }
    assert_eq!(target.rows().await.len(), 43);

    // Events were applied in capture order
    assert_eq!(*target.applied.lock().unwrap(), captured);
}

#[tokio::test]
async fn test_malformed_event_is_rejected_not_truncated() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();
    let source = start_source(
        dir.path(),
        100,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(network.join("corp-capture").await),
    )
    .await;

    let mut bad = insert(5, "x");
    bad.row_data.pop();

    // Capture refuses it outright
    let err = source
        .capture()
        .append("default", bad.clone())
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::DataIntegrity);

    // A payload carrying it fails to load as a whole
    let header = BatchHeader {
        batch_id: 1,
        source_node_id: "corp".into(),
        target_node_id: Some("s1".into()),
        channel_id: "default".into(),
        binary_encoding: BinaryEncoding::Base64,
        initial_load: false,
        ignored: false,
    };
    let payload = encode_batch(&header, &[insert(4, "ok"), bad]).unwrap();
    let resource = StagedResource {
        key: StageKey::outgoing(&BatchKey::new("corp", "s1", "default"), 1),
        state: StageState::Ready,
        size_bytes: payload.len() as u64,
        create_time: chrono::Utc::now(),
        path: None,
    };
    let sender = network.join("corp").await;
    match sender.send("s1", &resource, payload).await.unwrap() {
        Acknowledgement::Failed(failure) => {
            assert_eq!(failure.class, ErrorClass::DataIntegrity);
            assert!(!failure.is_retryable());
        }
        Acknowledgement::Ok => panic!("malformed batch was acknowledged"),
    }
    assert!(target.rows().await.is_empty());
    assert!(!target
        .ledger()
        .await
        .iter()
        .any(|(_, status)| *status == BatchStatus::Ok));
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();
    let source = start_source(
        dir.path(),
        100,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(network.join("corp").await),
    )
    .await;

    capture(&source, vec![insert(1, "a"), insert(2, "b")]).await;
    let reports = source.route_once().await;
    let (key, batch_id) = reports[0].batches[0].clone();
    source.push_once().await.unwrap();
    let once = target.rows().await;

    // Deliver the same staged payload again
    let stage_key = StageKey::outgoing(&key, batch_id);
    let resource = source.staging().get(&stage_key).await.unwrap();
    let payload = source.staging().read_all(&stage_key).await.unwrap();
    let sender = network.join("corp-replay").await;
    let ack = sender.send("s1", &resource, payload).await.unwrap();
    assert_eq!(ack, Acknowledgement::Ok);
    assert_eq!(target.rows().await, once);
    assert_eq!(target.ledger().await, vec![(batch_id, BatchStatus::Ok)]);

    // The same rows under a new batch id resolve as conflicts, not errors
    let header = BatchHeader {
        batch_id: batch_id + 1,
        source_node_id: "corp".into(),
        target_node_id: Some("s1".into()),
        channel_id: "default".into(),
        binary_encoding: BinaryEncoding::Base64,
        initial_load: false,
        ignored: false,
    };
    let payload = encode_batch(&header, &[insert(1, "a"), insert(2, "b")]).unwrap();
    let resource = StagedResource {
        key: StageKey::outgoing(&key, header.batch_id),
        ..resource
    };
    let ack = sender.send("s1", &resource, payload).await.unwrap();
    assert_eq!(ack, Acknowledgement::Ok);
    assert_eq!(target.rows().await, once);
}

#[tokio::test]
async fn test_batch_seals_exactly_at_event_threshold() {
    let network = InProcessNetwork::new();
    let dir = tempdir().unwrap();
    let source = start_source(
        dir.path(),
        2,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(network.join("corp").await),
    )
    .await;
    let key = BatchKey::new("corp", "s1", "default");

    capture(&source, vec![insert(1, "a"), insert(2, "b")]).await;
    let reports = source.route_once().await;
    assert_eq!(reports[0].batches, vec![(key.clone(), 1)]);
    assert_eq!(source.store().get(&key, 1).await.unwrap().unwrap().event_count, 2);

    capture(&source, vec![insert(3, "c"), insert(4, "d"), insert(5, "e")]).await;
    let reports = source.route_once().await;
    assert_eq!(reports[0].batches, vec![(key.clone(), 2), (key.clone(), 3)]);
    assert_eq!(source.store().get(&key, 2).await.unwrap().unwrap().event_count, 2);
    assert_eq!(source.store().get(&key, 3).await.unwrap().unwrap().event_count, 1);
    assert_eq!(source.store().data_ids(&key, 3).await.unwrap(), vec![5]);
}

#[tokio::test]
async fn test_values_survive_the_pipeline_unchanged() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();
    let source = start_source(
        dir.path(),
        100,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(network.join("corp").await),
    )
    .await;

    let names = [
        Some("comma, separated"),
        Some("line one\nline two\r\n"),
        Some("quote \" and back\\slash"),
        Some(""),
        None,
    ];
    let events = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            RowEvent::insert(
                TableIdentity::new("t"),
                columns(),
                vec!["id".into()],
                vec![Some((i + 1).to_string()), name.map(str::to_string)],
            )
        })
        .collect();
    capture(&source, events).await;
    source.route_once().await;
    source.push_once().await.unwrap();

    let expected: Vec<(String, Option<String>)> = names
        .iter()
        .enumerate()
        .map(|(i, name)| ((i + 1).to_string(), name.map(str::to_string)))
        .collect();
    assert_eq!(target.rows().await, expected);
}

#[tokio::test]
async fn test_poison_batch_is_ignored_and_sequence_moves_on() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();
    let source = start_source(
        dir.path(),
        1,
        SqlitePlatform::open_in_memory().unwrap(),
        Arc::new(network.join("corp").await),
    )
    .await;

    let missing = RowEvent::insert(
        TableIdentity::new("not_on_target"),
        vec!["id".into()],
        vec!["id".into()],
        vec![Some("1".into())],
    );
    capture(&source, vec![missing]).await;
    capture(&source, vec![insert(1, "after")]).await;
    source.route_once().await;
    let key = BatchKey::new("corp", "s1", "default");

    let first = source.push_once().await.unwrap();
    assert_eq!(first.failed, 1);
    let poisoned = source.store().get(&key, 1).await.unwrap().unwrap();
    assert_eq!(poisoned.status, BatchStatus::Error);
    assert!(!poisoned.failure.unwrap().is_retryable());
    assert!(target.rows().await.is_empty());

    let second = source.push_once().await.unwrap();
    assert_eq!(second.ignored, 1);
    assert_eq!(second.sent, 1);
    assert_eq!(
        source.store().get(&key, 1).await.unwrap().unwrap().status,
        BatchStatus::Ignored
    );
    assert_eq!(
        target.ledger().await,
        vec![(1, BatchStatus::Ignored), (2, BatchStatus::Ok)]
    );
    assert_eq!(target.rows().await, vec![("1".to_string(), Some("after".to_string()))]);
}

#[tokio::test]
async fn test_reload_sends_table_contents_to_one_node() {
    let network = InProcessNetwork::new();
    let target = start_target(&network).await;
    let dir = tempdir().unwrap();

    let source_db = SqlitePlatform::open_in_memory().unwrap();
    source_db
        .execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO t VALUES (1, 'one');
             INSERT INTO t VALUES (2, 'two');",
        )
        .await
        .unwrap();
    let source = start_source(
        dir.path(),
        100,
        source_db,
        Arc::new(network.join("corp").await),
    )
    .await;

    let batch_id = source
        .reload("s1", "default", vec![SnapshotTable::new(TableIdentity::new("t"))])
        .await
        .unwrap()
        .unwrap();
    let key = BatchKey::new("corp", "s1", "default");
    let batch = source.store().get(&key, batch_id).await.unwrap().unwrap();
    assert!(batch.initial_load);
    assert_eq!(batch.event_count, 2);

    source.push_once().await.unwrap();
    assert_eq!(
        target.rows().await,
        vec![
            ("1".to_string(), Some("one".to_string())),
            ("2".to_string(), Some("two".to_string())),
        ]
    );

    let err = source
        .reload("nowhere", "default", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Routing(_)));
}

#[tokio::test]
async fn test_routing_is_deterministic() {
    let dir = tempdir().unwrap();
    let capture_config = CaptureConfig {
        flush_interval_ms: 1,
        fsync: false,
        ..CaptureConfig::default()
    };
    let writer = CaptureLogWriter::open(dir.path().join("capture"), capture_config.clone())
        .await
        .unwrap();
    for i in 0..30u64 {
        let store = if i % 3 == 0 { "001" } else { "002" };
        let event = RowEvent::insert(
            TableIdentity::new("sale"),
            vec!["id".into(), "store_id".into()],
            vec!["id".into()],
            vec![Some(i.to_string()), Some(store.to_string())],
        );
        writer.append("default", event).await.unwrap();
    }
    writer.flush().await.unwrap();

    let nodes = vec![
        Node::new("s1", "store").with_external_id("001"),
        Node::new("s2", "store").with_external_id("002"),
    ];
    let subscriptions = vec![
        Subscription::new("by_store", "corp", "store", "default")
            .with_router(RouterType::Column, "STORE_ID=:EXTERNAL_ID"),
        Subscription::new("store_002_copy", "corp", "store", "default")
            .with_router(RouterType::Subset, "nodes:s1")
            .for_table("sale"),
    ];

    let mut outcomes = Vec::new();
    for run in 0..2 {
        let router = Arc::new(RouterService::new(
            Node::new("corp", "corp"),
            nodes.clone(),
            subscriptions.clone(),
            ExtensionRegistry::builder().build(),
        ));
        let log = CaptureLog::open(dir.path().join("capture"), capture_config.compression).unwrap();
        let store = Arc::new(BatchStore::open_in_memory("corp").unwrap());
        let staging = StagingManager::open(
            dir.path().join(format!("staging-{}", run)),
            StagingSettings::default(),
        )
        .unwrap();
        let extractor = Extractor::new(
            Arc::new(RwLock::new(log)),
            router,
            Arc::clone(&store),
            staging,
            ExtractSettings {
                max_batch_events: 4,
                ..ExtractSettings::default()
            },
        );

        let report = extractor.route_channel("default").await.unwrap();
        let mut assignment = BTreeMap::new();
        for (key, batch_id) in &report.batches {
            let ids = store.data_ids(key, *batch_id).await.unwrap();
            assignment.insert((key.target_node_id.clone(), *batch_id), ids);
        }
        outcomes.push(assignment);
    }

    assert!(!outcomes[0].is_empty());
    assert_eq!(outcomes[0], outcomes[1]);
}
