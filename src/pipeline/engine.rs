//! Sync Engine
//!
//! Owns one node's capture log, batch store, staging area and router, and
//! drives routing, push, load and housekeeping on their configured
//! intervals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::interval;

use super::{ExtractSettings, Extractor, Loader, PushReport, PushSettings, Pusher, RoutingReport};
use crate::capture::{CaptureLog, CaptureLogWriter};
use crate::config::WolfSyncConfig;
use crate::error::{Error, Result};
use crate::extension::ExtensionRegistry;
use crate::model::BatchId;
use crate::platform::Platform;
use crate::reader::{CancelFlag, SnapshotTable};
use crate::route::RouterService;
use crate::stage::{StagingManager, StagingSettings};
use crate::state::BatchStore;
use crate::transport::Transport;

/// Everything one node runs
pub struct SyncEngine {
    config: WolfSyncConfig,
    capture_writer: CaptureLogWriter,
    capture: Arc<RwLock<CaptureLog>>,
    store: Arc<BatchStore>,
    staging: StagingManager,
    router: Arc<RouterService>,
    extractor: Arc<Extractor>,
    loader: Arc<Loader>,
    transport: Option<Arc<dyn Transport>>,
    pusher: Option<Pusher>,
    cancel: CancelFlag,
}

impl SyncEngine {
    /// Open the node's on-disk state and wire the pipeline
    pub async fn open(
        config: WolfSyncConfig,
        platform: Arc<dyn Platform>,
        extensions: Arc<ExtensionRegistry>,
    ) -> Result<Self> {
        let cancel = CancelFlag::new();
        let node = config.local_node();

        let capture_writer =
            CaptureLogWriter::open(config.capture_dir(), config.capture.clone()).await?;
        let capture = Arc::new(RwLock::new(CaptureLog::open(
            config.capture_dir(),
            config.capture.compression,
        )?));
        let store = Arc::new(BatchStore::open(config.state_dir(), node.id.clone())?);
        let staging = StagingManager::open(
            config.staging_dir(),
            StagingSettings::from(&config.staging),
        )?;

        let router = Arc::new(
            RouterService::new(
                node.clone(),
                config.nodes(),
                config.subscriptions()?,
                Arc::clone(&extensions),
            )
            .with_platform(Arc::clone(&platform)),
        );

        let extractor = Arc::new(
            Extractor::new(
                Arc::clone(&capture),
                Arc::clone(&router),
                Arc::clone(&store),
                staging.clone(),
                ExtractSettings::from(&config),
            )
            .with_platform(Arc::clone(&platform))
            .with_cancel(cancel.clone()),
        );

        let loader = Arc::new(
            Loader::new(
                node.id.clone(),
                platform,
                extensions,
                config.loader.writer_settings(),
                staging.clone(),
            )
            .with_cancel(cancel.clone()),
        );

        tracing::info!(
            "Node {} ({}) opened with {} subscriptions",
            node.id,
            node.group_id,
            config.subscriptions.len()
        );

        Ok(Self {
            config,
            capture_writer,
            capture,
            store,
            staging,
            router,
            extractor,
            loader,
            transport: None,
            pusher: None,
            cancel,
        })
    }

    /// Attach the transport used to push and receive batches
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.pusher = Some(Pusher::new(
            Arc::clone(&self.store),
            self.staging.clone(),
            Arc::clone(&self.extractor),
            Arc::clone(&transport),
            PushSettings::from(&self.config.push),
        ));
        self.transport = Some(transport);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    /// Handle for recording captured changes
    pub fn capture(&self) -> &CaptureLogWriter {
        &self.capture_writer
    }

    pub fn store(&self) -> &Arc<BatchStore> {
        &self.store
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    pub fn router(&self) -> &Arc<RouterService> {
        &self.router
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// One routing pass over every enabled channel, in priority order
    ///
    /// A failing channel is logged and skipped; the others still run.
    pub async fn route_once(&self) -> Vec<RoutingReport> {
        let mut reports = Vec::new();
        for channel in self.config.channels().into_iter().filter(|c| c.enabled) {
            match self.extractor.route_channel(&channel.id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!("Routing pass on channel {} aborted: {}", channel.id, e);
                }
            }
        }
        reports
    }

    /// One push pass over every sequence with unsettled batches
    pub async fn push_once(&self) -> Result<PushReport> {
        let pusher = self
            .pusher
            .as_ref()
            .ok_or_else(|| Error::Config("no transport attached".into()))?;
        pusher.push_all().await
    }

    /// Queue an initial load of `tables` for one node
    pub async fn reload(
        &self,
        target_node_id: &str,
        channel_id: &str,
        tables: Vec<SnapshotTable>,
    ) -> Result<Option<BatchId>> {
        self.extractor.reload(target_node_id, channel_id, tables).await
    }

    /// Staging sweep, settled bookkeeping cleanup and capture purge
    pub async fn maintain(&self) -> Result<()> {
        let sweep = self.staging.sweep().await?;
        if sweep.expired_done + sweep.abandoned_creating > 0 {
            tracing::info!(
                "Staging sweep removed {} done and {} abandoned resources",
                sweep.expired_done,
                sweep.abandoned_creating
            );
        }

        let cleaned = self.store.cleanup_settled().await?;
        if cleaned > 0 {
            tracing::debug!("Dropped {} data id entries of settled batches", cleaned);
        }

        if self.config.capture.retention_hours > 0 {
            let channels: Vec<String> = self.config.channels().into_iter().map(|c| c.id).collect();
            let routed_through = self.store.min_cursor(&channels).await?;
            let retention = Duration::from_secs(self.config.capture.retention_hours * 3600);
            self.capture.write().await.purge(routed_through, retention)?;
        }
        Ok(())
    }

    /// Run until `stop` is called
    pub async fn run(&self) -> Result<()> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::Config("no transport attached".into()))?;
        let loader = tokio::spawn(Arc::clone(&self.loader).run(transport));

        let mut route_ticker = interval(self.config.route_interval());
        let mut push_ticker = interval(Duration::from_millis(self.config.push.push_interval_ms));
        let mut sweep_ticker = interval(Duration::from_secs(
            self.config.staging.sweep_interval_secs.max(1),
        ));
        tracing::info!("Node {} running", self.node_id());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = route_ticker.tick() => {
                    self.route_once().await;
                }
                _ = push_ticker.tick() => {
                    if let Err(e) = self.push_once().await {
                        tracing::warn!("Push pass failed: {}", e);
                    }
                }
                _ = sweep_ticker.tick() => {
                    if let Err(e) = self.maintain().await {
                        tracing::warn!("Maintenance failed: {}", e);
                    }
                }
            }
        }

        loader.abort();
        if let Err(e) = self.capture_writer.flush().await {
            tracing::warn!("Final capture flush failed: {}", e);
        }
        tracing::info!("Node {} stopped", self.node_id());
        Ok(())
    }

    /// Ask `run` and in-flight readers and writers to stop
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
