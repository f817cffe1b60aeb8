//! Outgoing push
//!
//! Sends staged batches to their targets. Each (target, channel) sequence
//! is pushed strictly in batch id order: the pass stops at the first batch
//! of a sequence that is not settled, so batch 43 never goes out while 42
//! is still failing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use super::{Extractor, PushReport};
use crate::config::PushConfig;
use crate::error::{Error, Result};
use crate::model::{BatchHeader, BatchKey, BatchStatus, BatchFailure};
use crate::protocol::PayloadWriter;
use crate::stage::{StageKey, StageState, StagedResource, StagingManager};
use crate::state::{BatchStore, OutgoingBatch};
use crate::transport::{Acknowledgement, Transport};

/// Retry policy of the push pass
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff
    pub jitter: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self::from(&PushConfig::default())
    }
}

impl From<&PushConfig> for PushSettings {
    fn from(config: &PushConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: Duration::from_millis(config.initial_backoff_ms / 4),
        }
    }
}

impl PushSettings {
    /// Delay before retry number `retry`, doubling up to the maximum
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let backoff = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let jitter = self.jitter.as_millis() as u64;
        if jitter == 0 {
            return backoff;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter);
        backoff + Duration::from_millis(extra)
    }
}

/// What happened to the head of one sequence
enum Step {
    /// Settled or moved on; look at the sequence again
    Continue,
    /// Nothing more to do for this sequence in this pass
    Stop,
}

/// Transmits staged outgoing batches
pub struct Pusher {
    store: Arc<BatchStore>,
    staging: StagingManager,
    extractor: Arc<Extractor>,
    transport: Arc<dyn Transport>,
    settings: PushSettings,
}

impl Pusher {
    pub fn new(
        store: Arc<BatchStore>,
        staging: StagingManager,
        extractor: Arc<Extractor>,
        transport: Arc<dyn Transport>,
        settings: PushSettings,
    ) -> Self {
        Self {
            store,
            staging,
            extractor,
            transport,
            settings,
        }
    }

    /// Push every sequence with unsettled batches
    ///
    /// Sequences are independent and run concurrently.
    pub async fn push_all(&self) -> Result<PushReport> {
        let keys = self.store.pending_keys().await?;
        let results = futures::future::join_all(keys.iter().map(|key| self.push_key(key))).await;

        let mut report = PushReport::default();
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(r) => report.merge(r),
                Err(e) => {
                    tracing::error!("Push to {} failed: {}", key, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Push one (target, channel) sequence in id order
    pub async fn push_key(&self, key: &BatchKey) -> Result<PushReport> {
        let mut report = PushReport::default();
        while let Some(batch) = self.store.next_unsettled(key).await? {
            match self.step(batch, &mut report).await? {
                Step::Continue => continue,
                Step::Stop => break,
            }
        }
        Ok(report)
    }

    async fn step(&self, batch: OutgoingBatch, report: &mut PushReport) -> Result<Step> {
        let key = batch.key.clone();
        let id = batch.batch_id;

        match batch.status {
            BatchStatus::Routed => {
                // Staging failed during the routing pass
                match self.extractor.restage(&batch).await {
                    Ok(_) => {
                        self.store.transition(&key, id, BatchStatus::ReadyToSend).await?;
                        Ok(Step::Continue)
                    }
                    Err(e) => {
                        tracing::error!("Cannot stage batch {}: {}", batch.node_batch_id(), e);
                        Ok(Step::Stop)
                    }
                }
            }
            BatchStatus::ReadyToSend | BatchStatus::Resend => self.send(batch, report).await,
            BatchStatus::Transmitting | BatchStatus::Loading => {
                // Left over from an interrupted push
                tracing::warn!(
                    "Batch {} was {} when the last push stopped",
                    batch.node_batch_id(),
                    batch.status
                );
                let failure = BatchFailure::from_error(&Error::Transport(
                    "push interrupted before acknowledgement".into(),
                ));
                self.store
                    .record_failure(&key, id, &failure, Some(Utc::now()))
                    .await?;
                Ok(Step::Continue)
            }
            BatchStatus::Error => {
                let retryable = batch.failure.as_ref().map_or(true, |f| f.is_retryable());
                if !retryable || batch.retry_count > self.settings.max_retries {
                    return self.ignore(batch, report).await;
                }
                if !batch.retry_due(Utc::now()) {
                    report.waiting += 1;
                    return Ok(Step::Stop);
                }
                self.store.transition(&key, id, BatchStatus::Resend).await?;
                Ok(Step::Continue)
            }
            BatchStatus::New | BatchStatus::Ok | BatchStatus::Ignored => {
                Err(Error::State(format!(
                    "batch {} is {} but listed as unsettled",
                    batch.node_batch_id(),
                    batch.status
                )))
            }
        }
    }

    /// Staged resource of a batch, staging it again if the payload is gone
    async fn resource(&self, batch: &OutgoingBatch) -> Result<StagedResource> {
        let stage_key = StageKey::outgoing(&batch.key, batch.batch_id);
        match self.staging.get(&stage_key).await {
            Some(resource) if resource.state == StageState::Ready => Ok(resource),
            _ => self.extractor.restage(batch).await,
        }
    }

    async fn send(&self, batch: OutgoingBatch, report: &mut PushReport) -> Result<Step> {
        let key = batch.key.clone();
        let id = batch.batch_id;

        let resource = match self.resource(&batch).await {
            Ok(resource) => resource,
            Err(e) => {
                // Nothing to transmit; fail the batch without touching the network
                self.store.transition(&key, id, BatchStatus::Transmitting).await?;
                self.fail(&batch, BatchFailure::from_error(&e), report).await?;
                return Ok(Step::Continue);
            }
        };
        let payload = self.staging.read_all(&resource.key).await?;

        self.store.transition(&key, id, BatchStatus::Transmitting).await?;
        tracing::debug!(
            "Sending batch {} to {} ({} bytes)",
            batch.node_batch_id(),
            key.target_node_id,
            payload.len()
        );

        match self.transport.send(&key.target_node_id, &resource, payload).await {
            Ok(Acknowledgement::Ok) => {
                self.store.transition(&key, id, BatchStatus::Loading).await?;
                self.store.transition(&key, id, BatchStatus::Ok).await?;
                if let Err(e) = self.staging.mark_done(&resource.key).await {
                    tracing::warn!("Cannot mark {} done: {}", resource.key, e);
                }
                report.sent += 1;
                Ok(Step::Continue)
            }
            Ok(Acknowledgement::Failed(failure)) => {
                self.store.transition(&key, id, BatchStatus::Loading).await?;
                self.fail(&batch, failure, report).await?;
                Ok(Step::Stop)
            }
            Err(e) => {
                self.fail(&batch, BatchFailure::from_error(&e), report).await?;
                Ok(Step::Stop)
            }
        }
    }

    async fn fail(
        &self,
        batch: &OutgoingBatch,
        failure: BatchFailure,
        report: &mut PushReport,
    ) -> Result<()> {
        let retry = batch.retry_count + 1;
        let next_retry = if failure.is_retryable() {
            let backoff = self.settings.backoff(retry);
            chrono::Duration::from_std(backoff)
                .ok()
                .map(|delay| Utc::now() + delay)
        } else {
            None
        };

        if failure.is_retryable() {
            tracing::warn!(
                "Batch {} to {} failed (attempt {}), retry scheduled: {}",
                batch.node_batch_id(),
                batch.key.target_node_id,
                retry,
                failure.message
            );
        } else {
            tracing::error!(
                "Batch {} to {} failed and will not be retried: {}",
                batch.node_batch_id(),
                batch.key.target_node_id,
                failure.message
            );
        }
        self.store
            .record_failure(&batch.key, batch.batch_id, &failure, next_retry)
            .await?;
        report.failed += 1;
        Ok(())
    }

    /// Give up on a batch: tell the target to skip it, then settle it as IGNORED
    async fn ignore(&self, batch: OutgoingBatch, report: &mut PushReport) -> Result<Step> {
        let header = BatchHeader {
            batch_id: batch.batch_id,
            source_node_id: batch.key.source_node_id.clone(),
            target_node_id: Some(batch.key.target_node_id.clone()),
            channel_id: batch.key.channel_id.clone(),
            binary_encoding: Default::default(),
            initial_load: batch.initial_load,
            ignored: true,
        };
        let mut notice = PayloadWriter::new(Vec::new());
        notice.start_batch(&header)?;
        notice.ignore()?;
        notice.commit()?;
        let payload = notice.into_inner();

        let resource = StagedResource {
            key: StageKey::outgoing(&batch.key, batch.batch_id),
            state: StageState::Ready,
            size_bytes: payload.len() as u64,
            create_time: Utc::now(),
            path: None,
        };

        match self
            .transport
            .send(&batch.key.target_node_id, &resource, payload)
            .await
        {
            Ok(Acknowledgement::Ok) => {
                self.store
                    .transition(&batch.key, batch.batch_id, BatchStatus::Ignored)
                    .await?;
                if self.staging.exists(&resource.key).await {
                    if let Err(e) = self.staging.mark_done(&resource.key).await {
                        tracing::debug!("Cannot mark {} done: {}", resource.key, e);
                    }
                }
                tracing::warn!(
                    "Batch {} to {} ignored after {} attempts",
                    batch.node_batch_id(),
                    batch.key.target_node_id,
                    batch.retry_count
                );
                report.ignored += 1;
                Ok(Step::Continue)
            }
            Ok(Acknowledgement::Failed(failure)) => {
                tracing::warn!(
                    "Target refused the ignore notice for batch {}: {}",
                    batch.node_batch_id(),
                    failure.message
                );
                Ok(Step::Stop)
            }
            Err(e) => {
                tracing::warn!(
                    "Cannot deliver the ignore notice for batch {}: {}",
                    batch.node_batch_id(),
                    e
                );
                Ok(Step::Stop)
            }
        }
    }
}
