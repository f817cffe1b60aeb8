//! Capture Log Writer
//!
//! Batched, single-task writer that assigns data ids and appends records
//! to the capture log.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};

use super::record::CaptureRecord;
use super::segment::{list_segments, Segment};
use super::CapturePaths;
use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::model::{DataId, RowEvent};

/// Room kept free at the end of a segment before rotating
const ROTATE_RESERVE: usize = 8192;

/// Requests sent to the writer task
enum Request {
    Append {
        channel_id: String,
        events: Vec<RowEvent>,
        response: oneshot::Sender<Result<Vec<DataId>>>,
    },
    Flush {
        response: oneshot::Sender<Result<()>>,
    },
}

/// Capture log writer handle
///
/// This is a cloneable handle to the underlying writer task.
#[derive(Clone)]
pub struct CaptureLogWriter {
    sender: mpsc::Sender<Request>,
    state: Arc<RwLock<WriterState>>,
}

struct WriterState {
    /// Highest data id handed out
    last_data_id: DataId,
}

type Pending = (Vec<CaptureRecord>, oneshot::Sender<Result<Vec<DataId>>>);

/// Internal writer that manages segments
struct WriterInner {
    paths: CapturePaths,
    config: CaptureConfig,
    current_segment: Option<Segment>,
    buffer: VecDeque<Pending>,
    buffered_records: usize,
    next_data_id: DataId,
    last_flush: Instant,
    state: Arc<RwLock<WriterState>>,
}

impl CaptureLogWriter {
    /// Open the capture log under `dir` and start the writer task
    pub async fn open(dir: PathBuf, config: CaptureConfig) -> Result<Self> {
        let paths = CapturePaths::new(dir);
        paths.ensure_dirs()?;

        let last_data_id = Self::find_last_data_id(&paths, &config)?;
        tracing::debug!("Capture log opened at data id {}", last_data_id);

        let state = Arc::new(RwLock::new(WriterState { last_data_id }));
        let (sender, receiver) = mpsc::channel(10000);

        let inner = WriterInner {
            paths,
            config,
            current_segment: None,
            buffer: VecDeque::new(),
            buffered_records: 0,
            next_data_id: last_data_id + 1,
            last_flush: Instant::now(),
            state: Arc::clone(&state),
        };

        tokio::spawn(Self::writer_task(inner, receiver));

        Ok(Self { sender, state })
    }

    fn find_last_data_id(paths: &CapturePaths, config: &CaptureConfig) -> Result<DataId> {
        let segments = list_segments(&paths.base_dir)?;
        let Some(last_path) = segments.last() else {
            return Ok(0);
        };

        let segment = Segment::open(last_path.clone(), config.segment_size_mb, config.compression)?;
        if segment.record_count() > 0 {
            Ok(segment.last_id())
        } else {
            Ok(segment.first_id().saturating_sub(1))
        }
    }

    /// Append a single captured change
    pub async fn append(&self, channel_id: &str, event: RowEvent) -> Result<DataId> {
        let ids = self.append_transaction(channel_id, vec![event]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Internal("Capture writer returned no data id".into()))
    }

    /// Append the changes of one source transaction under consecutive data ids
    pub async fn append_transaction(&self, channel_id: &str, events: Vec<RowEvent>) -> Result<Vec<DataId>> {
        for event in &events {
            event.validate()?;
        }

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Request::Append {
                channel_id: channel_id.to_string(),
                events,
                response: tx,
            })
            .await
            .map_err(|_| Error::CaptureLog("Writer task terminated".into()))?;

        rx.await
            .map_err(|_| Error::CaptureLog("Write cancelled".into()))?
    }

    /// Force buffered records to disk
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Request::Flush { response: tx })
            .await
            .map_err(|_| Error::CaptureLog("Writer task terminated".into()))?;

        rx.await.map_err(|_| Error::CaptureLog("Flush cancelled".into()))?
    }

    /// Highest data id assigned so far
    pub async fn last_data_id(&self) -> DataId {
        self.state.read().await.last_data_id
    }

    async fn writer_task(mut inner: WriterInner, mut receiver: mpsc::Receiver<Request>) {
        let flush_interval = Duration::from_millis(inner.config.flush_interval_ms);
        let batch_size = inner.config.batch_size.max(1);

        loop {
            let timeout = flush_interval.saturating_sub(inner.last_flush.elapsed());

            tokio::select! {
                request = receiver.recv() => {
                    match request {
                        Some(Request::Append { channel_id, mut events, response }) => {
                            tag_transaction(&mut events, inner.next_data_id);
                            let records: Vec<CaptureRecord> = events
                                .into_iter()
                                .map(|event| {
                                    let id = inner.next_data_id;
                                    inner.next_data_id += 1;
                                    CaptureRecord::new(id, channel_id.clone(), event)
                                })
                                .collect();
                            inner.state.write().await.last_data_id = inner.next_data_id - 1;
                            inner.buffered_records += records.len();
                            inner.buffer.push_back((records, response));

                            if inner.buffered_records >= batch_size {
                                if let Err(e) = inner.flush_buffer() {
                                    tracing::error!("Capture log flush failed: {}", e);
                                }
                            }
                        }
                        Some(Request::Flush { response }) => {
                            let _ = response.send(inner.flush_buffer());
                        }
                        None => {
                            if let Err(e) = inner.flush_buffer() {
                                tracing::error!("Capture log flush on shutdown failed: {}", e);
                            }
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    if !inner.buffer.is_empty() {
                        if let Err(e) = inner.flush_buffer() {
                            tracing::error!("Capture log flush failed: {}", e);
                        }
                    }
                    inner.last_flush = Instant::now();
                }
            }
        }
    }
}

/// Give untagged events of one appended transaction a shared transaction id
fn tag_transaction(events: &mut [RowEvent], first_id: DataId) {
    for event in events.iter_mut().filter(|e| e.transaction_id.is_none()) {
        event.transaction_id = Some(format!("capture-{}", first_id));
    }
}

impl WriterInner {
    /// Flush the write buffer to disk and answer the waiting callers
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut responses = Vec::with_capacity(self.buffer.len());
        let mut failure = None;

        while let Some((records, response)) = self.buffer.pop_front() {
            let result = if failure.is_some() {
                Err(Error::CaptureLog("Earlier append in the same flush failed".into()))
            } else {
                self.append_all(&records)
            };
            match result {
                Ok(()) => responses.push((response, Ok(records.iter().map(|r| r.data_id).collect()))),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e.to_string());
                    }
                    responses.push((response, Err(e)));
                }
            }
        }
        self.buffered_records = 0;

        let synced = if self.config.fsync {
            self.current_segment.as_mut().map_or(Ok(()), Segment::sync)
        } else {
            Ok(())
        };

        if let Err(e) = synced {
            let reason = e.to_string();
            for (response, _) in responses {
                let _ = response.send(Err(Error::CaptureLog(format!("fsync failed: {}", reason))));
            }
            self.last_flush = Instant::now();
            return Err(e);
        }

        for (response, result) in responses {
            let _ = response.send(result);
        }

        self.last_flush = Instant::now();
        match failure {
            Some(reason) => Err(Error::CaptureLog(reason)),
            None => Ok(()),
        }
    }

    fn append_all(&mut self, records: &[CaptureRecord]) -> Result<()> {
        for record in records {
            let segment = self.segment_for(record.data_id)?;
            segment.append(record)?;
        }
        Ok(())
    }

    /// Active segment with room for another record, rotating when full
    fn segment_for(&mut self, data_id: DataId) -> Result<&mut Segment> {
        if self.current_segment.is_none() {
            let segments = list_segments(&self.paths.base_dir)?;
            if let Some(last_path) = segments.last() {
                let segment = Segment::open(
                    last_path.clone(),
                    self.config.segment_size_mb,
                    self.config.compression,
                )?;
                if !segment.is_sealed() {
                    self.current_segment = Some(segment);
                }
            }
        }

        let rotate = match self.current_segment.as_ref() {
            Some(segment) => !segment.has_space(ROTATE_RESERVE),
            None => true,
        };

        if rotate {
            if let Some(mut full) = self.current_segment.take() {
                full.seal()?;
                tracing::debug!("Sealed capture segment {}", full.path.display());
            }
            let segment = Segment::create(
                self.paths.segment_path(data_id),
                data_id,
                self.config.segment_size_mb,
                self.config.compression,
            )?;
            self.current_segment = Some(segment);
        }

        self.current_segment
            .as_mut()
            .ok_or_else(|| Error::Internal("No active capture segment".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableIdentity;
    use tempfile::tempdir;

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            batch_size: 10,
            flush_interval_ms: 20,
            compression: true,
            segment_size_mb: 1,
            retention_hours: 0,
            fsync: false,
            ..CaptureConfig::default()
        }
    }

    fn event(id: i64) -> RowEvent {
        RowEvent::insert(
            TableIdentity::new("test"),
            vec!["id".into()],
            vec!["id".into()],
            vec![Some(id.to_string())],
        )
    }

    #[tokio::test]
    async fn test_writer_assigns_increasing_ids() {
        let dir = tempdir().unwrap();
        let writer = CaptureLogWriter::open(dir.path().to_path_buf(), test_config())
            .await
            .unwrap();

        for i in 1..=25 {
            let id = writer.append("default", event(i)).await.unwrap();
            assert_eq!(id, i as u64);
        }
        assert_eq!(writer.last_data_id().await, 25);

        let ids = writer
            .append_transaction("default", vec![event(26), event(27)])
            .await
            .unwrap();
        assert_eq!(ids, vec![26, 27]);
        writer.flush().await.unwrap();
    }

    #[test]
    fn test_transaction_tagging() {
        let mut events = vec![event(1), event(2).with_transaction("app-7")];
        tag_transaction(&mut events, 41);
        assert_eq!(events[0].transaction_id.as_deref(), Some("capture-41"));
        assert_eq!(events[1].transaction_id.as_deref(), Some("app-7"));
    }

    #[tokio::test]
    async fn test_writer_resumes_after_restart() {
        let dir = tempdir().unwrap();
        {
            let writer = CaptureLogWriter::open(dir.path().to_path_buf(), test_config())
                .await
                .unwrap();
            for i in 1..=5 {
                writer.append("default", event(i)).await.unwrap();
            }
            writer.flush().await.unwrap();
        }

        let writer = CaptureLogWriter::open(dir.path().to_path_buf(), test_config())
            .await
            .unwrap();
        assert_eq!(writer.append("default", event(6)).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_malformed_event_is_rejected() {
        let dir = tempdir().unwrap();
        let writer = CaptureLogWriter::open(dir.path().to_path_buf(), test_config())
            .await
            .unwrap();
        let mut bad = event(1);
        bad.row_data.push(None);
        assert!(writer.append("default", bad).await.is_err());
    }
}
