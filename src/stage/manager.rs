//! Staging manager
//!
//! Registry of staged payloads. One writer per key; readers only see READY
//! or DONE payloads. Payloads grow in memory until they pass the threshold,
//! then continue in a `.<claim>.create` file that is renamed to `.ready`
//! when the writer finishes and to `.done` once the payload has been
//! consumed. Every writer holds a claim number; a writer whose claim was
//! taken over can neither publish nor release the key.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{StageKey, StageState, StagedResource};
use crate::config::StagingConfig;
use crate::error::{Error, Result};

/// Staging thresholds
#[derive(Debug, Clone)]
pub struct StagingSettings {
    /// Payloads up to this size stay in memory
    pub memory_threshold_bytes: usize,
    /// How long DONE payloads are kept
    pub retention: Duration,
    /// Age after which an unfinished payload is considered abandoned
    pub stale_create: Duration,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: 256 * 1024,
            retention: Duration::from_secs(60 * 60),
            stale_create: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&StagingConfig> for StagingSettings {
    fn from(config: &StagingConfig) -> Self {
        Self {
            memory_threshold_bytes: config.memory_threshold_bytes,
            retention: Duration::from_secs(config.retention_minutes * 60),
            stale_create: Duration::from_secs(config.stale_create_minutes * 60),
        }
    }
}

/// What a sweep removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_done: usize,
    pub abandoned_creating: usize,
}

#[derive(Debug, Clone)]
enum Storage {
    Memory(Arc<Vec<u8>>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
struct Entry {
    state: StageState,
    size_bytes: u64,
    create_time: DateTime<Utc>,
    /// When the entry entered its current state
    state_time: DateTime<Utc>,
    storage: Option<Storage>,
    /// Writer claim; 0 for payloads recovered from disk
    claim: u64,
}

fn age_exceeds(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().map_or(false, |age| age >= limit)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Shared registry of staged payloads
#[derive(Clone)]
pub struct StagingManager {
    root: PathBuf,
    settings: StagingSettings,
    entries: Arc<Mutex<HashMap<StageKey, Entry>>>,
    claims: Arc<AtomicU64>,
}

impl StagingManager {
    /// Open the staging area under `root`, registering payloads left on disk
    pub fn open(root: PathBuf, settings: StagingSettings) -> Result<Self> {
        fs::create_dir_all(&root)?;

        let mut files = Vec::new();
        collect_files(&root, &mut files)?;

        let mut entries = HashMap::new();
        for path in files {
            let Some(state) = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(StageState::from_extension)
            else {
                continue;
            };
            // Spill files carry the writer claim before the extension
            let Some(key) = path
                .strip_prefix(&root)
                .ok()
                .map(|rel| match state {
                    StageState::Creating => rel.with_extension("").with_extension(""),
                    _ => rel.with_extension(""),
                })
                .and_then(|stem| StageKey::from_relative_path(&stem))
            else {
                continue;
            };

            let metadata = fs::metadata(&path)?;
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            entries.insert(
                key,
                Entry {
                    state,
                    size_bytes: metadata.len(),
                    create_time: modified,
                    state_time: modified,
                    storage: Some(Storage::File(path)),
                    claim: 0,
                },
            );
        }

        if !entries.is_empty() {
            tracing::info!("Recovered {} staged payloads from {:?}", entries.len(), root);
        }

        Ok(Self {
            root,
            settings,
            entries: Arc::new(Mutex::new(entries)),
            claims: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StageKey, state: StageState) -> PathBuf {
        self.root
            .join(key.relative_path())
            .with_extension(state.extension())
    }

    fn spill_path(&self, key: &StageKey, claim: u64) -> PathBuf {
        self.root.join(key.relative_path()).with_extension(format!(
            "{}.{}",
            claim,
            StageState::Creating.extension()
        ))
    }

    fn remove_files(&self, key: &StageKey, entry: &Entry) -> Result<()> {
        for state in [StageState::Creating, StageState::Ready, StageState::Done] {
            remove_if_exists(&self.path_for(key, state))?;
        }
        if let Some(Storage::File(path)) = &entry.storage {
            remove_if_exists(path)?;
        }
        if entry.state == StageState::Creating && entry.claim > 0 {
            remove_if_exists(&self.spill_path(key, entry.claim))?;
        }
        Ok(())
    }

    fn resource(key: &StageKey, entry: &Entry) -> StagedResource {
        StagedResource {
            key: key.clone(),
            state: entry.state,
            size_bytes: entry.size_bytes,
            create_time: entry.create_time,
            path: match &entry.storage {
                Some(Storage::File(path)) => Some(path.clone()),
                _ => None,
            },
        }
    }

    /// Claim `key` for writing
    ///
    /// Fails with `StageBusy` while another writer holds the key. An
    /// existing finished payload under the same key is replaced.
    pub async fn start_writing(&self, key: StageKey) -> Result<StageWriter> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        if let Some(existing) = entries.get(&key) {
            if existing.state == StageState::Creating
                && !age_exceeds(existing.create_time, now, self.settings.stale_create)
            {
                return Err(Error::StageBusy(key.to_string()));
            }
            tracing::debug!("Replacing {} staged payload {}", existing.state, key);
            self.remove_files(&key, existing)?;
        }

        let claim = self.claims.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.clone(),
            Entry {
                state: StageState::Creating,
                size_bytes: 0,
                create_time: now,
                state_time: now,
                storage: None,
                claim,
            },
        );

        Ok(StageWriter {
            spill_path: self.spill_path(&key, claim),
            claim,
            key,
            threshold: self.settings.memory_threshold_bytes,
            buffer: Vec::new(),
            file: None,
            size_bytes: 0,
        })
    }

    /// Close a writer and publish its payload as READY
    pub async fn finish_writing(&self, writer: StageWriter) -> Result<StagedResource> {
        let StageWriter {
            key,
            claim,
            spill_path,
            buffer,
            file,
            size_bytes,
            ..
        } = writer;

        let mut entries = self.entries.lock().await;
        let claimed = entries
            .get(&key)
            .map_or(false, |e| e.state == StageState::Creating && e.claim == claim);
        if !claimed {
            drop(file);
            remove_if_exists(&spill_path)?;
            return Err(Error::Staging(format!(
                "{} was swept or replaced while being written",
                key
            )));
        }

        let storage = match file {
            Some(mut file) => {
                file.flush()?;
                file.get_ref().sync_all()?;
                drop(file);
                let ready_path = self.path_for(&key, StageState::Ready);
                fs::rename(&spill_path, &ready_path)?;
                Storage::File(ready_path)
            }
            None => Storage::Memory(Arc::new(buffer)),
        };

        let now = Utc::now();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| Error::StageNotFound(key.to_string()))?;
        entry.state = StageState::Ready;
        entry.size_bytes = size_bytes;
        entry.state_time = now;
        entry.storage = Some(storage);

        let resource = Self::resource(&key, entry);
        tracing::debug!(
            "Staged {} ({} bytes, {})",
            key,
            size_bytes,
            if resource.in_memory() { "memory" } else { "file" }
        );
        Ok(resource)
    }

    /// Drop an unfinished writer and release its key
    pub async fn abandon(&self, writer: StageWriter) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&writer.key)
            .map_or(false, |e| e.state == StageState::Creating && e.claim == writer.claim)
        {
            entries.remove(&writer.key);
        }
        let StageWriter { spill_path, file, .. } = writer;
        drop(file);
        remove_if_exists(&spill_path)?;
        Ok(())
    }

    /// Stage a complete payload in one step
    pub async fn store(&self, key: StageKey, payload: &[u8]) -> Result<StagedResource> {
        let mut writer = self.start_writing(key).await?;
        if let Err(e) = writer.write_all(payload) {
            self.abandon(writer).await?;
            return Err(e.into());
        }
        self.finish_writing(writer).await
    }

    /// Open a finished payload for reading
    pub async fn open_for_read(&self, key: &StageKey) -> Result<StageReader> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(key)
            .ok_or_else(|| Error::StageNotFound(key.to_string()))?;

        match (&entry.state, &entry.storage) {
            (StageState::Creating, _) | (_, None) => Err(Error::StageNotReady(key.to_string())),
            (_, Some(Storage::Memory(bytes))) => {
                Ok(StageReader::Memory(Cursor::new(SharedBytes(Arc::clone(bytes)))))
            }
            (_, Some(Storage::File(path))) => Ok(StageReader::File(BufReader::new(File::open(path)?))),
        }
    }

    /// Read a finished payload into memory
    pub async fn read_all(&self, key: &StageKey) -> Result<Vec<u8>> {
        let mut reader = self.open_for_read(key).await?;
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        Ok(payload)
    }

    /// Mark a payload consumed; it stays readable until swept
    pub async fn mark_done(&self, key: &StageKey) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let done_path = self.path_for(key, StageState::Done);
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| Error::StageNotFound(key.to_string()))?;

        match entry.state {
            StageState::Creating => return Err(Error::StageNotReady(key.to_string())),
            StageState::Done => return Ok(()),
            StageState::Ready => {}
        }
        if let Some(Storage::File(path)) = &entry.storage {
            fs::rename(path, &done_path)?;
            entry.storage = Some(Storage::File(done_path));
        }
        entry.state = StageState::Done;
        entry.state_time = Utc::now();
        Ok(())
    }

    /// Remove a payload; returns whether one existed
    pub async fn delete(&self, key: &StageKey) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.state == StageState::Creating && entry.claim > 0 => {
                Err(Error::StageBusy(key.to_string()))
            }
            Some(_) => {
                if let Some(entry) = entries.remove(key) {
                    self.remove_files(key, &entry)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn exists(&self, key: &StageKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn get(&self, key: &StageKey) -> Option<StagedResource> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|entry| Self::resource(key, entry))
    }

    /// Every registered payload, ordered by key
    pub async fn list(&self) -> Vec<StagedResource> {
        let entries = self.entries.lock().await;
        let mut resources: Vec<_> = entries
            .iter()
            .map(|(key, entry)| Self::resource(key, entry))
            .collect();
        resources.sort_by(|a, b| a.key.cmp(&b.key));
        resources
    }

    /// Remove expired DONE payloads and abandoned unfinished ones
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let mut report = SweepReport::default();

        let expired: Vec<StageKey> = entries
            .iter()
            .filter(|(_, e)| match e.state {
                StageState::Done => age_exceeds(e.state_time, now, self.settings.retention),
                StageState::Creating => {
                    age_exceeds(e.create_time, now, self.settings.stale_create)
                }
                StageState::Ready => false,
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            let Some(entry) = entries.remove(&key) else {
                continue;
            };
            self.remove_files(&key, &entry)?;
            let state = entry.state;
            match state {
                StageState::Done => report.expired_done += 1,
                _ => report.abandoned_creating += 1,
            }
            tracing::info!("Swept {} staged payload {}", state, key);
        }

        Ok(report)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Write handle for one staged payload
pub struct StageWriter {
    key: StageKey,
    claim: u64,
    spill_path: PathBuf,
    threshold: usize,
    buffer: Vec<u8>,
    file: Option<io::BufWriter<File>>,
    size_bytes: u64,
}

impl StageWriter {
    pub fn key(&self) -> &StageKey {
        &self.key
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn spill(&mut self) -> io::Result<()> {
        if let Some(parent) = self.spill_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = io::BufWriter::new(File::create(&self.spill_path)?);
        file.write_all(&self.buffer)?;
        self.buffer = Vec::new();
        self.file = Some(file);
        Ok(())
    }
}

impl Write for StageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.write_all(buf)?,
            None => {
                self.buffer.extend_from_slice(buf);
                if self.buffer.len() > self.threshold {
                    self.spill()?;
                }
            }
        }
        self.size_bytes += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Shared in-memory payload bytes
#[derive(Debug, Clone)]
pub struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Read handle for a finished payload
pub enum StageReader {
    Memory(Cursor<SharedBytes>),
    File(BufReader<File>),
}

impl Read for StageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StageReader::Memory(cursor) => cursor.read(buf),
            StageReader::File(file) => file.read(buf),
        }
    }
}

impl BufRead for StageReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            StageReader::Memory(cursor) => cursor.fill_buf(),
            StageReader::File(file) => file.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            StageReader::Memory(cursor) => cursor.consume(amt),
            StageReader::File(file) => file.consume(amt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchKey;
    use tempfile::tempdir;

    fn key(batch_id: u64) -> StageKey {
        StageKey::outgoing(&BatchKey::new("corp", "store", "default"), batch_id)
    }

    fn settings(threshold: usize) -> StagingSettings {
        StagingSettings {
            memory_threshold_bytes: threshold,
            ..StagingSettings::default()
        }
    }

    #[tokio::test]
    async fn test_memory_and_spilled_payloads_read_alike() {
        let dir = tempdir().unwrap();
        let stage = StagingManager::open(dir.path().to_path_buf(), settings(16)).unwrap();

        let small = stage.store(key(1), b"short").await.unwrap();
        assert!(small.in_memory());
        assert_eq!(small.state, StageState::Ready);

        let payload = b"a payload well past the sixteen byte threshold".to_vec();
        let mut writer = stage.start_writing(key(2)).await.unwrap();
        writer.write_all(&payload[..10]).unwrap();
        writer.write_all(&payload[10..]).unwrap();
        let large = stage.finish_writing(writer).await.unwrap();
        assert!(!large.in_memory());
        assert_eq!(large.size_bytes, payload.len() as u64);

        assert_eq!(stage.read_all(&key(1)).await.unwrap(), b"short");
        assert_eq!(stage.read_all(&key(2)).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_single_writer_and_no_early_reads() {
        let dir = tempdir().unwrap();
        let stage = StagingManager::open(dir.path().to_path_buf(), settings(1024)).unwrap();

        let writer = stage.start_writing(key(1)).await.unwrap();
        assert!(matches!(
            stage.start_writing(key(1)).await,
            Err(Error::StageBusy(_))
        ));
        assert!(matches!(
            stage.open_for_read(&key(1)).await,
            Err(Error::StageNotReady(_))
        ));
        assert!(matches!(stage.delete(&key(1)).await, Err(Error::StageBusy(_))));
        assert!(matches!(
            stage.open_for_read(&key(9)).await,
            Err(Error::StageNotFound(_))
        ));

        stage.abandon(writer).await.unwrap();
        assert!(!stage.exists(&key(1)).await);
    }

    #[tokio::test]
    async fn test_taken_over_writer_cannot_publish() {
        let dir = tempdir().unwrap();
        let stage = StagingManager::open(
            dir.path().to_path_buf(),
            StagingSettings {
                memory_threshold_bytes: 4,
                stale_create: Duration::ZERO,
                ..StagingSettings::default()
            },
        )
        .unwrap();

        let mut stale = stage.start_writing(key(1)).await.unwrap();
        let mut live = stage.start_writing(key(1)).await.unwrap();
        assert_ne!(stale.spill_path, live.spill_path);
        stale.write_all(b"old-writer").unwrap();
        live.write_all(b"new-writer").unwrap();

        assert!(matches!(
            stage.finish_writing(stale).await,
            Err(Error::Staging(_))
        ));
        let resource = stage.finish_writing(live).await.unwrap();
        assert_eq!(resource.state, StageState::Ready);
        assert_eq!(stage.read_all(&key(1)).await.unwrap(), b"new-writer");

        // Abandoning the old claim leaves the new one in place
        let stale = stage.start_writing(key(2)).await.unwrap();
        let mut live = stage.start_writing(key(2)).await.unwrap();
        stage.abandon(stale).await.unwrap();
        assert!(stage.exists(&key(2)).await);
        live.write_all(b"kept").unwrap();
        stage.finish_writing(live).await.unwrap();
        assert_eq!(stage.read_all(&key(2)).await.unwrap(), b"kept");
    }

    #[tokio::test]
    async fn test_done_payloads_are_swept_after_retention() {
        let dir = tempdir().unwrap();
        let stage = StagingManager::open(
            dir.path().to_path_buf(),
            StagingSettings {
                memory_threshold_bytes: 0,
                retention: Duration::ZERO,
                stale_create: Duration::from_secs(3600),
            },
        )
        .unwrap();

        stage.store(key(1), b"payload").await.unwrap();
        stage.store(key(2), b"payload").await.unwrap();
        stage.mark_done(&key(1)).await.unwrap();
        let _writer = stage.start_writing(key(3)).await.unwrap();

        let report = stage.sweep().await.unwrap();
        assert_eq!(report.expired_done, 1);
        assert_eq!(report.abandoned_creating, 0);
        assert!(!stage.exists(&key(1)).await);
        assert!(stage.exists(&key(2)).await);
        assert!(stage.exists(&key(3)).await);
    }

    #[tokio::test]
    async fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        {
            let stage = StagingManager::open(dir.path().to_path_buf(), settings(0)).unwrap();
            stage.store(key(1), b"durable").await.unwrap();
            stage.store(key(2), b"consumed").await.unwrap();
            stage.mark_done(&key(2)).await.unwrap();
            let mut crashed = stage.start_writing(key(3)).await.unwrap();
            crashed.write_all(b"half written").unwrap();
            crashed.flush().unwrap();
            std::mem::forget(crashed);
        }

        let stage = StagingManager::open(
            dir.path().to_path_buf(),
            StagingSettings {
                memory_threshold_bytes: 0,
                retention: Duration::from_secs(3600),
                stale_create: Duration::ZERO,
            },
        )
        .unwrap();
        let states: Vec<_> = stage.list().await.into_iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![StageState::Ready, StageState::Done, StageState::Creating]
        );
        assert_eq!(stage.read_all(&key(1)).await.unwrap(), b"durable");

        let report = stage.sweep().await.unwrap();
        assert_eq!(report.abandoned_creating, 1);
        assert!(!stage.exists(&key(3)).await);
    }
}
