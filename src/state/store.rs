//! Batch Store
//!
//! Persistent record of outgoing batches, backed by SQLite: lifecycle
//! status, the ordered capture data ids of each batch, per-channel routing
//! cursors and per-target batch id sequences.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{Batch, BatchFailure, BatchId, BatchKey, BatchStatus, DataId};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS outgoing_batch (
        target_node_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        batch_id INTEGER NOT NULL,
        source_node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        initial_load INTEGER NOT NULL DEFAULT 0,
        event_count INTEGER NOT NULL DEFAULT 0,
        byte_count INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_retry_time TEXT,
        failure TEXT,
        create_time TEXT NOT NULL,
        last_update_time TEXT NOT NULL,
        PRIMARY KEY (target_node_id, channel_id, batch_id)
    );

    CREATE INDEX IF NOT EXISTS idx_outgoing_batch_status
        ON outgoing_batch(status);

    CREATE TABLE IF NOT EXISTS batch_event (
        target_node_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        batch_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        data_id INTEGER NOT NULL,
        PRIMARY KEY (target_node_id, channel_id, batch_id, position)
    );

    CREATE TABLE IF NOT EXISTS channel_cursor (
        channel_id TEXT PRIMARY KEY,
        last_data_id INTEGER NOT NULL,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS batch_sequence (
        target_node_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        next_batch_id INTEGER NOT NULL,
        PRIMARY KEY (target_node_id, channel_id)
    );
"#;

const BATCH_COLUMNS: &str = "target_node_id, channel_id, batch_id, source_node_id, status, \
    initial_load, event_count, byte_count, retry_count, next_retry_time, failure, create_time, \
    last_update_time";

/// Persisted summary of an outgoing batch
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingBatch {
    pub key: BatchKey,
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub initial_load: bool,
    pub event_count: u64,
    pub byte_count: u64,
    pub retry_count: u32,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub failure: Option<BatchFailure>,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl OutgoingBatch {
    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.key.source_node_id, self.batch_id)
    }

    /// Whether a retry may go out at `now`
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_time.map_or(true, |at| at <= now)
    }
}

fn parse_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<OutgoingBatch> {
    let status: String = row.get(4)?;
    let failure: Option<String> = row.get(10)?;
    let next_retry: Option<String> = row.get(9)?;
    Ok(OutgoingBatch {
        key: BatchKey {
            source_node_id: row.get(3)?,
            target_node_id: row.get(0)?,
            channel_id: row.get(1)?,
        },
        batch_id: row.get::<_, i64>(2)? as BatchId,
        status: BatchStatus::from_code(&status).unwrap_or(BatchStatus::Error),
        initial_load: row.get(5)?,
        event_count: row.get::<_, i64>(6)? as u64,
        byte_count: row.get::<_, i64>(7)? as u64,
        retry_count: row.get::<_, i64>(8)? as u32,
        next_retry_time: next_retry.as_deref().map(parse_time),
        failure: failure.and_then(|f| serde_json::from_str(&f).ok()),
        create_time: parse_time(&row.get::<_, String>(11)?),
        last_update_time: parse_time(&row.get::<_, String>(12)?),
    })
}

/// Persistent batch store backed by SQLite
pub struct BatchStore {
    conn: Mutex<Connection>,
    node_id: String,
}

impl BatchStore {
    /// Create or open the store under `data_dir`
    pub fn open(data_dir: PathBuf, node_id: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("batches.db"))?;
        Self::init(conn, node_id.into())
    }

    pub fn open_in_memory(node_id: impl Into<String>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, node_id.into())
    }

    fn init(conn: Connection, node_id: String) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            node_id,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Last capture data id routed on a channel
    pub async fn cursor(&self, channel_id: &str) -> Result<DataId> {
        let conn = self.conn.lock().await;
        let last: Option<i64> = conn
            .query_row(
                "SELECT last_data_id FROM channel_cursor WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.unwrap_or(0) as DataId)
    }

    /// Smallest cursor across channels, 0 if any channel has not routed yet
    pub async fn min_cursor(&self, channels: &[String]) -> Result<DataId> {
        let mut min = DataId::MAX;
        for channel in channels {
            min = min.min(self.cursor(channel).await?);
        }
        Ok(if channels.is_empty() { 0 } else { min })
    }

    /// Id the next batch for a target/channel sequence will get
    pub async fn next_batch_id(&self, target_node_id: &str, channel_id: &str) -> Result<BatchId> {
        let conn = self.conn.lock().await;
        let next: Option<i64> = conn
            .query_row(
                "SELECT next_batch_id FROM batch_sequence \
                 WHERE target_node_id = ?1 AND channel_id = ?2",
                params![target_node_id, channel_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next.map_or(1, |n| n as BatchId))
    }

    /// Persist the outcome of a routing pass atomically
    ///
    /// Sealed batches with their data ids, the advanced id sequences and the
    /// channel cursor commit together, or not at all.
    pub async fn record_routing(
        &self,
        channel_id: &str,
        batches: &[Batch],
        cursor: Option<DataId>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for batch in batches {
            let target = batch
                .target_node_id
                .as_deref()
                .ok_or_else(|| Error::State(format!("batch {} has no target", batch.node_batch_id())))?;
            if batch.status != BatchStatus::Routed {
                return Err(Error::State(format!(
                    "batch {} is {}, expected {}",
                    batch.node_batch_id(),
                    batch.status,
                    BatchStatus::Routed
                )));
            }

            tx.execute(
                &format!(
                    "INSERT INTO outgoing_batch ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, NULL, ?9, ?9)",
                    BATCH_COLUMNS
                ),
                params![
                    target,
                    batch.channel_id,
                    batch.batch_id as i64,
                    batch.source_node_id,
                    batch.status.code(),
                    batch.initial_load,
                    batch.event_count() as i64,
                    batch.byte_count as i64,
                    batch.create_time.to_rfc3339(),
                ],
            )?;

            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO batch_event (target_node_id, channel_id, batch_id, position, data_id) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (position, event) in batch.events.iter().enumerate() {
                    if event.source_data_id == 0 {
                        continue;
                    }
                    insert.execute(params![
                        target,
                        batch.channel_id,
                        batch.batch_id as i64,
                        position as i64,
                        event.source_data_id as i64
                    ])?;
                }
            }

            tx.execute(
                "INSERT INTO batch_sequence (target_node_id, channel_id, next_batch_id) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(target_node_id, channel_id) \
                 DO UPDATE SET next_batch_id = MAX(next_batch_id, ?3)",
                params![target, batch.channel_id, (batch.batch_id + 1) as i64],
            )?;
        }

        if let Some(cursor) = cursor {
            tx.execute(
                "INSERT INTO channel_cursor (channel_id, last_data_id) VALUES (?1, ?2) \
                 ON CONFLICT(channel_id) DO UPDATE SET \
                    last_data_id = MAX(last_data_id, ?2), updated_at = ?3",
                params![channel_id, cursor as i64, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub async fn get(&self, key: &BatchKey, batch_id: BatchId) -> Result<Option<OutgoingBatch>> {
        let conn = self.conn.lock().await;
        Self::get_locked(&conn, key, batch_id)
    }

    fn get_locked(conn: &Connection, key: &BatchKey, batch_id: BatchId) -> Result<Option<OutgoingBatch>> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM outgoing_batch \
                     WHERE target_node_id = ?1 AND channel_id = ?2 AND batch_id = ?3",
                    BATCH_COLUMNS
                ),
                params![key.target_node_id, key.channel_id, batch_id as i64],
                batch_from_row,
            )
            .optional()?)
    }

    /// Capture data ids of a batch in batch order
    pub async fn data_ids(&self, key: &BatchKey, batch_id: BatchId) -> Result<Vec<DataId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT data_id FROM batch_event \
             WHERE target_node_id = ?1 AND channel_id = ?2 AND batch_id = ?3 ORDER BY position",
        )?;
        let rows = stmt.query_map(
            params![key.target_node_id, key.channel_id, batch_id as i64],
            |row| Ok(row.get::<_, i64>(0)? as DataId),
        )?;

        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Move a batch to `next`, rejecting transitions the lifecycle forbids
    pub async fn transition(
        &self,
        key: &BatchKey,
        batch_id: BatchId,
        next: BatchStatus,
    ) -> Result<OutgoingBatch> {
        let conn = self.conn.lock().await;
        let batch = Self::get_locked(&conn, key, batch_id)?
            .ok_or_else(|| Error::BatchNotFound(format!("{} #{}", key, batch_id)))?;

        if !batch.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                batch: batch.node_batch_id(),
                from: batch.status.to_string(),
                to: next.to_string(),
            });
        }

        conn.execute(
            "UPDATE outgoing_batch SET status = ?1, last_update_time = ?2 \
             WHERE target_node_id = ?3 AND channel_id = ?4 AND batch_id = ?5",
            params![
                next.code(),
                Utc::now().to_rfc3339(),
                key.target_node_id,
                key.channel_id,
                batch_id as i64
            ],
        )?;
        tracing::debug!("Batch {} {} -> {}", batch.node_batch_id(), batch.status, next);

        Self::get_locked(&conn, key, batch_id)?
            .ok_or_else(|| Error::BatchNotFound(format!("{} #{}", key, batch_id)))
    }

    /// Move a batch to ERROR with its diagnostic and retry schedule
    pub async fn record_failure(
        &self,
        key: &BatchKey,
        batch_id: BatchId,
        failure: &BatchFailure,
        next_retry_time: Option<DateTime<Utc>>,
    ) -> Result<OutgoingBatch> {
        self.transition(key, batch_id, BatchStatus::Error).await?;

        let conn = self.conn.lock().await;
        let failure_json =
            serde_json::to_string(failure).map_err(|e| Error::State(e.to_string()))?;
        conn.execute(
            "UPDATE outgoing_batch SET retry_count = retry_count + 1, failure = ?1, \
                next_retry_time = ?2, last_update_time = ?3 \
             WHERE target_node_id = ?4 AND channel_id = ?5 AND batch_id = ?6",
            params![
                failure_json,
                next_retry_time.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                key.target_node_id,
                key.channel_id,
                batch_id as i64
            ],
        )?;

        Self::get_locked(&conn, key, batch_id)?
            .ok_or_else(|| Error::BatchNotFound(format!("{} #{}", key, batch_id)))
    }

    /// Oldest batch of a sequence that has not reached OK or IGNORED
    pub async fn next_unsettled(&self, key: &BatchKey) -> Result<Option<OutgoingBatch>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM outgoing_batch \
                     WHERE target_node_id = ?1 AND channel_id = ?2 AND status NOT IN (?3, ?4) \
                     ORDER BY batch_id LIMIT 1",
                    BATCH_COLUMNS
                ),
                params![
                    key.target_node_id,
                    key.channel_id,
                    BatchStatus::Ok.code(),
                    BatchStatus::Ignored.code()
                ],
                batch_from_row,
            )
            .optional()?)
    }

    /// Sequences with unsettled batches
    pub async fn pending_keys(&self) -> Result<Vec<BatchKey>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT source_node_id, target_node_id, channel_id FROM outgoing_batch \
             WHERE status NOT IN (?1, ?2) ORDER BY channel_id, target_node_id",
        )?;
        let rows = stmt.query_map(
            params![BatchStatus::Ok.code(), BatchStatus::Ignored.code()],
            |row| {
                Ok(BatchKey {
                    source_node_id: row.get(0)?,
                    target_node_id: row.get(1)?,
                    channel_id: row.get(2)?,
                })
            },
        )?;

        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }

    /// Batches, newest first, optionally restricted to one status
    pub async fn list(&self, status: Option<BatchStatus>, limit: usize) -> Result<Vec<OutgoingBatch>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outgoing_batch WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY create_time DESC, batch_id DESC LIMIT ?2",
            BATCH_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.code()), limit as i64],
            batch_from_row,
        )?;

        let mut batches = Vec::new();
        for batch in rows {
            batches.push(batch?);
        }
        Ok(batches)
    }

    /// Batch counts per status code
    pub async fn status_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM outgoing_batch GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut counts = Vec::new();
        for count in rows {
            counts.push(count?);
        }
        Ok(counts)
    }

    /// Drop data id lists of settled batches
    pub async fn cleanup_settled(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM batch_event WHERE EXISTS (
                SELECT 1 FROM outgoing_batch b
                WHERE b.target_node_id = batch_event.target_node_id
                  AND b.channel_id = batch_event.channel_id
                  AND b.batch_id = batch_event.batch_id
                  AND b.status IN (?1, ?2))",
            params![BatchStatus::Ok.code(), BatchStatus::Ignored.code()],
        )?;
        Ok(deleted as u64)
    }
}
