//! Incoming batch ledger
//!
//! Bookkeeping table in the target database recording which batches have
//! been loaded. Rows are written inside the load transaction, so the
//! ledger and the applied data can never disagree.

use chrono::Utc;

use crate::error::Result;
use crate::model::{BatchId, BatchStatus};
use crate::platform::{cell_text, Platform, PlatformTransaction, SqlValue};

pub const LEDGER_TABLE: &str = "sync_incoming_batch";

const CREATE_LEDGER: &str = "CREATE TABLE IF NOT EXISTS sync_incoming_batch (
    source_node_id VARCHAR(64) NOT NULL,
    channel_id VARCHAR(64) NOT NULL,
    batch_id BIGINT NOT NULL,
    status CHAR(2) NOT NULL,
    committed_count BIGINT NOT NULL DEFAULT 0,
    failure TEXT,
    last_update_time VARCHAR(40) NOT NULL,
    PRIMARY KEY (source_node_id, channel_id, batch_id)
)";

/// One ledger row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingBatch {
    pub source_node_id: String,
    pub channel_id: String,
    pub batch_id: BatchId,
    pub status: BatchStatus,
    /// Events already committed by early commits
    pub committed_count: u64,
    pub failure: Option<String>,
}

impl IncomingBatch {
    pub fn new(source_node_id: &str, channel_id: &str, batch_id: BatchId, status: BatchStatus) -> Self {
        Self {
            source_node_id: source_node_id.to_string(),
            channel_id: channel_id.to_string(),
            batch_id,
            status,
            committed_count: 0,
            failure: None,
        }
    }
}

fn markers(platform: &dyn Platform, from: usize, count: usize) -> Vec<String> {
    (from..from + count).map(|i| platform.placeholder(i)).collect()
}

pub async fn ensure_table(platform: &dyn Platform) -> Result<()> {
    let mut tx = platform.begin().await?;
    tx.execute_script(CREATE_LEDGER).await?;
    tx.commit().await
}

/// Highest batch id loaded or ignored for a source/channel pair, 0 if none
pub async fn last_settled(
    platform: &dyn Platform,
    tx: &mut dyn PlatformTransaction,
    source_node_id: &str,
    channel_id: &str,
) -> Result<BatchId> {
    let m = markers(platform, 1, 4);
    let sql = format!(
        "SELECT MAX(batch_id) FROM {} WHERE source_node_id = {} AND channel_id = {} \
         AND status IN ({}, {})",
        LEDGER_TABLE, m[0], m[1], m[2], m[3]
    );
    let rows = tx
        .query(
            &sql,
            &[
                SqlValue::Text(source_node_id.to_string()),
                SqlValue::Text(channel_id.to_string()),
                SqlValue::Text(BatchStatus::Ok.code().to_string()),
                SqlValue::Text(BatchStatus::Ignored.code().to_string()),
            ],
        )
        .await?;
    Ok(rows
        .first()
        .map(|row| cell_text(row, 0))
        .and_then(|max| max.parse().ok())
        .unwrap_or(0))
}

pub async fn find(
    platform: &dyn Platform,
    tx: &mut dyn PlatformTransaction,
    source_node_id: &str,
    channel_id: &str,
    batch_id: BatchId,
) -> Result<Option<IncomingBatch>> {
    let m = markers(platform, 1, 3);
    let sql = format!(
        "SELECT status, committed_count, failure FROM {} \
         WHERE source_node_id = {} AND channel_id = {} AND batch_id = {}",
        LEDGER_TABLE, m[0], m[1], m[2]
    );
    let rows = tx
        .query(
            &sql,
            &[
                SqlValue::Text(source_node_id.to_string()),
                SqlValue::Text(channel_id.to_string()),
                SqlValue::Text(batch_id.to_string()),
            ],
        )
        .await?;

    Ok(rows.first().map(|row| IncomingBatch {
        source_node_id: source_node_id.to_string(),
        channel_id: channel_id.to_string(),
        batch_id,
        status: BatchStatus::from_code(&cell_text(row, 0)).unwrap_or(BatchStatus::Error),
        committed_count: cell_text(row, 1).parse().unwrap_or(0),
        failure: row.get(2).and_then(SqlValue::as_text).map(str::to_string),
    }))
}

/// Insert or replace a ledger row
pub async fn record(
    platform: &dyn Platform,
    tx: &mut dyn PlatformTransaction,
    batch: &IncomingBatch,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let status = SqlValue::Text(batch.status.code().to_string());
    let committed = SqlValue::Text(batch.committed_count.to_string());
    let failure = batch
        .failure
        .as_ref()
        .map_or(SqlValue::Null, |f| SqlValue::Text(f.clone()));
    let key = [
        SqlValue::Text(batch.source_node_id.clone()),
        SqlValue::Text(batch.channel_id.clone()),
        SqlValue::Text(batch.batch_id.to_string()),
    ];

    let m = markers(platform, 1, 7);
    let update = format!(
        "UPDATE {} SET status = {}, committed_count = {}, failure = {}, last_update_time = {} \
         WHERE source_node_id = {} AND channel_id = {} AND batch_id = {}",
        LEDGER_TABLE, m[0], m[1], m[2], m[3], m[4], m[5], m[6]
    );
    let mut params = vec![
        status.clone(),
        committed.clone(),
        failure.clone(),
        SqlValue::Text(now.clone()),
    ];
    params.extend(key.iter().cloned());
    if tx.execute(&update, &params).await? > 0 {
        return Ok(());
    }

    let insert = format!(
        "INSERT INTO {} (source_node_id, channel_id, batch_id, status, committed_count, failure, \
         last_update_time) VALUES ({})",
        LEDGER_TABLE,
        m.join(", ")
    );
    let mut params: Vec<SqlValue> = key.into_iter().collect();
    params.extend([status, committed, failure, SqlValue::Text(now)]);
    tx.execute(&insert, &params).await?;
    Ok(())
}

/// Every ledger row for a source node, oldest first
pub async fn list(platform: &dyn Platform, source_node_id: &str) -> Result<Vec<IncomingBatch>> {
    let sql = format!(
        "SELECT channel_id, batch_id, status, committed_count, failure FROM {} \
         WHERE source_node_id = {} ORDER BY channel_id, batch_id",
        LEDGER_TABLE,
        platform.placeholder(1)
    );
    let rows = platform
        .query(&sql, &[SqlValue::Text(source_node_id.to_string())])
        .await?;
    Ok(rows
        .iter()
        .map(|row| IncomingBatch {
            source_node_id: source_node_id.to_string(),
            channel_id: cell_text(row, 0),
            batch_id: cell_text(row, 1).parse().unwrap_or(0),
            status: BatchStatus::from_code(&cell_text(row, 2)).unwrap_or(BatchStatus::Error),
            committed_count: cell_text(row, 3).parse().unwrap_or(0),
            failure: row.get(4).and_then(SqlValue::as_text).map(str::to_string),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SqlitePlatform;

    #[tokio::test]
    async fn test_record_and_settle() {
        let platform = SqlitePlatform::open_in_memory().unwrap();
        ensure_table(&platform).await.unwrap();
        ensure_table(&platform).await.unwrap();

        let mut tx = platform.begin().await.unwrap();
        assert_eq!(last_settled(&platform, tx.as_mut(), "a", "ch").await.unwrap(), 0);

        let mut row = IncomingBatch::new("a", "ch", 1, BatchStatus::Loading);
        row.committed_count = 10;
        record(&platform, tx.as_mut(), &row).await.unwrap();
        assert_eq!(last_settled(&platform, tx.as_mut(), "a", "ch").await.unwrap(), 0);

        row.status = BatchStatus::Ok;
        record(&platform, tx.as_mut(), &row).await.unwrap();
        record(&platform, tx.as_mut(), &IncomingBatch::new("a", "ch", 2, BatchStatus::Ignored))
            .await
            .unwrap();
        assert_eq!(last_settled(&platform, tx.as_mut(), "a", "ch").await.unwrap(), 2);
        assert_eq!(last_settled(&platform, tx.as_mut(), "a", "other").await.unwrap(), 0);

        let found = find(&platform, tx.as_mut(), "a", "ch", 1).await.unwrap().unwrap();
        assert_eq!(found.status, BatchStatus::Ok);
        assert_eq!(found.committed_count, 10);
        tx.commit().await.unwrap();

        let all = list(&platform, "a").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].status, BatchStatus::Ignored);
    }
}
