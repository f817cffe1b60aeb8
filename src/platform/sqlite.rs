//! SQLite Platform

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{cell_text, ColumnMeta, Platform, PlatformTransaction, SqlValue, TableMeta};
use crate::error::Result;
use crate::model::TableIdentity;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// SQLite database accessed through a single shared connection
#[derive(Clone)]
pub struct SqlitePlatform {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePlatform {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a script outside of any batch transaction
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
    let mut stmt = conn.prepare(sql)?;
    let width = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(match row.get_ref(i)? {
                ValueRef::Null => SqlValue::Null,
                ValueRef::Integer(v) => SqlValue::Text(v.to_string()),
                ValueRef::Real(v) => SqlValue::Text(v.to_string()),
                ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
            });
        }
        result.push(values);
    }
    Ok(result)
}

fn run_execute(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<u64> {
    let mut stmt = conn.prepare_cached(sql)?;
    let changed = stmt.execute(params_from_iter(params.iter()))?;
    Ok(changed as u64)
}

#[async_trait]
impl Platform for SqlitePlatform {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn metadata_query(&self, table: &TableIdentity) -> (String, Vec<SqlValue>) {
        let sql = match table.schema.as_deref().filter(|s| !s.is_empty()) {
            Some(schema) => format!(
                "SELECT name, type, \"notnull\", pk FROM {}.pragma_table_info(?)",
                self.quote_identifier(schema)
            ),
            None => "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?)".to_string(),
        };
        (sql, vec![SqlValue::Text(table.name.clone())])
    }

    fn parse_metadata(&self, table: &TableIdentity, rows: Vec<Vec<SqlValue>>) -> Option<TableMeta> {
        if rows.is_empty() {
            return None;
        }

        let mut keyed: Vec<(u32, String)> = Vec::new();
        let columns = rows
            .iter()
            .map(|row| {
                let name = cell_text(row, 0);
                let key_position: u32 = cell_text(row, 3).parse().unwrap_or(0);
                if key_position > 0 {
                    keyed.push((key_position, name.clone()));
                }
                ColumnMeta {
                    type_name: cell_text(row, 1),
                    nullable: cell_text(row, 2) != "1",
                    primary_key: key_position > 0,
                    name,
                }
            })
            .collect();
        keyed.sort();

        Some(TableMeta {
            table: table.clone(),
            columns,
            primary_keys: keyed.into_iter().map(|(_, name)| name).collect(),
        })
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let conn = self.conn.lock().await;
        run_query(&conn, sql, params)
    }

    async fn begin(&self) -> Result<Box<dyn PlatformTransaction>> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction { conn, open: true }))
    }
}

/// Transaction holding the connection for its whole lifetime
pub struct SqliteTransaction {
    conn: OwnedMutexGuard<Connection>,
    open: bool,
}

#[async_trait]
impl PlatformTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        run_execute(&self.conn, sql, params)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        run_query(&self.conn, sql, params)
    }

    async fn execute_script(&mut self, script: &str) -> Result<()> {
        self.conn.execute_batch(script)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.open = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback of abandoned SQLite transaction failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn platform() -> SqlitePlatform {
        let platform = SqlitePlatform::open_in_memory().unwrap();
        platform
            .execute_batch(
                "CREATE TABLE item (store_id TEXT NOT NULL, item_id INTEGER NOT NULL, name TEXT, \
                 PRIMARY KEY (item_id, store_id));",
            )
            .await
            .unwrap();
        platform
    }

    #[tokio::test]
    async fn test_table_metadata() {
        let platform = platform().await;
        let meta = platform
            .table_metadata(&TableIdentity::new("item"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.column_names(), vec!["store_id", "item_id", "name"]);
        assert_eq!(meta.primary_keys, vec!["item_id", "store_id"]);
        assert!(!meta.column("STORE_ID").unwrap().nullable);

        assert!(platform
            .table_metadata(&TableIdentity::new("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let platform = platform().await;
        let insert = "INSERT INTO item (store_id, item_id, name) VALUES (?, ?, ?)";

        let mut tx = platform.begin().await.unwrap();
        let params = [
            SqlValue::Text("s1".into()),
            SqlValue::Text("1".into()),
            SqlValue::Null,
        ];
        assert_eq!(tx.execute(insert, &params).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let mut tx = platform.begin().await.unwrap();
        let params = [
            SqlValue::Text("s1".into()),
            SqlValue::Text("2".into()),
            SqlValue::Text("x".into()),
        ];
        tx.execute(insert, &params).await.unwrap();
        drop(tx);

        let rows = platform.query("SELECT item_id, name FROM item", &[]).await.unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Text("1".into()), SqlValue::Null]]);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_unique_violation() {
        let platform = platform().await;
        let insert = "INSERT INTO item (store_id, item_id) VALUES ('s', 1)";
        let mut tx = platform.begin().await.unwrap();
        tx.execute(insert, &[]).await.unwrap();
        let err = tx.execute(insert, &[]).await.unwrap_err();
        assert!(err.is_unique_violation());
        tx.rollback().await.unwrap();
    }
}
