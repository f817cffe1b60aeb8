//! MariaDB Platform
//!
//! Statement execution against MariaDB/MySQL through a sqlx pool.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::error::ErrorKind;
use sqlx::mysql::{MySqlArguments, MySqlDatabaseError, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{MySql, MySqlPool, Row, Transaction};

use super::{
    cell_text, split_sql_statements, ColumnMeta, Platform, PlatformTransaction, SqlValue,
    TableMeta,
};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result, SqlErrorKind};
use crate::model::TableIdentity;

/// MariaDB platform over a connection pool
pub struct MariaDbPlatform {
    pool: MySqlPool,
}

impl MariaDbPlatform {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url())
            .await
            .map_err(map_sqlx_error)?;

        tracing::info!("Connected to MariaDB at {}:{}", config.host, config.port);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

/// Classify a sqlx failure; constraint and lock errors get their own kinds
fn map_sqlx_error(e: sqlx::Error) -> Error {
    let kind = match &e {
        sqlx::Error::Database(db) => {
            let number = db.try_downcast_ref::<MySqlDatabaseError>().map(|m| m.number());
            match (db.kind(), number) {
                (ErrorKind::UniqueViolation, _) | (_, Some(1062)) => SqlErrorKind::UniqueViolation,
                (ErrorKind::ForeignKeyViolation, _) | (_, Some(1451 | 1452)) => {
                    SqlErrorKind::ForeignKeyViolation
                }
                // lock wait timeout, deadlock
                (_, Some(1205 | 1213)) => SqlErrorKind::Timeout,
                _ => SqlErrorKind::Other,
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            SqlErrorKind::Connection
        }
        _ => return Error::Database(e),
    };
    Error::Sql {
        kind,
        message: format!("MariaDB error: {}", e),
    }
}

fn bind_all<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [SqlValue],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Bytes(b) => query.bind(b.as_slice()),
        };
    }
    query
}

/// Decode a row without knowing column types up front
fn row_values(row: &MySqlRow) -> Result<Vec<SqlValue>> {
    let mut values = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let value = if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map_or(SqlValue::Null, SqlValue::Text)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
            v.map_or(SqlValue::Null, SqlValue::Bytes)
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map_or(SqlValue::Null, |n| SqlValue::Text(n.to_string()))
        } else if let Ok(v) = row.try_get::<Option<u64>, _>(i) {
            v.map_or(SqlValue::Null, |n| SqlValue::Text(n.to_string()))
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map_or(SqlValue::Null, |n| SqlValue::Text(n.to_string()))
        } else {
            return Err(Error::Internal(format!(
                "column {} has a type that cannot be read as text; select it through CAST",
                i
            )));
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl Platform for MariaDbPlatform {
    fn name(&self) -> &'static str {
        "mariadb"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn select_column(&self, column: &str) -> String {
        let quoted = self.quote_identifier(column);
        format!("IF({0} IS NULL, NULL, CAST({0} AS CHAR)) AS {0}", quoted)
    }

    fn metadata_query(&self, table: &TableIdentity) -> (String, Vec<SqlValue>) {
        let schema = match table.schema.as_deref().filter(|s| !s.is_empty()) {
            Some(schema) => SqlValue::Text(schema.to_string()),
            None => SqlValue::Null,
        };
        (
            "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION"
                .to_string(),
            vec![schema, SqlValue::Text(table.name.clone())],
        )
    }

    fn parse_metadata(&self, table: &TableIdentity, rows: Vec<Vec<SqlValue>>) -> Option<TableMeta> {
        if rows.is_empty() {
            return None;
        }

        let columns: Vec<ColumnMeta> = rows
            .iter()
            .map(|row| ColumnMeta {
                name: cell_text(row, 0),
                type_name: cell_text(row, 1),
                nullable: cell_text(row, 2) == "YES",
                primary_key: cell_text(row, 3) == "PRI",
            })
            .collect();
        let primary_keys = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();

        Some(TableMeta {
            table: table.clone(),
            columns,
            primary_keys,
        })
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(row_values).collect()
    }

    async fn begin(&self) -> Result<Box<dyn PlatformTransaction>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(MariaDbTransaction { tx }))
    }
}

/// Pooled transaction; sqlx rolls it back if dropped unfinished
pub struct MariaDbTransaction {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl PlatformTransaction for MariaDbTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let result = bind_all(sqlx::query(sql), params)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(row_values).collect()
    }

    async fn execute_script(&mut self, script: &str) -> Result<()> {
        for stmt in split_sql_statements(script) {
            tracing::debug!("Executing statement: {}", stmt);
            sqlx::query(stmt)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> MariaDbPlatform {
        let pool = MySqlPoolOptions::new().connect_lazy("mysql://root@localhost:3306/test").unwrap();
        MariaDbPlatform::from_pool(pool)
    }

    #[tokio::test]
    async fn test_quoting_and_select() {
        let platform = platform();
        assert_eq!(platform.quote_identifier("we`ird"), "`we``ird`");
        assert_eq!(
            platform.qualified_table(&TableIdentity::with_schema("app", "users")),
            "`app`.`users`"
        );
        assert_eq!(
            platform.select_column("id"),
            "IF(`id` IS NULL, NULL, CAST(`id` AS CHAR)) AS `id`"
        );
    }

    #[tokio::test]
    async fn test_parse_metadata() {
        let platform = platform();
        let text = |s: &str| SqlValue::Text(s.to_string());
        let rows = vec![
            vec![text("id"), text("int(11)"), text("NO"), text("PRI")],
            vec![text("avatar"), text("varbinary(64)"), text("YES"), text("")],
        ];
        let meta = platform
            .parse_metadata(&TableIdentity::new("users"), rows)
            .unwrap();
        assert_eq!(meta.primary_keys, vec!["id"]);
        assert!(meta.column("avatar").unwrap().is_binary());
        assert!(meta.column("avatar").unwrap().nullable);
        assert!(platform.parse_metadata(&TableIdentity::new("x"), vec![]).is_none());
    }
}
