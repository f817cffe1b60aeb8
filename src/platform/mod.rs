//! Database Platforms
//!
//! The narrow capability interface the readers and the writer use to talk
//! to a database: identifier quoting, value coercion, table metadata and
//! transactional statement execution. One implementation per dialect.

mod mariadb;
mod sqlite;

pub use mariadb::MariaDbPlatform;
pub use sqlite::SqlitePlatform;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DatabaseConfig, DatabaseKind};
use crate::error::{Error, Result};
use crate::model::{BinaryEncoding, TableIdentity};

/// A statement parameter or result value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Text form of the value; bytes are encoded with `encoding`
    pub fn into_encoded(self, encoding: BinaryEncoding) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s),
            SqlValue::Bytes(b) => Some(encoding.encode(&b)),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnMeta {
    /// Whether values of this column travel in the batch binary encoding
    pub fn is_binary(&self) -> bool {
        let upper = self.type_name.to_ascii_uppercase();
        upper.contains("BLOB") || upper.contains("BINARY")
    }
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub table: TableIdentity,
    pub columns: Vec<ColumnMeta>,
    /// Primary key column names in key order
    pub primary_keys: Vec<String>,
}

impl TableMeta {
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Dialect capabilities
#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_identifier(&self, ident: &str) -> String;

    /// Quoted `schema.table` reference; catalogs are not addressed
    fn qualified_table(&self, table: &TableIdentity) -> String {
        match table.schema.as_deref().filter(|s| !s.is_empty()) {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }

    /// Positional parameter marker (1-based)
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// Select-list expression that reads a column back as text
    fn select_column(&self, column: &str) -> String {
        self.quote_identifier(column)
    }

    fn limit_offset(&self, limit: u64, offset: u64) -> String {
        format!(" LIMIT {} OFFSET {}", limit, offset)
    }

    /// Turn an encoded column value into a statement parameter
    fn coerce(
        &self,
        column: Option<&ColumnMeta>,
        value: Option<&str>,
        encoding: BinaryEncoding,
    ) -> Result<SqlValue> {
        let Some(value) = value else {
            return Ok(SqlValue::Null);
        };
        match column {
            Some(column) if column.is_binary() && encoding != BinaryEncoding::None => {
                encoding
                    .decode(value)
                    .map(SqlValue::Bytes)
                    .map_err(|reason| Error::Malformed {
                        reason: format!("column {}: {}", column.name, reason),
                        event: None,
                    })
            }
            _ => Ok(SqlValue::Text(value.to_string())),
        }
    }

    /// Query returning the metadata rows of a table
    fn metadata_query(&self, table: &TableIdentity) -> (String, Vec<SqlValue>);

    /// Build table metadata from the rows of `metadata_query`; `None` if absent
    fn parse_metadata(&self, table: &TableIdentity, rows: Vec<Vec<SqlValue>>) -> Option<TableMeta>;

    async fn table_metadata(&self, table: &TableIdentity) -> Result<Option<TableMeta>> {
        let (sql, params) = self.metadata_query(table);
        let rows = self.query(&sql, &params).await?;
        Ok(self.parse_metadata(table, rows))
    }

    /// Run a read-only statement outside of any batch transaction
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>>;

    async fn begin(&self) -> Result<Box<dyn PlatformTransaction>>;
}

/// An open database transaction
#[async_trait]
pub trait PlatformTransaction: Send {
    /// Execute one statement, returning the affected row count
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>>;

    /// Execute raw SQL text, which may hold several statements
    async fn execute_script(&mut self, script: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Connect to the configured database
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Platform>> {
    match config.kind {
        DatabaseKind::Mariadb => Ok(Arc::new(MariaDbPlatform::connect(config).await?)),
        DatabaseKind::Sqlite => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| Error::Config("database.path is required for sqlite".into()))?;
            Ok(Arc::new(SqlitePlatform::open(path)?))
        }
    }
}

/// Text of a metadata cell
pub(crate) fn cell_text(row: &[SqlValue], index: usize) -> String {
    row.get(index)
        .and_then(SqlValue::as_text)
        .unwrap_or_default()
        .to_string()
}

/// Split SQL text on semicolons, respecting string literals
pub(crate) fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut string_char = '"';
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_string {
            if c == string_char {
                // doubled quote stays inside the literal
                if chars.peek().map(|(_, nc)| *nc == string_char).unwrap_or(false) {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
        } else {
            match c {
                '\'' | '"' | '`' => {
                    in_string = true;
                    string_char = c;
                }
                ';' => {
                    let stmt = sql[start..i].trim();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
    }

    let remaining = sql[start..].trim();
    if !remaining.is_empty() {
        statements.push(remaining);
    }

    statements
}
