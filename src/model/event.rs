//! Row Event Types
//!
//! A single captured row change and the metadata needed to replay it
//! on another database.

use serde::{Deserialize, Serialize};

use super::BinaryEncoding;
use crate::error::{Error, Result};

/// Source-assigned, monotonically increasing change identifier
pub type DataId = u64;

/// Encoded column values in column order; `None` is SQL NULL
pub type Row = Vec<Option<String>>;

/// Kind of change carried by a row event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
    /// Raw SQL text to execute on the target
    Sql,
    /// DDL text creating a table on the target
    Create,
    /// Row synthesized by a re-extraction; applied like an insert
    Reload,
}

impl EventType {
    /// Payload token for this event type
    pub fn token(&self) -> &'static str {
        match self {
            EventType::Insert => "insert",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Sql => "sql",
            EventType::Create => "create",
            EventType::Reload => "reload",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "insert" => Some(EventType::Insert),
            "update" => Some(EventType::Update),
            "delete" => Some(EventType::Delete),
            "sql" => Some(EventType::Sql),
            "create" => Some(EventType::Create),
            "reload" => Some(EventType::Reload),
            _ => None,
        }
    }

    /// Whether the event carries a full row image in `row_data`
    pub fn carries_row(&self) -> bool {
        matches!(self, EventType::Insert | EventType::Update | EventType::Reload)
    }

    /// Whether the event is script text rather than row data
    pub fn is_script(&self) -> bool {
        matches!(self, EventType::Sql | EventType::Create)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token().to_uppercase())
    }
}

/// Catalog/schema/name triple identifying a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TableIdentity {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
}

impl TableIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Dotted name with absent parts omitted
    pub fn qualified_name(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if let Some(catalog) = self.catalog.as_deref().filter(|c| !c.is_empty()) {
            parts.push(catalog);
        }
        if let Some(schema) = self.schema.as_deref().filter(|s| !s.is_empty()) {
            parts.push(schema);
        }
        parts.push(&self.name);
        parts.join(".")
    }
}

impl std::fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// One captured row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub event_type: EventType,
    pub table: TableIdentity,
    /// Column names matching `row_data` and `old_data`
    pub column_names: Vec<String>,
    /// Primary key column names matching `key_values`
    pub key_names: Vec<String>,
    /// New values, or the script text for SQL/CREATE events
    pub row_data: Row,
    /// Pre-image, used for conflict detection
    pub old_data: Option<Row>,
    pub key_values: Row,
    pub source_data_id: DataId,
    /// Source transaction the change committed in
    pub transaction_id: Option<String>,
    pub binary_encoding: BinaryEncoding,
}

impl RowEvent {
    fn base(event_type: EventType, table: TableIdentity) -> Self {
        Self {
            event_type,
            table,
            column_names: Vec::new(),
            key_names: Vec::new(),
            row_data: Vec::new(),
            old_data: None,
            key_values: Vec::new(),
            source_data_id: 0,
            transaction_id: None,
            binary_encoding: BinaryEncoding::None,
        }
    }

    /// Insert event; key values are taken from the row
    pub fn insert(table: TableIdentity, columns: Vec<String>, keys: Vec<String>, row: Row) -> Self {
        let key_values = project(&columns, &keys, &row);
        Self {
            column_names: columns,
            key_names: keys,
            row_data: row,
            key_values,
            ..Self::base(EventType::Insert, table)
        }
    }

    /// Update event; key values come from the pre-image when present
    pub fn update(
        table: TableIdentity,
        columns: Vec<String>,
        keys: Vec<String>,
        row: Row,
        old: Option<Row>,
    ) -> Self {
        let key_values = project(&columns, &keys, old.as_ref().unwrap_or(&row));
        Self {
            column_names: columns,
            key_names: keys,
            row_data: row,
            old_data: old,
            key_values,
            ..Self::base(EventType::Update, table)
        }
    }

    pub fn delete(table: TableIdentity, keys: Vec<String>, key_values: Row) -> Self {
        Self {
            key_names: keys,
            key_values,
            ..Self::base(EventType::Delete, table)
        }
    }

    pub fn reload(table: TableIdentity, columns: Vec<String>, keys: Vec<String>, row: Row) -> Self {
        Self {
            event_type: EventType::Reload,
            ..Self::insert(table, columns, keys, row)
        }
    }

    pub fn sql(table: TableIdentity, sql: impl Into<String>) -> Self {
        Self {
            row_data: vec![Some(sql.into())],
            ..Self::base(EventType::Sql, table)
        }
    }

    pub fn create(table: TableIdentity, ddl: impl Into<String>) -> Self {
        Self {
            row_data: vec![Some(ddl.into())],
            ..Self::base(EventType::Create, table)
        }
    }

    pub fn with_source_data_id(mut self, id: DataId) -> Self {
        self.source_data_id = id;
        self
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_encoding(mut self, encoding: BinaryEncoding) -> Self {
        self.binary_encoding = encoding;
        self
    }

    /// Attach a pre-image; for deletes this also names the columns
    pub fn with_old_data(mut self, columns: Vec<String>, old: Row) -> Self {
        if self.column_names.is_empty() {
            self.column_names = columns;
        }
        self.old_data = Some(old);
        self
    }

    /// Check the arity invariants of the event
    pub fn validate(&self) -> Result<()> {
        if self.table.name.is_empty() && self.event_type != EventType::Sql {
            return Err(Error::malformed("event has no table name", self));
        }

        if self.event_type.is_script() {
            return match self.row_data.as_slice() {
                [Some(_)] => Ok(()),
                _ => Err(Error::malformed(
                    format!("{} event must carry exactly one script value", self.event_type),
                    self,
                )),
            };
        }

        if self.event_type.carries_row() {
            if self.column_names.is_empty() {
                return Err(Error::malformed("row event has no columns", self));
            }
            if self.row_data.len() != self.column_names.len() {
                return Err(Error::malformed(
                    format!(
                        "{} values for {} columns",
                        self.row_data.len(),
                        self.column_names.len()
                    ),
                    self,
                ));
            }
        }

        if !self.key_names.is_empty() && self.key_values.len() != self.key_names.len() {
            return Err(Error::malformed(
                format!(
                    "{} key values for {} key columns",
                    self.key_values.len(),
                    self.key_names.len()
                ),
                self,
            ));
        }

        if matches!(self.event_type, EventType::Update | EventType::Delete) && self.key_values.is_empty() {
            return Err(Error::malformed("event has no key values", self));
        }

        if let Some(old) = &self.old_data {
            if old.len() != self.column_names.len() {
                return Err(Error::malformed(
                    format!(
                        "{} old values for {} columns",
                        old.len(),
                        self.column_names.len()
                    ),
                    self,
                ));
            }
        }

        Ok(())
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }

    /// New value of a column (case-insensitive lookup)
    pub fn value(&self, column: &str) -> Option<&str> {
        if !self.event_type.carries_row() {
            return None;
        }
        self.position(column)
            .and_then(|i| self.row_data.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Pre-image value of a column
    pub fn old_value(&self, column: &str) -> Option<&str> {
        let old = self.old_data.as_ref()?;
        self.position(column)
            .and_then(|i| old.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Primary key value by key column name
    pub fn key_value(&self, key: &str) -> Option<&str> {
        self.key_names
            .iter()
            .position(|k| k.eq_ignore_ascii_case(key))
            .and_then(|i| self.key_values.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Best current value of a column: new image, then pre-image, then key
    pub fn current_value(&self, column: &str) -> Option<&str> {
        self.value(column)
            .or_else(|| self.old_value(column))
            .or_else(|| self.key_value(column))
    }

    /// Script text of a SQL/CREATE event
    pub fn script(&self) -> Option<&str> {
        if self.event_type.is_script() {
            self.row_data.first().and_then(|v| v.as_deref())
        } else {
            None
        }
    }

    /// Rough payload footprint, used for byte thresholds
    pub fn estimated_size(&self) -> u64 {
        let row_bytes = |row: &Row| -> usize {
            row.iter().map(|v| v.as_ref().map_or(1, |s| s.len() + 3)).sum()
        };
        let mut size = 16 + row_bytes(&self.row_data) + row_bytes(&self.key_values);
        if let Some(old) = &self.old_data {
            size += row_bytes(old);
        }
        size as u64
    }

    /// Short identity string for logs and diagnostics
    pub fn describe(&self) -> String {
        format!(
            "{} on {} (data id {})",
            self.event_type, self.table, self.source_data_id
        )
    }
}

/// Pick the values of `keys` out of a row laid out by `columns`
fn project(columns: &[String], keys: &[String], row: &Row) -> Row {
    keys.iter()
        .map(|key| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(key))
                .and_then(|i| row.get(i).cloned())
                .flatten()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(values: &[Option<&str>]) -> Row {
        values.iter().map(|v| v.map(|s| s.to_string())).collect()
    }

    #[test]
    fn test_insert_derives_keys() {
        let event = RowEvent::insert(
            TableIdentity::new("users"),
            cols(&["id", "name"]),
            cols(&["id"]),
            row(&[Some("1"), Some("Alice")]),
        );
        assert_eq!(event.key_values, row(&[Some("1")]));
        assert_eq!(event.value("NAME"), Some("Alice"));
        event.validate().unwrap();
    }

    #[test]
    fn test_update_keys_come_from_old_image() {
        let event = RowEvent::update(
            TableIdentity::new("users"),
            cols(&["id", "name"]),
            cols(&["id"]),
            row(&[Some("2"), Some("Bob")]),
            Some(row(&[Some("1"), Some("Bob")])),
        );
        assert_eq!(event.key_value("id"), Some("1"));
        assert_eq!(event.old_value("id"), Some("1"));
        event.validate().unwrap();
    }

    #[test]
    fn test_column_count_mismatch_is_malformed() {
        let mut event = RowEvent::insert(
            TableIdentity::new("users"),
            cols(&["id", "name"]),
            cols(&["id"]),
            row(&[Some("1"), Some("Alice")]),
        );
        event.row_data.pop();
        let err = event.validate().unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
        assert_eq!(err.event().unwrap().table.name, "users");
    }

    #[test]
    fn test_script_events() {
        let event = RowEvent::sql(TableIdentity::default(), "DELETE FROM audit");
        event.validate().unwrap();
        assert_eq!(event.script(), Some("DELETE FROM audit"));

        let mut bad = RowEvent::create(TableIdentity::new("t"), "CREATE TABLE t (id INT)");
        bad.row_data.push(None);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_delete_requires_keys() {
        let event = RowEvent::delete(TableIdentity::new("t"), vec![], vec![]);
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_qualified_name() {
        let mut table = TableIdentity::with_schema("app", "users");
        assert_eq!(table.qualified_name(), "app.users");
        table.catalog = Some("main".into());
        assert_eq!(table.to_string(), "main.app.users");
    }
}
