//! Statement construction for row events

use super::ConflictDetection;
use crate::error::{Error, Result};
use crate::model::RowEvent;
use crate::platform::{Platform, SqlValue, TableMeta};

/// A parameterized statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Event columns that exist in the target table, with their row positions
fn target_columns<'m>(meta: &'m TableMeta, event: &RowEvent) -> Vec<(usize, &'m str)> {
    event
        .column_names
        .iter()
        .enumerate()
        .filter_map(|(i, name)| meta.column(name).map(|c| (i, c.name.as_str())))
        .collect()
}

fn coerce(
    platform: &dyn Platform,
    meta: &TableMeta,
    column: &str,
    value: Option<&str>,
    event: &RowEvent,
) -> Result<SqlValue> {
    platform
        .coerce(meta.column(column), value, event.binary_encoding)
        .map_err(|e| match e {
            Error::Malformed { reason, .. } => Error::malformed(reason, event),
            other => other,
        })
}

/// `WHERE` clause matching the event's row; nulls compare with IS NULL
fn predicate(
    platform: &dyn Platform,
    meta: &TableMeta,
    event: &RowEvent,
    detection: ConflictDetection,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    let mut terms: Vec<(String, Option<String>)> = Vec::new();

    let use_old = detection == ConflictDetection::OldData && event.old_data.is_some();
    if use_old {
        let old = event.old_data.as_deref().unwrap_or_default();
        for (i, name) in target_columns(meta, event) {
            terms.push((name.to_string(), old.get(i).cloned().flatten()));
        }
    } else if !event.key_names.is_empty() {
        for (name, value) in event.key_names.iter().zip(&event.key_values) {
            let column = meta.column(name).map_or(name.as_str(), |c| c.name.as_str());
            terms.push((column.to_string(), value.clone()));
        }
    } else {
        for key in &meta.primary_keys {
            terms.push((key.clone(), event.current_value(key).map(str::to_string)));
        }
    }

    if terms.is_empty() {
        return Err(Error::malformed(
            format!("no key to locate the row in {}", meta.table),
            event,
        ));
    }

    let mut clauses = Vec::with_capacity(terms.len());
    for (column, value) in terms {
        let quoted = platform.quote_identifier(&column);
        match value {
            None => clauses.push(format!("{} IS NULL", quoted)),
            Some(value) => {
                params.push(coerce(platform, meta, &column, Some(&value), event)?);
                clauses.push(format!("{} = {}", quoted, platform.placeholder(params.len())));
            }
        }
    }
    Ok(clauses.join(" AND "))
}

pub fn insert(platform: &dyn Platform, meta: &TableMeta, event: &RowEvent) -> Result<Statement> {
    let columns = target_columns(meta, event);
    if columns.is_empty() {
        return Err(Error::malformed(
            format!("no event column exists in {}", meta.table),
            event,
        ));
    }

    let mut names = Vec::with_capacity(columns.len());
    let mut markers = Vec::with_capacity(columns.len());
    let mut params = Vec::with_capacity(columns.len());
    for (i, name) in columns {
        let value = event.row_data.get(i).and_then(|v| v.as_deref());
        params.push(coerce(platform, meta, name, value, event)?);
        names.push(platform.quote_identifier(name));
        markers.push(platform.placeholder(params.len()));
    }

    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            platform.qualified_table(&meta.table),
            names.join(", "),
            markers.join(", ")
        ),
        params,
    })
}

pub fn update(
    platform: &dyn Platform,
    meta: &TableMeta,
    event: &RowEvent,
    detection: ConflictDetection,
) -> Result<Statement> {
    let columns = target_columns(meta, event);
    if columns.is_empty() {
        return Err(Error::malformed(
            format!("no event column exists in {}", meta.table),
            event,
        ));
    }

    let mut params = Vec::new();
    let mut assignments = Vec::with_capacity(columns.len());
    for (i, name) in columns {
        let value = event.row_data.get(i).and_then(|v| v.as_deref());
        params.push(coerce(platform, meta, name, value, event)?);
        assignments.push(format!(
            "{} = {}",
            platform.quote_identifier(name),
            platform.placeholder(params.len())
        ));
    }
    let condition = predicate(platform, meta, event, detection, &mut params)?;

    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            platform.qualified_table(&meta.table),
            assignments.join(", "),
            condition
        ),
        params,
    })
}

pub fn delete(
    platform: &dyn Platform,
    meta: &TableMeta,
    event: &RowEvent,
    detection: ConflictDetection,
) -> Result<Statement> {
    let mut params = Vec::new();
    let condition = predicate(platform, meta, event, detection, &mut params)?;
    Ok(Statement {
        sql: format!(
            "DELETE FROM {} WHERE {}",
            platform.qualified_table(&meta.table),
            condition
        ),
        params,
    })
}
