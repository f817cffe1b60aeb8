//! Payload Reader
//!
//! Decodes the line-oriented payload format back into batches and events.

use std::io::BufRead;

use async_trait::async_trait;

use super::line::parse_line;
use super::token;
use crate::error::{Error, Result};
use crate::model::{BatchHeader, BinaryEncoding, DataId, EventType, Row, RowEvent, TableIdentity};
use crate::reader::{CancelFlag, DataContext, DataReader, ReaderStatistics};

type Line = (String, Vec<Option<String>>);

/// Where the reader sits within the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BetweenBatches,
    InBatch,
    InTable,
    Finished,
}

/// Data reader over a serialized payload
pub struct ProtocolDataReader<R: BufRead + Send> {
    input: Option<R>,
    line_number: u64,
    peeked: Option<Line>,
    position: Position,
    header: Option<BatchHeader>,
    table: TableIdentity,
    columns: Vec<String>,
    keys: Vec<String>,
    pending_catalog: Option<String>,
    pending_schema: Option<String>,
    pending_data: Option<(DataId, Option<String>)>,
    pending_old: Option<Row>,
    cancel: CancelFlag,
    stats: ReaderStatistics,
}

impl<R: BufRead + Send> ProtocolDataReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: Some(input),
            line_number: 0,
            peeked: None,
            position: Position::BetweenBatches,
            header: None,
            table: TableIdentity::default(),
            columns: Vec::new(),
            keys: Vec::new(),
            pending_catalog: None,
            pending_schema: None,
            pending_data: None,
            pending_old: None,
            cancel: CancelFlag::default(),
            stats: ReaderStatistics::default(),
        }
    }

    fn read_line(&mut self) -> Result<Option<Line>> {
        if let Some(line) = self.peeked.take() {
            return Ok(Some(line));
        }
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };

        loop {
            let mut raw = String::new();
            if input.read_line(&mut raw)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if raw.trim().is_empty() {
                continue;
            }
            return parse_line(&raw).map(Some).map_err(|reason| Error::Malformed {
                reason: format!("payload line {}: {}", self.line_number, reason),
                event: self.partial_event(&raw).map(Box::new),
            });
        }
    }

    fn push_back(&mut self, line: Line) {
        self.peeked = Some(line);
    }

    /// Best-effort event for diagnostics when a data line cannot be parsed
    fn partial_event(&self, raw: &str) -> Option<RowEvent> {
        let token = raw.split(',').next()?.trim();
        let event_type = EventType::from_token(token)?;
        let mut event = RowEvent::delete(self.table.clone(), self.keys.clone(), Vec::new());
        event.event_type = event_type;
        event.column_names = self.columns.clone();
        event.source_data_id = self.pending_data.as_ref().map_or(0, |(id, _)| *id);
        Some(event)
    }

    fn batch_name(&self) -> String {
        self.header
            .as_ref()
            .map(|h| h.node_batch_id())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    fn truncated(&self) -> Error {
        Error::Transport(format!(
            "payload for batch {} ended before its commit marker",
            self.batch_name()
        ))
    }

    fn single_field(token: &str, fields: Vec<Option<String>>) -> Result<Option<String>> {
        match <[Option<String>; 1]>::try_from(fields) {
            Ok([value]) => Ok(value),
            Err(fields) => Err(Error::Malformed {
                reason: format!("'{}' expects one field, found {}", token, fields.len()),
                event: None,
            }),
        }
    }

    fn names(fields: Vec<Option<String>>) -> Vec<String> {
        fields.into_iter().map(Option::unwrap_or_default).collect()
    }

    /// Skip whatever is left of the current batch
    async fn drain_batch(&mut self) -> Result<()> {
        while self.position != Position::BetweenBatches {
            if self.next_table().await?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn apply_table_line(&mut self, token: &str, fields: Vec<Option<String>>) -> Result<()> {
        match token {
            token::CATALOG => self.pending_catalog = Self::single_field(token, fields)?,
            token::SCHEMA => self.pending_schema = Self::single_field(token, fields)?,
            token::TABLE => {
                let name = Self::single_field(token, fields)?.unwrap_or_default();
                self.table = TableIdentity {
                    catalog: self.pending_catalog.take(),
                    schema: self.pending_schema.take(),
                    name,
                };
                self.columns.clear();
                self.keys.clear();
            }
            token::KEYS => self.keys = Self::names(fields),
            token::COLUMNS => self.columns = Self::names(fields),
            _ => {}
        }
        Ok(())
    }

    fn build_event(&mut self, token: &str, fields: Vec<Option<String>>) -> Result<RowEvent> {
        let encoding = self
            .header
            .as_ref()
            .map_or(BinaryEncoding::None, |h| h.binary_encoding);
        let (data_id, transaction_id) = self.pending_data.take().unwrap_or((0, None));
        let old = self.pending_old.take();

        let mut event = match token {
            token::INSERT | token::RELOAD => {
                let mut event = RowEvent::insert(
                    self.table.clone(),
                    self.columns.clone(),
                    self.keys.clone(),
                    fields,
                );
                if token == token::RELOAD {
                    event.event_type = EventType::Reload;
                }
                event
            }
            token::UPDATE => {
                let mut fields = fields;
                let column_count = self.columns.len();
                let keys = if fields.len() >= column_count {
                    fields.split_off(column_count)
                } else {
                    Vec::new()
                };
                let mut event = RowEvent::update(
                    self.table.clone(),
                    self.columns.clone(),
                    self.keys.clone(),
                    fields,
                    None,
                );
                if !keys.is_empty() || !self.keys.is_empty() {
                    event.key_values = keys;
                }
                event
            }
            token::DELETE => {
                let mut event = RowEvent::delete(self.table.clone(), self.keys.clone(), fields);
                event.column_names = self.columns.clone();
                event
            }
            token::SQL | token::CREATE => {
                let script = fields.into_iter().next().flatten().unwrap_or_default();
                if token == token::SQL {
                    RowEvent::sql(self.table.clone(), script)
                } else {
                    RowEvent::create(self.table.clone(), script)
                }
            }
            other => {
                return Err(Error::Internal(format!("'{}' is not an event token", other)));
            }
        };

        event.old_data = old;
        event.source_data_id = data_id;
        event.transaction_id = transaction_id;
        event.binary_encoding = encoding;
        event.validate()?;
        Ok(event)
    }
}

fn is_table_token(token: &str) -> bool {
    matches!(
        token,
        token::CATALOG | token::SCHEMA | token::TABLE | token::KEYS | token::COLUMNS
    )
}

fn is_event_token(token: &str) -> bool {
    matches!(
        token,
        token::DATA
            | token::OLD
            | token::INSERT
            | token::RELOAD
            | token::UPDATE
            | token::DELETE
            | token::SQL
            | token::CREATE
    )
}

#[async_trait]
impl<R: BufRead + Send> DataReader for ProtocolDataReader<R> {
    async fn open(&mut self, context: &DataContext) -> Result<()> {
        self.cancel = context.cancel.clone();
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<BatchHeader>> {
        if self.position == Position::Finished {
            return Ok(None);
        }
        if self.position != Position::BetweenBatches {
            self.drain_batch().await?;
        }

        let mut source_node_id = None;
        let mut channel_id = None;
        let mut batch_id = None;
        let mut binary_encoding = BinaryEncoding::None;
        let mut initial_load = false;

        loop {
            let Some((token, fields)) = self.read_line()? else {
                if batch_id.is_some() {
                    return Err(self.truncated());
                }
                self.position = Position::Finished;
                return Ok(None);
            };

            match token.as_str() {
                token::NODE_ID => source_node_id = Self::single_field(&token, fields)?,
                token::CHANNEL => channel_id = Self::single_field(&token, fields)?,
                token::BINARY => {
                    let value = Self::single_field(&token, fields)?.unwrap_or_default();
                    binary_encoding = value.parse().map_err(|reason: String| Error::Malformed {
                        reason,
                        event: None,
                    })?;
                }
                token::BATCH => {
                    let value = Self::single_field(&token, fields)?.unwrap_or_default();
                    batch_id = Some(value.parse::<u64>().map_err(|e| Error::Malformed {
                        reason: format!("invalid batch id '{}': {}", value, e),
                        event: None,
                    })?);
                }
                token::INITIAL_LOAD => initial_load = true,
                _ if batch_id.is_none() => {
                    tracing::debug!("Skipping '{}' outside of a batch", token);
                }
                _ => {
                    let ignored = token == token::IGNORE;
                    if !ignored {
                        self.push_back((token, fields));
                    }
                    let header = BatchHeader {
                        batch_id: batch_id.unwrap_or_default(),
                        source_node_id: source_node_id.unwrap_or_default(),
                        target_node_id: None,
                        channel_id: channel_id.unwrap_or_else(|| "default".to_string()),
                        binary_encoding,
                        initial_load,
                        ignored,
                    };
                    self.header = Some(header.clone());
                    self.position = Position::InBatch;
                    self.stats.batches += 1;
                    return Ok(Some(header));
                }
            }
        }
    }

    async fn next_table(&mut self) -> Result<Option<TableIdentity>> {
        match self.position {
            Position::BetweenBatches | Position::Finished => return Ok(None),
            Position::InTable => {
                // skip unread events of the current table
                while self.next_event().await?.is_some() {}
            }
            Position::InBatch => {}
        }

        loop {
            let Some((token, fields)) = self.read_line()? else {
                return Err(self.truncated());
            };

            if token == token::COMMIT {
                self.position = Position::BetweenBatches;
                return Ok(None);
            }
            if is_table_token(&token) {
                self.apply_table_line(&token, fields)?;
                continue;
            }
            if is_event_token(&token) {
                self.push_back((token, fields));
                self.position = Position::InTable;
                self.stats.tables += 1;
                return Ok(Some(self.table.clone()));
            }
            tracing::debug!("Skipping unknown token '{}'", token);
        }
    }

    async fn next_event(&mut self) -> Result<Option<RowEvent>> {
        if self.position != Position::InTable {
            return Ok(None);
        }
        self.cancel.check()?;

        loop {
            let Some((token, fields)) = self.read_line()? else {
                return Err(self.truncated());
            };

            match token.as_str() {
                token::DATA => {
                    let mut fields = fields.into_iter();
                    let id = fields.next().flatten().unwrap_or_default();
                    let id = id.parse::<DataId>().map_err(|e| Error::Malformed {
                        reason: format!("invalid data id '{}': {}", id, e),
                        event: None,
                    })?;
                    self.pending_data = Some((id, fields.next().flatten()));
                }
                token::OLD => self.pending_old = Some(fields),
                token::INSERT
                | token::RELOAD
                | token::UPDATE
                | token::DELETE
                | token::SQL
                | token::CREATE => {
                    let event = self.build_event(&token, fields)?;
                    self.stats.events += 1;
                    return Ok(Some(event));
                }
                _ => {
                    self.push_back((token, fields));
                    self.position = Position::InBatch;
                    return Ok(None);
                }
            }
        }
    }

    fn close(&mut self) {
        self.input = None;
        self.peeked = None;
        self.position = Position::Finished;
    }

    fn statistics(&self) -> ReaderStatistics {
        self.stats
    }
}
