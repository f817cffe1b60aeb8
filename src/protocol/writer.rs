//! Payload Writer
//!
//! Serializes batches into the line-oriented payload format.

use std::io::Write;

use super::line::format_line;
use super::token;
use crate::error::Result;
use crate::model::{BatchHeader, BatchId, EventType, RowEvent, TableIdentity};

const NO_FIELDS: [Option<&str>; 0] = [];

/// Streaming encoder for one or more batches
pub struct PayloadWriter<W: Write> {
    out: W,
    /// Table context last written: identity, columns, keys
    table: Option<(TableIdentity, Vec<String>, Vec<String>)>,
    batch_id: Option<BatchId>,
    bytes_written: u64,
}

impl<W: Write> PayloadWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            table: None,
            batch_id: None,
            bytes_written: 0,
        }
    }

    fn line<'a, I>(&mut self, token: &str, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let mut line = format_line(token, fields);
        line.push('\n');
        self.out.write_all(line.as_bytes())?;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    /// Write the batch header lines
    pub fn start_batch(&mut self, header: &BatchHeader) -> Result<()> {
        let batch_id = header.batch_id.to_string();
        self.line(token::NODE_ID, [Some(header.source_node_id.as_str())])?;
        self.line(token::BINARY, [Some(header.binary_encoding.as_str())])?;
        self.line(token::CHANNEL, [Some(header.channel_id.as_str())])?;
        self.line(token::BATCH, [Some(batch_id.as_str())])?;
        if header.initial_load {
            self.line(token::INITIAL_LOAD, NO_FIELDS)?;
        }
        self.table = None;
        self.batch_id = Some(header.batch_id);
        Ok(())
    }

    fn switch_table(&mut self, event: &RowEvent) -> Result<()> {
        let unchanged = self.table.as_ref().map_or(false, |(table, columns, keys)| {
            table == &event.table && columns == &event.column_names && keys == &event.key_names
        });
        if unchanged {
            return Ok(());
        }

        let table = &event.table;
        self.line(token::CATALOG, [table.catalog.as_deref()])?;
        self.line(token::SCHEMA, [table.schema.as_deref()])?;
        self.line(token::TABLE, [Some(table.name.as_str())])?;
        self.line(token::KEYS, event.key_names.iter().map(|k| Some(k.as_str())))?;
        self.line(token::COLUMNS, event.column_names.iter().map(|c| Some(c.as_str())))?;
        self.table = Some((
            table.clone(),
            event.column_names.clone(),
            event.key_names.clone(),
        ));
        Ok(())
    }

    /// Write one event, emitting table context lines when the table changes
    pub fn write_event(&mut self, event: &RowEvent) -> Result<()> {
        self.switch_table(event)?;

        let data_id = event.source_data_id.to_string();
        self.line(
            token::DATA,
            [Some(data_id.as_str()), event.transaction_id.as_deref()],
        )?;

        if let Some(old) = &event.old_data {
            self.line(token::OLD, old.iter().map(|v| v.as_deref()))?;
        }

        let values = event.row_data.iter().map(|v| v.as_deref());
        let keys = event.key_values.iter().map(|v| v.as_deref());
        match event.event_type {
            EventType::Update => self.line(token::UPDATE, values.chain(keys)),
            EventType::Delete => self.line(token::DELETE, keys),
            other => self.line(other.token(), values),
        }
    }

    /// Mark the current batch as abandoned by the sender
    pub fn ignore(&mut self) -> Result<()> {
        self.line(token::IGNORE, NO_FIELDS)
    }

    /// Close the current batch
    pub fn commit(&mut self) -> Result<()> {
        let batch_id = self.batch_id.take().map(|id| id.to_string());
        self.line(token::COMMIT, [batch_id.as_deref()])?;
        self.table = None;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Encode a whole batch into a payload buffer
pub fn encode_batch(header: &BatchHeader, events: &[RowEvent]) -> Result<Vec<u8>> {
    let mut writer = PayloadWriter::new(Vec::new());
    writer.start_batch(header)?;
    if header.ignored {
        writer.ignore()?;
    } else {
        for event in events {
            writer.write_event(event)?;
        }
    }
    writer.commit()?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BinaryEncoding;

    fn header() -> BatchHeader {
        BatchHeader {
            batch_id: 7,
            source_node_id: "corp".into(),
            target_node_id: Some("store-1".into()),
            channel_id: "sale".into(),
            binary_encoding: BinaryEncoding::Base64,
            initial_load: false,
            ignored: false,
        }
    }

    #[test]
    fn test_writes_table_context_once_per_run() {
        let table = TableIdentity::with_schema("app", "item");
        let cols = vec!["id".to_string(), "name".to_string()];
        let keys = vec!["id".to_string()];
        let events = vec![
            RowEvent::insert(table.clone(), cols.clone(), keys.clone(), vec![Some("1".into()), Some("a".into())])
                .with_source_data_id(10),
            RowEvent::update(table.clone(), cols.clone(), keys.clone(), vec![Some("1".into()), Some("b".into())], None)
                .with_source_data_id(11)
                .with_transaction("tx-1"),
        ];

        let payload = String::from_utf8(encode_batch(&header(), &events).unwrap()).unwrap();
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(
            lines,
            vec![
                "nodeid,\"corp\"",
                "binary,\"BASE64\"",
                "channel,\"sale\"",
                "batch,\"7\"",
                "catalog,",
                "schema,\"app\"",
                "table,\"item\"",
                "keys,\"id\"",
                "columns,\"id\",\"name\"",
                "data,\"10\",",
                "insert,\"1\",\"a\"",
                "data,\"11\",\"tx-1\"",
                "update,\"1\",\"b\",\"1\"",
                "commit,\"7\"",
            ]
        );
    }

    #[test]
    fn test_ignore_notice_has_no_events() {
        let mut header = header();
        header.ignored = true;
        let payload = String::from_utf8(encode_batch(&header, &[]).unwrap()).unwrap();
        assert!(payload.contains("\nignore\n"));
        assert!(payload.ends_with("commit,\"7\"\n"));
    }
}
