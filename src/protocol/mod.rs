//! Batch Payload Protocol
//!
//! Line-oriented, order-preserving serialization of batches. Each line is a
//! control token (batch header, table switch, commit) or an event line
//! carrying encoded column values.

mod line;
mod reader;
mod writer;

pub use line::{format_line, parse_line};
pub use reader::ProtocolDataReader;
pub use writer::{encode_batch, PayloadWriter};

/// Line tokens
pub mod token {
    pub const NODE_ID: &str = "nodeid";
    pub const BINARY: &str = "binary";
    pub const CHANNEL: &str = "channel";
    pub const BATCH: &str = "batch";
    pub const INITIAL_LOAD: &str = "initial_load";
    pub const IGNORE: &str = "ignore";
    pub const CATALOG: &str = "catalog";
    pub const SCHEMA: &str = "schema";
    pub const TABLE: &str = "table";
    pub const KEYS: &str = "keys";
    pub const COLUMNS: &str = "columns";
    pub const DATA: &str = "data";
    pub const INSERT: &str = "insert";
    pub const RELOAD: &str = "reload";
    pub const OLD: &str = "old";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const SQL: &str = "sql";
    pub const CREATE: &str = "create";
    pub const COMMIT: &str = "commit";
}
