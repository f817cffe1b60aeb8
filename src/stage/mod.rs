//! Staging Module
//!
//! Intermediate home of batch payloads between extraction and transmission
//! on the sending side, and between reception and load on the receiving
//! side. Small payloads stay in memory; larger ones spill to disk.

mod manager;

pub use manager::{StageReader, StageWriter, StagingManager, StagingSettings, SweepReport};

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::model::{BatchId, BatchKey};

/// Which side of the pipeline a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "outgoing" => Some(Direction::Outgoing),
            "incoming" => Some(Direction::Incoming),
            _ => None,
        }
    }
}

/// Identity of a staged payload
///
/// `node_id` is the target node for outgoing payloads and the source node
/// for incoming ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageKey {
    pub direction: Direction,
    pub node_id: String,
    pub channel_id: String,
    pub batch_id: BatchId,
}

impl StageKey {
    pub fn outgoing(key: &BatchKey, batch_id: BatchId) -> Self {
        Self {
            direction: Direction::Outgoing,
            node_id: key.target_node_id.clone(),
            channel_id: key.channel_id.clone(),
            batch_id,
        }
    }

    pub fn incoming(source_node_id: &str, channel_id: &str, batch_id: BatchId) -> Self {
        Self {
            direction: Direction::Incoming,
            node_id: source_node_id.to_string(),
            channel_id: channel_id.to_string(),
            batch_id,
        }
    }

    /// Path of the payload file below the staging root, without extension
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.direction.as_str())
            .join(&self.node_id)
            .join(&self.channel_id)
            .join(format!("{:020}", self.batch_id))
    }

    /// Reverse of `relative_path`; `None` for foreign files
    fn from_relative_path(path: &Path) -> Option<Self> {
        let parts: Vec<&str> = path.iter().filter_map(|p| p.to_str()).collect();
        let [direction, node_id, channel_id, file] = parts.as_slice() else {
            return None;
        };
        Some(Self {
            direction: Direction::from_str(direction)?,
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            batch_id: file.parse().ok()?,
        })
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.direction.as_str(),
            self.node_id,
            self.channel_id,
            self.batch_id
        )
    }
}

/// Lifecycle of a staged payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageState {
    /// A writer is producing the payload
    Creating,
    /// Complete and readable
    Ready,
    /// Consumed; kept until the retention window passes
    Done,
}

impl StageState {
    pub fn extension(&self) -> &'static str {
        match self {
            StageState::Creating => "create",
            StageState::Ready => "ready",
            StageState::Done => "done",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "create" => Some(StageState::Creating),
            "ready" => Some(StageState::Ready),
            "done" => Some(StageState::Done),
            _ => None,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::Creating => "CREATING",
            StageState::Ready => "READY",
            StageState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// A payload's durable intermediate home
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedResource {
    pub key: StageKey,
    pub state: StageState,
    pub size_bytes: u64,
    pub create_time: DateTime<Utc>,
    /// Backing file, or `None` when held in memory
    pub path: Option<PathBuf>,
}

impl StagedResource {
    pub fn in_memory(&self) -> bool {
        self.path.is_none()
    }
}
