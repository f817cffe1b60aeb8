//! WolfSync Configuration
//!
//! This module provides configuration structures for the WolfSync
//! change-capture batch pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::BinaryEncoding;
use crate::route::{Node, RouterType, Subscription};
use crate::writer::{ConflictDetection, WriterSettings};

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Database connection configuration
    pub database: DatabaseConfig,

    /// Capture log configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Routing and batching configuration
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Staging area configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Outgoing push configuration
    #[serde(default)]
    pub push: PushConfig,

    /// Incoming batch loader configuration
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Channels; a single `default` channel is assumed when empty
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Nodes this node may route to
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,

    /// Routing rules
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Node group this node belongs to
    pub group_id: String,

    /// Application-level identifier, used by routers
    #[serde(default)]
    pub external_id: Option<String>,

    /// Data directory for the capture log, staging area and batch store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Supported database platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Mariadb,
    Sqlite,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Platform to connect to
    #[serde(default)]
    pub kind: DatabaseKind,

    /// MariaDB host
    #[serde(default)]
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    #[serde(default)]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// SQLite database file
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// MariaDB connection URL
    pub fn url(&self) -> String {
        match &self.database {
            Some(db) => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, db
            ),
            None => format!(
                "mysql://{}:{}@{}:{}",
                self.user, self.password, self.host, self.port
            ),
        }
    }
}

/// Capture log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Number of records to buffer before flushing
    pub batch_size: usize,

    /// Flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// Enable LZ4 compression for capture records
    pub compression: bool,

    /// Maximum segment size in megabytes
    pub segment_size_mb: u64,

    /// Retention period in hours for fully routed segments (0 = infinite)
    pub retention_hours: u64,

    /// Use fsync for durability (slower but safer)
    pub fsync: bool,

    /// Encoding applied to binary column values
    pub binary_encoding: BinaryEncoding,
}

/// Routing and batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Seal an outgoing batch once it holds this many events
    pub max_batch_events: usize,

    /// Seal an outgoing batch once its payload estimate reaches this size
    pub max_batch_bytes: u64,

    /// Capture records read per routing pass and channel
    pub read_batch_size: usize,

    /// Interval between routing passes in milliseconds
    pub route_interval_ms: u64,
}

/// Staging area configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Payloads below this size stay in memory
    pub memory_threshold_bytes: usize,

    /// Minutes a DONE resource is kept before the sweep removes it
    pub retention_minutes: u64,

    /// Minutes after which an unfinished resource is considered abandoned
    pub stale_create_minutes: u64,

    /// Interval between sweeps in seconds
    pub sweep_interval_secs: u64,
}

/// Outgoing push configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Retries before a failing batch is ignored
    pub max_retries: u32,

    /// Backoff before the first retry in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for the retry backoff in milliseconds
    pub max_backoff_ms: u64,

    /// Interval between push passes in milliseconds
    pub push_interval_ms: u64,
}

/// Incoming batch loader configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoaderConfig {
    /// Commit every N rows within a batch (absent = one transaction per batch)
    #[serde(default)]
    pub max_rows_before_commit: Option<u64>,

    /// How UPDATE/DELETE statements find their target row
    #[serde(default)]
    pub conflict_detection: ConflictDetection,

    /// Log every resolved conflict at info level
    #[serde(default)]
    pub log_conflicts: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// A logical partition of change traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,

    /// Lower values are processed first
    #[serde(default)]
    pub priority: i32,

    /// Per-channel override of `routing.max_batch_events`
    #[serde(default)]
    pub max_batch_events: Option<usize>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A node known to this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// A routing rule as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub id: String,
    pub source_group: String,
    pub target_group: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_router_type")]
    pub router_type: String,
    #[serde(default)]
    pub router_expression: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Table name, or `*` for every table
    #[serde(default = "default_table_filter")]
    pub table: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_channel() -> String {
    "default".to_string()
}

fn default_router_type() -> String {
    "default".to_string()
}

fn default_table_filter() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfsync")
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval_ms: 100,
            compression: true,
            segment_size_mb: 64,
            retention_hours: 0,
            fsync: true,
            binary_encoding: BinaryEncoding::Base64,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_batch_events: 10_000,
            max_batch_bytes: 8 * 1024 * 1024,
            read_batch_size: 50_000,
            route_interval_ms: 10_000,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: 256 * 1024,
            retention_minutes: 60,
            stale_create_minutes: 30,
            sweep_interval_secs: 300,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            push_interval_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PushConfig {
    /// Backoff before retry number `retry` (1-based), capped at the maximum
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl LoaderConfig {
    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            max_rows_before_commit: self.max_rows_before_commit,
            conflict_detection: self.conflict_detection,
            log_conflicts: self.log_conflicts,
        }
    }
}

impl WolfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.group_id.is_empty() {
            return Err(crate::Error::Config("node.group_id cannot be empty".into()));
        }

        match self.database.kind {
            DatabaseKind::Mariadb if self.database.host.is_empty() => {
                return Err(crate::Error::Config("database.host cannot be empty".into()));
            }
            DatabaseKind::Sqlite if self.database.path.is_none() => {
                return Err(crate::Error::Config(
                    "database.path is required for sqlite".into(),
                ));
            }
            _ => {}
        }

        if self.routing.max_batch_events == 0 {
            return Err(crate::Error::Config(
                "routing.max_batch_events must be positive".into(),
            ));
        }

        if self.routing.max_batch_bytes == 0 {
            return Err(crate::Error::Config(
                "routing.max_batch_bytes must be positive".into(),
            ));
        }

        if self.push.initial_backoff_ms > self.push.max_backoff_ms {
            return Err(crate::Error::Config(
                "push.initial_backoff_ms cannot exceed push.max_backoff_ms".into(),
            ));
        }

        if self.loader.max_rows_before_commit == Some(0) {
            return Err(crate::Error::Config(
                "loader.max_rows_before_commit must be positive when set".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if channel.id.is_empty() {
                return Err(crate::Error::Config("channel id cannot be empty".into()));
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate channel id '{}'",
                    channel.id
                )));
            }
            if channel.max_batch_events == Some(0) {
                return Err(crate::Error::Config(format!(
                    "channel '{}' max_batch_events must be positive",
                    channel.id
                )));
            }
        }

        let channels = self.channels();
        for sub in &self.subscriptions {
            if !channels.iter().any(|c| c.id == sub.channel) {
                return Err(crate::Error::Config(format!(
                    "subscription '{}' references unknown channel '{}'",
                    sub.id, sub.channel
                )));
            }
            sub.to_subscription()?;
        }

        Ok(())
    }

    /// Configured channels, or the implicit `default` channel
    pub fn channels(&self) -> Vec<ChannelConfig> {
        if self.channels.is_empty() {
            vec![ChannelConfig {
                id: default_channel(),
                priority: 0,
                max_batch_events: None,
                enabled: true,
            }]
        } else {
            let mut channels = self.channels.clone();
            channels.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
            channels
        }
    }

    /// Parsed routing rules
    pub fn subscriptions(&self) -> crate::Result<Vec<Subscription>> {
        self.subscriptions
            .iter()
            .map(SubscriptionConfig::to_subscription)
            .collect()
    }

    /// This node as a routing participant
    pub fn local_node(&self) -> Node {
        Node {
            id: self.node.id.clone(),
            group_id: self.node.group_id.clone(),
            external_id: self.node.external_id.clone(),
        }
    }

    /// Known remote nodes
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(NodeEntry::to_node).collect()
    }

    /// Batch size limit for a channel
    pub fn max_batch_events(&self, channel_id: &str) -> usize {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .and_then(|c| c.max_batch_events)
            .unwrap_or(self.routing.max_batch_events)
    }

    /// Get the capture log directory path
    pub fn capture_dir(&self) -> PathBuf {
        self.node.data_dir.join("capture")
    }

    /// Get the staging directory path
    pub fn staging_dir(&self) -> PathBuf {
        self.node.data_dir.join("staging")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get route interval as Duration
    pub fn route_interval(&self) -> Duration {
        Duration::from_millis(self.routing.route_interval_ms)
    }
}

impl NodeEntry {
    pub fn to_node(&self) -> Node {
        Node {
            id: self.id.clone(),
            group_id: self.group_id.clone(),
            external_id: self.external_id.clone(),
        }
    }
}

impl SubscriptionConfig {
    pub fn to_subscription(&self) -> crate::Result<Subscription> {
        let router_type: RouterType = self.router_type.parse()?;
        Ok(Subscription {
            id: self.id.clone(),
            source_group_id: self.source_group.clone(),
            target_group_id: self.target_group.clone(),
            channel_id: self.channel.clone(),
            router_type,
            router_expression: self.router_expression.clone().unwrap_or_default(),
            priority: self.priority,
            table: self.table.clone(),
            enabled: self.enabled,
        })
    }
}
