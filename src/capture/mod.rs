//! Capture Log Module
//!
//! Durable, append-only log of captured row changes. Every record gets a
//! strictly increasing data id; the order of ids is the commit order at
//! the source.

mod log;
mod record;
mod segment;
mod writer;

pub use log::{CaptureLog, SegmentInfo};
pub use record::CaptureRecord;
pub use writer::CaptureLogWriter;

use std::path::PathBuf;

/// Capture log directory structure
pub struct CapturePaths {
    pub base_dir: PathBuf,
}

impl CapturePaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get path for a specific segment file
    pub fn segment_path(&self, first_id: u64) -> PathBuf {
        self.base_dir.join(format!("capture_{:020}.log", first_id))
    }

    /// Ensure the capture directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}
