//! Capture Log Reader
//!
//! Read access to the capture log by data id, plus retention.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use super::record::CaptureRecord;
use super::segment::{list_segments, Segment};
use super::CapturePaths;
use crate::error::Result;
use crate::model::DataId;

/// Read handle over the capture log segments
pub struct CaptureLog {
    paths: CapturePaths,
    compression: bool,
    /// Segment index: first data id -> segment path
    segment_index: BTreeMap<DataId, PathBuf>,
}

/// Information about a capture log segment
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub first_id: DataId,
    pub last_id: DataId,
    pub record_count: u32,
    pub size_bytes: u64,
    pub sealed: bool,
}

impl CaptureLog {
    pub fn open(dir: PathBuf, compression: bool) -> Result<Self> {
        let mut log = Self {
            paths: CapturePaths::new(dir),
            compression,
            segment_index: BTreeMap::new(),
        };
        log.refresh_index()?;
        Ok(log)
    }

    /// Pick up segments created since the last refresh
    pub fn refresh_index(&mut self) -> Result<()> {
        self.segment_index.clear();
        for path in list_segments(&self.paths.base_dir)? {
            let segment = Segment::open_readonly(path.clone(), self.compression)?;
            self.segment_index.insert(segment.first_id(), path);
        }
        Ok(())
    }

    /// Segments that may hold ids greater than `after`
    fn segments_after(&self, after: DataId) -> impl Iterator<Item = &PathBuf> {
        let start = self
            .segment_index
            .range(..=after.saturating_add(1))
            .next_back()
            .map(|(id, _)| *id)
            .unwrap_or(0);
        self.segment_index.range(start..).map(|(_, path)| path)
    }

    /// Up to `max` records with ids greater than `after`, optionally for one channel
    pub fn read_after(
        &self,
        channel_id: Option<&str>,
        after: DataId,
        max: usize,
    ) -> Result<Vec<CaptureRecord>> {
        let mut records = Vec::new();
        if max == 0 {
            return Ok(records);
        }

        'outer: for path in self.segments_after(after) {
            let mut segment = Segment::open_readonly(path.clone(), self.compression)?;
            for result in segment.iter() {
                let record = result?;
                if record.data_id <= after {
                    continue;
                }
                if channel_id.map_or(false, |c| c != record.channel_id) {
                    continue;
                }
                records.push(record);
                if records.len() >= max {
                    break 'outer;
                }
            }
        }

        Ok(records)
    }

    /// Records for the given ids, in ascending id order; unknown ids are skipped
    pub fn read_ids(&self, ids: &[DataId]) -> Result<Vec<CaptureRecord>> {
        let mut wanted: Vec<DataId> = ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let Some(&first) = wanted.first() else {
            return Ok(Vec::new());
        };

        let mut records = Vec::with_capacity(wanted.len());
        let mut next = 0;
        'outer: for path in self.segments_after(first.saturating_sub(1)) {
            let mut segment = Segment::open_readonly(path.clone(), self.compression)?;
            for result in segment.iter() {
                let record = result?;
                while next < wanted.len() && wanted[next] < record.data_id {
                    next += 1;
                }
                if next >= wanted.len() {
                    break 'outer;
                }
                if wanted[next] == record.data_id {
                    records.push(record);
                    next += 1;
                }
            }
        }

        Ok(records)
    }

    /// Highest data id on disk
    pub fn last_data_id(&self) -> Result<DataId> {
        for path in self.segment_index.values().rev() {
            let segment = Segment::open_readonly(path.clone(), self.compression)?;
            if segment.record_count() > 0 {
                return Ok(segment.last_id());
            }
        }
        Ok(0)
    }

    pub fn segments(&self) -> Result<Vec<SegmentInfo>> {
        let mut infos = Vec::new();
        for (first_id, path) in &self.segment_index {
            let segment = Segment::open_readonly(path.clone(), self.compression)?;
            infos.push(SegmentInfo {
                path: path.clone(),
                first_id: *first_id,
                last_id: segment.last_id(),
                record_count: segment.record_count(),
                size_bytes: segment.size_bytes(),
                sealed: segment.is_sealed(),
            });
        }
        Ok(infos)
    }

    /// Delete sealed segments fully below `routed_through` and older than `retention`
    pub fn purge(&mut self, routed_through: DataId, retention: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for info in self.segments()? {
            if !info.sealed || info.last_id > routed_through {
                continue;
            }
            let modified = std::fs::metadata(&info.path)?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < retention {
                continue;
            }
            std::fs::remove_file(&info.path)?;
            tracing::info!(
                "Purged capture segment {} (data ids {}..={})",
                info.path.display(),
                info.first_id,
                info.last_id
            );
            removed += 1;
        }

        if removed > 0 {
            self.refresh_index()?;
        }
        Ok(removed)
    }
}
