//! Capture Log Segment Management
//!
//! Handles individual capture log segment files.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::record::CaptureRecord;
use crate::error::{Error, Result};
use crate::model::DataId;

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"WLFSYNC1";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 40;

/// Per-record framing overhead: length, compression flag, checksum
const FRAME_OVERHEAD: u64 = 4 + 1 + 4;

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// First data id this segment was created for
    pub first_id: DataId,
    /// Last data id written (0 while empty)
    pub last_id: DataId,
    /// Number of records in this segment
    pub record_count: u32,
    /// Whether this segment is sealed (no more writes)
    pub sealed: bool,
}

impl SegmentHeader {
    pub fn new(first_id: DataId) -> Self {
        Self {
            first_id,
            last_id: 0,
            record_count: 0,
            sealed: false,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.first_id.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.last_id.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.record_count.to_le_bytes());
        bytes[32] = self.sealed as u8;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::CaptureLog("Segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::CaptureLog("Invalid segment magic bytes".into()));
        }

        let version = u32::from_le_bytes(le_bytes(&bytes[8..12])?);
        if version != SEGMENT_VERSION {
            return Err(Error::CaptureLog(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        Ok(Self {
            first_id: u64::from_le_bytes(le_bytes(&bytes[12..20])?),
            last_id: u64::from_le_bytes(le_bytes(&bytes[20..28])?),
            record_count: u32::from_le_bytes(le_bytes(&bytes[28..32])?),
            sealed: bytes[32] != 0,
        })
    }
}

fn le_bytes<const N: usize>(slice: &[u8]) -> Result<[u8; N]> {
    slice
        .try_into()
        .map_err(|_| Error::CaptureLog("Segment header field has the wrong width".into()))
}

/// A single capture log segment file
pub struct Segment {
    /// Segment ID (the first data id it was created for)
    pub id: u64,
    pub path: PathBuf,
    file: File,
    /// End of the last complete record
    write_pos: u64,
    header: SegmentHeader,
    max_size: u64,
    compression: bool,
}

impl Segment {
    /// Create a new segment file
    pub fn create(path: PathBuf, first_id: DataId, max_size_mb: u64, compression: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Self {
            id: first_id,
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            header: SegmentHeader::new(first_id),
            max_size: max_size_mb * 1024 * 1024,
            compression,
        };
        segment.write_header()?;

        Ok(segment)
    }

    /// Open an existing segment file, dropping any torn record at its tail
    pub fn open(path: PathBuf, max_size_mb: u64, compression: bool) -> Result<Self> {
        Self::open_with(path, max_size_mb, compression, true)
    }

    /// Open a segment for scanning only; a torn tail is skipped, not removed
    pub fn open_readonly(path: PathBuf, compression: bool) -> Result<Self> {
        Self::open_with(path, 0, compression, false)
    }

    fn open_with(path: PathBuf, max_size_mb: u64, compression: bool, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(writable).open(&path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;
        let file_len = file.seek(SeekFrom::End(0))?;

        let mut segment = Self {
            id: header.first_id,
            path,
            file,
            write_pos: file_len,
            header,
            max_size: max_size_mb * 1024 * 1024,
            compression,
        };
        segment.recover(writable)?;

        Ok(segment)
    }

    /// Rebuild the in-memory header from the records actually on disk
    fn recover(&mut self, truncate: bool) -> Result<()> {
        let file_len = self.write_pos;
        let mut pos = HEADER_SIZE as u64;
        let mut count = 0u32;
        let mut last_id = 0;

        while pos < file_len {
            match self.read_at(pos) {
                Ok((record, next)) => {
                    count += 1;
                    last_id = record.data_id;
                    pos = next;
                }
                Err(e) => {
                    if truncate {
                        tracing::warn!(
                            "Capture segment {} has a damaged tail at offset {}: {}",
                            self.path.display(),
                            pos,
                            e
                        );
                        self.file.set_len(pos)?;
                    }
                    break;
                }
            }
        }

        self.write_pos = pos;
        self.header.record_count = count;
        self.header.last_id = last_id;
        Ok(())
    }

    /// Append a record, returning its offset
    pub fn append(&mut self, record: &CaptureRecord) -> Result<u64> {
        if self.header.sealed {
            return Err(Error::CaptureLog("Segment is sealed".into()));
        }

        let serialized = record.serialize()?;
        let data = if self.compression {
            lz4_flex::compress_prepend_size(&serialized)
        } else {
            serialized
        };

        // Record format: [length: u32][compressed: u8][data: bytes][checksum: u32]
        let record_len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        let required_space = FRAME_OVERHEAD + data.len() as u64;
        if self.write_pos + required_space > self.max_size && self.header.record_count > 0 {
            return Err(Error::CaptureLog("Segment full".into()));
        }

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&record_len.to_le_bytes())?;
        self.file.write_all(&[self.compression as u8])?;
        self.file.write_all(&data)?;
        self.file.write_all(&checksum.to_le_bytes())?;

        let offset = self.write_pos;
        self.write_pos += required_space;
        self.header.record_count += 1;
        self.header.last_id = record.data_id;

        Ok(offset)
    }

    /// Read the record at `pos`, returning it with the offset of the next one
    pub fn read_at(&mut self, pos: u64) -> Result<(CaptureRecord, u64)> {
        let corrupted = |reason: String| Error::CaptureLogCorrupted { offset: pos, reason };

        self.file.seek(SeekFrom::Start(pos))?;

        let mut len_bytes = [0u8; 4];
        self.file
            .read_exact(&mut len_bytes)
            .map_err(|e| corrupted(format!("Short length prefix: {}", e)))?;
        let record_len = u32::from_le_bytes(len_bytes) as u64;

        if pos + FRAME_OVERHEAD + record_len > self.write_pos {
            return Err(corrupted("Record extends past end of segment".into()));
        }

        let mut compressed_flag = [0u8; 1];
        self.file.read_exact(&mut compressed_flag)?;
        let is_compressed = compressed_flag[0] != 0;

        let mut data = vec![0u8; record_len as usize];
        self.file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        self.file.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&data) {
            return Err(corrupted("Checksum mismatch".into()));
        }

        let serialized = if is_compressed {
            lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| corrupted(format!("Decompression failed: {}", e)))?
        } else {
            data
        };

        let record = CaptureRecord::deserialize(&serialized)?;
        Ok((record, pos + FRAME_OVERHEAD + record_len))
    }

    /// Iterate over all records in the segment
    pub fn iter(&mut self) -> SegmentIterator<'_> {
        SegmentIterator {
            segment: self,
            pos: HEADER_SIZE as u64,
        }
    }

    /// Persist the header and flush the segment to disk
    pub fn sync(&mut self) -> Result<()> {
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Seal the segment (no more writes)
    pub fn seal(&mut self) -> Result<()> {
        self.header.sealed = true;
        self.sync()
    }

    /// Check if segment still has space
    pub fn has_space(&self, additional_bytes: usize) -> bool {
        self.write_pos + additional_bytes as u64 <= self.max_size
    }

    pub fn is_sealed(&self) -> bool {
        self.header.sealed
    }

    pub fn first_id(&self) -> DataId {
        self.header.first_id
    }

    pub fn last_id(&self) -> DataId {
        self.header.last_id
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.write_pos
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }
}

/// Iterator over records in a segment
pub struct SegmentIterator<'a> {
    segment: &'a mut Segment,
    pos: u64,
}

impl<'a> Iterator for SegmentIterator<'a> {
    type Item = Result<CaptureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.segment.write_pos {
            return None;
        }

        match self.segment.read_at(self.pos) {
            Ok((record, next)) => {
                self.pos = next;
                Some(Ok(record))
            }
            Err(e) => {
                // Stop iteration on error
                self.pos = self.segment.write_pos;
                Some(Err(e))
            }
        }
    }
}

/// List all segment files in a directory, oldest first
pub fn list_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "log")
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(false, |s| s.starts_with("capture_"))
        {
            segments.push(path);
        }
    }

    // Zero-padded ids sort lexically
    segments.sort();
    Ok(segments)
}
