//! # Append-Only Record Log
//!
//! A single file of framed records, generic over a [`RecordCodec`].
//!
//! ## Frame Layout (little endian)
//!
//! ```text
//! | magic 0x4691 (i16) | body length (u32) | body | crc32(body) (u32) |
//! ```
//!
//! Records are only ever appended, overwritten in place with a frame of
//! the same length, or cut off by truncation.
//!
//! ## Corruption
//!
//! A bad magic, checksum or length ends a scan and is reported through
//! [`ScanStop::Corrupt`], so a clean end and a damaged tail are told
//! apart. Opening a log truncates a damaged tail so that new appends are
//! never hidden behind it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::StorageError;
use crate::ports::RecordCodec;

/// Leading marker of every frame.
pub const RECORD_MAGIC: i16 = 0x4691;

/// Upper bound on a body, rejects absurd lengths in damaged headers.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 6;
const TRAILER_LEN: usize = 4;

/// Bytes a frame adds around its body.
pub const FRAME_OVERHEAD: u64 = (HEADER_LEN + TRAILER_LEN) as u64;

/// A decoded record and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord<T> {
    /// Offset of the frame
    pub offset: u64,
    /// Frame length in bytes
    pub len: u64,
    pub record: T,
}

/// Why a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Reached the end of the log on a frame boundary.
    End,
    /// Hit an undecodable frame.
    Corrupt { offset: u64, reason: String },
}

/// Result of scanning a log file without modifying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Valid records before the stop
    pub records: u64,
    /// Length of the valid prefix
    pub valid_len: u64,
    /// Length of the file on disk
    pub file_len: u64,
    pub stop: ScanStop,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.stop == ScanStop::End
    }
}

/// Append-only file of framed records.
pub struct RecordLog<C: RecordCodec> {
    path: PathBuf,
    file: File,
    len: u64,
    codec: C,
    frame: Vec<u8>,
}

impl<C: RecordCodec> RecordLog<C> {
    /// Open or create the log at `path`, truncating any damaged tail.
    pub fn open(path: impl AsRef<Path>, codec: C) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let report = scan(&codec, &file, file_len)?;

        if let ScanStop::Corrupt { offset, reason } = &report.stop {
            warn!(
                path = %path.display(),
                offset,
                dropped = file_len - report.valid_len,
                %reason,
                "Truncating damaged log tail"
            );
            file.set_len(report.valid_len)?;
            file.sync_all()?;
        }

        debug!(
            path = %path.display(),
            records = report.records,
            len = report.valid_len,
            "Opened record log"
        );

        Ok(Self {
            path,
            file,
            len: report.valid_len,
            codec,
            frame: Vec::new(),
        })
    }

    /// Scan the log at `path` read-only.
    pub fn inspect(path: impl AsRef<Path>, codec: &C) -> Result<ScanReport, StorageError> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        Ok(scan(codec, &file, file_len)?)
    }

    /// Append `record` and return the offset of its frame.
    pub fn append(&mut self, record: &C::Record) -> Result<u64, StorageError> {
        self.codec.validate(record)?;
        self.encode_frame(record)?;

        let offset = self.len;
        if let Err(e) = self.write_frame(offset) {
            // Drop whatever part of the frame reached the file.
            if let Err(cut) = self.file.set_len(offset) {
                warn!(
                    path = %self.path.display(),
                    offset,
                    error = %cut,
                    "Could not cut off a partly written frame"
                );
            }
            return Err(e.into());
        }
        self.len += self.frame.len() as u64;
        Ok(offset)
    }

    /// Overwrite the record at `offset` with one of the same frame length.
    pub fn write_at(&mut self, offset: u64, record: &C::Record) -> Result<(), StorageError> {
        self.codec.validate(record)?;
        self.encode_frame(record)?;

        let expected = self.frame_len_at(offset)?;
        let actual = self.frame.len() as u64;
        if expected != actual {
            return Err(StorageError::LengthMismatch {
                offset,
                expected,
                actual,
            });
        }
        self.write_frame(offset)?;
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64) -> Result<C::Record, StorageError> {
        self.read_record_at(offset).map(|r| r.record)
    }

    /// Read one record with its location.
    pub fn read_record_at(&mut self, offset: u64) -> Result<LogRecord<C::Record>, StorageError> {
        if offset >= self.len {
            return Err(StorageError::RecordNotFound {
                offset,
                len: self.len,
            });
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;

        let mut body = Vec::new();
        match read_frame(&self.codec, &mut file, self.len - offset, &mut body) {
            Ok((record, len)) => Ok(LogRecord {
                offset,
                len,
                record,
            }),
            Err(FrameError::Io(e)) => Err(e.into()),
            Err(FrameError::Corrupt(reason)) => Err(StorageError::Corrupt { offset, reason }),
        }
    }

    /// Lazily decode records from `offset` to the end of the log.
    pub fn read_from(&mut self, offset: u64) -> Result<RecordIter<'_, C>, StorageError> {
        if offset > self.len {
            return Err(StorageError::RecordNotFound {
                offset,
                len: self.len,
            });
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;

        Ok(RecordIter {
            codec: &self.codec,
            reader: BufReader::new(file),
            path: &self.path,
            pos: offset,
            end: self.len,
            body: Vec::new(),
            stop: None,
        })
    }

    /// Drop every byte at or after `len`.
    pub fn truncate(&mut self, len: u64) -> Result<(), StorageError> {
        if len > self.len {
            return Err(StorageError::invalid(format!(
                "cannot truncate {} bytes to {len}",
                self.len
            )));
        }
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Frame length `record` would occupy.
    pub fn encoded_len(&self, record: &C::Record) -> u64 {
        let mut body = Vec::new();
        self.codec.encode(record, &mut body);
        FRAME_OVERHEAD + body.len() as u64
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn encode_frame(&mut self, record: &C::Record) -> Result<(), StorageError> {
        self.frame.clear();
        self.frame.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        self.frame.extend_from_slice(&[0u8; 4]);
        self.codec.encode(record, &mut self.frame);

        let body_len = self.frame.len() - HEADER_LEN;
        let body_len = u32::try_from(body_len)
            .ok()
            .filter(|len| *len <= MAX_BODY_LEN)
            .ok_or_else(|| {
                StorageError::invalid(format!("record body of {body_len} bytes is too large"))
            })?;
        self.frame[2..HEADER_LEN].copy_from_slice(&body_len.to_le_bytes());

        let crc = crc32fast::hash(&self.frame[HEADER_LEN..]);
        self.frame.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    fn write_frame(&mut self, offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&self.frame)
    }

    fn frame_len_at(&mut self, offset: u64) -> Result<u64, StorageError> {
        if offset + FRAME_OVERHEAD > self.len {
            return Err(StorageError::RecordNotFound {
                offset,
                len: self.len,
            });
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;

        let (magic, body_len) = parse_header(&header);
        if magic != RECORD_MAGIC {
            return Err(StorageError::Corrupt {
                offset,
                reason: format!("bad magic {magic:#06x}"),
            });
        }
        let frame_len = FRAME_OVERHEAD + body_len as u64;
        if frame_len > self.len - offset {
            return Err(StorageError::Corrupt {
                offset,
                reason: "record runs past end of log".into(),
            });
        }
        Ok(frame_len)
    }
}

/// Iterator returned by [`RecordLog::read_from`].
pub struct RecordIter<'a, C: RecordCodec> {
    codec: &'a C,
    reader: BufReader<&'a File>,
    path: &'a Path,
    pos: u64,
    end: u64,
    body: Vec<u8>,
    stop: Option<ScanStop>,
}

impl<C: RecordCodec> RecordIter<'_, C> {
    /// Why iteration ended, once it has.
    pub fn stop(&self) -> Option<&ScanStop> {
        self.stop.as_ref()
    }
}

impl<C: RecordCodec> Iterator for RecordIter<'_, C> {
    type Item = LogRecord<C::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop.is_some() {
            return None;
        }
        if self.pos >= self.end {
            self.stop = Some(ScanStop::End);
            return None;
        }

        let offset = self.pos;
        match read_frame(self.codec, &mut self.reader, self.end - offset, &mut self.body) {
            Ok((record, len)) => {
                self.pos += len;
                Some(LogRecord {
                    offset,
                    len,
                    record,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(path = %self.path.display(), offset, %reason, "Record scan stopped early");
                self.stop = Some(ScanStop::Corrupt { offset, reason });
                None
            }
        }
    }
}

enum FrameError {
    Io(io::Error),
    Corrupt(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "read failed: {e}"),
            FrameError::Corrupt(reason) => f.write_str(reason),
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Corrupt("unexpected end of file".into())
        } else {
            FrameError::Io(e)
        }
    }
}

fn parse_header(header: &[u8; HEADER_LEN]) -> (i16, u32) {
    let magic = i16::from_le_bytes([header[0], header[1]]);
    let body_len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    (magic, body_len)
}

/// Read one frame, `remaining` bytes of log being left at the reader.
fn read_frame<C: RecordCodec, R: Read>(
    codec: &C,
    reader: &mut R,
    remaining: u64,
    body: &mut Vec<u8>,
) -> Result<(C::Record, u64), FrameError> {
    if remaining < FRAME_OVERHEAD {
        return Err(FrameError::Corrupt("truncated frame".into()));
    }
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let (magic, body_len) = parse_header(&header);
    if magic != RECORD_MAGIC {
        return Err(FrameError::Corrupt(format!("bad magic {magic:#06x}")));
    }
    if body_len > MAX_BODY_LEN {
        return Err(FrameError::Corrupt(format!("body length {body_len} too large")));
    }
    let frame_len = FRAME_OVERHEAD + body_len as u64;
    if frame_len > remaining {
        return Err(FrameError::Corrupt("record runs past end of log".into()));
    }

    body.resize(body_len as usize, 0);
    reader.read_exact(body)?;
    let mut crc = [0u8; TRAILER_LEN];
    reader.read_exact(&mut crc)?;
    if u32::from_le_bytes(crc) != crc32fast::hash(body) {
        return Err(FrameError::Corrupt("checksum mismatch".into()));
    }

    let record = codec
        .decode(body)
        .map_err(|e| FrameError::Corrupt(e.to_string()))?;
    Ok((record, frame_len))
}

fn scan<C: RecordCodec>(codec: &C, file: &File, file_len: u64) -> io::Result<ScanReport> {
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;

    let mut body = Vec::new();
    let mut pos = 0u64;
    let mut records = 0u64;
    let stop = loop {
        if pos >= file_len {
            break ScanStop::End;
        }
        match read_frame(codec, &mut reader, file_len - pos, &mut body) {
            Ok((_, len)) => {
                pos += len;
                records += 1;
            }
            Err(FrameError::Io(e)) => return Err(e),
            Err(FrameError::Corrupt(reason)) => break ScanStop::Corrupt { offset: pos, reason },
        }
    };

    Ok(ScanReport {
        records,
        valid_len: pos,
        file_len,
        stop,
    })
}
