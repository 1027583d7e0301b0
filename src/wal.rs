//! Write-ahead log for crash recovery of buffered postings.
//!
//! Every ingested posting is appended here before it reaches the in-memory
//! write buffer, and the log is truncated only after a successful flush.
//! Records are self-checking: a CRC32 trails each one, so replay can tell a
//! torn tail (crash mid-append, silently dropped) from corruption in the
//! middle of the log (reported as `CorruptData`). A frame that fails to
//! decode counts as torn only when it runs into the end of the file;
//! anything undecodable with data still behind it is corruption.
//!
//! Record layout: varint term length, term bytes, varint document
//! reference, varint payload word, varint write sequence, CRC32 of the
//! preceding bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::codec::encode_u64;
use crate::error::{MinidexError, Result};
use crate::segment::Posting;

/// Name of the log file inside an index directory.
pub const WAL_FILE: &str = "wal.log";

/// Upper bound on term length, generous for normalized tokens. Enforced at
/// append time so that a decoded length beyond it can only mean a corrupt
/// record frame, never a torn one.
pub const MAX_TERM_LEN: usize = 4096;

/// One recovered log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub term: Vec<u8>,
    pub posting: Posting,
}

/// Append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    sync_writes: bool,
    len: u64,
}

impl Wal {
    /// Open (or create) the log in `dir` and replay its intact records.
    ///
    /// A torn trailing record is dropped and the file truncated back to the
    /// last intact boundary.
    pub fn open(dir: &Path, sync_writes: bool) -> Result<(Wal, Vec<WalRecord>)> {
        let path = dir.join(WAL_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (records, valid_end) = replay(&data)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if (valid_end as u64) < data.len() as u64 {
            file.set_len(valid_end as u64)?;
            file.sync_data()?;
        }

        Ok((
            Wal {
                file,
                path,
                sync_writes,
                len: valid_end as u64,
            },
            records,
        ))
    }

    /// Append one record. An I/O failure here is fatal for durability and
    /// must disable further ingestion at the engine level.
    pub fn append(&mut self, term: &[u8], posting: Posting) -> Result<()> {
        if term.len() > MAX_TERM_LEN {
            return Err(MinidexError::invalid_argument(format!(
                "term length {} exceeds the {MAX_TERM_LEN} byte limit",
                term.len()
            )));
        }

        let mut buf = Vec::with_capacity(term.len() + 24);
        buf.extend_from_slice(&encode_u64(term.len() as u64));
        buf.extend_from_slice(term);
        buf.extend_from_slice(&encode_u64(posting.doc_ref));
        buf.extend_from_slice(&encode_u64(posting.payload_word()));
        buf.extend_from_slice(&encode_u64(posting.seq));
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        self.file.write_all(&buf).map_err(classify_wal_error)?;
        if self.sync_writes {
            self.file.sync_data().map_err(classify_wal_error)?;
        }
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Empty the log after a successful flush.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.len = 0;
        Ok(())
    }

    /// Current log size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A full disk must surface as `CapacityExceeded` so callers can tell it
/// apart from transient I/O trouble.
fn classify_wal_error(e: io::Error) -> MinidexError {
    match e.kind() {
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
            MinidexError::capacity(format!("write-ahead log device full: {e}"))
        }
        _ => MinidexError::Io(e),
    }
}

/// Walk the raw log bytes and return all intact records plus the offset of
/// the last intact boundary.
fn replay(data: &[u8]) -> Result<(Vec<WalRecord>, usize)> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    let mut valid_end = 0usize;

    'records: while pos < data.len() {
        let start = pos;

        let Some(term_len) = read_varint(data, &mut pos)? else {
            break;
        };
        let term_len = term_len as usize;
        if term_len > MAX_TERM_LEN {
            // Appends reject such terms, so this frame cannot be a
            // truncated suffix of a legitimate record.
            return Err(MinidexError::corrupt(
                "write-ahead log term length out of range",
            ));
        }
        if pos + term_len > data.len() {
            break;
        }
        let term = data[pos..pos + term_len].to_vec();
        pos += term_len;

        // doc ref, payload word, write sequence.
        let mut words = [0u64; 3];
        for word in &mut words {
            let Some(value) = read_varint(data, &mut pos)? else {
                break 'records;
            };
            *word = value;
        }

        if pos + 4 > data.len() {
            break;
        }
        let stored = (&data[pos..pos + 4]).read_u32::<LittleEndian>()?;
        pos += 4;

        let computed = crc32fast::hash(&data[start..pos - 4]);
        if stored != computed {
            if pos == data.len() {
                // Torn final record; drop it.
                break;
            }
            return Err(MinidexError::corrupt(
                "write-ahead log checksum mismatch mid-file",
            ));
        }

        records.push(WalRecord {
            term,
            posting: Posting::from_parts(words[0], words[1], words[2]),
        });
        valid_end = pos;
    }

    Ok((records, valid_end))
}

/// Decode one varint at `pos`, advancing it on success. `None` means the
/// bytes ran out before the terminating byte, which can only happen
/// against the end of the file: a torn record, not corruption.
fn read_varint(data: &[u8], pos: &mut usize) -> Result<Option<u64>> {
    let mut result = 0u64;
    let mut shift = 0u32;
    let mut index = *pos;

    while index < data.len() {
        let byte = data[index];
        index += 1;

        if shift >= 64 {
            return Err(MinidexError::corrupt("write-ahead log varint overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            *pos = index;
            return Ok(Some(result));
        }
        shift += 7;
    }

    Ok(None)
}
