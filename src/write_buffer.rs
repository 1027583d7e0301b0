//! Bounded in-memory accumulator for pending postings.
//!
//! The write buffer is exclusively owned by the ingestion path. Every
//! append is WAL-logged first, then inserted into a per-term sorted list;
//! when the approximate byte footprint crosses the configured budget the
//! owner is told to flush. Flushing writes one new segment, installs it in
//! the manifest, and only then truncates the WAL.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::segment::{ChecksumMode, Posting, Segment, SegmentWriter};
use crate::wal::Wal;

// Rough per-entry footprint used for budget accounting; exact sizes do not
// matter, only that the buffer stays bounded.
const TERM_OVERHEAD: usize = 48;
const POSTING_COST: usize = 24;

/// Bounded buffer of postings not yet flushed to a segment.
#[derive(Debug)]
pub struct WriteBuffer {
    wal: Wal,
    map: BTreeMap<Vec<u8>, Vec<Posting>>,
    buffered_bytes: usize,
    posting_count: usize,
    max_seq: u64,
    budget: usize,
}

impl WriteBuffer {
    /// Open the buffer for an index directory, replaying any write-ahead
    /// log records left behind by a crash.
    pub fn open(dir: &Path, budget: usize, sync_writes: bool) -> Result<WriteBuffer> {
        let (wal, records) = Wal::open(dir, sync_writes)?;

        let mut buffer = WriteBuffer {
            wal,
            map: BTreeMap::new(),
            buffered_bytes: 0,
            posting_count: 0,
            max_seq: 0,
            budget,
        };

        for record in records {
            buffer.insert_in_memory(&record.term, record.posting);
        }

        Ok(buffer)
    }

    /// Log and buffer one posting. Returns `true` when the byte budget has
    /// been reached and the owner should flush.
    pub fn append(&mut self, term: &[u8], posting: Posting) -> Result<bool> {
        self.wal.append(term, posting)?;
        self.insert_in_memory(term, posting);
        Ok(self.buffered_bytes >= self.budget)
    }

    /// Write all buffered postings as one new segment, install it in the
    /// manifest, and truncate the WAL. Returns `None` when the buffer was
    /// empty. This is the sole path by which buffered data becomes durable
    /// segment state.
    pub fn flush(
        &mut self,
        dir: &Path,
        segment_id: u64,
        checksum_mode: ChecksumMode,
        manifest: &Manifest,
    ) -> Result<Option<Arc<Segment>>> {
        if self.map.is_empty() {
            return Ok(None);
        }

        let mut writer = SegmentWriter::new(dir, segment_id)?;
        for (term, postings) in &self.map {
            writer.add_term(term, postings)?;
        }
        let segment = Arc::new(writer.finish(checksum_mode)?);

        manifest.install(vec![Arc::clone(&segment)], &[])?;

        // Only clear state once the segment is durably referenced.
        self.map.clear();
        self.buffered_bytes = 0;
        self.posting_count = 0;
        self.wal.truncate()?;

        Ok(Some(segment))
    }

    /// Point-in-time copy of the buffered postings, for query snapshots.
    pub fn postings_snapshot(&self) -> BTreeMap<Vec<u8>, Vec<Posting>> {
        self.map.clone()
    }

    /// Whether any postings are buffered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of buffered postings.
    pub fn posting_count(&self) -> usize {
        self.posting_count
    }

    /// Approximate in-memory footprint in bytes.
    pub fn byte_usage(&self) -> usize {
        self.buffered_bytes
    }

    /// Current write-ahead log size in bytes.
    pub fn wal_len(&self) -> u64 {
        self.wal.len()
    }

    /// Highest write sequence number seen, across appends and WAL replay.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    fn insert_in_memory(&mut self, term: &[u8], posting: Posting) {
        self.max_seq = self.max_seq.max(posting.seq);
        if !self.map.contains_key(term) {
            self.buffered_bytes += term.len() + TERM_OVERHEAD;
        }
        let list = self.map.entry(term.to_vec()).or_default();

        match list.binary_search_by_key(&posting.doc_ref, |p| p.doc_ref) {
            // Same (term, doc) appended twice: the later write wins.
            Ok(i) => {
                if posting.seq >= list[i].seq {
                    list[i] = posting;
                }
            }
            Err(i) => {
                list.insert(i, posting);
                self.buffered_bytes += POSTING_COST;
                self.posting_count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn posting(doc_ref: u64, payload: u64) -> Posting {
        Posting::new(doc_ref, payload).unwrap()
    }

    #[test]
    fn test_budget_trigger() {
        let temp_dir = TempDir::new().unwrap();
        let mut buffer = WriteBuffer::open(temp_dir.path(), 200, false).unwrap();

        assert!(!buffer.append(b"a", posting(1, 0)).unwrap());
        let mut flagged = false;
        for doc in 2..32 {
            flagged = buffer.append(b"a", posting(doc, 0)).unwrap();
            if flagged {
                break;
            }
        }
        assert!(flagged, "budget was never reached");
    }

    #[test]
    fn test_last_write_wins_in_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let mut buffer = WriteBuffer::open(temp_dir.path(), 1 << 20, false).unwrap();

        buffer.append(b"a", posting(1, 1).with_seq(1)).unwrap();
        buffer.append(b"a", posting(1, 9).with_seq(2)).unwrap();
        buffer.append(b"a", Posting::tombstone(2).with_seq(3)).unwrap();
        // A stale write never replaces a newer one.
        buffer.append(b"a", posting(1, 4).with_seq(1)).unwrap();

        let snapshot = buffer.postings_snapshot();
        let list = snapshot.get(b"a".as_slice()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].payload, 9);
        assert!(list[1].tombstone);
        assert_eq!(buffer.posting_count(), 2);
        assert_eq!(buffer.max_seq(), 3);
    }

    #[test]
    fn test_crash_recovery_restores_buffer() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut buffer = WriteBuffer::open(temp_dir.path(), 1 << 20, true).unwrap();
            buffer.append(b"a", posting(1, 0)).unwrap();
            buffer.append(b"b", posting(2, 0)).unwrap();
            // Dropped without flush, as a crash would leave it.
        }

        let buffer = WriteBuffer::open(temp_dir.path(), 1 << 20, true).unwrap();
        assert_eq!(buffer.posting_count(), 2);
        let snapshot = buffer.postings_snapshot();
        assert_eq!(snapshot.get(b"a".as_slice()).unwrap()[0].doc_ref, 1);
        assert_eq!(snapshot.get(b"b".as_slice()).unwrap()[0].doc_ref, 2);
    }

    #[test]
    fn test_flush_clears_buffer_and_wal() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::create(temp_dir.path()).unwrap();
        let mut buffer = WriteBuffer::open(temp_dir.path(), 1 << 20, false).unwrap();

        buffer.append(b"a", posting(1, 0)).unwrap();
        buffer.append(b"a", posting(2, 0)).unwrap();

        let segment = buffer
            .flush(temp_dir.path(), 1, ChecksumMode::Eager, &manifest)
            .unwrap()
            .unwrap();
        assert_eq!(segment.term_count(), 1);
        assert!(buffer.is_empty());

        // Nothing left to replay.
        drop(buffer);
        let buffer = WriteBuffer::open(temp_dir.path(), 1 << 20, false).unwrap();
        assert!(buffer.is_empty());

        // Flushing an empty buffer is a no-op.
        let mut buffer = buffer;
        assert!(
            buffer
                .flush(temp_dir.path(), 2, ChecksumMode::Eager, &manifest)
                .unwrap()
                .is_none()
        );
    }
}
