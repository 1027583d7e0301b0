//! The embedded engine façade.
//!
//! [`Engine`] owns one index directory: the manifest, the write buffer and
//! its write-ahead log, and an optional background merger thread. It is
//! safe to share across threads; ingestion serializes on the buffer lock
//! while queries run lock-free against snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MinidexError, Result};
use crate::manifest::{Manifest, Snapshot};
use crate::merge::{MergeContext, MergePolicy, MergerMessage, merger_loop};
use crate::query::{Query, ScoredDoc};
use crate::segment::{ChecksumMode, Posting};
use crate::wal::MAX_TERM_LEN;
use crate::write_buffer::WriteBuffer;

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// Tunables for an [`Engine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Write buffer byte budget; crossing it triggers an automatic flush.
    pub buffer_budget_bytes: usize,
    /// Fsync the write-ahead log on every append. Slower, but an ingested
    /// posting survives any crash once `ingest` returns.
    pub sync_writes: bool,
    /// When segment checksums are verified.
    pub checksum_mode: ChecksumMode,
    /// How merge cohorts are chosen.
    pub merge_policy: MergePolicy,
    /// Live segment count above which the merger kicks in.
    pub max_live_segments: usize,
    /// Run the merger on its own background thread.
    pub background_merge: bool,
    /// Idle interval between background merge checks.
    pub merge_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            buffer_budget_bytes: 16 << 20,
            sync_writes: true,
            checksum_mode: ChecksumMode::default(),
            merge_policy: MergePolicy::default(),
            max_live_segments: 8,
            background_merge: true,
            merge_interval_ms: 1_000,
        }
    }
}

/// Point-in-time counters, taken without blocking ingestion for long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub generation: u64,
    pub live_segments: usize,
    pub buffered_postings: usize,
    pub buffered_bytes: usize,
    pub wal_bytes: u64,
    pub merges_completed: u64,
    /// Segments found corrupt at open and set aside as `*.corrupt` files.
    pub quarantined_segments: Vec<u64>,
}

/// An open index: the single entry point of the crate.
pub struct Engine {
    dir: PathBuf,
    config: EngineConfig,
    manifest: Arc<Manifest>,
    buffer: Mutex<WriteBuffer>,
    next_segment_id: Arc<AtomicU64>,
    // Write sequence counter; every ingested or deleted posting gets the
    // next value, and conflict resolution follows it across merges.
    next_seq: AtomicU64,
    merge_context: Arc<MergeContext>,
    merger_tx: Option<Sender<MergerMessage>>,
    merger: Option<JoinHandle<()>>,
    state: AtomicU8,
    // Set after a write-ahead log failure; further ingestion is refused
    // because durability can no longer be promised.
    wal_poisoned: AtomicBool,
    quarantined: Vec<u64>,
}

impl Engine {
    /// Open (or create) the index in `dir`, recovering any write-ahead log
    /// left behind by a crash.
    pub fn open(dir: &Path, config: EngineConfig) -> Result<Engine> {
        let (manifest, quarantined) = Manifest::open(dir, config.checksum_mode)?;
        if !quarantined.is_empty() {
            eprintln!(
                "minidex: opened {} with {} quarantined segment(s)",
                dir.display(),
                quarantined.len()
            );
        }
        let manifest = Arc::new(manifest);

        let buffer = WriteBuffer::open(dir, config.buffer_budget_bytes, config.sync_writes)?;
        // Quarantined ids count too: their files still exist as `*.corrupt`
        // and a reused id would make the stats ambiguous.
        let max_quarantined = quarantined.iter().copied().max().unwrap_or(0);
        let next_segment_id = Arc::new(AtomicU64::new(
            manifest.max_segment_id().max(max_quarantined),
        ));
        let next_seq = AtomicU64::new(manifest.max_seq().max(buffer.max_seq()));

        let merge_context = Arc::new(MergeContext::new(
            dir.to_path_buf(),
            Arc::clone(&manifest),
            config.merge_policy,
            config.max_live_segments,
            config.checksum_mode,
            Arc::clone(&next_segment_id),
        ));

        let (merger_tx, merger) = if config.background_merge {
            let (tx, rx) = crossbeam_channel::unbounded();
            let context = Arc::clone(&merge_context);
            let tick = Duration::from_millis(config.merge_interval_ms);
            let handle = std::thread::Builder::new()
                .name("minidex-merger".to_string())
                .spawn(move || merger_loop(context, rx, tick))?;
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Ok(Engine {
            dir: dir.to_path_buf(),
            config,
            manifest,
            buffer: Mutex::new(buffer),
            next_segment_id,
            next_seq,
            merge_context,
            merger_tx,
            merger,
            state: AtomicU8::new(STATE_OPEN),
            wal_poisoned: AtomicBool::new(false),
            quarantined,
        })
    }

    /// Index directory this engine was opened on.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Add one (term, document) pair with a ranking payload. Once this
    /// returns with `sync_writes` on, the pair survives a crash.
    pub fn ingest(&self, term: &[u8], doc_ref: u64, payload: u64) -> Result<()> {
        self.append(term, Posting::new(doc_ref, payload)?)
    }

    /// Delete one (term, document) pair. The deletion masks any earlier
    /// occurrence in segments or buffer and is itself crash-durable.
    pub fn delete(&self, term: &[u8], doc_ref: u64) -> Result<()> {
        self.append(term, Posting::tombstone(doc_ref))
    }

    fn append(&self, term: &[u8], posting: Posting) -> Result<()> {
        self.check_writable()?;
        if term.is_empty() {
            return Err(MinidexError::invalid_argument("term must not be empty"));
        }
        if term.len() > MAX_TERM_LEN {
            return Err(MinidexError::invalid_argument(format!(
                "term length {} exceeds the {MAX_TERM_LEN} byte limit",
                term.len()
            )));
        }

        let over_budget = {
            // Sequence assignment happens under the buffer lock so WAL
            // order matches sequence order.
            let mut buffer = self.buffer.lock();
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
            match buffer.append(term, posting.with_seq(seq)) {
                Ok(flag) => flag,
                Err(e) => {
                    self.wal_poisoned.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        };

        if over_budget {
            self.flush()?;
        }
        Ok(())
    }

    /// Persist the write buffer as a new segment and truncate the
    /// write-ahead log. Returns the new segment's id, or `None` when the
    /// buffer was empty.
    pub fn flush(&self) -> Result<Option<u64>> {
        self.check_open()?;

        let segment = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(None);
            }
            let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst) + 1;
            buffer.flush(&self.dir, id, self.config.checksum_mode, &self.manifest)?
        };

        if let Some(tx) = &self.merger_tx {
            let _ = tx.send(MergerMessage::Wake);
        }
        Ok(segment.map(|s| s.id()))
    }

    /// A point-in-time view combining all live segments with the current
    /// buffer contents. Queries against it are repeatable: later flushes
    /// and merges do not affect it.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.check_open()?;
        // Buffer lock first: a segment installed between the two reads can
        // only duplicate a buffered posting, and the overlay wins those.
        let overlay = Arc::new(self.buffer.lock().postings_snapshot());
        Ok(self.manifest.current().with_overlay(overlay))
    }

    /// Run a query and collect every match in ascending document order.
    pub fn search(&self, query: &Query) -> Result<Vec<ScoredDoc>> {
        let snapshot = self.snapshot()?;
        crate::query::execute(&snapshot, query)?.collect()
    }

    /// Run a query and keep the `k` best-scoring matches.
    pub fn top_k(&self, query: &Query, k: usize) -> Result<Vec<ScoredDoc>> {
        let snapshot = self.snapshot()?;
        crate::query::top_k(&snapshot, query, k)
    }

    /// Flush, then merge every live segment into one, dropping all
    /// tombstones. Blocks until the merge completes.
    pub fn force_merge(&self) -> Result<()> {
        self.check_open()?;
        self.flush()?;
        self.merge_context.force_merge_all()?;
        Ok(())
    }

    /// Current engine counters.
    pub fn stats(&self) -> EngineStats {
        let (buffered_postings, buffered_bytes, wal_bytes) = {
            let buffer = self.buffer.lock();
            (buffer.posting_count(), buffer.byte_usage(), buffer.wal_len())
        };
        EngineStats {
            generation: self.manifest.generation(),
            live_segments: self.manifest.live_segment_count(),
            buffered_postings,
            buffered_bytes,
            wal_bytes,
            merges_completed: self.merge_context.merges_completed(),
            quarantined_segments: self.quarantined.clone(),
        }
    }

    /// Flush outstanding writes and stop the merger thread. Further calls
    /// on the engine fail with `InvalidOperation`.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let flush_result = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                Ok(None)
            } else {
                let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst) + 1;
                buffer.flush(&self.dir, id, self.config.checksum_mode, &self.manifest)
            }
        };

        if let Some(tx) = self.merger_tx.take() {
            let _ = tx.send(MergerMessage::Shutdown);
        }
        if let Some(handle) = self.merger.take() {
            let _ = handle.join();
        }

        flush_result.map(|_| ())
    }

    fn check_open(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(MinidexError::invalid_operation("engine is closed"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.wal_poisoned.load(Ordering::Acquire) {
            return Err(MinidexError::invalid_operation(
                "ingestion disabled after a write-ahead log failure",
            ));
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
