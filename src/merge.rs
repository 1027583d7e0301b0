//! Background segment merging.
//!
//! Merging bounds segment count and read amplification: a cohort of live
//! segments is rewritten into one, keyed k-way by term, and installed as a
//! single manifest generation swap. Queries running against an older
//! snapshot keep their inputs alive until they finish.
//!
//! For the same (term, document reference) pair appearing in several
//! cohort members, the posting with the highest write sequence wins, so
//! conflict resolution is stable across any sequence of partial merges.
//! Tombstones are carried forward unless the cohort covers every live
//! segment, in which case there is no older occurrence left to suppress
//! and they are dropped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::manifest::Manifest;
use crate::segment::{ChecksumMode, Posting, Segment, SegmentWriter};

/// How merge cohorts are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Merge the smallest segments first, minimizing rewrite volume.
    #[default]
    SmallestFirst,
    /// Merge the oldest segments first.
    OldestFirst,
}

/// Control messages for the merger thread.
#[derive(Debug)]
pub enum MergerMessage {
    /// Run a merge cycle now instead of waiting for the next tick.
    Wake,
    /// Stop the thread after the current cycle.
    Shutdown,
}

/// Shared state driving merge decisions, used both by the background
/// thread and by explicit full merges.
#[derive(Debug)]
pub struct MergeContext {
    dir: PathBuf,
    manifest: Arc<Manifest>,
    policy: MergePolicy,
    max_live_segments: usize,
    checksum_mode: ChecksumMode,
    next_segment_id: Arc<AtomicU64>,
    merges_completed: AtomicU64,
    // One merge at a time; cycles and explicit full merges must not race.
    merge_lock: Mutex<()>,
}

impl MergeContext {
    pub fn new(
        dir: PathBuf,
        manifest: Arc<Manifest>,
        policy: MergePolicy,
        max_live_segments: usize,
        checksum_mode: ChecksumMode,
        next_segment_id: Arc<AtomicU64>,
    ) -> MergeContext {
        MergeContext {
            dir,
            manifest,
            policy,
            max_live_segments,
            checksum_mode,
            next_segment_id,
            merges_completed: AtomicU64::new(0),
            merge_lock: Mutex::new(()),
        }
    }

    /// Number of merges completed since open.
    pub fn merges_completed(&self) -> u64 {
        self.merges_completed.load(Ordering::Relaxed)
    }

    /// Run one merge cycle if the live segment count exceeds the bound.
    /// Returns `true` if a merge was performed.
    pub fn run_cycle(&self) -> Result<bool> {
        let _guard = self.merge_lock.lock();

        let snapshot = self.manifest.current();
        let live = snapshot.segments().len();
        if live <= self.max_live_segments {
            return Ok(false);
        }

        // Merge just enough members to fall back under the bound.
        let cohort_len = (live - self.max_live_segments + 1).max(2).min(live);
        let cohort = select_cohort(snapshot.segments(), self.policy, cohort_len);
        self.merge_cohort(&cohort, cohort.len() == live)?;
        Ok(true)
    }

    /// Merge every live segment into one, dropping all tombstones. Returns
    /// `true` if a merge was performed.
    pub fn force_merge_all(&self) -> Result<bool> {
        let _guard = self.merge_lock.lock();

        let snapshot = self.manifest.current();
        if snapshot.segments().is_empty() {
            return Ok(false);
        }

        let cohort: Vec<Arc<Segment>> = snapshot.segments().to_vec();
        self.merge_cohort(&cohort, true)?;
        Ok(true)
    }

    fn merge_cohort(&self, cohort: &[Arc<Segment>], drop_tombstones: bool) -> Result<()> {
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst) + 1;
        let merged = merge_segments(&self.dir, id, cohort, drop_tombstones, self.checksum_mode)?;

        let removed: Vec<u64> = cohort.iter().map(|s| s.id()).collect();
        let added = match merged {
            Some(segment) => vec![segment],
            None => Vec::new(),
        };
        self.manifest.install(added, &removed)?;

        self.merges_completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Pick `cohort_len` segments to merge according to the policy.
fn select_cohort(
    segments: &[Arc<Segment>],
    policy: MergePolicy,
    cohort_len: usize,
) -> Vec<Arc<Segment>> {
    let mut candidates: Vec<Arc<Segment>> = segments.to_vec();
    match policy {
        MergePolicy::SmallestFirst => candidates.sort_by_key(|s| (s.size_bytes(), s.id())),
        MergePolicy::OldestFirst => candidates.sort_by_key(|s| s.id()),
    }
    candidates.truncate(cohort_len);
    candidates.sort_by_key(|s| s.id());
    candidates
}

struct HeapEntry {
    term: Vec<u8>,
    postings: Vec<Posting>,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.term == other.term && self.src == other.src
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so BinaryHeap pops the smallest term first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .term
            .cmp(&self.term)
            .then_with(|| other.src.cmp(&self.src))
    }
}

/// Stream-merge a cohort into a single new segment.
///
/// Conflicts on the same (term, document) pair resolve to the posting with
/// the highest write sequence. Returns `None` when every surviving posting
/// was a dropped tombstone and no output segment was needed.
pub fn merge_segments(
    dir: &std::path::Path,
    id: u64,
    cohort: &[Arc<Segment>],
    drop_tombstones: bool,
    checksum_mode: ChecksumMode,
) -> Result<Option<Arc<Segment>>> {
    let mut iters = Vec::with_capacity(cohort.len());
    for segment in cohort {
        iters.push(segment.iter()?);
    }

    let mut heap = BinaryHeap::new();
    for (src, iter) in iters.iter_mut().enumerate() {
        if let Some(item) = iter.next() {
            let (term, mut cursor) = item?;
            let mut postings = Vec::with_capacity(cursor.doc_count() as usize);
            while let Some(p) = cursor.next()? {
                postings.push(p);
            }
            heap.push(HeapEntry {
                term: term.to_vec(),
                postings,
                src,
            });
        }
    }

    let mut writer = SegmentWriter::new(dir, id)?;
    let mut wrote_any = false;

    while let Some(first) = heap.pop() {
        let term = first.term;
        let mut sources = vec![(first.src, first.postings)];
        let mut exhausted = vec![first.src];

        while let Some(next) = heap.peek()
            && next.term == term
        {
            let entry = heap.pop().ok_or_else(|| {
                crate::error::MinidexError::other("merge heap emptied unexpectedly")
            })?;
            sources.push((entry.src, entry.postings));
            exhausted.push(entry.src);
        }

        let merged = merge_postings(sources, drop_tombstones);
        if !merged.is_empty() {
            writer.add_term(&term, &merged)?;
            wrote_any = true;
        }

        for src in exhausted {
            if let Some(item) = iters[src].next() {
                let (term, mut cursor) = item?;
                let mut postings = Vec::with_capacity(cursor.doc_count() as usize);
                while let Some(p) = cursor.next()? {
                    postings.push(p);
                }
                heap.push(HeapEntry {
                    term: term.to_vec(),
                    postings,
                    src,
                });
            }
        }
    }

    if !wrote_any {
        // Writer drop removes the temp file.
        return Ok(None);
    }

    Ok(Some(Arc::new(writer.finish(checksum_mode)?)))
}

/// Combine one term's postings from several sources into one sorted list.
///
/// For a document present in more than one source the posting with the
/// highest write sequence wins; `sources` carries each list's cohort index,
/// which breaks ties among postings that carry no sequence.
fn merge_postings(sources: Vec<(usize, Vec<Posting>)>, drop_tombstones: bool) -> Vec<Posting> {
    let mut all: Vec<(u64, u64, usize, Posting)> = Vec::new();
    for (rank, postings) in sources {
        for posting in postings {
            all.push((posting.doc_ref, posting.seq, rank, posting));
        }
    }
    all.sort_by_key(|&(doc_ref, seq, rank, _)| (doc_ref, seq, rank));

    let mut out = Vec::with_capacity(all.len());
    let mut iter = all.into_iter().peekable();
    while let Some((doc_ref, _, _, mut posting)) = iter.next() {
        while let Some(&(next_doc, _, _, next_posting)) = iter.peek() {
            if next_doc != doc_ref {
                break;
            }
            posting = next_posting;
            iter.next();
        }
        if drop_tombstones && posting.tombstone {
            continue;
        }
        out.push(posting);
    }
    out
}

/// Body of the merger thread: run a cycle on every wake-up or tick, exit
/// on shutdown. Merge failures are reported and retried on the next tick
/// rather than taking the engine down.
pub fn merger_loop(context: Arc<MergeContext>, receiver: Receiver<MergerMessage>, tick: Duration) {
    loop {
        let run = match receiver.recv_timeout(tick) {
            Ok(MergerMessage::Wake) => true,
            Ok(MergerMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if run && let Err(e) = context.run_cycle() {
            eprintln!("minidex: background merge failed: {e}");
        }
    }
}
