//! Boolean query evaluation over a snapshot.
//!
//! Queries are trees of term, AND and OR nodes. Evaluation is lazy: every
//! node is a sorted stream of (document reference, score) pairs pulled one
//! at a time, so intersections and unions run as merge-joins without
//! materializing intermediate result sets.
//!
//! A term stream reads all live segments plus the snapshot's buffered
//! overlay in parallel. When the same (term, document) pair occurs in more
//! than one source the write with the highest sequence number wins, no
//! matter which segment a merge moved it into. A winning tombstone
//! suppresses the document.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{MinidexError, Result};
use crate::manifest::Snapshot;
use crate::segment::{Posting, PostingsCursor};

/// A boolean query tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Match documents containing this exact term.
    Term { term: Vec<u8>, boost: f32 },
    /// Match documents matching every child.
    And(Vec<Query>),
    /// Match documents matching at least one child.
    Or(Vec<Query>),
}

impl Query {
    /// A term query with the default boost of 1.0.
    pub fn term(term: impl Into<Vec<u8>>) -> Query {
        Query::Term {
            term: term.into(),
            boost: 1.0,
        }
    }

    /// A term query with an explicit boost.
    pub fn boosted_term(term: impl Into<Vec<u8>>, boost: f32) -> Query {
        Query::Term {
            term: term.into(),
            boost,
        }
    }

    /// Conjunction of the given sub-queries.
    pub fn and(children: Vec<Query>) -> Query {
        Query::And(children)
    }

    /// Disjunction of the given sub-queries.
    pub fn or(children: Vec<Query>) -> Query {
        Query::Or(children)
    }

    /// Reject structurally invalid trees before evaluation starts.
    pub fn validate(&self) -> Result<()> {
        match self {
            Query::Term { term, boost } => {
                if term.is_empty() {
                    return Err(MinidexError::invalid_query("empty term"));
                }
                if !boost.is_finite() || *boost < 0.0 {
                    return Err(MinidexError::invalid_query(format!(
                        "boost must be finite and non-negative, got {boost}"
                    )));
                }
                Ok(())
            }
            Query::And(children) | Query::Or(children) => {
                if children.is_empty() {
                    return Err(MinidexError::invalid_query(
                        "boolean node must have at least one child",
                    ));
                }
                for child in children {
                    child.validate()?;
                }
                Ok(())
            }
        }
    }
}

/// One query match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredDoc {
    pub doc_ref: u64,
    pub score: f32,
}

/// Evaluate a query against a snapshot.
///
/// The returned iterator yields matches in ascending document-reference
/// order and performs all postings decoding lazily as it is driven.
pub fn execute<'a>(snapshot: &'a Snapshot, query: &Query) -> Result<SearchResults<'a>> {
    query.validate()?;
    Ok(SearchResults {
        stream: build_stream(snapshot, query)?,
        failed: false,
    })
}

/// Evaluate a query and keep only the `k` highest-scoring matches,
/// returned in descending score order (ties by ascending document
/// reference).
pub fn top_k(snapshot: &Snapshot, query: &Query, k: usize) -> Result<Vec<ScoredDoc>> {
    let mut heap: BinaryHeap<Reverse<RankedDoc>> = BinaryHeap::with_capacity(k + 1);
    if k == 0 {
        // Still validate and drain errors.
        for item in execute(snapshot, query)? {
            item?;
        }
        return Ok(Vec::new());
    }

    for item in execute(snapshot, query)? {
        let doc = item?;
        heap.push(Reverse(RankedDoc(doc)));
        if heap.len() > k {
            heap.pop();
        }
    }

    let mut out: Vec<ScoredDoc> = heap.into_iter().map(|Reverse(RankedDoc(d))| d).collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.doc_ref.cmp(&b.doc_ref))
    });
    Ok(out)
}

// Ordering wrapper: higher score ranks higher, with lower doc_ref breaking
// ties so eviction from the bounded heap is deterministic.
struct RankedDoc(ScoredDoc);

impl PartialEq for RankedDoc {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for RankedDoc {}

impl PartialOrd for RankedDoc {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedDoc {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .score
            .total_cmp(&other.0.score)
            .then_with(|| other.0.doc_ref.cmp(&self.0.doc_ref))
    }
}

/// Lazy, ordered stream of query matches.
pub struct SearchResults<'a> {
    stream: DocStream<'a>,
    failed: bool,
}

impl Iterator for SearchResults<'_> {
    type Item = Result<ScoredDoc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.stream.next() {
            Ok(Some((doc_ref, score))) => Some(Ok(ScoredDoc { doc_ref, score })),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn build_stream<'a>(snapshot: &'a Snapshot, query: &Query) -> Result<DocStream<'a>> {
    match query {
        Query::Term { term, boost } => {
            Ok(DocStream::Term(TermStream::open(snapshot, term, *boost)?))
        }
        Query::And(children) => {
            let mut streams = Vec::with_capacity(children.len());
            for child in children {
                streams.push(build_stream(snapshot, child)?);
            }
            Ok(DocStream::And(AndStream::new(streams)?))
        }
        Query::Or(children) => {
            let mut streams = Vec::with_capacity(children.len());
            for child in children {
                streams.push(build_stream(snapshot, child)?);
            }
            Ok(DocStream::Or(OrStream::new(streams)?))
        }
    }
}

enum DocStream<'a> {
    Term(TermStream<'a>),
    And(AndStream<'a>),
    Or(OrStream<'a>),
}

impl DocStream<'_> {
    fn next(&mut self) -> Result<Option<(u64, f32)>> {
        match self {
            DocStream::Term(s) => s.next(),
            DocStream::And(s) => s.next(),
            DocStream::Or(s) => s.next(),
        }
    }
}

enum Cursor<'a> {
    Segment(PostingsCursor<'a>),
    Memory(std::slice::Iter<'a, Posting>),
}

impl Cursor<'_> {
    fn next(&mut self) -> Result<Option<Posting>> {
        match self {
            Cursor::Segment(c) => c.next(),
            Cursor::Memory(iter) => Ok(iter.next().copied()),
        }
    }
}

struct Head<'a> {
    // Tie-break rank for postings carrying no write sequence: position in
    // the segment list, with the buffered overlay above every segment.
    rank: u64,
    posting: Posting,
    cursor: Cursor<'a>,
}

/// Merged postings stream for one term across all snapshot sources.
struct TermStream<'a> {
    heads: Vec<Head<'a>>,
    boost: f32,
}

impl<'a> TermStream<'a> {
    fn open(snapshot: &'a Snapshot, term: &[u8], boost: f32) -> Result<TermStream<'a>> {
        let mut heads = Vec::new();

        for (rank, segment) in snapshot.segments().iter().enumerate() {
            if let Some(cursor) = segment.lookup(term)? {
                push_head(&mut heads, rank as u64, Cursor::Segment(cursor))?;
            }
        }
        if let Some(postings) = snapshot.overlay().get(term) {
            push_head(&mut heads, u64::MAX, Cursor::Memory(postings.iter()))?;
        }

        Ok(TermStream { heads, boost })
    }

    fn next(&mut self) -> Result<Option<(u64, f32)>> {
        loop {
            let Some(doc_ref) = self.heads.iter().map(|h| h.posting.doc_ref).min() else {
                return Ok(None);
            };

            // The newest write at this document wins; advance every source
            // positioned on it.
            let mut winner: Option<((u64, u64), Posting)> = None;
            let mut index = 0;
            while index < self.heads.len() {
                if self.heads[index].posting.doc_ref != doc_ref {
                    index += 1;
                    continue;
                }
                let head = &mut self.heads[index];
                let key = (head.posting.seq, head.rank);
                if winner.is_none_or(|(best, _)| key > best) {
                    winner = Some((key, head.posting));
                }
                match head.cursor.next()? {
                    Some(posting) => {
                        head.posting = posting;
                        index += 1;
                    }
                    None => {
                        self.heads.swap_remove(index);
                    }
                }
            }

            let (_, posting) = winner
                .ok_or_else(|| MinidexError::other("term stream lost its minimum head"))?;
            if posting.tombstone {
                continue;
            }
            return Ok(Some((doc_ref, self.boost * (posting.payload as f32 + 1.0))));
        }
    }
}

fn push_head<'a>(heads: &mut Vec<Head<'a>>, rank: u64, mut cursor: Cursor<'a>) -> Result<()> {
    if let Some(posting) = cursor.next()? {
        heads.push(Head {
            rank,
            posting,
            cursor,
        });
    }
    Ok(())
}

/// Merge-join intersection. A match's score is the sum of child scores.
struct AndStream<'a> {
    children: Vec<DocStream<'a>>,
    current: Vec<Option<(u64, f32)>>,
    exhausted: bool,
}

impl<'a> AndStream<'a> {
    fn new(mut children: Vec<DocStream<'a>>) -> Result<AndStream<'a>> {
        let mut current = Vec::with_capacity(children.len());
        let mut exhausted = false;
        for child in &mut children {
            let head = child.next()?;
            exhausted |= head.is_none();
            current.push(head);
        }
        Ok(AndStream {
            children,
            current,
            exhausted,
        })
    }

    fn next(&mut self) -> Result<Option<(u64, f32)>> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            let mut target = 0u64;
            for head in &self.current {
                match head {
                    Some((doc_ref, _)) => target = target.max(*doc_ref),
                    None => {
                        self.exhausted = true;
                        return Ok(None);
                    }
                }
            }

            // Leapfrog every lagging child up to the current maximum.
            let mut aligned = true;
            for (child, head) in self.children.iter_mut().zip(self.current.iter_mut()) {
                while let Some((doc_ref, _)) = head {
                    if *doc_ref >= target {
                        break;
                    }
                    *head = child.next()?;
                    aligned = false;
                }
                if head.is_none() {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
            if !aligned {
                continue;
            }

            let mut score = 0.0f32;
            for head in &self.current {
                if let Some((_, s)) = head {
                    score += s;
                }
            }
            for (child, head) in self.children.iter_mut().zip(self.current.iter_mut()) {
                *head = child.next()?;
            }
            return Ok(Some((target, score)));
        }
    }
}

/// Merge union. A match's score is the sum over children containing it.
struct OrStream<'a> {
    children: Vec<DocStream<'a>>,
    current: Vec<Option<(u64, f32)>>,
}

impl<'a> OrStream<'a> {
    fn new(mut children: Vec<DocStream<'a>>) -> Result<OrStream<'a>> {
        let mut current = Vec::with_capacity(children.len());
        for child in &mut children {
            current.push(child.next()?);
        }
        Ok(OrStream { children, current })
    }

    fn next(&mut self) -> Result<Option<(u64, f32)>> {
        let Some(doc_ref) = self
            .current
            .iter()
            .filter_map(|head| head.map(|(doc_ref, _)| doc_ref))
            .min()
        else {
            return Ok(None);
        };

        let mut score = 0.0f32;
        for (child, head) in self.children.iter_mut().zip(self.current.iter_mut()) {
            if let Some((d, s)) = head
                && *d == doc_ref
            {
                score += *s;
                *head = child.next()?;
            }
        }
        Ok(Some((doc_ref, score)))
    }
}
