//! Immutable, memory-mapped index segments.
//!
//! A segment is the on-disk unit of indexed data: a sorted term dictionary
//! pointing into a postings region, with a trailing CRC32 checksum. Segments
//! are written once through [`SegmentWriter`] (temp file, fsync, atomic
//! rename) and never mutated afterwards; they are only superseded by merge
//! output and deleted once no manifest generation references them.
//!
//! The dictionary is parsed into memory at open time and binary-searched for
//! lookups. The postings region stays memory-mapped and is paged in on
//! demand, so total indexed volume may exceed available RAM.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::codec::{DeltaCursor, decode_u64, encode_delta_sequence, encode_u64};
use crate::error::{MinidexError, Result};

const MAGIC: u32 = u32::from_le_bytes(*b"MIDX");
const FORMAT_VERSION: u32 = 1;

/// magic + version + segment id.
const HEADER_LEN: usize = 16;
/// dict offset/len + term count + max sequence + segment id + magic echo + crc.
const TRAILER_LEN: usize = 48;

const SEGMENT_EXT: &str = "seg";
const TMP_EXT: &str = "tmp";

/// When segment checksums are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChecksumMode {
    /// Verify the whole file when the segment is opened.
    Eager,
    /// Verify on first postings access.
    #[default]
    Lazy,
}

/// A single (document reference, payload) entry within a postings list.
///
/// Payloads are small ranking hints (typically a term frequency) and are
/// limited to 63 bits; the remaining bit packs the tombstone flag on disk.
/// The sequence number records write order engine-wide and survives merges
/// unchanged, so the newest write for a (term, document) pair can be
/// identified no matter which segment it ended up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    /// Opaque document reference; strictly increasing within a list.
    pub doc_ref: u64,
    /// Small ranking payload carried alongside the document reference.
    pub payload: u64,
    /// Marks a deletion of this (term, document) pair.
    pub tombstone: bool,
    /// Engine-wide write sequence number; higher means written later.
    pub seq: u64,
}

impl Posting {
    /// Largest representable payload value.
    pub const MAX_PAYLOAD: u64 = (1 << 63) - 1;

    /// Create a regular posting, rejecting payloads that do not fit 63 bits.
    pub fn new(doc_ref: u64, payload: u64) -> Result<Self> {
        if payload > Self::MAX_PAYLOAD {
            return Err(MinidexError::invalid_argument(
                "payload exceeds 63-bit limit",
            ));
        }
        Ok(Posting {
            doc_ref,
            payload,
            tombstone: false,
            seq: 0,
        })
    }

    /// Create a tombstone posting for the given document reference.
    pub fn tombstone(doc_ref: u64) -> Self {
        Posting {
            doc_ref,
            payload: 0,
            tombstone: true,
            seq: 0,
        }
    }

    /// The same posting carrying the given write sequence number.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub(crate) fn payload_word(&self) -> u64 {
        (self.payload << 1) | self.tombstone as u64
    }

    pub(crate) fn from_parts(doc_ref: u64, payload_word: u64, seq: u64) -> Self {
        Posting {
            doc_ref,
            payload: payload_word >> 1,
            tombstone: payload_word & 1 == 1,
            seq,
        }
    }
}

/// One parsed dictionary entry; offsets are absolute into the mapped file.
#[derive(Debug)]
struct DictEntry {
    term_offset: usize,
    term_len: usize,
    postings_offset: usize,
    docs_len: usize,
    postings_len: usize,
    doc_count: u64,
}

/// File name for a segment with the given identifier.
pub fn segment_file_name(id: u64) -> String {
    format!("segment-{id:016x}.{SEGMENT_EXT}")
}

/// Parse a segment identifier back out of a file name, if it is one.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let hex = name
        .strip_prefix("segment-")?
        .strip_suffix(&format!(".{SEGMENT_EXT}"))?;
    u64::from_str_radix(hex, 16).ok()
}

/// An immutable, memory-mapped segment.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    id: u64,
    file_len: u64,
    max_seq: u64,
    mmap: Mmap,
    dict: Vec<DictEntry>,
    verified: AtomicBool,
    defunct: AtomicBool,
}

impl Segment {
    /// Memory-map an existing segment file and parse its dictionary.
    ///
    /// With [`ChecksumMode::Eager`] the file checksum is verified here;
    /// with [`ChecksumMode::Lazy`] verification is deferred to the first
    /// postings access.
    pub fn open(path: &Path, checksum_mode: ChecksumMode) -> Result<Segment> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let len = mmap.len();

        if len < HEADER_LEN + TRAILER_LEN {
            return Err(MinidexError::corrupt("segment file too small"));
        }

        let mut header = &mmap[..HEADER_LEN];
        let magic = header.read_u32::<LittleEndian>()?;
        let version = header.read_u32::<LittleEndian>()?;
        let id = header.read_u64::<LittleEndian>()?;

        if magic != MAGIC {
            return Err(MinidexError::corrupt("bad segment magic"));
        }
        if version != FORMAT_VERSION {
            return Err(MinidexError::corrupt(format!(
                "unsupported segment format version: {version}"
            )));
        }

        let mut trailer = &mmap[len - TRAILER_LEN..];
        let dict_offset = trailer.read_u64::<LittleEndian>()? as usize;
        let dict_len = trailer.read_u64::<LittleEndian>()? as usize;
        let term_count = trailer.read_u64::<LittleEndian>()? as usize;
        let max_seq = trailer.read_u64::<LittleEndian>()?;
        let trailer_id = trailer.read_u64::<LittleEndian>()?;
        let magic_echo = trailer.read_u32::<LittleEndian>()?;

        if magic_echo != MAGIC || trailer_id != id {
            return Err(MinidexError::corrupt("segment trailer mismatch"));
        }
        if dict_offset < HEADER_LEN
            || dict_offset
                .checked_add(dict_len)
                .is_none_or(|end| end != len - TRAILER_LEN)
        {
            return Err(MinidexError::corrupt("segment dictionary out of bounds"));
        }

        let segment = Segment {
            path: path.to_path_buf(),
            id,
            file_len: len as u64,
            max_seq,
            dict: parse_dictionary(&mmap, dict_offset, dict_len, term_count)?,
            mmap,
            verified: AtomicBool::new(false),
            defunct: AtomicBool::new(false),
        };

        if checksum_mode == ChecksumMode::Eager {
            segment.verify_checksum()?;
        }

        Ok(segment)
    }

    /// The segment's identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// On-disk size of the segment in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.file_len
    }

    /// Number of distinct terms in the dictionary.
    pub fn term_count(&self) -> usize {
        self.dict.len()
    }

    /// Highest write sequence number carried by any posting.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the segment as superseded; its file is removed when the last
    /// reference (manifest or outstanding snapshot) drops.
    pub(crate) fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
    }

    /// Point lookup of one term. Returns a cursor over its postings list,
    /// or `None` if the term is not present.
    pub fn lookup(&self, term: &[u8]) -> Result<Option<PostingsCursor<'_>>> {
        self.ensure_verified()?;

        let index = match self
            .dict
            .binary_search_by(|entry| self.term_bytes(entry).cmp(term))
        {
            Ok(index) => index,
            Err(_) => return Ok(None),
        };

        Ok(Some(self.cursor_at(index)?))
    }

    /// Ordered, restartable iteration over (term, postings cursor) pairs.
    pub fn iter(&self) -> Result<TermIter<'_>> {
        self.ensure_verified()?;
        Ok(TermIter {
            segment: self,
            index: 0,
        })
    }

    fn term_bytes(&self, entry: &DictEntry) -> &[u8] {
        &self.mmap[entry.term_offset..entry.term_offset + entry.term_len]
    }

    fn term_at(&self, index: usize) -> &[u8] {
        let entry = &self.dict[index];
        &self.mmap[entry.term_offset..entry.term_offset + entry.term_len]
    }

    fn cursor_at(&self, index: usize) -> Result<PostingsCursor<'_>> {
        let entry = &self.dict[index];
        let block = &self.mmap[entry.postings_offset..entry.postings_offset + entry.postings_len];
        PostingsCursor::new(block, entry.docs_len, entry.doc_count)
    }

    fn ensure_verified(&self) -> Result<()> {
        if self.verified.load(Ordering::Acquire) {
            return Ok(());
        }
        self.verify_checksum()
    }

    fn verify_checksum(&self) -> Result<()> {
        let len = self.mmap.len();
        let stored = (&self.mmap[len - 4..]).read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(&self.mmap[..len - 4]);

        if stored != computed {
            return Err(MinidexError::corrupt(format!(
                "segment {} checksum mismatch",
                self.id
            )));
        }

        self.verified.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.defunct.load(Ordering::Acquire) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn parse_dictionary(
    mmap: &Mmap,
    dict_offset: usize,
    dict_len: usize,
    term_count: usize,
) -> Result<Vec<DictEntry>> {
    let dict_end = dict_offset + dict_len;
    let mut pos = dict_offset;
    let mut entries = Vec::with_capacity(term_count.min(1 << 16));
    let mut prev_term_end = 0usize;

    for _ in 0..term_count {
        let (term_len, n) = decode_u64(&mmap[pos..dict_end])?;
        pos += n;
        let term_len = term_len as usize;
        if pos + term_len > dict_end {
            return Err(MinidexError::corrupt("dictionary term out of bounds"));
        }
        let term_offset = pos;
        pos += term_len;

        let (postings_offset, n) = decode_u64(&mmap[pos..dict_end])?;
        pos += n;
        let (docs_len, n) = decode_u64(&mmap[pos..dict_end])?;
        pos += n;
        let (postings_len, n) = decode_u64(&mmap[pos..dict_end])?;
        pos += n;
        let (doc_count, n) = decode_u64(&mmap[pos..dict_end])?;
        pos += n;

        let postings_offset = postings_offset as usize;
        let postings_len = postings_len as usize;
        let docs_len = docs_len as usize;

        if postings_offset < HEADER_LEN
            || postings_offset + postings_len > dict_offset
            || docs_len > postings_len
        {
            return Err(MinidexError::corrupt("postings block out of bounds"));
        }

        if let Some(last) = entries.last() {
            let last: &DictEntry = last;
            let prev = &mmap[last.term_offset..prev_term_end];
            if mmap[term_offset..term_offset + term_len] <= *prev {
                return Err(MinidexError::corrupt("dictionary terms out of order"));
            }
        }
        prev_term_end = term_offset + term_len;

        entries.push(DictEntry {
            term_offset,
            term_len,
            postings_offset,
            docs_len,
            postings_len,
            doc_count,
        });
    }

    if pos != dict_end {
        return Err(MinidexError::corrupt("trailing bytes in dictionary"));
    }

    Ok(entries)
}

/// Streaming decoder over one term's postings block.
///
/// Holds only the current decode position, so memory stays constant no
/// matter how long the list is.
#[derive(Debug)]
pub struct PostingsCursor<'a> {
    docs: DeltaCursor<'a>,
    payloads: &'a [u8],
    payload_pos: usize,
    doc_count: u64,
}

impl<'a> PostingsCursor<'a> {
    fn new(block: &'a [u8], docs_len: usize, doc_count: u64) -> Result<Self> {
        if docs_len > block.len() {
            return Err(MinidexError::corrupt("postings doc block out of bounds"));
        }
        let docs = DeltaCursor::new(&block[..docs_len])?;
        if docs.remaining() != doc_count {
            return Err(MinidexError::corrupt("postings doc count mismatch"));
        }
        Ok(PostingsCursor {
            docs,
            payloads: &block[docs_len..],
            payload_pos: 0,
            doc_count,
        })
    }

    /// Total number of postings in this list.
    pub fn doc_count(&self) -> u64 {
        self.doc_count
    }

    /// Decode the next posting, or `None` at the end of the list.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Posting>> {
        let Some(doc_ref) = self.docs.next()? else {
            return Ok(None);
        };

        let (payload_word, n) = decode_u64(&self.payloads[self.payload_pos..])?;
        self.payload_pos += n;
        let (seq, n) = decode_u64(&self.payloads[self.payload_pos..])?;
        self.payload_pos += n;

        Ok(Some(Posting::from_parts(doc_ref, payload_word, seq)))
    }
}

/// Ordered iterator over all (term, postings cursor) pairs of a segment.
#[derive(Debug)]
pub struct TermIter<'a> {
    segment: &'a Segment,
    index: usize,
}

impl<'a> Iterator for TermIter<'a> {
    type Item = Result<(&'a [u8], PostingsCursor<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.segment.dict.len() {
            return None;
        }
        let index = self.index;
        self.index += 1;

        let term = self.segment.term_at(index);
        Some(self.segment.cursor_at(index).map(|cursor| (term, cursor)))
    }
}

/// Streaming writer producing a new immutable segment.
///
/// Terms must be added in strictly ascending byte order, each with its
/// postings sorted by document reference. The file only becomes visible
/// at the atomic rename inside [`SegmentWriter::finish`].
#[derive(Debug)]
pub struct SegmentWriter {
    dir: PathBuf,
    id: u64,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    hasher: Hasher,
    position: u64,
    dict: Vec<PendingEntry>,
    last_term: Option<Vec<u8>>,
    max_seq: u64,
    finished: bool,
}

#[derive(Debug)]
struct PendingEntry {
    term: Vec<u8>,
    offset: u64,
    docs_len: u64,
    postings_len: u64,
    doc_count: u64,
}

impl SegmentWriter {
    /// Start writing a new segment in `dir` under the given identifier.
    pub fn new(dir: &Path, id: u64) -> Result<SegmentWriter> {
        let final_path = dir.join(segment_file_name(id));
        let tmp_path = final_path.with_extension(format!("{SEGMENT_EXT}.{TMP_EXT}"));

        let file = File::create(&tmp_path)?;
        let mut writer = SegmentWriter {
            dir: dir.to_path_buf(),
            id,
            tmp_path,
            final_path,
            writer: Some(BufWriter::new(file)),
            hasher: Hasher::new(),
            position: 0,
            dict: Vec::new(),
            last_term: None,
            max_seq: 0,
            finished: false,
        };

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.write_u32::<LittleEndian>(MAGIC)?;
        header.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        header.write_u64::<LittleEndian>(id)?;
        writer.write_bytes(&header)?;

        Ok(writer)
    }

    /// Append one term's postings list. Terms must arrive in ascending
    /// order; postings must be sorted by document reference.
    pub fn add_term(&mut self, term: &[u8], postings: &[Posting]) -> Result<()> {
        if term.is_empty() {
            return Err(MinidexError::invalid_argument("term must not be empty"));
        }
        if postings.is_empty() {
            return Err(MinidexError::invalid_argument(
                "postings list must not be empty",
            ));
        }
        if let Some(last) = &self.last_term
            && term <= last.as_slice()
        {
            return Err(MinidexError::invalid_argument(
                "terms must be added in ascending order",
            ));
        }

        let offset = self.position;

        let docs: Vec<u64> = postings.iter().map(|p| p.doc_ref).collect();
        let doc_block = encode_delta_sequence(&docs)?;

        let mut payloads = Vec::with_capacity(postings.len() * 2);
        for posting in postings {
            payloads.extend_from_slice(&encode_u64(posting.payload_word()));
            payloads.extend_from_slice(&encode_u64(posting.seq));
            self.max_seq = self.max_seq.max(posting.seq);
        }

        self.write_bytes(&doc_block)?;
        self.write_bytes(&payloads)?;

        self.dict.push(PendingEntry {
            term: term.to_vec(),
            offset,
            docs_len: doc_block.len() as u64,
            postings_len: (doc_block.len() + payloads.len()) as u64,
            doc_count: postings.len() as u64,
        });
        self.last_term = Some(term.to_vec());

        Ok(())
    }

    /// Write the dictionary and trailer, fsync, and atomically rename the
    /// temp file into place. Returns the opened segment.
    pub fn finish(mut self, checksum_mode: ChecksumMode) -> Result<Segment> {
        let dict_offset = self.position;
        let term_count = self.dict.len() as u64;

        let mut dict_buf = Vec::new();
        for entry in std::mem::take(&mut self.dict) {
            dict_buf.extend_from_slice(&encode_u64(entry.term.len() as u64));
            dict_buf.extend_from_slice(&entry.term);
            dict_buf.extend_from_slice(&encode_u64(entry.offset));
            dict_buf.extend_from_slice(&encode_u64(entry.docs_len));
            dict_buf.extend_from_slice(&encode_u64(entry.postings_len));
            dict_buf.extend_from_slice(&encode_u64(entry.doc_count));
        }
        self.write_bytes(&dict_buf)?;
        let dict_len = self.position - dict_offset;

        let mut trailer = Vec::with_capacity(TRAILER_LEN - 4);
        trailer.write_u64::<LittleEndian>(dict_offset)?;
        trailer.write_u64::<LittleEndian>(dict_len)?;
        trailer.write_u64::<LittleEndian>(term_count)?;
        trailer.write_u64::<LittleEndian>(self.max_seq)?;
        trailer.write_u64::<LittleEndian>(self.id)?;
        trailer.write_u32::<LittleEndian>(MAGIC)?;
        self.write_bytes(&trailer)?;

        let checksum = self.hasher.clone().finalize();
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| MinidexError::other("segment writer already finished"))?;
        writer.write_u32::<LittleEndian>(checksum)?;

        let file = writer
            .into_inner()
            .map_err(|e| MinidexError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;
        File::open(&self.dir)?.sync_all()?;
        self.finished = true;

        Segment::open(&self.final_path, checksum_mode)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| MinidexError::other("segment writer already finished"))?;
        writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
