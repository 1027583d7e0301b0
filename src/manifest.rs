//! Versioned manifest of live segments, with snapshot isolation.
//!
//! The manifest is the single mutable shared structure in the engine. Each
//! install produces a new generation: an immutable, ordered list of live
//! segments behind a short-lived lock, so `current()` never observes a
//! half-installed generation and never blocks writers for long. Readers
//! hold a [`Snapshot`]; a superseded segment's file is removed only when
//! the last reference to it (manifest or snapshot) drops.
//!
//! The current generation is persisted to `manifest.bin` via write-temp +
//! atomic rename so it survives crashes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::{Mutex, RwLock};

use crate::codec::{decode_u64, encode_u64};
use crate::error::{MinidexError, Result};
use crate::segment::{ChecksumMode, Posting, Segment, parse_segment_file_name, segment_file_name};

/// Name of the manifest file inside an index directory.
pub const MANIFEST_FILE: &str = "manifest.bin";

const MANIFEST_MAGIC: u32 = u32::from_le_bytes(*b"MIDM");
const MANIFEST_VERSION: u32 = 1;

/// An immutable view of one manifest generation, the unit of
/// repeatable-read for queries.
#[derive(Debug, Clone)]
pub struct Snapshot {
    generation: u64,
    segments: Arc<Vec<Arc<Segment>>>,
    overlay: Arc<BTreeMap<Vec<u8>, Vec<Posting>>>,
}

impl Snapshot {
    /// Generation this snapshot was taken from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Live segments, ordered by ascending segment id.
    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    /// Buffered postings captured alongside the segment set, so queries
    /// observe writes that are WAL-durable but not yet flushed.
    pub fn overlay(&self) -> &BTreeMap<Vec<u8>, Vec<Posting>> {
        &self.overlay
    }

    /// Attach a point-in-time copy of the write buffer.
    pub fn with_overlay(mut self, overlay: Arc<BTreeMap<Vec<u8>, Vec<Posting>>>) -> Snapshot {
        self.overlay = overlay;
        self
    }
}

#[derive(Debug)]
struct ManifestState {
    generation: u64,
    segments: Arc<Vec<Arc<Segment>>>,
}

/// The versioned, atomically-swapped list of live segments.
#[derive(Debug)]
pub struct Manifest {
    dir: PathBuf,
    state: RwLock<ManifestState>,
    // Serializes installs so persistence and the in-memory swap cannot
    // interleave; `state` itself is only held for the swap.
    install_lock: Mutex<()>,
}

impl Manifest {
    /// Create an empty manifest for a fresh index directory.
    pub fn create(dir: &Path) -> Result<Manifest> {
        fs::create_dir_all(dir)?;
        persist(dir, 0, &[])?;
        Ok(Manifest {
            dir: dir.to_path_buf(),
            state: RwLock::new(ManifestState {
                generation: 0,
                segments: Arc::new(Vec::new()),
            }),
            install_lock: Mutex::new(()),
        })
    }

    /// Open the manifest from disk, opening every listed segment.
    ///
    /// A listed segment that fails its checksum is excluded from the live
    /// set, its file renamed `*.corrupt` for manual inspection, and its id
    /// returned in the quarantine list. Orphaned temp and segment files
    /// left behind by a crash are removed.
    pub fn open(dir: &Path, checksum_mode: ChecksumMode) -> Result<(Manifest, Vec<u64>)> {
        fs::create_dir_all(dir)?;

        let Some((generation, ids)) = load(dir)? else {
            return Ok((Manifest::create(dir)?, Vec::new()));
        };

        let mut segments = Vec::new();
        let mut quarantined = Vec::new();
        for id in &ids {
            let path = dir.join(segment_file_name(*id));
            match Segment::open(&path, checksum_mode) {
                Ok(segment) => segments.push(Arc::new(segment)),
                Err(MinidexError::CorruptData(msg)) => {
                    eprintln!("minidex: quarantining corrupt segment {id}: {msg}");
                    let _ = fs::rename(&path, path.with_extension("corrupt"));
                    quarantined.push(*id);
                }
                Err(e) => return Err(e),
            }
        }
        segments.sort_by_key(|s| s.id());

        let mut generation = generation;
        if !quarantined.is_empty() {
            // Excluded segments must not reappear in future manifests.
            generation += 1;
            let live_ids: Vec<u64> = segments.iter().map(|s| s.id()).collect();
            persist(dir, generation, &live_ids)?;
        }

        remove_orphans(dir, &segments)?;

        Ok((
            Manifest {
                dir: dir.to_path_buf(),
                state: RwLock::new(ManifestState {
                    generation,
                    segments: Arc::new(segments),
                }),
                install_lock: Mutex::new(()),
            },
            quarantined,
        ))
    }

    /// Acquire the live generation without blocking writers.
    pub fn current(&self) -> Snapshot {
        let state = self.state.read();
        Snapshot {
            generation: state.generation,
            segments: Arc::clone(&state.segments),
            overlay: Arc::new(BTreeMap::new()),
        }
    }

    /// Current generation number.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Number of live segments.
    pub fn live_segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Highest live segment id, or 0 for an empty manifest.
    pub fn max_segment_id(&self) -> u64 {
        self.state
            .read()
            .segments
            .iter()
            .map(|s| s.id())
            .max()
            .unwrap_or(0)
    }

    /// Highest write sequence number across live segments, or 0.
    pub fn max_seq(&self) -> u64 {
        self.state
            .read()
            .segments
            .iter()
            .map(|s| s.max_seq())
            .max()
            .unwrap_or(0)
    }

    /// Atomically install a new generation that adds `added` and drops the
    /// segments named in `removed_ids`. Returns the new generation number.
    ///
    /// The previous generation stays valid for any snapshot already
    /// acquired; removed segment files are deleted once unreferenced.
    pub fn install(&self, added: Vec<Arc<Segment>>, removed_ids: &[u64]) -> Result<u64> {
        let _guard = self.install_lock.lock();

        let (next_generation, new_segments, removed) = {
            let state = self.state.read();
            let mut list: Vec<Arc<Segment>> = Vec::with_capacity(state.segments.len() + added.len());
            let mut removed = Vec::new();
            for segment in state.segments.iter() {
                if removed_ids.contains(&segment.id()) {
                    removed.push(Arc::clone(segment));
                } else {
                    list.push(Arc::clone(segment));
                }
            }
            list.extend(added);
            list.sort_by_key(|s| s.id());
            (state.generation + 1, list, removed)
        };

        let ids: Vec<u64> = new_segments.iter().map(|s| s.id()).collect();
        persist(&self.dir, next_generation, &ids)?;

        {
            let mut state = self.state.write();
            state.generation = next_generation;
            state.segments = Arc::new(new_segments);
        }

        for segment in removed {
            segment.mark_defunct();
        }

        Ok(next_generation)
    }
}

fn persist(dir: &Path, generation: u64, ids: &[u64]) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
    buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
    buf.extend_from_slice(&generation.to_le_bytes());
    buf.extend_from_slice(&encode_u64(ids.len() as u64));
    for id in ids {
        buf.extend_from_slice(&encode_u64(*id));
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    let tmp_path = dir.join(format!("{MANIFEST_FILE}.tmp"));
    let mut file = File::create(&tmp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, dir.join(MANIFEST_FILE))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn load(dir: &Path) -> Result<Option<(u64, Vec<u64>)>> {
    let path = dir.join(MANIFEST_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if data.len() < 20 {
        return Err(MinidexError::corrupt("manifest file too small"));
    }

    let body = &data[..data.len() - 4];
    let stored = (&data[data.len() - 4..]).read_u32::<LittleEndian>()?;
    if crc32fast::hash(body) != stored {
        return Err(MinidexError::corrupt("manifest checksum mismatch"));
    }

    let mut header = body;
    let magic = header.read_u32::<LittleEndian>()?;
    let version = header.read_u32::<LittleEndian>()?;
    let generation = header.read_u64::<LittleEndian>()?;

    if magic != MANIFEST_MAGIC {
        return Err(MinidexError::corrupt("bad manifest magic"));
    }
    if version != MANIFEST_VERSION {
        return Err(MinidexError::corrupt(format!(
            "unsupported manifest version: {version}"
        )));
    }

    let mut pos = 16usize;
    let (count, n) = decode_u64(&body[pos..])?;
    pos += n;
    let mut ids = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        let (id, n) = decode_u64(&body[pos..])?;
        pos += n;
        ids.push(id);
    }
    if pos != body.len() {
        return Err(MinidexError::corrupt("trailing bytes in manifest"));
    }

    Ok(Some((generation, ids)))
}

/// Remove temp files and segment files no generation references. Safe after
/// a crash: an orphaned flush output is still covered by the WAL.
fn remove_orphans(dir: &Path, live: &[Arc<Segment>]) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if name.ends_with(".tmp") {
            let _ = fs::remove_file(entry.path());
        } else if let Some(id) = parse_segment_file_name(name)
            && !live.iter().any(|s| s.id() == id)
        {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}
