//! End-to-end tests driving the engine through its public API.

use minidex::engine::{Engine, EngineConfig};
use minidex::error::MinidexError;
use minidex::merge::MergePolicy;
use minidex::query::{self, Query};
use minidex::segment::{ChecksumMode, segment_file_name};
use tempfile::TempDir;

fn config() -> EngineConfig {
    EngineConfig {
        background_merge: false,
        max_live_segments: 4,
        ..EngineConfig::default()
    }
}

fn doc_refs(engine: &Engine, query: &Query) -> Vec<u64> {
    engine
        .search(query)
        .unwrap()
        .into_iter()
        .map(|hit| hit.doc_ref)
        .collect()
}

#[test]
fn buffered_writes_are_queryable_before_flush() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path(), config()).unwrap();

    engine.ingest(b"a", 1, 0).unwrap();
    engine.ingest(b"a", 2, 0).unwrap();
    engine.ingest(b"b", 3, 0).unwrap();

    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![1, 2]);
    // No document carries both terms.
    assert_eq!(
        doc_refs(&engine, &Query::and(vec![Query::term("a"), Query::term("b")])),
        Vec::<u64>::new()
    );

    engine.flush().unwrap();
    engine.ingest(b"a", 3, 0).unwrap();
    engine.flush().unwrap();
    engine.force_merge().unwrap();

    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![1, 2, 3]);
    assert_eq!(engine.stats().live_segments, 1);
}

#[test]
fn unflushed_writes_survive_a_crash() {
    let temp_dir = TempDir::new().unwrap();

    let engine = Engine::open(temp_dir.path(), config()).unwrap();
    engine.ingest(b"a", 1, 0).unwrap();
    engine.ingest(b"b", 2, 0).unwrap();
    // Simulate a crash: no flush, no close, no drop.
    std::mem::forget(engine);

    let engine = Engine::open(temp_dir.path(), config()).unwrap();
    assert_eq!(engine.stats().live_segments, 0);
    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![1]);
    assert_eq!(doc_refs(&engine, &Query::term("b")), vec![2]);
}

#[test]
fn flushed_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp_dir.path(), config()).unwrap();
        engine.ingest(b"rust", 1, 3).unwrap();
        engine.ingest(b"rust", 2, 1).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(temp_dir.path(), config()).unwrap();
    assert_eq!(engine.stats().live_segments, 1);
    assert_eq!(engine.stats().wal_bytes, 0);

    let hits = engine.search(&Query::term("rust")).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].score, 4.0);
}

#[test]
fn snapshots_are_isolated_from_later_writes() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path(), config()).unwrap();

    engine.ingest(b"a", 1, 0).unwrap();
    let snapshot = engine.snapshot().unwrap();

    engine.ingest(b"a", 2, 0).unwrap();
    engine.flush().unwrap();
    engine.force_merge().unwrap();

    let old: Vec<u64> = query::execute(&snapshot, &Query::term("a"))
        .unwrap()
        .map(|r| r.unwrap().doc_ref)
        .collect();
    assert_eq!(old, vec![1]);
    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![1, 2]);
}

#[test]
fn deletes_mask_older_occurrences() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path(), config()).unwrap();

    engine.ingest(b"a", 1, 0).unwrap();
    engine.ingest(b"a", 2, 0).unwrap();
    engine.flush().unwrap();

    engine.delete(b"a", 1).unwrap();
    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![2]);

    // Masking holds through flush and through a tombstone-purging merge.
    engine.flush().unwrap();
    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![2]);
    engine.force_merge().unwrap();
    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![2]);
    assert_eq!(engine.stats().live_segments, 1);
}

#[test]
fn reingest_overwrites_payload() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path(), config()).unwrap();

    engine.ingest(b"a", 1, 1).unwrap();
    engine.flush().unwrap();
    engine.ingest(b"a", 1, 5).unwrap();

    let hits = engine.search(&Query::term("a")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].score, 6.0);

    // Still the newer payload once both live in segments.
    engine.flush().unwrap();
    engine.force_merge().unwrap();
    let hits = engine.search(&Query::term("a")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].score, 6.0);
}

#[test]
fn merge_preserves_results_and_bounds_segments() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(
        temp_dir.path(),
        EngineConfig {
            max_live_segments: 2,
            ..config()
        },
    )
    .unwrap();

    for doc in 1..=6u64 {
        engine.ingest(b"t", doc, 0).unwrap();
        engine.flush().unwrap();
    }
    assert_eq!(engine.stats().live_segments, 6);

    engine.force_merge().unwrap();
    assert_eq!(engine.stats().live_segments, 1);
    assert_eq!(doc_refs(&engine, &Query::term("t")), vec![1, 2, 3, 4, 5, 6]);

    // Merging a single segment again is harmless.
    engine.force_merge().unwrap();
    assert_eq!(doc_refs(&engine, &Query::term("t")), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn background_merger_bounds_segment_count() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(
        temp_dir.path(),
        EngineConfig {
            background_merge: true,
            max_live_segments: 2,
            merge_interval_ms: 10,
            ..EngineConfig::default()
        },
    )
    .unwrap();

    for doc in 1..=8u64 {
        engine.ingest(b"t", doc, 0).unwrap();
        engine.flush().unwrap();
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while engine.stats().live_segments > 2 {
        assert!(
            std::time::Instant::now() < deadline,
            "merger never brought segment count under the bound"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    assert_eq!(doc_refs(&engine, &Query::term("t")), (1..=8).collect::<Vec<u64>>());
    engine.close().unwrap();
}

#[test]
fn overwrites_and_deletes_survive_background_partial_merges() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(
        temp_dir.path(),
        EngineConfig {
            background_merge: true,
            max_live_segments: 2,
            merge_interval_ms: 10,
            merge_policy: MergePolicy::OldestFirst,
            ..EngineConfig::default()
        },
    )
    .unwrap();

    let wait_for_merge = |engine: &Engine| {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while engine.stats().live_segments > 2 {
            assert!(
                std::time::Instant::now() < deadline,
                "merger never brought segment count under the bound"
            );
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    };

    // The stale write ends up inside a merge output with a brand-new
    // segment id; the overwrite must still win.
    engine.ingest(b"a", 7, 1).unwrap();
    engine.flush().unwrap();
    engine.ingest(b"filler", 1, 0).unwrap();
    engine.flush().unwrap();
    engine.ingest(b"a", 7, 9).unwrap();
    engine.flush().unwrap();
    wait_for_merge(&engine);

    let hits = engine.search(&Query::term("a")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].score, 10.0);

    // Same for a deletion: it must not resurrect once the surviving
    // occurrence has been merged into a higher-id segment.
    engine.delete(b"a", 7).unwrap();
    engine.flush().unwrap();
    wait_for_merge(&engine);

    assert_eq!(doc_refs(&engine, &Query::term("a")), Vec::<u64>::new());
    engine.close().unwrap();
}

#[test]
fn overwrite_after_reopen_wins_through_merge() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(temp_dir.path(), config()).unwrap();
        engine.ingest(b"a", 1, 1).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    // The write ordering must carry across a reopen.
    let engine = Engine::open(temp_dir.path(), config()).unwrap();
    engine.ingest(b"a", 1, 5).unwrap();
    engine.flush().unwrap();
    engine.force_merge().unwrap();

    let hits = engine.search(&Query::term("a")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].score, 6.0);
}

#[test]
fn quarantined_segment_id_is_not_reused() {
    let temp_dir = TempDir::new().unwrap();
    let cfg = EngineConfig {
        checksum_mode: ChecksumMode::Eager,
        ..config()
    };

    {
        let engine = Engine::open(temp_dir.path(), cfg.clone()).unwrap();
        engine.ingest(b"a", 1, 0).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    // Corrupt the flushed segment so reopening quarantines it.
    let seg_path = temp_dir.path().join(segment_file_name(1));
    let mut data = std::fs::read(&seg_path).unwrap();
    let mid = data.len() / 2;
    data[mid] ^= 0xFF;
    std::fs::write(&seg_path, &data).unwrap();

    let engine = Engine::open(temp_dir.path(), cfg).unwrap();
    assert_eq!(engine.stats().quarantined_segments, vec![1]);

    // The next flush must pick a fresh id, not the quarantined one.
    engine.ingest(b"b", 2, 0).unwrap();
    let id = engine.flush().unwrap().unwrap();
    assert_ne!(id, 1);
    assert!(!temp_dir.path().join(segment_file_name(1)).exists());
    assert!(temp_dir.path().join(segment_file_name(id)).exists());
    assert_eq!(doc_refs(&engine, &Query::term("b")), vec![2]);
}

#[test]
fn boolean_queries_across_buffer_and_segments() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path(), config()).unwrap();

    engine.ingest(b"a", 1, 0).unwrap();
    engine.ingest(b"a", 2, 0).unwrap();
    engine.flush().unwrap();
    engine.ingest(b"b", 2, 0).unwrap();
    engine.ingest(b"b", 3, 0).unwrap();

    let and = Query::and(vec![Query::term("a"), Query::term("b")]);
    assert_eq!(doc_refs(&engine, &and), vec![2]);

    let or = Query::or(vec![Query::term("a"), Query::term("b")]);
    assert_eq!(doc_refs(&engine, &or), vec![1, 2, 3]);

    let top = engine.top_k(&or, 2).unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].doc_ref, 2);
}

#[test]
fn invalid_input_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(temp_dir.path(), config()).unwrap();

    assert!(engine.ingest(b"", 1, 0).is_err());
    assert!(engine.ingest(b"a", 1, u64::MAX).is_err());
    assert!(matches!(
        engine.search(&Query::and(vec![])),
        Err(MinidexError::InvalidQuery(_))
    ));
}

#[test]
fn closed_engine_rejects_operations() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().to_path_buf();
    let engine = Engine::open(&path, config()).unwrap();
    engine.ingest(b"a", 1, 0).unwrap();
    engine.close().unwrap();

    let engine = Engine::open(&path, config()).unwrap();
    assert_eq!(doc_refs(&engine, &Query::term("a")), vec![1]);
}
