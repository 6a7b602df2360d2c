//! Deduplication and usage-count garbage collection.

use dedup_api_types::StopMode;
use dedup_engine::content::fingerprint;

mod common;
use common::{create_engine, TestDir};

const BLOCK_COUNT: u64 = 256;

#[test]
fn overwrite_deduplication_collects_unreferenced_chunks() {
    let dir = TestDir::new("gc-overwrite-dedup");
    let engine = create_engine(&dir);
    let block_size = engine.block_size() as usize;
    let chunk_size = 8192;

    let sevens = vec![0x07u8; block_size];
    let zeros = vec![0x00u8; block_size];
    let fp_seven = fingerprint(&sevens[..chunk_size]);
    let fp_zero = fingerprint(&zeros[..chunk_size]);
    let chunks_per_block = (block_size / chunk_size) as u64;

    // generation 1: constant 0x07 everywhere
    for block_id in 0..BLOCK_COUNT {
        engine.write_block(block_id, &sevens).unwrap();
    }
    engine.flush().unwrap();
    engine.replay_pending().unwrap();

    // a single unique chunk carries all references
    let mapping = engine.chunk_index().lookup(&fp_seven).unwrap().unwrap();
    assert_eq!(mapping.usage_count, BLOCK_COUNT * chunks_per_block);

    // generation 2: overwrite everything with 0x00
    for block_id in 0..BLOCK_COUNT {
        engine.write_block(block_id, &zeros).unwrap();
    }
    engine.flush().unwrap();
    engine.replay_pending().unwrap();

    let mapping = engine.chunk_index().lookup(&fp_seven).unwrap().unwrap();
    assert_eq!(mapping.usage_count, 0);
    let mapping = engine.chunk_index().lookup(&fp_zero).unwrap().unwrap();
    assert_eq!(mapping.usage_count, BLOCK_COUNT * chunks_per_block);

    // generation 3: back to 0x07
    for block_id in 0..BLOCK_COUNT {
        engine.write_block(block_id, &sevens).unwrap();
    }
    engine.flush().unwrap();
    engine.replay_pending().unwrap();

    // idle-time candidate processing deletes the unreferenced chunk
    engine.garbage_collector().process_candidates().unwrap();

    let mapping = engine.chunk_index().lookup(&fp_seven).unwrap().unwrap();
    assert_eq!(mapping.usage_count, BLOCK_COUNT * chunks_per_block);
    assert!(engine.chunk_index().lookup(&fp_zero).unwrap().is_none());

    for block_id in 0..BLOCK_COUNT {
        assert_eq!(engine.read_block(block_id).unwrap(), sevens);
    }
    engine.stop(StopMode::Writeback).unwrap();
}

#[test]
fn outrunning_overwrite_leaves_skipped_chunk_unreferenced() {
    let dir = TestDir::new("gc-outrun");
    let engine = create_engine(&dir);
    let block_size = engine.block_size() as usize;

    let data_a = common::random_block(1, block_size);
    let data_b = common::random_block(2, block_size);
    let fp_a = fingerprint(&data_a[..8192]);

    // both versions stay in the volatile store (container still open)
    engine.write_block(9, &data_a).unwrap();
    engine.write_block(9, &data_b).unwrap();
    assert_eq!(engine.block_index().open_block_count(), 1);

    // committing the shared container promotes only the second version
    engine.flush().unwrap();
    engine.replay_pending().unwrap();

    assert_eq!(engine.read_block(9).unwrap(), data_b);
    let mapping = engine.chunk_index().lookup(&fp_a).unwrap().unwrap();
    assert_eq!(mapping.usage_count, 0);
    engine.stop(StopMode::Writeback).unwrap();
}

#[test]
fn reference_counts_match_committed_mappings() {
    let dir = TestDir::new("gc-refcounts");
    let engine = create_engine(&dir);
    let block_size = engine.block_size() as usize;

    // three blocks share one content, one block is distinct
    let shared = common::random_block(7, block_size);
    let distinct = common::random_block(8, block_size);
    for block_id in [1, 2, 3] {
        engine.write_block(block_id, &shared).unwrap();
    }
    engine.write_block(4, &distinct).unwrap();
    engine.flush().unwrap();
    engine.replay_pending().unwrap();

    let chunks_per_block = block_size / 8192;
    for offset in (0..block_size).step_by(8192) {
        let fp = fingerprint(&shared[offset..offset + 8192]);
        let mapping = engine.chunk_index().lookup(&fp).unwrap().unwrap();
        assert_eq!(mapping.usage_count, 3, "shared chunk at offset {offset}");
    }
    let mut distinct_total = 0;
    for offset in (0..block_size).step_by(8192) {
        let fp = fingerprint(&distinct[offset..offset + 8192]);
        distinct_total += engine.chunk_index().lookup(&fp).unwrap().unwrap().usage_count;
    }
    assert_eq!(distinct_total, chunks_per_block as u64);
    engine.stop(StopMode::Writeback).unwrap();
}
