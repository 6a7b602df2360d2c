//! Crash recovery: dirty restarts, lost metadata, failed containers.

use dedup_api_types::StopMode;

mod common;
use common::{create_engine, random_block, reopen_engine, TestDir};

#[test]
fn dirty_restart_replays_unconsumed_events() {
    let dir = TestDir::new("recovery-dirty-restart");
    let engine = create_engine(&dir);
    let block_size = engine.block_size() as usize;

    for block_id in 0..16 {
        engine
            .write_block(block_id, &random_block(block_id, block_size))
            .unwrap();
    }
    engine.flush().unwrap();
    // no background replay, no stop: this is the crash
    drop(engine);

    let engine = reopen_engine(&dir);
    for block_id in 0..16 {
        assert_eq!(
            engine.read_block(block_id).unwrap(),
            random_block(block_id, block_size),
            "block {block_id} mismatch after dirty restart"
        );
    }

    // (e) once more after the full background replay
    engine.replay_pending().unwrap();
    for block_id in 0..16 {
        assert_eq!(
            engine.read_block(block_id).unwrap(),
            random_block(block_id, block_size),
        );
    }
    engine.stop(StopMode::Writeback).unwrap();
}

#[test]
fn lost_container_metadata_is_restored_from_the_log() {
    let dir = TestDir::new("recovery-lost-metadata");
    let engine = create_engine(&dir);
    let block_size = engine.block_size() as usize;

    for block_id in 0..16 {
        engine
            .write_block(block_id, &random_block(block_id, block_size))
            .unwrap();
    }
    engine.flush().unwrap();

    // drop the metadata record of the container behind the last block
    let mapping = engine.block_index().read_block_info(15).unwrap();
    let container_id = mapping.items[0].container_id;
    assert!(engine
        .storage()
        .drop_metadata_record(container_id)
        .unwrap());

    // crash without a clean stop
    drop(engine);

    // the dirty replay of the container commit event re-creates the
    // metadata record from the blob found on disk
    let engine = reopen_engine(&dir);
    for block_id in 0..16 {
        assert_eq!(
            engine.read_block(block_id).unwrap(),
            random_block(block_id, block_size),
            "block {block_id} mismatch after metadata recovery"
        );
    }
    engine.stop(StopMode::Writeback).unwrap();
}

#[test]
fn failed_container_reverts_blocks_to_previous_version() {
    let dir = TestDir::new("recovery-failed-container");
    let engine = create_engine(&dir);
    let block_size = engine.block_size() as usize;

    let version_1 = random_block(1, block_size);
    let version_2 = random_block(2, block_size);

    engine.write_block(3, &version_1).unwrap();
    engine.flush().unwrap();
    engine.replay_pending().unwrap();
    assert_eq!(engine.read_block(3).unwrap(), version_1);

    // the overwrite stays volatile; its container never commits
    engine.write_block(3, &version_2).unwrap();
    assert_eq!(engine.read_block(3).unwrap(), version_2);

    let container_id = {
        let mapping = engine.block_index().read_block_info(3).unwrap();
        mapping.items[0].container_id
    };
    engine.fail_container(container_id).unwrap();

    // the block fell back to the previous version
    assert_eq!(engine.read_block(3).unwrap(), version_1);
    assert_eq!(engine.block_index().open_block_count(), 0);

    // survives the dirty restart as well
    drop(engine);
    let engine = reopen_engine(&dir);
    assert_eq!(engine.read_block(3).unwrap(), version_1);

    // no chunk of the failed container survived with references
    let fp = dedup_engine::content::fingerprint(&version_2[..8192]);
    match engine.chunk_index().lookup(&fp).unwrap() {
        None => (),
        Some(mapping) => assert_eq!(mapping.usage_count, 0),
    }
    engine.stop(StopMode::Writeback).unwrap();
}

#[test]
fn repeated_dirty_restarts_keep_reference_counts_stable() {
    let dir = TestDir::new("recovery-idempotent-replay");
    let engine = create_engine(&dir);
    let block_size = engine.block_size() as usize;

    // eight blocks of identical content share their chunks
    let shared = random_block(42, block_size);
    for block_id in 0..8 {
        engine.write_block(block_id, &shared).unwrap();
    }
    engine.flush().unwrap();
    // crash before any background replay
    drop(engine);

    let fp = dedup_engine::content::fingerprint(&shared[..8192]);

    // first dirty restart applies the reference counts
    let engine = reopen_engine(&dir);
    engine.replay_pending().unwrap();
    let counted = engine.chunk_index().lookup(&fp).unwrap().unwrap();
    assert_eq!(counted.usage_count, 8);
    drop(engine);

    // further dirty restarts must not change them
    for _ in 0..2 {
        let engine = reopen_engine(&dir);
        engine.replay_pending().unwrap();
        let again = engine.chunk_index().lookup(&fp).unwrap().unwrap();
        assert_eq!(again.usage_count, counted.usage_count);
        assert_eq!(engine.read_block(3).unwrap(), shared);
        drop(engine);
    }
}

#[test]
fn config_mismatch_aborts_reopen() {
    let dir = TestDir::new("recovery-config-mismatch");
    let engine = create_engine(&dir);
    engine.stop(StopMode::Writeback).unwrap();
    drop(engine);

    let mut config = common::engine_config(&dir);
    config.raw.push_str("block-size=32768\n");
    config.block_size = 32768;
    assert!(dedup_engine::DedupEngine::open(config.clone(), false).is_err());

    // force overrides the stored configuration, but the index layers
    // still verify their own info files
    let engine = dedup_engine::DedupEngine::open(config, true).unwrap();
    engine.stop(StopMode::Fast).unwrap();
}
