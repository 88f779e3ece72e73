//! Tests for the value log
//!
//! These tests verify:
//! - Append returns contiguous addresses and advances the offset
//! - Read re-verifies records by address
//! - Sync strategies
//! - Sequential readers over the log

use std::sync::Arc;

use chronokv::config::SyncStrategy;
use chronokv::error::ChronoError;
use chronokv::io::{FileId, IoActor, IoAddress};
use chronokv::wal::{TailState, ValueLog, ValueLogRecord};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_log(strategy: SyncStrategy) -> (TempDir, IoActor, ValueLog) {
    let temp_dir = TempDir::new().unwrap();
    let actor = IoActor::spawn(&temp_dir.path().join("values.log"), FileId::VALUE_LOG).unwrap();
    let log = ValueLog::open(actor.handle(), strategy).unwrap();
    (temp_dir, actor, log)
}

fn record(i: u64) -> ValueLogRecord {
    ValueLogRecord::put(format!("key{}", i).into_bytes(), i + 1, format!("value{}", i).into_bytes())
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_open_requires_value_log_actor() {
    let temp_dir = TempDir::new().unwrap();
    let actor = IoActor::spawn(&temp_dir.path().join("index.db"), FileId::INDEX).unwrap();

    let result = ValueLog::open(actor.handle(), SyncStrategy::EveryWrite);

    assert!(matches!(result, Err(ChronoError::Config(_))));
}

#[test]
fn test_append_addresses_are_contiguous() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);

    let first = log.append(&record(0)).unwrap();
    let second = log.append(&record(1)).unwrap();

    assert_eq!(first.file, FileId::VALUE_LOG);
    assert_eq!(first.offset, 0);
    assert_eq!(first.len as usize, record(0).encoded_len());
    assert_eq!(second.offset, first.end());
    assert_eq!(log.append_offset(), second.end());
}

#[test]
fn test_read_by_address() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);
    let addresses: Vec<_> = (0..10).map(|i| log.append(&record(i)).unwrap()).collect();

    for (i, address) in addresses.into_iter().enumerate().rev() {
        let read = log.read(address).unwrap();
        assert_eq!(read.key, record(i as u64).key);
        assert_eq!(read.value, record(i as u64).value);
    }
}

#[test]
fn test_read_beyond_end_is_not_found() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);
    log.append(&record(0)).unwrap();

    let result = log.read(IoAddress::new(FileId::VALUE_LOG, 1_000, 40));

    assert!(matches!(result, Err(ChronoError::NotFound)));
}

#[test]
fn test_read_rejects_foreign_address() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);
    let address = log.append(&record(0)).unwrap();

    let result = log.read(IoAddress::new(FileId::INDEX, address.offset, address.len));

    assert!(matches!(result, Err(ChronoError::Corruption(_))));
}

#[test]
fn test_reopen_continues_at_end() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("values.log");
    let end = {
        let actor = IoActor::spawn(&path, FileId::VALUE_LOG).unwrap();
        let log = ValueLog::open(actor.handle(), SyncStrategy::EveryWrite).unwrap();
        log.append(&record(0)).unwrap();
        log.append(&record(1)).unwrap().end()
    };

    let actor = IoActor::spawn(&path, FileId::VALUE_LOG).unwrap();
    let log = ValueLog::open(actor.handle(), SyncStrategy::EveryWrite).unwrap();
    let address = log.append(&record(2)).unwrap();

    assert_eq!(address.offset, end);
}

// =============================================================================
// Sync Strategy Tests
// =============================================================================

#[test]
fn test_every_write_leaves_nothing_unsynced() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);

    for i in 0..5 {
        log.append(&record(i)).unwrap();
        assert_eq!(log.unsynced_count(), 0);
    }
}

#[test]
fn test_every_n_entries_batches_syncs() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryNEntries { count: 3 });

    log.append(&record(0)).unwrap();
    log.append(&record(1)).unwrap();
    assert_eq!(log.unsynced_count(), 2);

    log.append(&record(2)).unwrap();
    assert_eq!(log.unsynced_count(), 0);

    log.append(&record(3)).unwrap();
    log.sync().unwrap();
    assert_eq!(log.unsynced_count(), 0);
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_reader_yields_records_in_file_order() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);
    let addresses: Vec<_> = (0..5).map(|i| log.append(&record(i)).unwrap()).collect();

    let mut reader = log.reader(0).unwrap();
    let mut seen = Vec::new();
    while let Some((address, rec)) = reader.next_record().unwrap() {
        seen.push((address, rec.key));
    }

    assert_eq!(seen.len(), 5);
    for (i, (address, key)) in seen.into_iter().enumerate() {
        assert_eq!(address, addresses[i]);
        assert_eq!(key, record(i as u64).key);
    }
    assert_eq!(reader.tail(), TailState::Clean);
    assert_eq!(reader.position(), log.append_offset());
}

#[test]
fn test_reader_from_middle() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);
    let addresses: Vec<_> = (0..4).map(|i| log.append(&record(i)).unwrap()).collect();

    let keys: Vec<_> = log
        .reader(addresses[2].offset)
        .unwrap()
        .map(|item| item.unwrap().1.key)
        .collect();

    assert_eq!(keys, vec![record(2).key, record(3).key]);
}

#[test]
fn test_reader_past_end_is_rejected() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryWrite);
    log.append(&record(0)).unwrap();

    assert!(matches!(log.reader(10_000), Err(ChronoError::Corruption(_))));
}

#[test]
fn test_concurrent_appends_get_distinct_offsets() {
    let (_temp, _actor, log) = setup_log(SyncStrategy::EveryNEntries { count: 16 });
    let log = Arc::new(log);

    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                (0..25u64)
                    .map(|i| log.append(&record(t * 100 + i)).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut addresses: Vec<_> = threads.into_iter().flat_map(|t| t.join().unwrap()).collect();
    addresses.sort_by_key(|a| a.offset);

    for pair in addresses.windows(2) {
        assert_eq!(pair[0].end(), pair[1].offset);
    }
    assert_eq!(log.reader(0).unwrap().count(), 100);
}
