//! Crash recovery tests
//!
//! A "crash" is dropping the engine without a checkpoint: table rows only
//! reach disk when a checkpoint flushes them, so everything since the last
//! checkpoint must come back from the WAL.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use granitedb::index::{Database, Index};
use granitedb::recovery::{self, EditLog, LogRecord, PrimeOutcome, RecoveryManager, WalReader};
use granitedb::storage::MemoryDatabase;
use granitedb::{ClientId, Config, Engine, Key, TableKind, TransactionManager, Value};
use tempfile::{tempdir, TempDir};

fn setup() -> (TempDir, Config) {
    let temp_dir = tempdir().unwrap();
    let config = Config::new(temp_dir.path().join("data"));
    (temp_dir, config)
}

fn rows(engine: &Engine, table: &str) -> Vec<(Key, Value)> {
    engine
        .database()
        .table(table)
        .map(|t| t.table_start().unwrap().map(|e| (e.key, e.value)).collect())
        .unwrap_or_default()
}

fn committed_insert(engine: &Engine, table: &str, key: Key, value: Value) {
    let h = engine.handler();
    let client = ClientId::new();
    h.begin(client).unwrap();
    h.insert(client, table, key, value).unwrap();
    h.commit(client).unwrap();
}

#[test]
fn test_fresh_start() {
    let (_dir, config) = setup();
    let engine = Engine::open(&config).unwrap();
    assert_eq!(engine.prime_outcome(), PrimeOutcome::Fresh);
    assert_eq!(engine.recovery_report().records_scanned, 0);
    assert!(config.data_dir.is_dir());
    assert!(config.snapshot_dir().is_dir());
    assert!(config.wal_path().exists());
}

#[test]
fn test_uncommitted_insert_then_update_is_undone() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        let h = engine.handler();
        h.create_table(TableKind::BTree, "users").unwrap();

        let client = ClientId::new();
        h.begin(client).unwrap();
        h.insert(client, "users", 1, 10).unwrap();
        h.update(client, "users", 1, 20).unwrap();
        // crash before commit
    }

    let engine = Engine::open(&config).unwrap();
    assert_eq!(engine.prime_outcome(), PrimeOutcome::Restored);
    let report = engine.recovery_report();
    assert_eq!(report.undone_transactions.len(), 1);
    assert_eq!(report.compensated_edits, 2);

    let users = engine.database().table("users").unwrap();
    assert_eq!(users.find(1).unwrap(), None);
}

#[test]
fn test_committed_work_survives_crash() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        engine
            .handler()
            .create_table(TableKind::Hash, "users")
            .unwrap();
        for key in 0..20 {
            committed_insert(&engine, "users", key, key * 2);
        }
    }

    let engine = Engine::open(&config).unwrap();
    let expected: Vec<(Key, Value)> = (0..20).map(|k| (k, k * 2)).collect();
    assert_eq!(rows(&engine, "users"), expected);
    assert_eq!(
        engine.database().memory_table("users").unwrap().kind(),
        TableKind::Hash
    );
}

#[test]
fn test_checkpoint_crash_prime_then_recover_tail() {
    let (_dir, config) = setup();
    prime_and_checkpoint_then_write_tail(&config);

    // prime alone restores exactly the checkpointed snapshot
    let outcome = recovery::prime(&config.data_dir, &config.snapshot_suffix).unwrap();
    assert_eq!(outcome, PrimeOutcome::Restored);
    {
        let db = MemoryDatabase::open(&config.data_dir).unwrap();
        let users = db.table("users").unwrap();
        assert_eq!(users.find(1).unwrap(), Some(10));
        assert_eq!(users.find(2).unwrap(), None);
    }

    // recover then reapplies the tail written after the checkpoint
    let db = Arc::new(MemoryDatabase::open(&config.data_dir).unwrap());
    let rm = RecoveryManager::open(db.clone(), Arc::new(TransactionManager::new()), &config)
        .unwrap();
    let report = rm.recover().unwrap();
    assert!(report.undone_transactions.is_empty());

    let users = db.table("users").unwrap();
    assert_eq!(users.find(1).unwrap(), Some(10));
    assert_eq!(users.find(2).unwrap(), Some(20));
}

/// key 1 committed before a checkpoint, key 2 committed after it and
/// flushed into the live directory only
fn prime_and_checkpoint_then_write_tail(config: &Config) {
    let engine = Engine::open(config).unwrap();
    engine
        .handler()
        .create_table(TableKind::BTree, "users")
        .unwrap();
    committed_insert(&engine, "users", 1, 10);
    engine.recovery().checkpoint().unwrap();

    committed_insert(&engine, "users", 2, 20);
    engine.database().flush_all().unwrap();
}

#[test]
fn test_transaction_active_across_checkpoint_is_undone() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        let h = engine.handler();
        h.create_table(TableKind::BTree, "users").unwrap();
        committed_insert(&engine, "users", 100, 1);

        let client = ClientId::new();
        h.begin(client).unwrap();
        h.insert(client, "users", 1, 10).unwrap();
        h.update(client, "users", 100, 2).unwrap();
        engine.recovery().checkpoint().unwrap();
        h.insert(client, "users", 2, 20).unwrap();

        let last = WalReader::read_all(config.wal_path())
            .unwrap()
            .into_iter()
            .filter(|r| matches!(r, LogRecord::Checkpoint { .. }))
            .last()
            .unwrap();
        assert_eq!(last, LogRecord::Checkpoint { active: vec![client] });
    }

    let engine = Engine::open(&config).unwrap();
    assert_eq!(engine.recovery_report().undone_transactions.len(), 1);
    // the snapshot held the uncommitted effects flushed at the checkpoint
    assert_eq!(rows(&engine, "users"), vec![(100, 1)]);
}

#[test]
fn test_rollback_survives_crash() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        let h = engine.handler();
        h.create_table(TableKind::BTree, "users").unwrap();
        committed_insert(&engine, "users", 1, 10);

        let client = ClientId::new();
        h.begin(client).unwrap();
        h.update(client, "users", 1, 99).unwrap();
        h.insert(client, "users", 2, 20).unwrap();
        h.rollback(client).unwrap();
        assert_eq!(rows(&engine, "users"), vec![(1, 10)]);
    }

    let engine = Engine::open(&config).unwrap();
    assert!(engine.recovery_report().undone_transactions.is_empty());
    assert_eq!(rows(&engine, "users"), vec![(1, 10)]);
}

#[test]
fn test_rollback_restores_every_key() {
    let (_dir, config) = setup();
    let engine = Engine::open(&config).unwrap();
    let h = engine.handler();
    h.create_table(TableKind::BTree, "accounts").unwrap();
    for key in 0..50 {
        committed_insert(&engine, "accounts", key, 1000 + key);
    }
    let before = rows(&engine, "accounts");

    let client = ClientId::new();
    h.begin(client).unwrap();
    for key in 0..50 {
        match key % 3 {
            0 => h.update(client, "accounts", key, -1).unwrap(),
            1 => h.delete(client, "accounts", key).unwrap(),
            _ => {
                h.update(client, "accounts", key, 0).unwrap();
                h.update(client, "accounts", key, 7).unwrap();
            }
        }
    }
    for key in 50..60 {
        h.insert(client, "accounts", key, key).unwrap();
    }
    h.rollback(client).unwrap();

    assert_eq!(rows(&engine, "accounts"), before);
    assert!(engine.transactions().lock_manager().is_empty());
}

#[test]
fn test_replaying_committed_log_matches_direct_execution() {
    let (dir, config) = setup();
    let direct = {
        let engine = Engine::open(&config).unwrap();
        let h = engine.handler();
        h.create_table(TableKind::BTree, "users").unwrap();
        h.create_table(TableKind::Hash, "orders").unwrap();
        let client = ClientId::new();
        h.begin(client).unwrap();
        for key in 0..10 {
            h.insert(client, "users", key, key).unwrap();
            h.insert(client, "orders", key, -key).unwrap();
        }
        for key in (0..10).step_by(2) {
            h.update(client, "users", key, key * 100).unwrap();
            h.delete(client, "orders", key).unwrap();
        }
        h.commit(client).unwrap();
        (rows(&engine, "users"), rows(&engine, "orders"))
    };

    // a brand-new directory rebuilt from the log alone
    let replay = Config {
        wal_path: Some(config.wal_path()),
        ..Config::new(dir.path().join("replica"))
    };
    let first = Engine::open(&replay).unwrap();
    assert_eq!(first.prime_outcome(), PrimeOutcome::Fresh);
    assert_eq!((rows(&first, "users"), rows(&first, "orders")), direct);
    drop(first);

    // and replaying again over an already-populated directory changes nothing
    fs::remove_file(replay.data_dir.join(recovery::CHECKPOINT_MARKER)).unwrap();
    fs::remove_dir_all(replay.snapshot_dir()).unwrap();
    let second = Engine::open(&replay).unwrap();
    assert_eq!(second.prime_outcome(), PrimeOutcome::Existing);
    assert!(second.recovery_report().skipped > 0);
    assert_eq!((rows(&second, "users"), rows(&second, "orders")), direct);
}

#[test]
fn test_recovery_is_repeatable() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        let h = engine.handler();
        h.create_table(TableKind::BTree, "users").unwrap();
        committed_insert(&engine, "users", 1, 1);
        let client = ClientId::new();
        h.begin(client).unwrap();
        h.update(client, "users", 1, 2).unwrap();
    }

    let first = rows(&Engine::open(&config).unwrap(), "users");
    let second = rows(&Engine::open(&config).unwrap(), "users");
    assert_eq!(first, vec![(1, 1)]);
    assert_eq!(first, second);
}

#[test]
fn test_torn_wal_tail_is_tolerated() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        engine
            .handler()
            .create_table(TableKind::BTree, "users")
            .unwrap();
        committed_insert(&engine, "users", 1, 10);
    }
    append_garbage(&config.wal_path());

    let engine = Engine::open(&config).unwrap();
    assert_eq!(rows(&engine, "users"), vec![(1, 10)]);

    // the writer cut the torn frame off, so later records stay readable
    committed_insert(&engine, "users", 2, 20);
    let records = WalReader::scan(config.wal_path()).unwrap();
    assert!(!records.torn);
}

fn append_garbage(path: &Path) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(&64u32.to_le_bytes()).unwrap();
    file.write_all(&[0xAB; 10]).unwrap();
}

#[test]
fn test_dump_format_of_recovered_log() {
    let (_dir, config) = setup();
    let client = ClientId::new();
    {
        let engine = Engine::open(&config).unwrap();
        let h = engine.handler();
        h.create_table(TableKind::BTree, "users").unwrap();
        h.begin(client).unwrap();
        h.insert(client, "users", 1, 10).unwrap();
    }
    drop(Engine::open(&config).unwrap());

    let lines: Vec<String> = WalReader::read_all(config.wal_path())
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    let expected = [
        "table btree users".to_string(),
        format!("start {}", client),
        format!("edit {} insert users 1 - 10", client),
        format!("edit {} delete users 1 10 -", client),
        format!("commit {}", client),
    ];
    let tail: Vec<&String> = lines.iter().filter(|l| !l.starts_with("checkpoint")).collect();
    assert_eq!(tail, expected.iter().collect::<Vec<_>>());
}

#[test]
fn test_table_logged_before_checkpoint_and_created_after() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        engine.recovery().table(TableKind::BTree, "users").unwrap();
        engine.recovery().checkpoint().unwrap();
        engine
            .database()
            .create_table(TableKind::BTree, "users")
            .unwrap();
        committed_insert(&engine, "users", 1, 10);
    }

    // the snapshot has no users table; recovery must still create it
    let engine = Engine::open(&config).unwrap();
    assert_eq!(rows(&engine, "users"), vec![(1, 10)]);
}

#[test]
fn test_tables_created_during_checkpoints_survive_crash() {
    let (_dir, config) = setup();
    {
        let engine = Arc::new(Engine::open(&config).unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let checkpointer = {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    engine.recovery().checkpoint().unwrap();
                }
            })
        };

        for n in 0..10 {
            let name = format!("t{}", n);
            engine
                .handler()
                .create_table(TableKind::Hash, &name)
                .unwrap();
            committed_insert(&engine, &name, n, n * 10);
        }
        stop.store(true, Ordering::SeqCst);
        checkpointer.join().unwrap();
    }

    let engine = Engine::open(&config).unwrap();
    for n in 0..10 {
        assert_eq!(rows(&engine, &format!("t{}", n)), vec![(n, n * 10)]);
    }
}

#[test]
fn test_interrupted_rollback_is_finished_by_recovery() {
    let (_dir, config) = setup();
    {
        let engine = Engine::open(&config).unwrap();
        let h = engine.handler();
        h.create_table(TableKind::BTree, "users").unwrap();
        committed_insert(&engine, "users", 1, 10);
        committed_insert(&engine, "users", 2, 20);

        let client = ClientId::new();
        h.begin(client).unwrap();
        h.update(client, "users", 1, 11).unwrap();
        h.update(client, "users", 2, 21).unwrap();
        h.insert(client, "users", 3, 30).unwrap();

        // rollback got as far as compensating the newest edit, then crashed
        engine
            .recovery()
            .log_edit(EditLog::delete(client, "users", 3, 30))
            .unwrap();
        engine
            .database()
            .table("users")
            .unwrap()
            .delete(3)
            .unwrap();
    }

    let engine = Engine::open(&config).unwrap();
    let report = engine.recovery_report();
    assert_eq!(report.undone_transactions.len(), 1);
    assert_eq!(report.compensated_edits, 4);
    assert_eq!(rows(&engine, "users"), vec![(1, 10), (2, 20)]);
}
