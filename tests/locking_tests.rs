//! Two-phase locking through the transactional handler

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use granitedb::index::{Database, Index};
use granitedb::{ClientId, Config, Engine, GraniteError, LockType, Resource, TableKind};
use tempfile::{tempdir, TempDir};

fn setup() -> (TempDir, Arc<Engine>) {
    let temp_dir = tempdir().unwrap();
    let engine = Engine::open(&Config::new(temp_dir.path().join("data"))).unwrap();
    (temp_dir, Arc::new(engine))
}

fn seed(engine: &Engine, table: &str, keys: std::ops::Range<i64>, value: i64) {
    let h = engine.handler();
    h.create_table(TableKind::BTree, table).unwrap();
    let client = ClientId::new();
    h.begin(client).unwrap();
    for key in keys {
        h.insert(client, table, key, value).unwrap();
    }
    h.commit(client).unwrap();
}

#[test]
fn test_reader_blocks_behind_writer_until_commit() {
    let (_dir, engine) = setup();
    seed(&engine, "users", 5..6, 50);
    let (t1, t2) = (ClientId::new(), ClientId::new());
    let h = engine.handler();

    h.begin(t1).unwrap();
    h.update(t1, "users", 5, 51).unwrap();

    let (tx, rx) = mpsc::channel();
    let engine2 = Arc::clone(&engine);
    let reader = thread::spawn(move || {
        let h = engine2.handler();
        h.begin(t2).unwrap();
        let seen = h.find(t2, "users", 5).unwrap();
        tx.send(seen).unwrap();
        h.commit(t2).unwrap();
    });

    // no dirty read: the reader is still waiting
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    h.commit(t1).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(51));
    reader.join().unwrap();
    assert!(engine.transactions().lock_manager().is_empty());
}

#[test]
fn test_crossed_updates_deadlock_and_retry() {
    let (_dir, engine) = setup();
    seed(&engine, "accounts", 1..3, 100);
    let (t1, t2) = (ClientId::new(), ClientId::new());
    let h = engine.handler();

    h.begin(t1).unwrap();
    h.begin(t2).unwrap();
    h.update(t1, "accounts", 1, 90).unwrap();
    h.update(t2, "accounts", 2, 80).unwrap();

    let (tx, rx) = mpsc::channel();
    let engine1 = Arc::clone(&engine);
    let blocked = thread::spawn(move || {
        let result = engine1.handler().update(t1, "accounts", 2, 110);
        tx.send(result.is_ok()).unwrap();
    });
    for _ in 0..500 {
        if !engine.transactions().waits_for(t1).is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    let err = h.update(t2, "accounts", 1, 120).unwrap_err();
    assert!(matches!(err, GraniteError::DeadlockDetected { .. }));
    h.rollback(t2).unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    blocked.join().unwrap();
    h.commit(t1).unwrap();

    let accounts = engine.database().table("accounts").unwrap();
    assert_eq!(accounts.find(1).unwrap(), Some(90));
    assert_eq!(accounts.find(2).unwrap(), Some(110));
}

#[test]
fn test_commit_leaves_no_lock_entries() {
    let (_dir, engine) = setup();
    seed(&engine, "users", 0..20, 0);
    let tm = engine.transactions();
    let h = engine.handler();

    let client = ClientId::new();
    h.begin(client).unwrap();
    for key in 0..20 {
        if key % 2 == 0 {
            h.find(client, "users", key).unwrap();
        } else {
            h.update(client, "users", key, 1).unwrap();
        }
    }
    assert_eq!(tm.transaction(client).unwrap().lock_count(), 20);

    h.commit(client).unwrap();
    assert!(tm.transaction(client).is_none());
    for key in 0..20 {
        assert!(tm.holders_of(&Resource::new("users", key)).is_empty());
    }
    assert!(tm.lock_manager().is_empty());
    assert!(matches!(
        h.commit(client),
        Err(GraniteError::TransactionNotFound(_))
    ));
}

#[test]
fn test_read_then_write_needs_unlock() {
    let (_dir, engine) = setup();
    seed(&engine, "users", 1..2, 1);
    let h = engine.handler();
    let tm = engine.transactions();
    let client = ClientId::new();
    let row = Resource::new("users", 1);

    h.begin(client).unwrap();
    h.find(client, "users", 1).unwrap();
    assert!(matches!(
        h.update(client, "users", 1, 2),
        Err(GraniteError::UpgradeNotSupported(_))
    ));

    tm.unlock(client, &row, LockType::Shared).unwrap();
    h.update(client, "users", 1, 2).unwrap();
    h.commit(client).unwrap();
}

#[test]
fn test_concurrent_transfers_preserve_total() {
    const ACCOUNTS: i64 = 5;
    const THREADS: i64 = 4;
    const TRANSFERS: i64 = 25;

    let (_dir, engine) = setup();
    seed(&engine, "accounts", 0..ACCOUNTS, 100);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut deadlocks = 0;
                for n in 0..TRANSFERS {
                    let from = (t + n) % ACCOUNTS;
                    let to = (from + 1 + t % 2) % ACCOUNTS;
                    loop {
                        match transfer(&engine, from, to, 1) {
                            Ok(()) => break,
                            Err(e) if e.requires_abort() => deadlocks += 1,
                            Err(e) => panic!("transfer failed: {}", e),
                        }
                    }
                }
                deadlocks
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let accounts = engine.database().table("accounts").unwrap();
    let total: i64 = accounts.table_start().unwrap().map(|e| e.value).sum();
    assert_eq!(total, ACCOUNTS * 100);
    assert!(engine.transactions().lock_manager().is_empty());
    assert_eq!(engine.transactions().wait_edge_count(), 0);
}

/// Move `amount` between two accounts; on deadlock the transaction is rolled
/// back and the error returned for a retry.
fn transfer(engine: &Engine, from: i64, to: i64, amount: i64) -> granitedb::Result<()> {
    let h = engine.handler();
    let tm = engine.transactions();
    let client = ClientId::new();
    h.begin(client).unwrap();

    let result = (|| -> granitedb::Result<()> {
        for key in [from, to] {
            tm.lock(client, &Resource::new("accounts", key), LockType::Exclusive)?;
        }
        let a = h.find(client, "accounts", from)?.unwrap_or(0);
        let b = h.find(client, "accounts", to)?.unwrap_or(0);
        h.update(client, "accounts", from, a - amount)?;
        h.update(client, "accounts", to, b + amount)?;
        Ok(())
    })();

    match result {
        Ok(()) => h.commit(client),
        Err(e) => {
            h.rollback(client)?;
            Err(e)
        }
    }
}
