//! Crash recovery and journal lifecycle integration tests.

use ledgerdb::{
    BufferSizing, BufferSpec, CommitPolicy, Config, Database, Key, VolumeSpec,
};
use std::time::Duration;

fn config(dir: &std::path::Path, frames: usize) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config::new(dir);
    config.volumes.push(VolumeSpec::new("data.v01", "data", 4096));
    config.buffers.push(BufferSpec {
        page_size: 4096,
        sizing: BufferSizing::Count(frames),
    });
    config.commit_policy = CommitPolicy::Hard;
    config.close_grace_period = Duration::from_millis(500);
    config
}

fn int_key(i: i64) -> Key {
    let mut key = Key::new();
    key.append_int(i);
    key
}

#[test]
fn crash_recovery_commits_survive_uncommitted_vanish() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(config(dir.path(), 64)).unwrap();
        let cursor = db.cursor("data", "ledger", true).unwrap();

        for i in 1..=1000i64 {
            let mut txn = db.begin().unwrap();
            cursor
                .store(&txn, &int_key(i), format!("row-{}", i).as_bytes())
                .unwrap();
            if i % 2 == 1 {
                txn.commit().unwrap();
            }
            // even transactions are simply never committed
        }

        db.crash();
    }

    let db = Database::open(config(dir.path(), 64)).unwrap();
    let report = db.recovery_report().clone();
    assert!(report.committed_transactions >= 500);
    assert!(report.uncommitted_transactions >= 500);

    let cursor = db.cursor("data", "ledger", false).unwrap();
    let txn = db.begin().unwrap();
    for i in 1..=1000i64 {
        let value = cursor.fetch(&txn, &int_key(i)).unwrap();
        if i % 2 == 1 {
            assert_eq!(
                value.as_deref(),
                Some(format!("row-{}", i).as_bytes()),
                "committed key {} lost",
                i
            );
        } else {
            assert!(value.is_none(), "uncommitted key {} resurrected", i);
        }
    }
    drop(txn);
    db.close().unwrap();
}

#[test]
fn crash_recovery_after_copy_back_still_hides_uncommitted() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(config(dir.path(), 64)).unwrap();
        let cursor = db.cursor("data", "t", true).unwrap();

        let mut committed = db.begin().unwrap();
        cursor.store(&committed, &int_key(1), b"keep").unwrap();
        committed.commit().unwrap();

        // an uncommitted write that reaches the volume through copy-back
        let open = db.begin().unwrap();
        cursor.store(&open, &int_key(2), b"discard").unwrap();
        db.copy_back();
        std::mem::forget(open); // left active at the "crash"

        db.crash();
    }

    let db = Database::open(config(dir.path(), 64)).unwrap();
    let cursor = db.cursor("data", "t", false).unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(cursor.fetch(&txn, &int_key(1)).unwrap().as_deref(), Some(&b"keep"[..]));
    // the version sits in the copied-back page but its writer never
    // committed, so it must stay invisible
    assert!(cursor.fetch(&txn, &int_key(2)).unwrap().is_none());
    drop(txn);
    db.close().unwrap();
}

#[test]
fn journal_rollover_and_base_advance() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 256);
    cfg.commit_policy = CommitPolicy::Soft;
    cfg.journal_block_size = 10_000_000; // the minimum: forces rollovers
    // keep admission control out of this test's way
    cfg.urgent_file_count_threshold = 60;

    let value = vec![0xABu8; 1200];
    {
        let db = Database::open(cfg.clone()).unwrap();
        let cursor = db.cursor("data", "bulk", true).unwrap();

        let mut txn = db.begin().unwrap();
        for i in 0..100_000i64 {
            cursor.store(&txn, &int_key(i), &value).unwrap();
            if i % 1000 == 999 {
                txn.commit().unwrap();
                txn = db.begin().unwrap();
            }
        }
        txn.commit().unwrap();

        let before = db.journal_stats();
        assert!(
            before.file_count >= 10,
            "expected at least ten rollovers, saw {} files",
            before.file_count
        );

        // checkpoint + copy-back lets the base advance and files go away
        db.checkpoint().unwrap().expect("checkpoint confirmed");
        db.copy_back();

        let after = db.journal_stats();
        assert!(after.base_address > before.base_address);
        assert!(
            after.file_count < before.file_count,
            "files below the base must be deleted ({} -> {})",
            before.file_count,
            after.file_count
        );

        db.crash();
    }

    // recovery from the remaining files reproduces the final state
    let db = Database::open(cfg).unwrap();
    let cursor = db.cursor("data", "bulk", false).unwrap();
    let txn = db.begin().unwrap();
    for i in (0..100_000i64).step_by(997) {
        assert_eq!(
            cursor.fetch(&txn, &int_key(i)).unwrap().unwrap(),
            value,
            "key {} lost after rollover recovery",
            i
        );
    }
    drop(txn);
    db.close().unwrap();
}

#[test]
fn recovery_recreates_trees_known_only_to_the_journal() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(config(dir.path(), 64)).unwrap();
        let cursor = db.cursor("data", "fresh", true).unwrap();
        let mut txn = db.begin().unwrap();
        cursor.store(&txn, &int_key(7), b"seven").unwrap();
        txn.commit().unwrap();
        // crash before any checkpoint could capture the directory pages
        db.crash();
    }

    let db = Database::open(config(dir.path(), 64)).unwrap();
    assert!(db.list_trees("data").unwrap().contains(&"fresh".to_string()));
    let cursor = db.cursor("data", "fresh", false).unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(cursor.fetch(&txn, &int_key(7)).unwrap().as_deref(), Some(&b"seven"[..]));
    drop(txn);
    db.close().unwrap();
}

#[test]
fn double_open_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 64)).unwrap();
    let second = Database::open(config(dir.path(), 64));
    assert!(second.is_err());
    db.close().unwrap();
}

#[test]
fn clean_shutdown_leaves_small_recovery_window() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config(dir.path(), 64)).unwrap();
        let cursor = db.cursor("data", "t", true).unwrap();
        let mut txn = db.begin().unwrap();
        for i in 0..500i64 {
            cursor.store(&txn, &int_key(i), b"v").unwrap();
        }
        txn.commit().unwrap();
        db.close().unwrap();
    }

    let db = Database::open(config(dir.path(), 64)).unwrap();
    let report = db.recovery_report();
    // the final checkpoint settled everything: nothing left to replay
    assert_eq!(report.applied_pages, 0);
    assert!(report.truncated_by.is_none());
    assert!(report.keystone_address.0 > 0);
    db.close().unwrap();
}
