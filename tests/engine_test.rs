//! Engine-level integration tests: round trips, traversal, splits, long
//! records, snapshot isolation, and the key/value boundary behaviors.

use ledgerdb::{
    BufferSizing, BufferSpec, CommitPolicy, Config, Database, Direction, Error, Key, VolumeSpec,
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
    config.commit_policy = CommitPolicy::Soft;
    config.close_grace_period = Duration::from_millis(500);
    config
}

fn string_key(text: &str) -> Key {
    let mut key = Key::new();
    key.append_str(text);
    key
}

fn int_key(i: i64) -> Key {
    let mut key = Key::new();
    key.append_int(i);
    key
}

#[test]
fn fifty_thousand_key_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(config(dir.path(), 256)).unwrap();
        let cursor = db.cursor("data", "records", true).unwrap();

        let mut txn = db.begin().unwrap();
        for i in 1..=50_000i64 {
            cursor
                .store(&txn, &int_key(i), format!("Record #{}", i).as_bytes())
                .unwrap();
        }
        txn.commit().unwrap();
        db.close().unwrap();
    }

    // clean shutdown and reopen: every key comes back
    let db = Database::open(config(dir.path(), 256)).unwrap();
    let cursor = db.cursor("data", "records", false).unwrap();
    let txn = db.begin().unwrap();
    for i in 1..=50_000i64 {
        let value = cursor.fetch(&txn, &int_key(i)).unwrap();
        assert_eq!(
            value.as_deref(),
            Some(format!("Record #{}", i).as_bytes()),
            "key {} lost",
            i
        );
    }
    drop(txn);
    db.close().unwrap();
}

#[test]
fn traversal_under_eviction_visits_every_key_once() {
    let dir = tempfile::tempdir().unwrap();
    // pool far smaller than the tree
    let db = Database::open(config(dir.path(), 8)).unwrap();
    let cursor = db.cursor("data", "scan", true).unwrap();

    let mut txn = db.begin().unwrap();
    for i in 0..1000i64 {
        cursor.store(&txn, &int_key(i), &i.to_be_bytes()).unwrap();
    }
    txn.commit().unwrap();

    let txn = db.begin().unwrap();
    let mut seen = Vec::new();
    let mut position = Key::before();
    while let Some(result) = cursor.traverse(&txn, &position, Direction::Gt, true).unwrap() {
        seen.push(result.key.clone());
        position = result.key;
    }
    assert_eq!(seen.len(), 1000, "every key exactly once");
    for window in seen.windows(2) {
        assert!(window[0] < window[1], "sorted order");
    }
    drop(txn);
    db.close().unwrap();
}

#[test]
fn backward_traversal_mirrors_forward() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "scan", true).unwrap();

    let mut txn = db.begin().unwrap();
    for i in 0..200i64 {
        cursor.store(&txn, &int_key(i), b"x").unwrap();
    }
    txn.commit().unwrap();

    let txn = db.begin().unwrap();
    let mut count = 0;
    let mut position = Key::after();
    let mut last: Option<Key> = None;
    while let Some(result) = cursor.traverse(&txn, &position, Direction::Lt, true).unwrap() {
        if let Some(previous) = &last {
            assert!(result.key < *previous);
        }
        count += 1;
        last = Some(result.key.clone());
        position = result.key;
    }
    assert_eq!(count, 200);
    drop(txn);
    db.close().unwrap();
}

#[test]
fn split_with_long_separator_survives_removal() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 64)).unwrap();
    let cursor = db.cursor("data", "split", true).unwrap();

    let long_middle = "m".repeat(600);
    let mut keys = Vec::new();
    for i in 1..=4 {
        let mut key = Key::new();
        key.append_str("A").append_int(i as i64);
        keys.push(key);
    }
    let mut b_long = Key::new();
    b_long.append_str("B").append_str(&long_middle);
    keys.push(b_long.clone());
    let mut b_z = Key::new();
    b_z.append_str("B").append_str("z");
    keys.push(b_z.clone());
    for i in 1..=3 {
        let mut key = Key::new();
        key.append_str("C").append_int(i as i64);
        keys.push(key);
    }

    // values fat enough that the nine keys cannot share one 4 KiB page
    let mut txn = db.begin().unwrap();
    for (i, key) in keys.iter().enumerate() {
        cursor
            .store(&txn, key, format!("value-{}-{}", i, "v".repeat(700)).as_bytes())
            .unwrap();
    }
    txn.commit().unwrap();

    let mut txn = db.begin().unwrap();
    assert!(cursor.remove(&txn, &b_z).unwrap());
    txn.commit().unwrap();

    let txn = db.begin().unwrap();
    let mut a1 = Key::new();
    a1.append_str("A").append_int(1i64);
    let mut c3 = Key::new();
    c3.append_str("C").append_int(3i64);
    assert!(cursor.fetch(&txn, &a1).unwrap().is_some());
    assert!(cursor.fetch(&txn, &b_long).unwrap().is_some());
    assert!(cursor.fetch(&txn, &c3).unwrap().is_some());
    assert!(cursor.fetch(&txn, &b_z).unwrap().is_none());
    drop(txn);
    db.close().unwrap();
}

#[test]
fn snapshot_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "iso", true).unwrap();
    let key = string_key("k");

    let mut setup = db.begin().unwrap();
    cursor.store(&setup, &key, b"original").unwrap();
    setup.commit().unwrap();

    // A begins and reads
    let mut a = db.begin().unwrap();
    assert_eq!(cursor.fetch(&a, &key).unwrap().as_deref(), Some(&b"original"[..]));

    // B begins later, writes, and commits
    let mut b = db.begin().unwrap();
    cursor.store(&b, &key, b"updated").unwrap();
    b.commit().unwrap();

    // A still sees its snapshot
    assert_eq!(cursor.fetch(&a, &key).unwrap().as_deref(), Some(&b"original"[..]));
    a.commit().unwrap();

    // a transaction begun after B's commit sees the update
    let fresh = db.begin().unwrap();
    assert_eq!(cursor.fetch(&fresh, &key).unwrap().as_deref(), Some(&b"updated"[..]));
    drop(fresh);
    db.close().unwrap();
}

#[test]
fn concurrent_writers_exactly_one_commits() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "ww", true).unwrap();
    let key = string_key("contested");

    let mut t = db.begin().unwrap();
    let mut u = db.begin().unwrap();

    cursor.store(&t, &key, b"from-t").unwrap();
    // the second concurrent writer loses immediately
    let conflict = cursor.store(&u, &key, b"from-u");
    assert!(matches!(conflict, Err(Error::Rollback)));
    assert!(matches!(u.commit(), Err(Error::Rollback)));

    t.commit().unwrap();

    let fresh = db.begin().unwrap();
    assert_eq!(cursor.fetch(&fresh, &key).unwrap().as_deref(), Some(&b"from-t"[..]));
    drop(fresh);
    db.close().unwrap();
}

#[test]
fn key_length_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "bounds", true).unwrap();

    // encoded size = class byte + payload + terminator; the ceiling for a
    // 4 KiB page is 1024 encoded bytes
    let mut at_limit = Key::new();
    at_limit.append_bytes(&vec![0x42u8; 1022]);
    assert_eq!(at_limit.encoded().len(), 1024);

    let mut over = Key::new();
    over.append_bytes(&vec![0x42u8; 1023]);

    let mut txn = db.begin().unwrap();
    cursor.store(&txn, &at_limit, b"fits").unwrap();
    assert!(matches!(
        cursor.store(&txn, &over, b"too long"),
        Err(Error::KeyTooLong { .. })
    ));
    txn.commit().unwrap();

    let txn = db.begin().unwrap();
    assert_eq!(cursor.fetch(&txn, &at_limit).unwrap().as_deref(), Some(&b"fits"[..]));
    drop(txn);
    db.close().unwrap();
}

#[test]
fn sentinel_and_empty_keys_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "bounds", true).unwrap();

    let txn = db.begin().unwrap();
    assert!(matches!(
        cursor.store(&txn, &Key::before(), b"x"),
        Err(Error::SentinelKey)
    ));
    assert!(matches!(
        cursor.store(&txn, &Key::after(), b"x"),
        Err(Error::SentinelKey)
    ));
    assert!(matches!(
        cursor.store(&txn, &Key::new(), b"x"),
        Err(Error::EmptyKey)
    ));
    drop(txn);
    db.close().unwrap();
}

#[test]
fn long_record_threshold_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 64)).unwrap();
    let cursor = db.cursor("data", "long", true).unwrap();

    let key = string_key("fat-value");
    let threshold = cursor.long_record_threshold(&key);

    let inline = vec![0xA5u8; threshold];
    let chained = vec![0x5Au8; threshold + 1];
    let huge = vec![0x33u8; 200_000];

    let mut txn = db.begin().unwrap();
    cursor.store(&txn, &key, &inline).unwrap();
    txn.commit().unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(cursor.fetch(&txn, &key).unwrap().unwrap(), inline);
    drop(txn);

    let mut txn = db.begin().unwrap();
    cursor.store(&txn, &key, &chained).unwrap();
    txn.commit().unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(cursor.fetch(&txn, &key).unwrap().unwrap(), chained);
    drop(txn);

    let mut txn = db.begin().unwrap();
    cursor.store(&txn, &key, &huge).unwrap();
    txn.commit().unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(cursor.fetch(&txn, &key).unwrap().unwrap(), huge);
    drop(txn);
    db.close().unwrap();
}

#[test]
fn single_key_tree_round_trips_through_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config(dir.path(), 32)).unwrap();
        let cursor = db.cursor("data", "tiny", true).unwrap();
        let mut txn = db.begin().unwrap();
        cursor.store(&txn, &string_key("only"), b"one").unwrap();
        txn.commit().unwrap();
        db.close().unwrap();
    }
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "tiny", false).unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(
        cursor.fetch(&txn, &string_key("only")).unwrap().as_deref(),
        Some(&b"one"[..])
    );
    drop(txn);
    db.close().unwrap();
}

#[test]
fn shallow_traversal_names_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "dirs", true).unwrap();

    // a two-level hierarchy: {a,1} {a,2} {b,1} {c}
    let mut txn = db.begin().unwrap();
    for (parent, child) in [("a", Some(1i64)), ("a", Some(2)), ("b", Some(1))] {
        let mut key = Key::new();
        key.append_str(parent);
        if let Some(child) = child {
            key.append_int(child);
        }
        cursor.store(&txn, &key, b"leaf").unwrap();
    }
    cursor.store(&txn, &string_key("c"), b"plain").unwrap();
    txn.commit().unwrap();

    let txn = db.begin().unwrap();

    // deep: the next key after {a} is {a,1}
    let deep = cursor
        .traverse(&txn, &string_key("a"), Direction::Gt, true)
        .unwrap()
        .unwrap();
    let mut expect = Key::new();
    expect.append_str("a").append_int(1i64);
    assert_eq!(deep.key, expect);

    // shallow: the next sibling after {a} is {b}; it carries no value of
    // its own (only {b,1} does)
    let shallow = cursor
        .traverse(&txn, &string_key("a"), Direction::Gt, false)
        .unwrap()
        .unwrap();
    assert_eq!(shallow.key, string_key("b"));
    assert_eq!(shallow.value, None);

    // continuing shallow from {b} lands on {c}, which has a value
    let next = cursor
        .traverse(&txn, &shallow.key, Direction::Gt, false)
        .unwrap()
        .unwrap();
    assert_eq!(next.key, string_key("c"));
    assert_eq!(next.value.as_deref(), Some(&b"plain"[..]));

    drop(txn);
    db.close().unwrap();
}

#[test]
fn remove_range_deletes_visible_span() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "ranges", true).unwrap();

    let mut txn = db.begin().unwrap();
    for i in 0..100i64 {
        cursor.store(&txn, &int_key(i), b"v").unwrap();
    }
    txn.commit().unwrap();

    let mut txn = db.begin().unwrap();
    let removed = cursor
        .remove_range(&txn, &int_key(10), &int_key(19))
        .unwrap();
    assert_eq!(removed, 10);
    txn.commit().unwrap();

    let txn = db.begin().unwrap();
    assert!(cursor.fetch(&txn, &int_key(9)).unwrap().is_some());
    for i in 10..=19 {
        assert!(cursor.fetch(&txn, &int_key(i)).unwrap().is_none());
    }
    assert!(cursor.fetch(&txn, &int_key(20)).unwrap().is_some());
    drop(txn);
    db.close().unwrap();
}

#[test]
fn tree_administration() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();

    db.cursor("data", "alpha", true).unwrap();
    db.cursor("data", "beta", true).unwrap();
    assert_eq!(db.list_trees("data").unwrap(), vec!["alpha", "beta"]);

    db.remove_tree("data", "alpha").unwrap();
    assert_eq!(db.list_trees("data").unwrap(), vec!["beta"]);
    assert!(matches!(
        db.cursor("data", "alpha", false),
        Err(Error::TreeNotFound(_))
    ));
    db.close().unwrap();
}

#[test]
fn open_transaction_delays_close_only_briefly() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();

    let txn = db.begin().unwrap();
    let started = std::time::Instant::now();
    db.close().unwrap();
    let elapsed = started.elapsed();
    // blocked by the straggler for at most the grace period (plus slack)
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_secs(5));
    drop(txn);
}

#[test]
fn value_too_large_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 32);
    cfg.max_value_size = 1024;
    let db = Database::open(cfg).unwrap();
    let cursor = db.cursor("data", "limits", true).unwrap();

    let txn = db.begin().unwrap();
    assert!(matches!(
        cursor.store(&txn, &string_key("k"), &vec![0u8; 2048]),
        Err(Error::ValueTooLarge { .. })
    ));
    drop(txn);
    db.close().unwrap();
}

#[test]
fn randomized_workload_matches_model() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 64)).unwrap();
    let cursor = db.cursor("data", "model", true).unwrap();

    let mut rng = StdRng::seed_from_u64(0xBADC0FFE);
    let mut model: BTreeMap<i64, Vec<u8>> = BTreeMap::new();

    for _ in 0..20 {
        let mut txn = db.begin().unwrap();
        for _ in 0..200 {
            let k = rng.gen_range(0..500i64);
            if rng.gen_bool(0.75) {
                let len = rng.gen_range(0..300usize);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                cursor.store(&txn, &int_key(k), &value).unwrap();
                model.insert(k, value);
            } else {
                cursor.remove(&txn, &int_key(k)).unwrap();
                model.remove(&k);
            }
        }
        txn.commit().unwrap();
    }

    let txn = db.begin().unwrap();
    for k in 0..500i64 {
        assert_eq!(
            cursor.fetch(&txn, &int_key(k)).unwrap(),
            model.get(&k).cloned(),
            "divergence at key {}",
            k
        );
    }
    // traversal agrees with the model's key order
    let mut position = Key::before();
    let mut model_iter = model.keys();
    while let Some(found) = cursor.traverse(&txn, &position, Direction::Gt, true).unwrap() {
        let expected = model_iter.next().expect("engine has extra keys");
        assert_eq!(found.key, int_key(*expected));
        position = found.key;
    }
    assert!(model_iter.next().is_none(), "engine lost keys");
    drop(txn);
    db.close().unwrap();
}

#[test]
fn statistics_surface_responds() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config(dir.path(), 32)).unwrap();
    let cursor = db.cursor("data", "stats", true).unwrap();

    let mut txn = db.begin().unwrap();
    for i in 0..100i64 {
        cursor.store(&txn, &int_key(i), b"v").unwrap();
    }
    txn.commit().unwrap();

    let (snapshot, gauges) = db.pool_stats(4096).unwrap();
    assert!(snapshot.writer_claims > 0);
    assert!(gauges.valid > 0);

    let journal = db.journal_stats();
    assert!(journal.current_address.0 > 0);
    assert!(journal.file_count >= 1);

    let depths = db.transaction_depths();
    assert_eq!(depths.current, 0);

    assert!(db.volume_info("data").is_some());
    assert!(db.alerts().is_empty());
    db.close().unwrap();
}
