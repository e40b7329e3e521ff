//! Store/fetch hot-path benchmark.

use criterion::{criterion_group, criterion_main, Criterion};
use ledgerdb::{BufferSizing, BufferSpec, CommitPolicy, Config, Database, Key};

fn setup(dir: &std::path::Path) -> std::sync::Arc<Database> {
    let mut config = Config::new(dir);
    config
        .volumes
        .push(ledgerdb::VolumeSpec::new("bench.v01", "bench", 4096));
    config.buffers.push(BufferSpec {
        page_size: 4096,
        sizing: BufferSizing::Count(1024),
    });
    config.commit_policy = CommitPolicy::Soft;
    Database::open(config).unwrap()
}

fn bench_store_fetch(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(dir.path());
    let cursor = db.cursor("bench", "kv", true).unwrap();

    let mut i = 0i64;
    c.bench_function("store", |b| {
        b.iter(|| {
            let mut txn = db.begin().unwrap();
            let mut key = Key::new();
            key.append_int(i);
            cursor.store(&txn, &key, b"benchmark value payload").unwrap();
            txn.commit().unwrap();
            i += 1;
        })
    });

    // populate a fixed window for fetches
    {
        let mut txn = db.begin().unwrap();
        for j in 0..10_000i64 {
            let mut key = Key::new();
            key.append_int(j);
            cursor.store(&txn, &key, b"benchmark value payload").unwrap();
        }
        txn.commit().unwrap();
    }

    let mut j = 0i64;
    c.bench_function("fetch", |b| {
        b.iter(|| {
            let txn = db.begin().unwrap();
            let mut key = Key::new();
            key.append_int(j % 10_000);
            let value = cursor.fetch(&txn, &key).unwrap();
            assert!(value.is_some());
            j += 1;
        })
    });

    db.close().unwrap();
}

criterion_group!(benches, bench_store_fetch);
criterion_main!(benches);
