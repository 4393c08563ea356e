use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arbor::page::NO_PAGE;
use arbor::tree::AccumulatorKind;
use arbor::txn::CommitListener;
use arbor::{CommitPolicy, Config, Engine, Error, Key, RecoveryStatus, Ts};

fn small_config(dir: &std::path::Path) -> Config {
    Config::new(dir)
        .page_size(1024)
        .buffer_pool_bytes(64 * 1024)
        .journal_file_size(256 * 1024)
        .commit_policy(CommitPolicy::Hard)
        .checkpoint_interval_ms(3_600_000)
}

fn main() {
    insert_read_cycle();
    transactional_counter();
    long_record_fidelity();
    range_delete();
    recovery_after_crash();
    accumulators_survive_recovery();
    commit_listener_fires();
    println!("engine_test: all scenarios passed");
}

/// Insert a run of i32 keys, then traverse forward from BEFORE and
/// check count, order and values. Traversal must also see the writes
/// before commit (read-your-writes merge).
fn insert_read_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(small_config(dir.path())).unwrap();
    let volume = engine.open_volume("data").unwrap();
    let mut ex = engine.exchange(&volume, "cycle", true).unwrap();

    let n = 500i32;
    let mut txn = engine.begin().unwrap();
    for i in 0..n {
        ex.key_mut().clear().append_i32(i).unwrap();
        ex.value_mut().put(format!("v{i}").as_bytes());
        ex.store(&mut txn).unwrap();
    }

    // uncommitted traversal sees the write set.
    ex.key_mut().clear();
    let mut seen = 0i32;
    while ex.next(&txn, false).unwrap() {
        let mut key = ex.key().clone();
        key.reset_index();
        assert_eq!(key.decode_i32().unwrap(), seen);
        seen += 1;
    }
    assert_eq!(seen, n);

    engine.commit(&mut txn).unwrap();
    engine.end(&mut txn).unwrap();

    // committed traversal out of a fresh transaction.
    let mut txn = engine.begin().unwrap();
    ex.key_mut().clear();
    let mut last = -1i32;
    let mut count = 0;
    while ex.next(&txn, false).unwrap() {
        let mut key = ex.key().clone();
        key.reset_index();
        let i = key.decode_i32().unwrap();
        assert!(i > last, "descending at {i} after {last}");
        assert_eq!(ex.value().as_bytes(), format!("v{i}").as_bytes());
        last = i;
        count += 1;
    }
    assert_eq!(count, n);
    assert_eq!(last, n - 1);
    engine.end(&mut txn).unwrap();
    engine.close().unwrap();
    println!("insert_read_cycle ok");
}

/// Concurrent increments of one counter under the hard policy; every
/// Rollback is retried. The final value is exactly threads × iters.
fn transactional_counter() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(small_config(dir.path())).unwrap();
    let volume = engine.open_volume("data").unwrap();
    // create the tree before the race.
    engine.exchange(&volume, "counter", true).unwrap();

    let threads = 8;
    let iters = 50i64;
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let engine = engine.clone();
            let volume = Arc::clone(&volume);
            std::thread::spawn(move || {
                let mut ex = engine.exchange(&volume, "counter", false).unwrap();
                for _ in 0..iters {
                    loop {
                        let mut txn = engine.begin().unwrap();
                        let attempt = (|| -> Result<(), Error> {
                            ex.key_mut().clear().append_i32(42)?;
                            let current = if ex.fetch(&txn)? {
                                i64::from_be_bytes(ex.value().as_bytes().try_into().unwrap())
                            } else {
                                0
                            };
                            ex.value_mut().put(&(current + 1).to_be_bytes());
                            ex.store(&mut txn)?;
                            engine.commit_with(&mut txn, CommitPolicy::Hard)?;
                            Ok(())
                        })();
                        engine.end(&mut txn).unwrap();
                        match attempt {
                            Ok(()) => break,
                            Err(Error::Rollback) => continue,
                            Err(err) => panic!("counter worker: {err}"),
                        }
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let mut ex = engine.exchange(&volume, "counter", false).unwrap();
    let txn = engine.begin().unwrap();
    ex.key_mut().clear().append_i32(42).unwrap();
    assert!(ex.fetch(&txn).unwrap());
    let total = i64::from_be_bytes(ex.value().as_bytes().try_into().unwrap());
    assert_eq!(total, threads as i64 * iters);
    let mut txn = txn;
    engine.end(&mut txn).unwrap();
    engine.close().unwrap();
    println!("transactional_counter ok");
}

/// A value far past the inline threshold round-trips byte for byte
/// through a long-record chain; overwriting it with a short value frees
/// the chain back to the volume free list.
fn long_record_fidelity() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(small_config(dir.path())).unwrap();
    let volume = engine.open_volume("data").unwrap();
    let mut ex = engine.exchange(&volume, "blobs", true).unwrap();

    let big: Vec<u8> = (0..80_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let mut txn = engine.begin().unwrap();
    ex.key_mut().clear().append_i32(1).unwrap();
    ex.value_mut().put(&big);
    ex.store(&mut txn).unwrap();
    engine.commit(&mut txn).unwrap();
    engine.end(&mut txn).unwrap();

    let mut txn = engine.begin().unwrap();
    ex.key_mut().clear().append_i32(1).unwrap();
    assert!(ex.fetch(&txn).unwrap());
    assert_eq!(ex.value().as_bytes(), big.as_slice());
    engine.end(&mut txn).unwrap();

    let mut txn = engine.begin().unwrap();
    ex.key_mut().clear().append_i32(1).unwrap();
    ex.value_mut().put(b"short value now.....");
    ex.store(&mut txn).unwrap();
    engine.commit(&mut txn).unwrap();
    engine.end(&mut txn).unwrap();

    let mut txn = engine.begin().unwrap();
    ex.key_mut().clear().append_i32(1).unwrap();
    assert!(ex.fetch(&txn).unwrap());
    assert_eq!(ex.value().len(), 20);
    engine.end(&mut txn).unwrap();

    // the chain's pages chained back onto the free list.
    assert_ne!(volume.meta.lock().unwrap().free_head, NO_PAGE);
    engine.close().unwrap();
    println!("long_record_fidelity ok");
}

/// Populate 0..300, delete [100, 200) transactionally, and check both
/// traversal directions skip exactly the removed band.
fn range_delete() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(small_config(dir.path())).unwrap();
    let volume = engine.open_volume("data").unwrap();
    let mut ex = engine.exchange(&volume, "range", true).unwrap();

    let mut txn = engine.begin().unwrap();
    for i in 0..300i32 {
        ex.key_mut().clear().append_i32(i).unwrap();
        ex.value_mut().put(&i.to_be_bytes());
        ex.store(&mut txn).unwrap();
    }
    engine.commit(&mut txn).unwrap();
    engine.end(&mut txn).unwrap();

    let mut txn = engine.begin().unwrap();
    ex.key_mut().clear().append_i32(100).unwrap();
    let mut to = Key::new();
    to.append_i32(200).unwrap();
    ex.remove_range(&to, &mut txn).unwrap();
    engine.commit(&mut txn).unwrap();
    engine.end(&mut txn).unwrap();

    let expected: Vec<i32> = (0..100).chain(200..300).collect();

    let mut txn = engine.begin().unwrap();
    ex.key_mut().clear();
    let mut forward = Vec::new();
    while ex.next(&txn, false).unwrap() {
        let mut key = ex.key().clone();
        key.reset_index();
        forward.push(key.decode_i32().unwrap());
    }
    assert_eq!(forward, expected);

    *ex.key_mut() = Key::after();
    let mut backward = Vec::new();
    while ex.previous(&txn, false).unwrap() {
        let mut key = ex.key().clone();
        key.reset_index();
        backward.push(key.decode_i32().unwrap());
    }
    let mut mirrored = expected.clone();
    mirrored.reverse();
    assert_eq!(backward, mirrored);

    ex.key_mut().clear().append_i32(150).unwrap();
    assert!(!ex.fetch(&txn).unwrap());
    let mut txn = txn;
    engine.end(&mut txn).unwrap();
    engine.close().unwrap();
    println!("range_delete ok");
}

/// Hard-committed updates survive an unclean shutdown; recovery reports
/// the crash, replays everything committed, and a subsequent clean
/// close reopens Clean.
fn recovery_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let n = 50i32;
    {
        let engine = Engine::open(small_config(dir.path())).unwrap();
        let volume = engine.open_volume("data").unwrap();
        let mut ex = engine.exchange(&volume, "crash", true).unwrap();
        for i in 0..n {
            let mut txn = engine.begin().unwrap();
            ex.key_mut().clear().append_i32(i).unwrap();
            ex.value_mut().put(format!("survivor{i}").as_bytes());
            ex.store(&mut txn).unwrap();
            engine.commit_with(&mut txn, CommitPolicy::Hard).unwrap();
            engine.end(&mut txn).unwrap();
        }
        // dropped without close(): the journal is left unsealed.
    }
    // let the background threads notice the engine is gone.
    std::thread::sleep(std::time::Duration::from_millis(800));

    {
        let engine = Engine::open(small_config(dir.path())).unwrap();
        assert_eq!(engine.recovery_status(), RecoveryStatus::CrashRecovered);
        let volume = engine.open_volume("data").unwrap();
        let mut ex = engine.exchange(&volume, "crash", false).unwrap();
        let txn = engine.begin().unwrap();
        for i in 0..n {
            ex.key_mut().clear().append_i32(i).unwrap();
            assert!(ex.fetch(&txn).unwrap(), "key {i} lost in crash");
            assert_eq!(ex.value().as_bytes(), format!("survivor{i}").as_bytes());
        }
        let mut txn = txn;
        engine.end(&mut txn).unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(small_config(dir.path())).unwrap();
    assert_eq!(engine.recovery_status(), RecoveryStatus::Clean);
    engine.close().unwrap();
    println!("recovery_after_crash ok");
}

/// Accumulator deltas commit through D0 sub-records and survive crash
/// recovery exactly.
fn accumulators_survive_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let n = 10i64;
    {
        let engine = Engine::open(small_config(dir.path())).unwrap();
        let volume = engine.open_volume("data").unwrap();
        let mut ex = engine.exchange(&volume, "ticker", true).unwrap();
        for _ in 0..n {
            let mut txn = engine.begin().unwrap();
            ex.increment(&mut txn, 0, AccumulatorKind::Seq).unwrap();
            engine.commit_with(&mut txn, CommitPolicy::Hard).unwrap();
            engine.end(&mut txn).unwrap();
        }
        assert_eq!(ex.accumulator_value(None, 0), n);
    }
    std::thread::sleep(std::time::Duration::from_millis(800));

    let engine = Engine::open(small_config(dir.path())).unwrap();
    let volume = engine.open_volume("data").unwrap();
    let ex = engine.exchange(&volume, "ticker", false).unwrap();
    assert_eq!(ex.accumulator_value(None, 0), n);
    engine.close().unwrap();
    println!("accumulators_survive_recovery ok");
}

struct Recorder(Arc<AtomicI64>);

impl CommitListener for Recorder {
    fn committed(&self, commit_ts: Ts) {
        self.0.store(commit_ts as i64, Ordering::SeqCst);
    }

    fn rolled_back(&self) {
        self.0.store(-1, Ordering::SeqCst);
    }
}

/// Listeners fire after durability on commit and on rollback.
fn commit_listener_fires() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(small_config(dir.path())).unwrap();
    let volume = engine.open_volume("data").unwrap();
    let mut ex = engine.exchange(&volume, "listen", true).unwrap();

    let seen = Arc::new(AtomicI64::new(0));
    let mut txn = engine.begin().unwrap();
    txn.add_listener(Box::new(Recorder(Arc::clone(&seen))));
    ex.key_mut().clear().append_i32(7).unwrap();
    ex.value_mut().put(b"x");
    ex.store(&mut txn).unwrap();
    engine.commit(&mut txn).unwrap();
    engine.end(&mut txn).unwrap();
    assert!(seen.load(Ordering::SeqCst) > 0);

    let seen = Arc::new(AtomicI64::new(0));
    let mut txn = engine.begin().unwrap();
    txn.add_listener(Box::new(Recorder(Arc::clone(&seen))));
    ex.key_mut().clear().append_i32(8).unwrap();
    ex.value_mut().put(b"y");
    ex.store(&mut txn).unwrap();
    engine.rollback(&mut txn).unwrap();
    engine.end(&mut txn).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), -1);

    let txn = engine.begin().unwrap();
    ex.key_mut().clear().append_i32(8).unwrap();
    assert!(!ex.fetch(&txn).unwrap());
    let mut txn = txn;
    engine.end(&mut txn).unwrap();
    engine.close().unwrap();
    println!("commit_listener_fires ok");
}
