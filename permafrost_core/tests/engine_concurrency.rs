use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use permafrost_core::{Configs, KvEngine, KvError};

const THREADS: usize = 16;
const KEYS_PER_THREAD: usize = 1_250;

fn test_configs() -> Configs {
    let mut configs = Configs::default();
    configs.pmem_file_size = 256 << 20;
    configs.pmem_segment_bytes = 1 << 20;
    configs.hash_bucket_num = 1 << 16;
    configs.num_buckets_per_slot = 8;
    configs.dram_arena_bytes = 128 << 20;
    configs.max_access_threads = 64;
    configs
}

fn open_engine(dir: &tempfile::TempDir) -> Arc<KvEngine> {
    Arc::new(KvEngine::open(dir.path().join("pool"), test_configs()).expect("engine open failed"))
}

#[test]
fn sixteen_threads_insert_distinct_sorted_keys() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let engine = open_engine(&dir);
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..KEYS_PER_THREAD {
                let key = format!("{:02}-{:06}", t, i);
                let value = format!("value-{}-{}", t, i);
                engine
                    .sorted_put("storm", key.as_bytes(), value.as_bytes())
                    .expect("sorted put failed");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    // Every acknowledged write must be readable.
    for t in 0..THREADS {
        for i in 0..KEYS_PER_THREAD {
            let key = format!("{:02}-{:06}", t, i);
            let value = engine
                .sorted_get("storm", key.as_bytes())
                .unwrap_or_else(|err| panic!("lost key {}: {}", key, err));
            assert_eq!(value, format!("value-{}-{}", t, i).into_bytes());
        }
    }

    // Iteration yields each key exactly once, in strictly ascending order.
    let mut iter = engine.sorted_iterator("storm").expect("iterator failed");
    iter.seek_to_first();
    let mut seen = HashSet::new();
    let mut last: Option<Vec<u8>> = None;
    while iter.valid() {
        let key = iter.key().expect("key missing");
        if let Some(last) = &last {
            assert!(*last < key, "iteration order broken at {:?}", key);
        }
        assert!(seen.insert(key.clone()), "duplicate key {:?}", key);
        last = Some(key);
        iter.next();
    }
    assert_eq!(seen.len(), THREADS * KEYS_PER_THREAD);
}

#[test]
fn concurrent_same_key_updates_converge_on_one_winner() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let engine = open_engine(&dir);
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for value in [&b"v1"[..], b"v2"] {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            engine.put(b"k", value).expect("string put failed");
            engine.sorted_put("s", b"k", value).expect("sorted put failed");
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    let winner = engine.get(b"k").expect("string winner missing");
    assert!(winner == b"v1" || winner == b"v2");
    let sorted_winner = engine.sorted_get("s", b"k").expect("sorted winner missing");
    assert!(sorted_winner == b"v1" || sorted_winner == b"v2");

    engine.put(b"k", b"v3").expect("follow-up put failed");
    engine.sorted_put("s", b"k", b"v3").expect("follow-up sorted put failed");
    assert_eq!(engine.get(b"k").expect("get failed"), b"v3");
    assert_eq!(engine.sorted_get("s", b"k").expect("get failed"), b"v3");
}

#[test]
fn readers_always_observe_complete_values_during_churn() {
    const KEYS: usize = 64;
    const WRITERS: usize = 4;
    const READERS: usize = 4;
    const ROUNDS: usize = 400;

    let dir = tempfile::tempdir().expect("tempdir failed");
    let engine = open_engine(&dir);
    for key in 0..KEYS {
        engine
            .put(format!("churn-{:03}", key).as_bytes(), b"seed:0:0")
            .expect("seed put failed");
    }

    let barrier = Arc::new(Barrier::new(WRITERS + READERS));
    let mut handles = Vec::new();

    for w in 0..WRITERS {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for round in 0..ROUNDS {
                let key = format!("churn-{:03}", (w * 17 + round) % KEYS);
                let value = format!("seed:{}:{}", w, round);
                engine
                    .put(key.as_bytes(), value.as_bytes())
                    .expect("churn put failed");
            }
        }));
    }

    for _ in 0..READERS {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for round in 0..ROUNDS {
                let key = format!("churn-{:03}", round % KEYS);
                match engine.get(key.as_bytes()) {
                    Ok(value) => {
                        let text = String::from_utf8(value).expect("value bytes torn");
                        assert!(
                            text.starts_with("seed:"),
                            "reader observed a partial value: {}",
                            text
                        );
                    }
                    Err(KvError::NotFound) => panic!("seeded key {} disappeared", key),
                    Err(err) => panic!("unexpected read error: {}", err),
                }
            }
        }));
    }

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
}

#[test]
fn concurrent_deletes_and_inserts_keep_iteration_consistent() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let engine = open_engine(&dir);

    for i in 0..512_u32 {
        engine
            .sorted_put("mixed", format!("{:06}", i).as_bytes(), b"v")
            .expect("seed put failed");
    }

    let barrier = Arc::new(Barrier::new(2));
    let deleter = {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in (0..512_u32).step_by(2) {
                engine
                    .sorted_delete("mixed", format!("{:06}", i).as_bytes())
                    .expect("delete failed");
            }
        })
    };
    let inserter = {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 512..768_u32 {
                engine
                    .sorted_put("mixed", format!("{:06}", i).as_bytes(), b"v")
                    .expect("insert failed");
            }
        })
    };
    deleter.join().expect("deleter panicked");
    inserter.join().expect("inserter panicked");

    let mut iter = engine.sorted_iterator("mixed").expect("iterator failed");
    iter.seek_to_first();
    let mut count = 0_usize;
    let mut last: Option<Vec<u8>> = None;
    while iter.valid() {
        let key = iter.key().expect("key missing");
        if let Some(last) = &last {
            assert!(*last < key, "order broken after concurrent churn");
        }
        let n: u32 = String::from_utf8(key.clone())
            .expect("key bytes")
            .parse()
            .expect("numeric key");
        assert!(
            n % 2 == 1 || n >= 512,
            "deleted key {:06} resurfaced in iteration",
            n
        );
        last = Some(key);
        count += 1;
    }
    assert_eq!(count, 256 + 256);

    // Retired index nodes drain once the writers are quiescent.
    let mut total = 0_usize;
    for _ in 0..16 {
        let reclaimed = engine.reclaim_volatile(usize::MAX);
        total += reclaimed;
        if reclaimed == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let _ = total;
}
