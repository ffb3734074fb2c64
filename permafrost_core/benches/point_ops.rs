use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use permafrost_core::{Configs, KvEngine};

const PREFILL: usize = 10_000;

fn bench_configs() -> Configs {
    let mut configs = Configs::default();
    configs.pmem_file_size = 512 << 20;
    configs.pmem_segment_bytes = 4 << 20;
    configs.hash_bucket_num = 1 << 18;
    configs.dram_arena_bytes = 256 << 20;
    configs.max_access_threads = 8;
    configs
}

fn key(i: usize) -> String {
    format!("bench-key-{:08}", i)
}

fn bench_point_ops(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let engine = KvEngine::open(dir.path().join("pool"), bench_configs()).expect("open failed");

    for i in 0..PREFILL {
        engine
            .put(key(i).as_bytes(), b"prefill-value")
            .expect("prefill put failed");
        engine
            .sorted_put("bench", key(i).as_bytes(), b"prefill-value")
            .expect("prefill sorted put failed");
    }

    let mut group = c.benchmark_group("point_ops");
    group.throughput(Throughput::Elements(1));

    let mut i = 0_usize;
    group.bench_function("string_put", |b| {
        b.iter(|| {
            i = (i + 1) % PREFILL;
            engine
                .put(key(i).as_bytes(), b"bench-value")
                .expect("put failed");
        })
    });

    let mut i = 0_usize;
    group.bench_function("string_get", |b| {
        b.iter(|| {
            i = (i + 1) % PREFILL;
            engine.get(key(i).as_bytes()).expect("get failed")
        })
    });

    let mut i = 0_usize;
    group.bench_function("sorted_put", |b| {
        b.iter(|| {
            i = (i + 1) % PREFILL;
            engine
                .sorted_put("bench", key(i).as_bytes(), b"bench-value")
                .expect("sorted put failed");
        })
    });

    let mut i = 0_usize;
    group.bench_function("sorted_get", |b| {
        b.iter(|| {
            i = (i + 1) % PREFILL;
            engine
                .sorted_get("bench", key(i).as_bytes())
                .expect("sorted get failed")
        })
    });

    let mut i = 0_usize;
    group.bench_function("sorted_seek", |b| {
        let mut iter = engine.sorted_iterator("bench").expect("iterator failed");
        b.iter(|| {
            i = (i + 1) % PREFILL;
            iter.seek(key(i).as_bytes());
            assert!(iter.valid());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_point_ops);
criterion_main!(benches);
