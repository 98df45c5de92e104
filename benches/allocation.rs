//! Benchmarks for reservation, publish and free paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use vea_rs::{ManualClock, SpaceInfo, VeaBuilder};

const TOTAL_BLOCKS: u64 = 1 << 20;

fn new_space() -> SpaceInfo {
    VeaBuilder::new()
        .clock(Arc::new(ManualClock::new(0)))
        .format(TOTAL_BLOCKS)
        .build()
        .unwrap()
}

/// Space fragmented into `holes` free extents of 1..=64 blocks
fn fragmented_space(holes: usize) -> SpaceInfo {
    let mut vea = new_space();
    let mut all = [vea.reserve((TOTAL_BLOCKS - 1) as u32, None).unwrap()];
    vea.publish(&mut all).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut offset = 1u64;
    for _ in 0..holes {
        if offset + 64 >= TOTAL_BLOCKS {
            break;
        }
        let count = rng.gen_range(1..=64u32);
        vea.free(offset, count).unwrap();
        offset += u64::from(count) + rng.gen_range(1..=64u64);
    }
    vea.flush().unwrap();
    vea
}

fn benchmark_reserve_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_cancel");

    for blocks in [1u32, 64, 4096, 65536].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(blocks), blocks, |b, &blocks| {
            let mut vea = new_space();
            b.iter(|| {
                let resrv = vea.reserve(black_box(blocks), None).unwrap();
                vea.cancel(&mut [resrv]).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_hinted_reserve(c: &mut Criterion) {
    c.bench_function("reserve_hinted_stream", |b| {
        b.iter_batched(
            new_space,
            |mut vea| {
                let mut batch: Vec<_> = (0..256)
                    .map(|_| vea.reserve(16, Some(1)).unwrap())
                    .collect();
                vea.cancel(&mut batch).unwrap();
                vea
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn benchmark_publish_free(c: &mut Criterion) {
    c.bench_function("publish_then_free", |b| {
        let mut vea = new_space();
        b.iter(|| {
            let mut resrv = [vea.reserve(32, None).unwrap()];
            vea.publish(&mut resrv).unwrap();
            vea.free(resrv[0].offset(), 32).unwrap();
            vea.flush().unwrap();
        });
    });
}

fn benchmark_fragmented_reserve(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_fragmented");

    for holes in [100usize, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(holes), holes, |b, &holes| {
            let mut vea = fragmented_space(holes);
            b.iter(|| {
                // Small requests hit the size classes, larger ones need vectors
                for blocks in [8u32, 48, 200] {
                    let resrv = vea.reserve(black_box(blocks), None).unwrap();
                    vea.cancel(&mut [resrv]).unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_reserve_cancel,
    benchmark_hinted_reserve,
    benchmark_publish_free,
    benchmark_fragmented_reserve
);
criterion_main!(benches);
