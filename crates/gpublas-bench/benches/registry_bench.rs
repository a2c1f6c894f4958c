//! Object registry benchmarks.
//!
//! Every intercepted `free` and every operand placement does a registry
//! lookup, so these bound the per-call tracking overhead.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gpublas_core::SystemAllocator;
use gpublas_membrane::{AllocSym, AllocationRecord, CallSite, ObjectRegistry};

const OBJECT: usize = 4096;

fn populated(objects: usize) -> ObjectRegistry {
    let registry = ObjectRegistry::new();
    let record = Arc::new(AllocationRecord::new(
        AllocSym::Malloc,
        CallSite(0x4005d6),
        OBJECT,
        SystemAllocator::shared(),
    ));
    for i in 0..objects {
        registry.register(0x1000_0000 + i * OBJECT * 2, Arc::clone(&record), OBJECT);
    }
    registry
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_lookup");
    group.throughput(Throughput::Elements(1));

    for &objects in &[16usize, 1024, 65_536] {
        let registry = populated(objects);
        let base = 0x1000_0000 + (objects / 2) * OBJECT * 2;

        group.bench_with_input(BenchmarkId::new("exact", objects), &base, |b, &addr| {
            b.iter(|| black_box(registry.lookup(black_box(addr))));
        });
        group.bench_with_input(
            BenchmarkId::new("interior", objects),
            &(base + OBJECT / 2),
            |b, &addr| {
                b.iter(|| black_box(registry.lookup_containing(black_box(addr))));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("untracked", objects),
            &(base + OBJECT + 8),
            |b, &addr| {
                b.iter(|| black_box(registry.lookup_containing(black_box(addr))));
            },
        );
    }
    group.finish();
}

fn bench_register_cycle(c: &mut Criterion) {
    let registry = populated(1024);
    let record = Arc::new(AllocationRecord::new(
        AllocSym::Malloc,
        CallSite(0x400700),
        64,
        SystemAllocator::shared(),
    ));

    c.bench_function("registry_register_unregister", |b| {
        b.iter(|| {
            registry.register(0x9000_0000, Arc::clone(&record), 64);
            black_box(registry.unregister(0x9000_0000));
        });
    });
}

criterion_group!(benches, bench_lookup, bench_register_cycle);
criterion_main!(benches);
