use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use heap::{CollectionKind, Heap, HeapSettings, RootProvider, TraceLevel};
use object::{ObjectKind, Value};

struct BenchRoots {
    roots: Vec<Value>,
}

impl RootProvider for BenchRoots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in &mut self.roots {
            visitor(value);
        }
    }
}

fn bench_settings() -> HeapSettings {
    HeapSettings {
        region_count: 32,
        nursery_regions: 4,
        trace_level: TraceLevel::Quiet,
        ..HeapSettings::default()
    }
}

fn bench_nursery_allocation(c: &mut Criterion) {
    let heap = Heap::new(bench_settings()).expect("heap");
    let mut proxy = heap.proxy();
    let mut roots = BenchRoots { roots: Vec::new() };

    let mut group = c.benchmark_group("nursery");
    for slots in [1u16, 4, 16] {
        group.bench_with_input(BenchmarkId::new("allocate_object", slots), &slots, |b, &slots| {
            b.iter(|| {
                let value = proxy
                    .allocate_object(ObjectKind::Slots, slots, 0, &mut roots)
                    .expect("allocate");
                black_box(value)
            })
        });
    }
    group.finish();
}

fn bench_tenured_allocation(c: &mut Criterion) {
    let heap = Heap::new(bench_settings()).expect("heap");
    let mut proxy = heap.proxy();
    let mut roots = BenchRoots { roots: Vec::new() };

    c.bench_function("tenured/allocate_object", |b| {
        b.iter(|| {
            let value = proxy
                .allocate_tenured(ObjectKind::Slots, 4, 0, &mut roots)
                .expect("allocate");
            black_box(value)
        })
    });
}

/// Collections over a rooted linked list of `len` nodes.
fn bench_collections(c: &mut Criterion) {
    let heap = Heap::new(bench_settings()).expect("heap");
    let mut proxy = heap.proxy();
    let mut roots = BenchRoots { roots: Vec::new() };

    let mut head = Value::NULL;
    for _ in 0..10_000 {
        roots.roots = vec![head];
        let node = proxy
            .allocate_object(ObjectKind::Slots, 2, 0, &mut roots)
            .expect("allocate");
        unsafe { proxy.store(node, 0, roots.roots[0]) };
        head = node;
    }
    roots.roots = vec![head];

    c.bench_function("collect/minor", |b| {
        b.iter(|| proxy.collect(CollectionKind::Minor, &mut roots))
    });
    c.bench_function("collect/full", |b| {
        b.iter(|| proxy.collect(CollectionKind::Full, &mut roots))
    });
}

criterion_group!(
    benches,
    bench_nursery_allocation,
    bench_tenured_allocation,
    bench_collections
);
criterion_main!(benches);
