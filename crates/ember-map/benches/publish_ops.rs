//! Benchmark: commit-map publish and lookup hot paths.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ember_map::CommitMap;
use ember_nvm::{Fram, FramLayout};
use ember_types::{LogicalTime, NvAddr, ObjectId, StoreGeometry, ValidityInterval};

fn make_map() -> (CommitMap, Fram) {
    let layout = FramLayout::new(StoreGeometry::default()).expect("layout");
    let mut fram = Fram::new(layout.total_len());
    let map = CommitMap::new(layout);
    map.format(&mut fram).expect("format");
    (map, fram)
}

fn bench_publish(c: &mut Criterion) {
    let (map, mut fram) = make_map();
    let interval = ValidityInterval::new(LogicalTime(1), LogicalTime(9));

    c.bench_function("publish", |b| {
        b.iter(|| {
            map.publish(
                black_box(&mut fram),
                black_box(ObjectId(7)),
                black_box(NvAddr(0x400)),
                black_box(interval),
                black_box(8),
            )
            .expect("publish");
        });
    });
}

fn bench_current_address(c: &mut Criterion) {
    let (map, mut fram) = make_map();
    let interval = ValidityInterval::new(LogicalTime(1), LogicalTime(9));
    map.publish(&mut fram, ObjectId(7), NvAddr(0x400), interval, 8)
        .expect("seed");

    c.bench_function("current_address", |b| {
        b.iter(|| black_box(map.current_address(black_box(&fram), black_box(ObjectId(7)))));
    });
}

fn bench_current_interval(c: &mut Criterion) {
    let (map, mut fram) = make_map();
    let interval = ValidityInterval::new(LogicalTime(1), LogicalTime(9));
    map.publish(&mut fram, ObjectId(3), NvAddr(0x100), interval, 8)
        .expect("seed");

    c.bench_function("current_interval", |b| {
        b.iter(|| black_box(map.current_interval(black_box(&fram), black_box(ObjectId(3)))));
    });
}

criterion_group!(benches, bench_publish, bench_current_address, bench_current_interval);
criterion_main!(benches);
