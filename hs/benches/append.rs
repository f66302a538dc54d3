use criterion::{Criterion, criterion_group, criterion_main};
use historystore::{EvalStatus, Evaluation, HistoryStore, NewRow, ObjectiveShape, Returned};
use std::hint::black_box;

fn bench_append(c: &mut Criterion) {
    let x = [0.25; 8];
    let x_cube = [0.5; 8];

    c.bench_function("append_10k_rows", |b| {
        b.iter(|| {
            let mut store = HistoryStore::new(8, ObjectiveShape::Scalar);
            for _ in 0..10_000 {
                let row = NewRow {
                    x: &x,
                    x_cube: &x_cube,
                    is_local_point: true,
                    paused: false,
                };
                black_box(store.append(row).ok());
            }
            store
        })
    });

    c.bench_function("append_and_mark_10k_rows", |b| {
        b.iter(|| {
            let mut store = HistoryStore::new(8, ObjectiveShape::Scalar);
            for i in 0..10_000u64 {
                let row = NewRow {
                    x: &x,
                    x_cube: &x_cube,
                    is_local_point: true,
                    paused: false,
                };
                let id = store.append(row).unwrap_or(i);
                let returned = Returned {
                    value: Evaluation::Scalar(i as f64),
                    status: EvalStatus::Evaluated,
                    worker: None,
                };
                black_box(store.mark_returned(id, returned).ok());
            }
            store
        })
    });
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
