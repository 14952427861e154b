//! Performance benchmarks for crr-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crr_engine::{
    ChangeRecord, ChangesQuery, ColumnDef, ColumnType, Replica, SiteId, TableDef, Value,
};

fn todos_def() -> TableDef {
    TableDef::new(
        "todos",
        vec![
            ColumnDef::primary_key("id", ColumnType::Integer),
            ColumnDef::nullable("title", ColumnType::Text),
            ColumnDef::not_null_with_default("done", ColumnType::Integer, Value::Integer(0)),
        ],
    )
}

fn seeded_replica(seed: u8, rows: i64) -> Replica {
    let mut replica = Replica::with_site_id(SiteId::from_bytes([seed; 16]));
    replica.create_table(todos_def()).unwrap();
    replica.make_crr("todos").unwrap();
    for i in 0..rows {
        replica
            .insert(
                "todos",
                [
                    ("id", Value::Integer(i)),
                    ("title", Value::text(format!("todo {i}"))),
                ],
            )
            .unwrap();
    }
    replica
}

fn bench_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture");

    group.bench_function("insert", |b| {
        let mut replica = seeded_replica(1, 0);
        let mut id = 0i64;
        b.iter(|| {
            id += 1;
            replica.insert(
                "todos",
                [
                    ("id", Value::Integer(black_box(id))),
                    ("title", Value::text("bench")),
                ],
            )
        })
    });

    group.bench_function("update", |b| {
        let mut replica = seeded_replica(1, 1);
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            replica.update(
                "todos",
                vec![Value::Integer(0)],
                [("done", Value::Integer(black_box(n % 2)))],
            )
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("apply_batch", size), size, |b, &size| {
            let source = seeded_replica(1, size);
            let batch: Vec<ChangeRecord> = source.changes(ChangesQuery::new()).unwrap();

            b.iter(|| {
                let mut target = seeded_replica(2, 0);
                target.apply_changes(black_box(&batch))
            })
        });

        group.bench_with_input(
            BenchmarkId::new("apply_superseded", size),
            size,
            |b, &size| {
                let source = seeded_replica(1, size);
                let batch: Vec<ChangeRecord> = source.changes(ChangesQuery::new()).unwrap();
                let mut target = seeded_replica(2, 0);
                target.apply_changes(&batch).unwrap();

                // every record is already known; this measures the no-op path
                b.iter(|| target.apply_changes(black_box(&batch)))
            },
        );
    }

    group.finish();
}

fn bench_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("scan_all", size), size, |b, &size| {
            let replica = seeded_replica(1, size);
            b.iter(|| replica.changes(black_box(ChangesQuery::new())))
        });

        group.bench_with_input(BenchmarkId::new("scan_since", size), size, |b, &size| {
            let replica = seeded_replica(1, size);
            let since = replica.db_version() / 2;
            b.iter(|| replica.changes_since(black_box(since), None))
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    group.bench_function("record_to_json", |b| {
        let replica = seeded_replica(1, 1);
        let record = replica.changes(ChangesQuery::new()).unwrap().remove(1);
        b.iter(|| serde_json::to_string(black_box(&record)))
    });

    group.bench_function("snapshot_export", |b| {
        let replica = seeded_replica(1, 500);
        b.iter(|| replica.export_state())
    });

    group.finish();
}

criterion_group!(benches, bench_capture, bench_merge, bench_feed, bench_serialization);
criterion_main!(benches);
