use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pryv_sync::engine::apply_changes;
use pryv_sync::{ChangeSet, ChangeToken, Deletion, LocalRecord, MemoryRemoteStore};
use serde_json::json;

fn additions(count: usize) -> Vec<LocalRecord> {
    (0..count)
        .map(|i| LocalRecord::new(format!("r{}", i), "bodyMass", "mass/kg", json!(60 + i % 40)))
        .collect()
}

fn bench_first_sync(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("first_sync");

    for count in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let remote = MemoryRemoteStore::new("bench");
                let changes = ChangeSet {
                    additions: additions(count),
                    deletions: vec![],
                    next_anchor: ChangeToken::from_u64(count as u64),
                };
                let report = runtime.block_on(apply_changes(&remote, &ChangeToken::bootstrap(), changes));
                assert_eq!(report.created.len(), count);
                black_box(report);
            });
        });
    }
    group.finish();
}

fn bench_redelivery(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("redelivery");

    for count in [10, 100, 1000].iter() {
        let remote = MemoryRemoteStore::new("bench");
        let changes = ChangeSet {
            additions: additions(*count),
            deletions: vec![],
            next_anchor: ChangeToken::from_u64(*count as u64),
        };
        runtime.block_on(apply_changes(&remote, &ChangeToken::bootstrap(), changes.clone()));

        // Everything is already remote: only the dedup lookup runs
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let report = runtime.block_on(apply_changes(
                    &remote,
                    &ChangeToken::bootstrap(),
                    changes.clone(),
                ));
                assert!(report.created.is_empty());
                black_box(report);
            });
        });
    }
    group.finish();
}

fn bench_deletions(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("delete_100", |b| {
        b.iter(|| {
            let remote = MemoryRemoteStore::new("bench");
            let created = ChangeSet {
                additions: additions(100),
                deletions: vec![],
                next_anchor: ChangeToken::from_u64(100),
            };
            runtime.block_on(apply_changes(&remote, &ChangeToken::bootstrap(), created));

            let removed = ChangeSet {
                additions: vec![],
                deletions: (0..100).map(|i| Deletion::new(format!("r{}", i))).collect(),
                next_anchor: ChangeToken::from_u64(200),
            };
            let report =
                runtime.block_on(apply_changes(&remote, &ChangeToken::from_u64(100), removed));
            assert_eq!(report.deleted.len(), 100);
            black_box(report);
        });
    });
}

criterion_group!(benches, bench_first_sync, bench_redelivery, bench_deletions);
criterion_main!(benches);
