use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use progression_core::{CatalogCompiler, LevelOverride, RawPathRecord, RawSegment};

fn synthetic_records(paths: usize, max_level: u32) -> Vec<RawPathRecord> {
    (0..paths)
        .map(|index| {
            let linear = RawSegment {
                start_level: 1,
                end_level: i64::from(max_level),
                mode: Some("Linear".into()),
                linear_slope: Some(12.0),
                ..Default::default()
            };
            let exponential = RawSegment {
                start_level: 1,
                end_level: i64::from(max_level),
                mode: Some("Exponential".into()),
                exp_rate: Some(1.05),
                ..Default::default()
            };
            RawPathRecord::new(format!("path_{index}"), max_level)
                .with_override(LevelOverride {
                    level: 0,
                    resource_costs: vec![("wood".into(), 50), ("stone".into(), 20)],
                    upgrade_seconds: Some(5),
                    locked: false,
                })
                .with_override(LevelOverride {
                    level: i64::from(max_level / 2),
                    resource_costs: vec![("wood".into(), 500)],
                    upgrade_seconds: None,
                    locked: false,
                })
                .with_cost_segments("wood", vec![linear])
                .with_cost_segments("stone", vec![exponential.clone()])
                .with_time_segments(vec![exponential])
        })
        .collect()
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for paths in [16usize, 128, 512] {
        group.bench_with_input(BenchmarkId::new("paths", paths), &paths, |b, &paths| {
            b.iter_batched(
                || synthetic_records(paths, 50),
                |records| CatalogCompiler::new().compile(records),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(compile_benches, bench_compile);
criterion_main!(compile_benches);
