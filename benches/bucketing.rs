use std::time::Duration;

use chrono::{DateTime, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use shepherd::model::{Snapshot, SnapshotMetrics};
use shepherd::uptime::{build_series, Period, SeriesMode, Window};

const NOW_MS: i64 = 1_700_000_000_000;

fn snapshot_at(machine: usize, at_ms: i64) -> Snapshot {
    Snapshot {
        machine_id: format!("m-{machine}"),
        at: DateTime::<Utc>::from_timestamp_millis(at_ms).expect("valid timestamp"),
        metrics: SnapshotMetrics {
            cpu_load: 0.42 + machine as f64 * 0.01,
            mem_usage_mb: 512.0,
            disk_used_gb: 10.0 + at_ms as f64 % 7.0,
            disk_total_gb: 100.0,
        },
    }
}

/// A day of 1-minute snapshots for a small fleet.
fn build_day_of_snapshots(machines: usize) -> Vec<Snapshot> {
    let window = Window::compute(NOW_MS, Period::Day, Duration::from_secs(60));
    let mut snapshots = Vec::new();

    for machine in 0..machines {
        let mut t = window.period_start;
        while t <= window.period_end {
            snapshots.push(snapshot_at(machine, t));
            t += 60_000;
        }
    }

    snapshots
}

fn bench_window_compute(c: &mut Criterion) {
    c.bench_function("window_compute_week", |b| {
        b.iter(|| {
            black_box(Window::compute(
                black_box(NOW_MS),
                Period::Week,
                Duration::from_secs(60),
            ))
        })
    });
}

fn bench_build_series(c: &mut Criterion) {
    let snapshots = build_day_of_snapshots(10);
    let window = Window::compute(NOW_MS, Period::Day, Duration::from_secs(60));

    let mut group = c.benchmark_group("build_series");

    group.bench_function("aggregate_10_machines_day", |b| {
        b.iter(|| {
            black_box(build_series(
                window,
                black_box(&snapshots),
                SeriesMode::Aggregate,
            ))
        })
    });

    let single: Vec<Snapshot> = snapshots
        .iter()
        .filter(|s| s.machine_id == "m-0")
        .cloned()
        .collect();

    group.bench_function("per_machine_day", |b| {
        b.iter(|| {
            black_box(build_series(
                window,
                black_box(&single),
                SeriesMode::PerMachine,
            ))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_window_compute, bench_build_series);
criterion_main!(benches);
