//! Bucket-aligned chart series over machine snapshots.
//!
//! Raw snapshots become a fixed-width, gap-preserving series a dashboard can
//! render directly: one point per bucket boundary, nulls where no snapshot
//! landed. Aggregate queries average across machines in a bucket; per-machine
//! queries keep the newest snapshot in a bucket to absorb ticker jitter.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::model::{Snapshot, SnapshotMetrics};

/// Target number of output points per query.
pub const TARGET_POINTS: i64 = 80;

/// Supported query windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    TenMinutes,
    OneHour,
    Day,
    Week,
}

impl Period {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "10m" => Some(Self::TenMinutes),
            "1h" => Some(Self::OneHour),
            "24h" => Some(Self::Day),
            "7d" => Some(Self::Week),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TenMinutes => "10m",
            Self::OneHour => "1h",
            Self::Day => "24h",
            Self::Week => "7d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::TenMinutes => 10 * 60 * 1000,
            Self::OneHour => 60 * 60 * 1000,
            Self::Day => 24 * 60 * 60 * 1000,
            Self::Week => 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// How a bucket's snapshots reduce to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesMode {
    /// Latest snapshot in the bucket wins.
    PerMachine,
    /// Arithmetic mean of each canonical field.
    Aggregate,
}

/// The resolved query window: both bounds land on bucket boundaries so the
/// first bucket is never a phantom partial gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub period_start: i64,
    pub period_end: i64,
    pub bucket_size: i64,
}

impl Window {
    /// Bucket width targets [`TARGET_POINTS`] output points but never drops
    /// below the snapshot interval, which would guarantee empty buckets.
    pub fn compute(now_ms: i64, period: Period, snapshot_interval: Duration) -> Self {
        let target = period.duration_ms() / TARGET_POINTS;
        let bucket_size = target.max(snapshot_interval.as_millis() as i64).max(1);

        Self {
            period_start: (now_ms - period.duration_ms()) / bucket_size * bucket_size,
            period_end: now_ms / bucket_size * bucket_size,
            bucket_size,
        }
    }
}

/// One chart point. Null metric fields mark a gap (downtime).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    pub t: i64,
    pub cpu_load: Option<f64>,
    pub mem_usage_mb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub disk_total_gb: Option<f64>,
}

impl ChartPoint {
    fn gap(t: i64) -> Self {
        Self {
            t,
            cpu_load: None,
            mem_usage_mb: None,
            disk_used_gb: None,
            disk_total_gb: None,
        }
    }

    fn from_metrics(t: i64, metrics: &SnapshotMetrics) -> Self {
        Self {
            t,
            cpu_load: Some(round3(metrics.cpu_load)),
            mem_usage_mb: Some(round3(metrics.mem_usage_mb)),
            disk_used_gb: Some(round3(metrics.disk_used_gb)),
            disk_total_gb: Some(round3(metrics.disk_total_gb)),
        }
    }
}

/// The full chart response body.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSeries {
    pub points: Vec<ChartPoint>,
    pub period_start: i64,
    pub period_end: i64,
    /// Suggested upper bound for the disk chart's Y axis.
    pub disk_max: f64,
}

/// Reduces snapshots into one point per bucket boundary in
/// `[period_start, period_end]`, inclusive on both ends.
pub fn build_series(window: Window, snapshots: &[Snapshot], mode: SeriesMode) -> ChartSeries {
    let mut by_bucket: BTreeMap<i64, Vec<&Snapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        let at = snapshot.at.timestamp_millis();
        if at < window.period_start || at > window.period_end {
            continue;
        }
        let bucket = at / window.bucket_size * window.bucket_size;
        by_bucket.entry(bucket).or_default().push(snapshot);
    }

    let mut points = Vec::new();
    let mut disk_max: Option<f64> = None;

    let mut t = window.period_start;
    while t <= window.period_end {
        match by_bucket.get(&t) {
            None => points.push(ChartPoint::gap(t)),
            Some(bucket) => {
                let metrics = reduce_bucket(bucket, mode);
                let point = ChartPoint::from_metrics(t, &metrics);
                if let Some(total) = point.disk_total_gb {
                    disk_max = Some(disk_max.map_or(total, |m| m.max(total)));
                }
                points.push(point);
            }
        }
        t += window.bucket_size;
    }

    ChartSeries {
        points,
        period_start: window.period_start,
        period_end: window.period_end,
        disk_max: disk_max.unwrap_or(1.0),
    }
}

fn reduce_bucket(bucket: &[&Snapshot], mode: SeriesMode) -> SnapshotMetrics {
    match mode {
        SeriesMode::PerMachine => {
            // Ticker jitter can land two rows in one bucket; the newest
            // observation wins.
            bucket
                .iter()
                .max_by_key(|s| s.at)
                .map(|s| s.metrics)
                .unwrap_or_default()
        }
        SeriesMode::Aggregate => {
            let n = bucket.len() as f64;
            let mut sum = SnapshotMetrics::default();
            for snapshot in bucket {
                sum.cpu_load += snapshot.metrics.cpu_load;
                sum.mem_usage_mb += snapshot.metrics.mem_usage_mb;
                sum.disk_used_gb += snapshot.metrics.disk_used_gb;
                sum.disk_total_gb += snapshot.metrics.disk_total_gb;
            }
            SnapshotMetrics {
                cpu_load: sum.cpu_load / n,
                mem_usage_mb: sum.mem_usage_mb / n,
                disk_used_gb: sum.disk_used_gb / n,
                disk_total_gb: sum.disk_total_gb / n,
            }
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
