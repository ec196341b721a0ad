use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{Aggregate, OutcomeLog},
    metric::Outcome,
};

/// A [`ReportSink`] performs the side effect of publishing a [`Summary`],
/// such as printing it or sending it to a service.
pub trait ReportSink {
    fn emit(&self, summary: &Summary)
    -> impl Future<Output = Result<(), Box<dyn std::error::Error>>>;
}

/// Presentation settings for a [`Summary`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportSettings {
    /// Requests slower than this are counted separately.
    pub threshold: Duration,
    /// Print every duration in milliseconds instead of adaptive units.
    pub fixed_ms: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(1),
            fixed_ms: false,
        }
    }
}

/// Per-label figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelStats {
    pub count: usize,
    pub failures: usize,
    pub mean_latency: Duration,
}

/// Latency distribution, recorded at microsecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub successes: usize,
    pub failures: usize,
    /// Percentage of successful requests.
    pub success_ratio: f64,
    pub total_bytes: usize,
    /// From the start of the earliest request to the end of the latest one.
    pub wall_time: Duration,
    /// Requests per second over `wall_time`.
    pub rate: f64,
    /// Bytes per second over `wall_time`.
    pub throughput: f64,
    pub latency: Percentiles,
    pub over_threshold: usize,
    pub by_label: BTreeMap<String, LabelStats>,
    pub settings: ReportSettings,
}

impl Summary {
    pub fn from_log(log: &OutcomeLog, settings: ReportSettings) -> Self {
        let count = log.len();
        let successes = log.successes();
        let total_bytes = log.iter().map(|o| o.size).sum();

        let first_start = log.iter().map(Outcome::started).min().unwrap_or_default();
        let last_finish = log.iter().map(|o| o.finished).max().unwrap_or_default();
        let wall_time = last_finish.saturating_sub(first_start);
        let per_second = |n: f64| {
            if wall_time.is_zero() {
                0.0
            } else {
                n / wall_time.as_secs_f64()
            }
        };

        let latency = latency_percentiles(log);
        let over_threshold = log
            .iter()
            .filter(|o| o.elapsed > settings.threshold)
            .count();

        let mut by_label: BTreeMap<String, (LabelStats, Duration)> = BTreeMap::new();
        for outcome in log.iter() {
            let label = outcome.label.clone().unwrap_or_else(|| "-".to_string());
            let (stats, total) = by_label.entry(label).or_default();
            stats.count += 1;
            stats.failures += usize::from(!outcome.success);
            *total += outcome.elapsed;
        }

        Self {
            count,
            successes,
            failures: count - successes,
            success_ratio: if count == 0 {
                0.0
            } else {
                successes as f64 / count as f64 * 100.0
            },
            total_bytes,
            wall_time,
            rate: per_second(count as f64),
            throughput: per_second(total_bytes as f64),
            latency,
            over_threshold,
            by_label: by_label
                .into_iter()
                .map(|(label, (mut stats, total))| {
                    stats.mean_latency = total.div_f64(stats.count as f64);
                    (label, stats)
                })
                .collect(),
            settings,
        }
    }

    fn duration(&self, d: Duration) -> String {
        pretty_duration(d, self.settings.fixed_ms)
    }
}

/// Longest latency the histogram tracks, in microseconds. Slower requests are
/// clamped to it.
const MAX_LATENCY_US: u64 = 3_600_000_000;

fn latency_percentiles(log: &OutcomeLog) -> Percentiles {
    if log.is_empty() {
        return Percentiles::default();
    }
    let mut hist = match Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3) {
        Ok(hist) => hist,
        Err(e) => {
            tracing::error!("Cannot build latency histogram: {e}");
            return Percentiles::default();
        }
    };
    for outcome in log.iter() {
        let us = u64::try_from(outcome.elapsed.as_micros()).unwrap_or(u64::MAX);
        hist.saturating_record(us.clamp(1, MAX_LATENCY_US));
    }

    let at = |q: f64| Duration::from_micros(hist.value_at_quantile(q));
    Percentiles {
        p50: at(0.50),
        p90: at(0.90),
        p95: at(0.95),
        p99: at(0.99),
        max: Duration::from_micros(hist.max()),
    }
}

pub fn pretty_duration(d: Duration, fixed_ms: bool) -> String {
    if fixed_ms {
        return format!("{:.1} ms", d.as_secs_f64() * 1e3);
    }
    let ns = d.as_nanos();
    match ns {
        0..1_000 => format!("{ns} ns"),
        1_000..1_000_000 => format!("{:.1} µs", ns as f64 / 1e3),
        1_000_000..1_000_000_000 => format!("{:.1} ms", ns as f64 / 1e6),
        _ => format!("{:.2} s", d.as_secs_f64()),
    }
}

pub fn pretty_size(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Requests: {} ({} ok, {} failed, {:.1}% success)",
            self.count, self.successes, self.failures, self.success_ratio
        )?;
        writeln!(
            f,
            "Wall time: {}, {:.1} req/s, {}/s, {} total",
            self.duration(self.wall_time),
            self.rate,
            pretty_size(self.throughput),
            pretty_size(self.total_bytes as f64),
        )?;
        writeln!(f)?;
        writeln!(f, "| p50 | p90 | p95 | p99 | max |")?;
        writeln!(f, "|-----|-----|-----|-----|-----|")?;
        writeln!(
            f,
            "| {} | {} | {} | {} | {} |",
            self.duration(self.latency.p50),
            self.duration(self.latency.p90),
            self.duration(self.latency.p95),
            self.duration(self.latency.p99),
            self.duration(self.latency.max),
        )?;
        writeln!(
            f,
            "\n{} request(s) slower than {}",
            self.over_threshold,
            self.duration(self.settings.threshold)
        )?;
        if !self.by_label.is_empty() {
            writeln!(f, "\n| name | requests | failed | mean |")?;
            writeln!(f, "|------|----------|--------|------|")?;
            for (label, stats) in &self.by_label {
                writeln!(
                    f,
                    "| {label} | {} | {} | {} |",
                    stats.count,
                    stats.failures,
                    self.duration(stats.mean_latency)
                )?;
            }
        }
        Ok(())
    }
}

/// Run-wide accumulator of request outcomes.
///
/// Workers [`append`](Self::append) concurrently; the log keeps completion
/// order. [`report`](Self::report) only reads the log, so calling it twice
/// without new appends yields the same summary.
#[derive(Debug)]
pub struct Reporter {
    epoch: Instant,
    settings: ReportSettings,
    log: Mutex<OutcomeLog>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(ReportSettings::default())
    }
}

impl Reporter {
    pub fn new(settings: ReportSettings) -> Self {
        Self {
            epoch: Instant::now(),
            settings,
            log: Mutex::new(OutcomeLog::new()),
        }
    }

    pub fn append(&self, success: bool, elapsed: Duration, label: Option<&str>, size: usize) {
        let outcome = Outcome {
            success,
            elapsed,
            label: label.map(str::to_string),
            size,
            finished: self.epoch.elapsed(),
        };
        self.log.lock().consume(&outcome);
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    pub fn outcomes(&self) -> OutcomeLog {
        self.log.lock().clone()
    }

    pub fn report(&self) -> Summary {
        Summary::from_log(&self.log.lock(), self.settings)
    }

    /// Forget every outcome, for reuse between runs.
    pub fn reset(&self) {
        *self.log.lock() = OutcomeLog::new();
    }
}

/// Prints summaries to stdout.
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    async fn emit(&self, summary: &Summary) -> Result<(), Box<dyn std::error::Error>> {
        let rule = "=".repeat(72);
        println!("{rule}\n{summary}{rule}");
        Ok(())
    }
}
