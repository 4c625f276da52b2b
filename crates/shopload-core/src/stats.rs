use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::config::ReportConfig;
use crate::driver::Endpoint;
use crate::verifier::{VerificationError, VerificationFailure};

/// Timing of one completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub sent_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Clients running when the request was sent
    pub concurrency: usize,
}

#[derive(Default)]
struct EndpointStats {
    samples: Mutex<Vec<Sample>>,
    errors: Mutex<Vec<VerificationError>>,
    transport_failures: AtomicU64,
}

impl EndpointStats {
    fn clear(&self) {
        self.samples.lock().clear();
        self.errors.lock().clear();
        self.transport_failures.store(0, Ordering::SeqCst);
    }
}

/// Thread-safe accumulator shared by every client of a run.
#[derive(Default)]
pub struct RunStats {
    total_requests: AtomicU64,
    listing: EndpointStats,
    purchase: EndpointStats,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(&self, endpoint: Endpoint) -> &EndpointStats {
        match endpoint {
            Endpoint::Listing => &self.listing,
            Endpoint::Purchase => &self.purchase,
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample(&self, endpoint: Endpoint, sample: Sample) {
        self.endpoint(endpoint).samples.lock().push(sample);
    }

    pub fn record_error(&self, error: VerificationError) {
        self.endpoint(error.endpoint).errors.lock().push(error);
    }

    pub fn record_transport_failure(&self, endpoint: Endpoint) {
        self.endpoint(endpoint)
            .transport_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn transport_failures(&self, endpoint: Endpoint) -> u64 {
        self.endpoint(endpoint)
            .transport_failures
            .load(Ordering::Relaxed)
    }

    pub fn samples(&self, endpoint: Endpoint) -> Vec<Sample> {
        self.endpoint(endpoint).samples.lock().clone()
    }

    pub fn errors(&self, endpoint: Endpoint) -> Vec<VerificationError> {
        self.endpoint(endpoint).errors.lock().clone()
    }

    pub fn error_count(&self, endpoint: Endpoint) -> usize {
        self.endpoint(endpoint).errors.lock().len()
    }

    /// Clear every list and counter before the next phase.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::SeqCst);
        self.listing.clear();
        self.purchase.clear();
    }

    pub fn average(&self, endpoint: Endpoint) -> Duration {
        average(&self.samples(endpoint))
    }

    pub fn median(&self, endpoint: Endpoint) -> Duration {
        median(&self.samples(endpoint))
    }

    pub fn percentile(&self, endpoint: Endpoint, p: f64) -> Duration {
        percentile(&self.samples(endpoint), p)
    }

    pub fn report(&self, phase: &str, config: &ReportConfig) -> PhaseReport {
        let width = Duration::from_millis(config.time_bucket_ms);
        let endpoints = Endpoint::ALL
            .iter()
            .map(|&endpoint| {
                let samples = self.samples(endpoint);
                let errors = self.errors(endpoint);
                let wrong_status = errors
                    .iter()
                    .filter(|e| matches!(e.failure, VerificationFailure::WrongStatusCode { .. }))
                    .count();
                EndpointReport {
                    endpoint,
                    samples: samples.len(),
                    wrong_status,
                    wrong_body: errors.len() - wrong_status,
                    transport_failures: self.transport_failures(endpoint),
                    average: average(&samples),
                    median: median(&samples),
                    percentile: percentile(&samples, config.percentile),
                    by_concurrency: by_concurrency(&samples, config.percentile),
                    by_time: time_buckets(&samples, width, config.percentile),
                }
            })
            .collect();

        PhaseReport {
            phase: phase.to_string(),
            total_requests: self.total_requests(),
            percentile: config.percentile,
            endpoints,
        }
    }
}

fn sorted_elapsed(samples: &[Sample]) -> Vec<Duration> {
    let mut elapsed: Vec<Duration> = samples.iter().map(|s| s.elapsed).collect();
    elapsed.sort_unstable();
    elapsed
}

/// Arithmetic mean of elapsed times; zero for no samples.
pub fn average(samples: &[Sample]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: u128 = samples.iter().map(|s| s.elapsed.as_nanos()).sum();
    Duration::from_nanos((total / samples.len() as u128) as u64)
}

/// Middle elapsed time; the mean of the two middle values for an even count.
pub fn median(samples: &[Sample]) -> Duration {
    let sorted = sorted_elapsed(samples);
    let n = sorted.len();
    if n == 0 {
        return Duration::ZERO;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2
    }
}

/// Nearest-rank percentile: index `ceil(p/100 * n) - 1`, clamped to the list.
pub fn percentile(samples: &[Sample], p: f64) -> Duration {
    let sorted = sorted_elapsed(samples);
    let n = sorted.len();
    if n == 0 {
        return Duration::ZERO;
    }
    let rank = (p * n as f64 / 100.0).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBucket {
    /// Offset of the bucket start from the first sample
    pub start: Duration,
    pub count: usize,
    pub average: Duration,
    pub median: Duration,
    pub percentile: Duration,
}

/// Count and latency figures per fixed-width wall-clock bucket. Empty buckets
/// are skipped.
pub fn time_buckets(samples: &[Sample], width: Duration, p: f64) -> Vec<TimeBucket> {
    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|s| s.sent_at);
    let Some(first) = sorted.first().map(|s| s.sent_at) else {
        return Vec::new();
    };
    let width_ns = width.as_nanos().max(1);
    let bucket_of = |s: &Sample| -> u128 {
        (s.sent_at - first).to_std().unwrap_or_default().as_nanos() / width_ns
    };

    sorted
        .chunk_by(|a, b| bucket_of(a) == bucket_of(b))
        .map(|run| TimeBucket {
            start: Duration::from_nanos((bucket_of(&run[0]) * width_ns) as u64),
            count: run.len(),
            average: average(run),
            median: median(run),
            percentile: percentile(run, p),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyBreakdown {
    pub level: usize,
    pub count: usize,
    pub average: Duration,
    pub median: Duration,
    pub percentile: Duration,
}

/// Count and latency figures per concurrency level, ascending by level.
///
/// Samples are grouped by level over the whole phase, so a level seen both
/// while ramping up and while draining is reported as one row.
pub fn by_concurrency(samples: &[Sample], p: f64) -> Vec<ConcurrencyBreakdown> {
    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|s| s.sent_at);
    // Stable: keeps time order within a level.
    sorted.sort_by_key(|s| s.concurrency);

    sorted
        .chunk_by(|a, b| a.concurrency == b.concurrency)
        .map(|run| ConcurrencyBreakdown {
            level: run[0].concurrency,
            count: run.len(),
            average: average(run),
            median: median(run),
            percentile: percentile(run, p),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct EndpointReport {
    pub endpoint: Endpoint,
    pub samples: usize,
    pub wrong_status: usize,
    pub wrong_body: usize,
    pub transport_failures: u64,
    pub average: Duration,
    pub median: Duration,
    pub percentile: Duration,
    pub by_concurrency: Vec<ConcurrencyBreakdown>,
    pub by_time: Vec<TimeBucket>,
}

impl EndpointReport {
    pub fn errors(&self) -> usize {
        self.wrong_status + self.wrong_body
    }
}

#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: String,
    pub total_requests: u64,
    pub percentile: f64,
    pub endpoints: Vec<EndpointReport>,
}

impl PhaseReport {
    pub fn endpoint(&self, endpoint: Endpoint) -> Option<&EndpointReport> {
        self.endpoints.iter().find(|e| e.endpoint == endpoint)
    }

    pub fn total_errors(&self) -> usize {
        self.endpoints.iter().map(EndpointReport::errors).sum()
    }

    /// Emit the report as log lines.
    pub fn log(&self) {
        for line in self.to_string().lines() {
            info!("{}", line);
        }
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.percentile;
        writeln!(f, "=== Phase '{}' ===", self.phase)?;
        writeln!(f, "Total requests: {}", self.total_requests)?;
        for e in &self.endpoints {
            writeln!(
                f,
                "[{}] samples={} errors={} (status={} body={}) transport_failures={}",
                e.endpoint,
                e.samples,
                e.errors(),
                e.wrong_status,
                e.wrong_body,
                e.transport_failures
            )?;
            writeln!(
                f,
                "[{}] avg={:.3}ms median={:.3}ms p{}={:.3}ms",
                e.endpoint,
                ms(e.average),
                ms(e.median),
                p,
                ms(e.percentile)
            )?;
            for c in &e.by_concurrency {
                writeln!(
                    f,
                    "[{}] clients={:<5} requests={:<7} avg={:.3}ms median={:.3}ms p{}={:.3}ms",
                    e.endpoint,
                    c.level,
                    c.count,
                    ms(c.average),
                    ms(c.median),
                    p,
                    ms(c.percentile)
                )?;
            }
            for b in &e.by_time {
                writeln!(
                    f,
                    "[{}] t+{:>8.3}s requests={:<7} avg={:.3}ms median={:.3}ms p{}={:.3}ms",
                    e.endpoint,
                    b.start.as_secs_f64(),
                    b.count,
                    ms(b.average),
                    ms(b.median),
                    p,
                    ms(b.percentile)
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(offset_ms: i64, elapsed_ms: u64, concurrency: usize) -> Sample {
        Sample {
            sent_at: Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms).unwrap(),
            elapsed: Duration::from_millis(elapsed_ms),
            concurrency,
        }
    }

    fn elapsed(ms: &[u64]) -> Vec<Sample> {
        ms.iter()
            .enumerate()
            .map(|(i, &m)| at(i as i64, m, 1))
            .collect()
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&elapsed(&[5, 1, 4, 2, 3])), Duration::from_millis(3));
        assert_eq!(median(&elapsed(&[4, 1, 3, 2])), Duration::from_micros(2_500));
        assert_eq!(median(&elapsed(&[7])), Duration::from_millis(7));
        assert_eq!(median(&elapsed(&[1, 2])), Duration::from_micros(1_500));
        assert_eq!(median(&[]), Duration::ZERO);
    }

    #[test]
    fn test_average() {
        assert_eq!(average(&elapsed(&[1, 2, 3, 4])), Duration::from_micros(2_500));
        assert_eq!(average(&[]), Duration::ZERO);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let samples = elapsed(&(1..=100).rev().collect::<Vec<_>>());
        assert_eq!(percentile(&samples, 95.0), Duration::from_millis(95));
        assert_eq!(percentile(&samples, 100.0), Duration::from_millis(100));
        assert_eq!(percentile(&samples, 50.0), Duration::from_millis(50));
        assert_eq!(percentile(&samples, 0.1), Duration::from_millis(1));

        let small = elapsed(&[10, 20, 30]);
        assert_eq!(percentile(&small, 95.0), Duration::from_millis(30));
        assert_eq!(percentile(&[], 95.0), Duration::ZERO);
    }

    #[test]
    fn test_time_buckets() {
        let samples = vec![
            at(2_500, 40, 1),
            at(0, 10, 1),
            at(999, 30, 1),
            at(1_000, 7, 1),
            at(2_000, 20, 1),
        ];
        let buckets = time_buckets(&samples, Duration::from_secs(1), 95.0);
        let shape: Vec<_> = buckets.iter().map(|b| (b.start, b.count)).collect();
        assert_eq!(
            shape,
            vec![
                (Duration::ZERO, 2),
                (Duration::from_secs(1), 1),
                (Duration::from_secs(2), 2),
            ]
        );

        assert_eq!(buckets[0].average, Duration::from_millis(20));
        assert_eq!(buckets[0].median, Duration::from_millis(20));
        assert_eq!(buckets[0].percentile, Duration::from_millis(30));
        assert_eq!(buckets[1].average, Duration::from_millis(7));
        assert_eq!(buckets[1].percentile, Duration::from_millis(7));
        assert_eq!(buckets[2].median, Duration::from_millis(30));
        assert_eq!(buckets[2].percentile, Duration::from_millis(40));

        assert!(time_buckets(&[], Duration::from_secs(1), 95.0).is_empty());
    }

    #[test]
    fn test_by_concurrency_merges_separated_runs_of_a_level() {
        // Level 2 on the way up and again while clients drain.
        let samples = vec![at(0, 10, 2), at(1, 20, 3), at(2, 30, 2)];
        let breakdown = by_concurrency(&samples, 95.0);
        let levels: Vec<_> = breakdown.iter().map(|b| (b.level, b.count)).collect();
        assert_eq!(levels, vec![(2, 2), (3, 1)]);
        assert_eq!(breakdown[0].average, Duration::from_millis(20));
    }

    #[test]
    fn test_report_renders_bucket_latency() {
        let stats = RunStats::new();
        stats.record_sample(Endpoint::Listing, at(0, 4, 1));
        stats.record_sample(Endpoint::Listing, at(10, 8, 1));

        let text = stats.report("unit", &ReportConfig::default()).to_string();
        assert!(text.contains("t+   0.000s requests=2       avg=6.000ms median=6.000ms p95=8.000ms"));
    }

    #[test]
    fn test_by_concurrency() {
        let samples = vec![
            at(0, 10, 1),
            at(1, 20, 2),
            at(2, 30, 2),
            at(3, 40, 1),
            at(4, 50, 3),
        ];
        let breakdown = by_concurrency(&samples, 95.0);
        let levels: Vec<_> = breakdown.iter().map(|b| (b.level, b.count)).collect();
        assert_eq!(levels, vec![(1, 2), (2, 2), (3, 1)]);
        assert_eq!(breakdown[0].average, Duration::from_millis(25));
        assert_eq!(breakdown[1].median, Duration::from_millis(25));
        assert_eq!(breakdown[1].percentile, Duration::from_millis(30));
        assert_eq!(breakdown[2].percentile, Duration::from_millis(50));
    }

    #[test]
    fn test_record_and_reset() {
        let stats = RunStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_sample(Endpoint::Listing, at(0, 4, 1));
        stats.record_sample(Endpoint::Purchase, at(1, 6, 1));
        stats.record_transport_failure(Endpoint::Purchase);
        stats.record_error(VerificationError::new(
            Endpoint::Listing,
            VerificationFailure::WrongStatusCode { status: 500 },
        ));

        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.average(Endpoint::Listing), Duration::from_millis(4));
        assert_eq!(stats.median(Endpoint::Purchase), Duration::from_millis(6));
        assert_eq!(stats.error_count(Endpoint::Listing), 1);
        assert_eq!(stats.error_count(Endpoint::Purchase), 0);
        assert_eq!(stats.transport_failures(Endpoint::Purchase), 1);

        let report = stats.report("unit", &ReportConfig::default());
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.total_errors(), 1);
        let listing = report.endpoint(Endpoint::Listing).unwrap();
        assert_eq!(listing.wrong_status, 1);
        assert_eq!(listing.wrong_body, 0);
        assert!(report.to_string().contains("Phase 'unit'"));

        stats.reset();
        assert_eq!(stats.total_requests(), 0);
        assert!(stats.samples(Endpoint::Listing).is_empty());
        assert!(stats.errors(Endpoint::Listing).is_empty());
        assert_eq!(stats.transport_failures(Endpoint::Purchase), 0);
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = std::sync::Arc::new(RunStats::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        stats.record_request();
                        stats.record_sample(Endpoint::Listing, at(i, t + 1, t as usize));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.total_requests(), 2_000);
        assert_eq!(stats.samples(Endpoint::Listing).len(), 2_000);
    }
}
