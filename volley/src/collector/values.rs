use pdatastructs::tdigest::{TDigest, K1};
use std::fmt;
use tracing::error;
use volley_core::{MetricKind, TDIGEST_BACKLOG_SIZE, TDIGEST_COMPRESSION};

/// Aggregated values of a single metric.
///
/// Lives behind the collector's per-metric lock while a run is in progress, and is cloned into a
/// [`MetricsSnapshot`](crate::MetricsSnapshot) when frozen.
#[derive(Debug, Clone)]
pub struct MetricValues {
    kind: MetricKind,
    count: u64,
    non_zero: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: Option<f64>,
    dropped: u64,
    latency: Option<TDigest<K1>>,
}

impl MetricValues {
    pub(crate) fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            count: 0,
            non_zero: 0,
            sum: 0.,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: None,
            dropped: 0,
            latency: (kind == MetricKind::Trend).then(default_tdigest),
        }
    }

    /// Fold one value into the aggregate. Values which would corrupt it (non-finite values, a
    /// saturated counter) are dropped and counted instead.
    pub(crate) fn add(&mut self, value: f64) -> bool {
        let sum = self.sum + value;
        let count = match self.count.checked_add(1) {
            Some(count) if value.is_finite() && sum.is_finite() => count,
            _ => {
                self.dropped = self.dropped.saturating_add(1);
                return false;
            }
        };

        self.count = count;
        self.sum = sum;
        if value != 0. {
            self.non_zero += 1;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if let Some(latency) = &mut self.latency {
            latency.insert(value);
        }
        true
    }

    pub(crate) fn set_last(&mut self, value: f64) {
        self.last = Some(value);
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Number of values added.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Values dropped to protect the aggregate.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Fraction of added values which were non-zero.
    pub fn rate(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.non_zero as f64 / self.count as f64)
    }

    /// Number of non-zero values, i.e. passes for a rate metric.
    pub fn non_zero(&self) -> u64 {
        self.non_zero
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }

    /// Latest value of a gauge.
    pub fn value(&self) -> Option<f64> {
        self.last
    }

    /// Estimated percentile, `p` in `[0, 100]`. Only trends carry a distribution.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let latency = self.latency.as_ref()?;
        if self.is_empty() {
            return None;
        }

        let estimate = latency.quantile((p / 100.).clamp(0., 1.));
        if !estimate.is_finite() {
            error!("Non-finite percentile estimate for p({p}); reporting the maximum instead.");
            return Some(self.max);
        }

        // Interpolation can stray outside the observed range on tiny sample sets.
        Some(estimate.clamp(self.min, self.max))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.)
    }
}

impl fmt::Display for MetricValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MetricKind::Counter => write!(f, "count={}", self.sum),
            MetricKind::Gauge => write!(f, "value={}", self.last.unwrap_or_default()),
            MetricKind::Rate => write!(
                f,
                "rate={:.4} ({}/{})",
                self.rate().unwrap_or_default(),
                self.non_zero,
                self.count
            ),
            MetricKind::Trend => write!(
                f,
                "avg={:.2} min={:.2} med={:.2} max={:.2} p(95)={:.2} p(99)={:.2}",
                self.mean().unwrap_or_default(),
                self.min().unwrap_or_default(),
                self.median().unwrap_or_default(),
                self.max().unwrap_or_default(),
                self.percentile(95.).unwrap_or_default(),
                self.percentile(99.).unwrap_or_default(),
            ),
        }
    }
}

fn default_tdigest() -> TDigest<K1> {
    TDigest::new(K1::new(TDIGEST_COMPRESSION), TDIGEST_BACKLOG_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};
    use rand_distr::{Distribution, Uniform};

    #[test]
    fn rate_counts_non_zero_values() {
        let mut values = MetricValues::new(MetricKind::Rate);
        assert_eq!(values.rate(), None);
        for i in 0..100 {
            values.add(if i < 10 { 1. } else { 0. });
        }
        assert_eq!(values.count(), 100);
        assert_eq!(values.non_zero(), 10);
        assert_eq!(values.rate(), Some(0.1));
    }

    #[test]
    fn trend_statistics() {
        let mut values = MetricValues::new(MetricKind::Trend);
        for v in [10., 20., 30., 40.] {
            values.add(v);
        }
        assert_eq!(values.mean(), Some(25.));
        assert_eq!(values.min(), Some(10.));
        assert_eq!(values.max(), Some(40.));
        assert_eq!(values.sum(), 100.);
    }

    #[test]
    fn constant_trend_percentiles_are_exact() {
        let mut values = MetricValues::new(MetricKind::Trend);
        for _ in 0..1_000 {
            values.add(100.);
        }
        assert_eq!(values.percentile(95.), Some(100.));
        assert_eq!(values.percentile(99.), Some(100.));
    }

    #[test]
    fn uniform_trend_percentiles_are_close() {
        let mut rng = SmallRng::seed_from_u64(7);
        let dist = Uniform::new(0., 1_000.);
        let mut values = MetricValues::new(MetricKind::Trend);
        for _ in 0..50_000 {
            values.add(dist.sample(&mut rng));
        }

        let p50 = values.percentile(50.).unwrap();
        let p95 = values.percentile(95.).unwrap();
        assert!((p50 - 500.).abs() < 25., "p50={p50}");
        assert!((p95 - 950.).abs() < 25., "p95={p95}");
    }

    #[test]
    fn non_trend_metrics_have_no_percentiles() {
        let mut values = MetricValues::new(MetricKind::Rate);
        values.add(1.);
        assert_eq!(values.percentile(95.), None);
    }

    #[test]
    fn drops_values_that_would_corrupt_the_aggregate() {
        let mut values = MetricValues::new(MetricKind::Counter);
        assert!(values.add(1.));
        assert!(!values.add(f64::NAN));
        assert!(!values.add(f64::INFINITY));

        values.count = u64::MAX;
        assert!(!values.add(1.));

        assert_eq!(values.count(), u64::MAX);
        assert_eq!(values.sum(), 1.);
        assert_eq!(values.dropped(), 3);
    }
}
