//! Thread-safe metric aggregation.
mod cell;
mod values;

use cell::MetricCell;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};
use std::time::Duration;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, trace, warn};
use volley_core::{
    ConfigError, MetricKind, MetricSelector, Sample, Tags, BUILTIN_METRICS, CHECKS,
};

pub use values::MetricValues;

/// The single owner of every metric aggregate in a run.
///
/// Shared by reference (`Arc`) with every virtual user. `record()` never blocks on other
/// recorders; aggregation happens in `flush()`, which the run loop calls every scheduler tick,
/// and in `snapshot()`.
pub struct MetricsCollector {
    metrics: RwLock<HashMap<String, Arc<MetricEntry>>>,
    checks: RwLock<BTreeMap<String, Arc<CheckCounter>>>,
    started: Instant,
}

struct MetricEntry {
    cell: MetricCell,
    submetrics: Vec<Submetric>,
    rejected: AtomicU64,
}

struct Submetric {
    selector: MetricSelector,
    cell: MetricCell,
}

#[derive(Default)]
struct CheckCounter {
    passes: AtomicU64,
    fails: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector with the built-in metrics, the given custom metrics and the submetrics
    /// named by thresholds.
    pub fn new(
        custom: &[(String, MetricKind)],
        submetrics: &[MetricSelector],
    ) -> Result<Self, ConfigError> {
        let mut kinds: HashMap<String, MetricKind> = BUILTIN_METRICS
            .iter()
            .map(|(name, kind)| (name.to_string(), *kind))
            .collect();

        for (name, kind) in custom {
            MetricSelector::parse(name)
                .ok()
                .filter(|s| !s.is_submetric())
                .ok_or_else(|| ConfigError::InvalidSelector(name.clone()))?;

            if let Some(existing) = kinds.get(name).filter(|existing| *existing != kind) {
                return Err(ConfigError::KindConflict {
                    name: name.clone(),
                    existing: existing.to_string(),
                });
            }
            kinds.insert(name.clone(), *kind);
        }

        let mut grouped: HashMap<String, Vec<Submetric>> = HashMap::new();
        for selector in submetrics.iter().filter(|s| s.is_submetric()) {
            let kind = *kinds
                .get(&selector.name)
                .ok_or_else(|| ConfigError::UnknownMetric(selector.name.clone()))?;
            let subs = grouped.entry(selector.name.clone()).or_default();
            if subs.iter().all(|s| &s.selector != selector) {
                subs.push(Submetric {
                    selector: selector.clone(),
                    cell: MetricCell::new(kind),
                });
            }
        }

        let metrics = kinds
            .into_iter()
            .map(|(name, kind)| {
                let submetrics = grouped.remove(&name).unwrap_or_default();
                let entry = MetricEntry {
                    cell: MetricCell::new(kind),
                    submetrics,
                    rejected: AtomicU64::new(0),
                };
                (name, Arc::new(entry))
            })
            .collect();

        Ok(Self {
            metrics: RwLock::new(metrics),
            checks: RwLock::new(BTreeMap::new()),
            started: Instant::now(),
        })
    }

    /// Kind of a registered metric or submetric.
    pub fn kind_of(&self, selector: &MetricSelector) -> Option<MetricKind> {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        let entry = metrics.get(&selector.name)?;
        if selector.is_submetric() && entry.submetrics.iter().all(|s| &s.selector != selector) {
            return None;
        }
        Some(entry.cell.kind())
    }

    pub fn record(&self, sample: Sample) {
        let entry = self.entry(&sample.metric, sample.kind);
        if entry.cell.kind() != sample.kind {
            entry.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        entry.cell.push(sample.value);
        for sub in &entry.submetrics {
            if sub.selector.matches(&sample.tags) {
                sub.cell.push(sample.value);
            }
        }
    }

    pub fn add_counter(&self, name: &str, value: f64, tags: Tags) {
        self.record(Sample::new(name, MetricKind::Counter, value).with_tags(tags));
    }

    pub fn add_rate(&self, name: &str, hit: bool, tags: Tags) {
        let value = if hit { 1. } else { 0. };
        self.record(Sample::new(name, MetricKind::Rate, value).with_tags(tags));
    }

    pub fn add_trend(&self, name: &str, value: f64, tags: Tags) {
        self.record(Sample::new(name, MetricKind::Trend, value).with_tags(tags));
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.record(Sample::new(name, MetricKind::Gauge, value));
    }

    /// Record the outcome of a named check, both in the `checks` rate and in its own tally.
    pub fn record_check(&self, name: &str, passed: bool, mut tags: Tags) {
        tags.insert("check".to_string(), name.to_string());
        self.add_rate(CHECKS, passed, tags);

        let counter = self.check_counter(name);
        if passed {
            counter.passes.fetch_add(1, Ordering::Relaxed);
        } else {
            counter.fails.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fold every pending sample into its aggregate.
    pub fn flush(&self) {
        for (name, entry) in self.entries() {
            report_losses(&name, entry.cell.flush(), entry.rejected.swap(0, Ordering::Relaxed));
            for sub in &entry.submetrics {
                report_losses(&sub.selector.to_string(), sub.cell.flush(), 0);
            }
        }
    }

    /// Freeze the current state of every metric.
    ///
    /// Every sample recorded before this call is included.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.started.elapsed();
        let mut metrics = BTreeMap::new();

        for (name, entry) in self.entries() {
            let (values, dropped) = entry.cell.freeze();
            report_losses(&name, dropped, entry.rejected.swap(0, Ordering::Relaxed));
            metrics.insert(name, values);

            for sub in &entry.submetrics {
                let key = sub.selector.to_string();
                let (values, dropped) = sub.cell.freeze();
                report_losses(&key, dropped, 0);
                metrics.insert(key, values);
            }
        }

        let checks = self
            .checks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, counter)| {
                let tally = CheckTally {
                    passes: counter.passes.load(Ordering::Relaxed),
                    fails: counter.fails.load(Ordering::Relaxed),
                };
                (name.clone(), tally)
            })
            .collect();

        MetricsSnapshot {
            elapsed,
            metrics,
            checks,
        }
    }

    fn entry(&self, name: &str, kind: MetricKind) -> Arc<MetricEntry> {
        if let Some(entry) = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return entry.clone();
        }

        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Registering {kind} metric `{name}`");
                Arc::new(MetricEntry {
                    cell: MetricCell::new(kind),
                    submetrics: vec![],
                    rejected: AtomicU64::new(0),
                })
            })
            .clone()
    }

    fn entries(&self) -> Vec<(String, Arc<MetricEntry>)> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    fn check_counter(&self, name: &str) -> Arc<CheckCounter> {
        if let Some(counter) = self
            .checks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return counter.clone();
        }

        self.checks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

fn report_losses(name: &str, dropped: u64, rejected: u64) {
    if dropped > 0 {
        error!("Dropped {dropped} samples of `{name}` which would have corrupted its aggregate.");
    }
    if rejected > 0 {
        warn!("Rejected {rejected} samples of `{name}` recorded with the wrong metric kind.");
    }
}

/// Frozen view of every metric at one point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Time between collector creation and the snapshot.
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricValues>,
    pub checks: BTreeMap<String, CheckTally>,
}

impl MetricsSnapshot {
    /// Look up a metric (`http_req_duration`) or submetric (`http_req_duration{name:login}`).
    pub fn get(&self, key: &str) -> Option<&MetricValues> {
        self.metrics.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use volley_core::{HTTP_REQ_DURATION, HTTP_REQ_FAILED};

    fn collector() -> MetricsCollector {
        MetricsCollector::new(&[], &[]).unwrap()
    }

    #[test]
    fn builtin_metrics_are_registered() {
        let collector = collector();
        for (name, kind) in BUILTIN_METRICS {
            assert_eq!(collector.kind_of(&MetricSelector::metric(name)), Some(kind));
        }
        assert_eq!(collector.kind_of(&MetricSelector::metric("errors")), None);
    }

    #[test]
    fn rate_is_exact_under_concurrent_recording() {
        let collector = Arc::new(collector());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let collector = collector.clone();
                thread::spawn(move || {
                    for i in 0..1_000 {
                        // Every thread records 1000 samples, 100 * (t + 1) of them failures.
                        let failed = i < 100 * (t + 1);
                        collector.add_rate(HTTP_REQ_FAILED, failed, Tags::new());
                        if i % 250 == 0 {
                            collector.flush();
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snapshot = collector.snapshot();
        let failed = snapshot.get(HTTP_REQ_FAILED).unwrap();
        assert_eq!(failed.count(), 8_000);
        assert_eq!(failed.non_zero(), 3_600);
        assert_eq!(failed.rate(), Some(3_600. / 8_000.));
    }

    #[test]
    fn snapshot_includes_unflushed_samples() {
        let collector = collector();
        for _ in 0..10 {
            collector.add_trend(HTTP_REQ_DURATION, 100., Tags::new());
        }
        let snapshot = collector.snapshot();
        let duration = snapshot.get(HTTP_REQ_DURATION).unwrap();
        assert_eq!(duration.count(), 10);
        assert_eq!(duration.mean(), Some(100.));
    }

    #[test]
    fn snapshot_is_frozen() {
        let collector = collector();
        collector.add_counter("http_reqs", 1., Tags::new());
        let snapshot = collector.snapshot();
        collector.add_counter("http_reqs", 1., Tags::new());
        assert_eq!(snapshot.get("http_reqs").unwrap().sum(), 1.);
        assert_eq!(collector.snapshot().get("http_reqs").unwrap().sum(), 2.);
    }

    #[test]
    fn submetrics_receive_matching_samples() {
        let selector = MetricSelector::parse("http_req_duration{name:login}").unwrap();
        let collector = MetricsCollector::new(&[], &[selector.clone()]).unwrap();
        assert_eq!(collector.kind_of(&selector), Some(MetricKind::Trend));

        let mut login = Tags::new();
        login.insert("name".into(), "login".into());
        let mut other = Tags::new();
        other.insert("name".into(), "list".into());

        collector.add_trend(HTTP_REQ_DURATION, 10., login.clone());
        collector.add_trend(HTTP_REQ_DURATION, 30., login);
        collector.add_trend(HTTP_REQ_DURATION, 500., other);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.get(HTTP_REQ_DURATION).unwrap().count(), 3);
        let sub = snapshot.get("http_req_duration{name:login}").unwrap();
        assert_eq!(sub.count(), 2);
        assert_eq!(sub.mean(), Some(20.));
    }

    #[test]
    fn submetric_of_unknown_metric_is_a_config_error() {
        let selector = MetricSelector::parse("errors{name:login}").unwrap();
        assert!(matches!(
            MetricsCollector::new(&[], &[selector]),
            Err(ConfigError::UnknownMetric(name)) if name == "errors"
        ));
    }

    #[test]
    fn custom_metric_kind_conflicts() {
        let res = MetricsCollector::new(&[(CHECKS.to_string(), MetricKind::Trend)], &[]);
        assert!(matches!(res, Err(ConfigError::KindConflict { .. })));

        let collector =
            MetricsCollector::new(&[("errors".to_string(), MetricKind::Rate)], &[]).unwrap();
        assert_eq!(
            collector.kind_of(&MetricSelector::metric("errors")),
            Some(MetricKind::Rate)
        );
    }

    #[test]
    fn wrong_kind_samples_are_rejected() {
        let collector = collector();
        collector.add_trend(HTTP_REQ_FAILED, 12., Tags::new());
        collector.add_rate(HTTP_REQ_FAILED, true, Tags::new());
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.get(HTTP_REQ_FAILED).unwrap().count(), 1);
    }

    #[test]
    fn lazily_registers_unknown_metrics() {
        let collector = collector();
        collector.add_trend("queue_wait", 3., Tags::new());
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.get("queue_wait").unwrap().kind(), MetricKind::Trend);
    }

    #[test]
    fn check_tallies() {
        let collector = collector();
        collector.record_check("created", true, Tags::new());
        collector.record_check("created", false, Tags::new());
        collector.record_check("fast", true, Tags::new());

        let snapshot = collector.snapshot();
        assert_eq!(
            snapshot.checks["created"],
            CheckTally {
                passes: 1,
                fails: 1
            }
        );
        assert_eq!(snapshot.checks["fast"].passes, 1);
        assert_eq!(snapshot.get(CHECKS).unwrap().rate(), Some(2. / 3.));
    }

    #[test]
    fn gauges_keep_the_latest_value() {
        let collector = collector();
        collector.set_gauge("vus", 3.);
        collector.set_gauge("vus", 7.);
        collector.set_gauge("vus", 5.);
        let snapshot = collector.snapshot();
        let vus = snapshot.get("vus").unwrap();
        assert_eq!(vus.value(), Some(5.));
        assert_eq!(vus.max(), Some(7.));
    }
}
