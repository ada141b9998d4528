//! Evaluation of threshold rules against a metrics snapshot.
use crate::collector::{MetricValues, MetricsCollector, MetricsSnapshot};
use std::time::Duration;
use volley_core::{ConfigError, MetricKind, Rule, Statistic, Threshold, ThresholdResult};

/// Evaluate every rule of every threshold against `snapshot`.
///
/// A metric which received no samples yields `observed: None` and passes, except for counters
/// which simply observe zero. Results are returned in threshold order, then rule order.
pub fn evaluate(
    snapshot: &MetricsSnapshot,
    thresholds: &[Threshold],
) -> Result<Vec<ThresholdResult>, ConfigError> {
    let mut results = vec![];
    for threshold in thresholds {
        let name = threshold.selector.to_string();
        let values = snapshot
            .get(&name)
            .ok_or_else(|| ConfigError::UnknownMetric(threshold.selector.name.clone()))?;

        for rule in &threshold.rules {
            results.push(evaluate_rule(&name, values, rule, snapshot.elapsed));
        }
    }
    Ok(results)
}

fn evaluate_rule(name: &str, values: &MetricValues, rule: &Rule, elapsed: Duration) -> ThresholdResult {
    let observed = observe(values, rule.statistic, elapsed);
    ThresholdResult {
        name: name.to_string(),
        rule: rule.source.clone(),
        passed: observed.map_or(true, |v| rule.comparator.holds(v, rule.bound)),
        observed,
    }
}

/// Per-second rate of a counter over `elapsed`, the snapshot's age.
pub(crate) fn per_second(values: &MetricValues, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (secs > 0.).then(|| values.sum() / secs)
}

fn observe(values: &MetricValues, statistic: Statistic, elapsed: Duration) -> Option<f64> {
    match (values.kind(), statistic) {
        (MetricKind::Counter, Statistic::Count) => Some(values.sum()),
        (MetricKind::Counter, Statistic::Rate) => per_second(values, elapsed),
        (MetricKind::Rate, Statistic::Rate) => values.rate(),
        (MetricKind::Gauge, Statistic::Value) => values.value(),
        (_, Statistic::Count) => (!values.is_empty()).then(|| values.count() as f64),
        (_, Statistic::Avg) => values.mean(),
        (_, Statistic::Min) => values.min(),
        (_, Statistic::Max) => values.max(),
        (_, Statistic::Med) => values.median(),
        (_, Statistic::Percentile(p)) => values.percentile(p),
        _ => None,
    }
}

/// The thresholds of one run.
pub(crate) struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    pub fn new(thresholds: &[Threshold]) -> Self {
        Self {
            thresholds: thresholds.to_vec(),
        }
    }

    /// Check every threshold against the metrics registered in `collector`.
    pub fn validate(&self, collector: &MetricsCollector) -> Result<(), ConfigError> {
        for threshold in &self.thresholds {
            threshold.validate(collector.kind_of(&threshold.selector))?;
        }
        Ok(())
    }

    pub fn has_abort_rules(&self) -> bool {
        self.thresholds
            .iter()
            .flat_map(|t| &t.rules)
            .any(|r| r.abort_on_fail)
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Result<Vec<ThresholdResult>, ConfigError> {
        evaluate(snapshot, &self.thresholds)
    }

    /// First failing abort-on-fail rule whose evaluation delay has passed.
    pub fn first_abort(
        &self,
        snapshot: &MetricsSnapshot,
        elapsed: Duration,
    ) -> Result<Option<ThresholdResult>, ConfigError> {
        for threshold in &self.thresholds {
            let name = threshold.selector.to_string();
            let Some(values) = snapshot.get(&name) else {
                return Err(ConfigError::UnknownMetric(threshold.selector.name.clone()));
            };

            let due = threshold
                .rules
                .iter()
                .filter(|r| r.abort_on_fail && r.delay_abort_eval.map_or(true, |d| elapsed >= d));
            for rule in due {
                let result = evaluate_rule(&name, values, rule, snapshot.elapsed);
                if !result.passed {
                    return Ok(Some(result));
                }
            }
        }
        Ok(None)
    }
}
