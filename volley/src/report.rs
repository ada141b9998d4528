//! End-of-run summary, as text for the console and as JSON for tooling.
use crate::collector::{CheckTally, MetricValues, MetricsSnapshot};
use crate::error::Error;
use crate::thresholds::per_second;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::Path;
use std::time::Duration;
use volley_core::{
    MetricKind, ThresholdResult, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED,
    REPORTED_PERCENTILES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every stage ran to completion.
    Completed,
    /// Stopped early through a [`StopHandle`](crate::StopHandle).
    Stopped,
    /// Stopped early by a failing abort-on-fail threshold.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scenario: String,
    pub duration: Duration,
    pub outcome: RunOutcome,
    pub snapshot: MetricsSnapshot,
    pub thresholds: Vec<ThresholdResult>,
}

impl RunSummary {
    /// Whether every threshold rule passed.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn requests(&self) -> u64 {
        self.snapshot.get(HTTP_REQS).map_or(0, |v| v.sum() as u64)
    }

    /// Fraction of failed HTTP requests.
    pub fn error_rate(&self) -> f64 {
        self.snapshot
            .get(HTTP_REQ_FAILED)
            .and_then(MetricValues::rate)
            .unwrap_or_default()
    }

    /// HTTP request latency statistics in milliseconds.
    pub fn latency(&self) -> Option<&MetricValues> {
        self.snapshot.get(HTTP_REQ_DURATION).filter(|v| !v.is_empty())
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        // Writing to a String never fails.
        let _ = self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) -> fmt::Result {
        let rule = "=".repeat(48);
        writeln!(out, "{rule}")?;
        writeln!(out, " SUMMARY: {} ({:?})", self.scenario, self.outcome)?;
        writeln!(out, "{rule}")?;
        writeln!(out, " Duration:     {:.2}s", self.duration.as_secs_f64())?;
        writeln!(out, " Requests:     {}", self.requests())?;
        writeln!(out, " Error rate:   {:.2}%", self.error_rate() * 100.)?;
        if let Some(latency) = self.latency() {
            writeln!(out, " Mean latency: {:.2}ms", latency.mean().unwrap_or_default())?;
            for p in [95., 99.] {
                let value = latency.percentile(p).unwrap_or_default();
                writeln!(out, " P{p}:          {value:.2}ms")?;
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(out, "{rule}")?;
            writeln!(out, " Thresholds:")?;
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                let observed = t
                    .observed
                    .map_or_else(|| "no data".to_string(), |v| format!("{v:.4}"));
                writeln!(out, "   {mark} {} {} ({observed})", t.name, t.rule)?;
            }
        }

        if !self.snapshot.checks.is_empty() {
            writeln!(out, "{rule}")?;
            writeln!(out, " Checks:")?;
            for (name, tally) in &self.snapshot.checks {
                let mark = if tally.fails == 0 { "✓" } else { "✗" };
                writeln!(
                    out,
                    "   {mark} {name}: {} / {} passed",
                    tally.passes,
                    tally.passes + tally.fails
                )?;
            }
        }
        writeln!(out, "{rule}")
    }

    /// Machine-readable summary, keyed like k6's `handleSummary` data.
    ///
    /// Counter rates are taken over the snapshot's age, as thresholds see them.
    pub fn to_json(&self) -> serde_json::Value {
        let mut metrics: BTreeMap<&str, JsonMetric> = self
            .snapshot
            .metrics
            .iter()
            .map(|(name, values)| (name.as_str(), JsonMetric::new(values, self.snapshot.elapsed)))
            .collect();

        for result in &self.thresholds {
            if let Some(metric) = metrics.get_mut(result.name.as_str()) {
                metric
                    .thresholds
                    .insert(result.rule.clone(), JsonThreshold { ok: result.passed });
            }
        }

        let report = JsonReport {
            scenario: &self.scenario,
            outcome: self.outcome,
            passed: self.passed(),
            state: JsonState {
                test_run_duration_ms: self.duration.as_secs_f64() * 1_000.,
            },
            metrics,
            checks: &self.snapshot.checks,
            thresholds: &self.thresholds,
        };
        serde_json::json!(report)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_text())
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    scenario: &'a str,
    outcome: RunOutcome,
    passed: bool,
    state: JsonState,
    metrics: BTreeMap<&'a str, JsonMetric>,
    checks: &'a BTreeMap<String, CheckTally>,
    thresholds: &'a [ThresholdResult],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonState {
    test_run_duration_ms: f64,
}

#[derive(Serialize)]
struct JsonMetric {
    #[serde(rename = "type")]
    kind: MetricKind,
    values: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    thresholds: BTreeMap<String, JsonThreshold>,
}

impl JsonMetric {
    fn new(values: &MetricValues, elapsed: Duration) -> Self {
        let mut out = BTreeMap::new();
        let mut put = |key: &str, value: Option<f64>| {
            if let Some(value) = value {
                out.insert(key.to_string(), value);
            }
        };

        match values.kind() {
            MetricKind::Counter => {
                put("count", Some(values.sum()));
                put("rate", per_second(values, elapsed));
            }
            MetricKind::Gauge => {
                put("value", values.value());
                put("min", values.min());
                put("max", values.max());
            }
            MetricKind::Rate => {
                put("rate", values.rate());
                put("passes", Some(values.non_zero() as f64));
                put("fails", Some((values.count() - values.non_zero()) as f64));
            }
            MetricKind::Trend => {
                put("avg", values.mean());
                put("min", values.min());
                put("med", values.median());
                put("max", values.max());
                for p in REPORTED_PERCENTILES {
                    put(&format!("p({p})"), values.percentile(p));
                }
            }
        }

        Self {
            kind: values.kind(),
            values: out,
            thresholds: BTreeMap::new(),
        }
    }
}

#[derive(Serialize)]
struct JsonThreshold {
    ok: bool,
}
