use crate::error::ConfigError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

pub type Tags = BTreeMap<String, String>;

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
/// Iterations cut short by a panic in the scenario.
pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
pub const CHECKS: &str = "checks";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";
pub const TRANSACTION_DURATION: &str = "transaction_duration";
pub const TRANSACTION_FAILED: &str = "transaction_failed";

/// Metrics registered for every run.
pub const BUILTIN_METRICS: [(&str, MetricKind); 11] = [
    (HTTP_REQS, MetricKind::Counter),
    (HTTP_REQ_DURATION, MetricKind::Trend),
    (HTTP_REQ_FAILED, MetricKind::Rate),
    (ITERATIONS, MetricKind::Counter),
    (ITERATION_DURATION, MetricKind::Trend),
    (INTERRUPTED_ITERATIONS, MetricKind::Counter),
    (CHECKS, MetricKind::Rate),
    (VUS, MetricKind::Gauge),
    (VUS_MAX, MetricKind::Gauge),
    (TRANSACTION_DURATION, MetricKind::Trend),
    (TRANSACTION_FAILED, MetricKind::Rate),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Cumulative sum of added values.
    Counter,
    /// Latest value, with min and max.
    Gauge,
    /// Fraction of added values which were non-zero.
    Rate,
    /// Distribution of added values, summarized by a t-digest.
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// A single observation produced while running a scenario.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: String,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: SystemTime,
    pub tags: Tags,
}

impl Sample {
    pub fn new(metric: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            metric: metric.into(),
            kind,
            value,
            timestamp: SystemTime::now(),
            tags: Tags::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A metric name with an optional tag filter, e.g. `http_req_duration{name:login,method:POST}`.
///
/// A selector with tags identifies a *submetric*: the subset of the parent metric's samples
/// carrying every listed tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricSelector {
    pub name: String,
    pub tags: Vec<(String, String)>,
}

impl MetricSelector {
    pub fn metric(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tags: vec![],
        }
    }

    pub fn parse(key: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidSelector(key.to_string());
        let key = key.trim();

        let (name, filter) = match key.split_once('{') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix('}').ok_or_else(invalid)?;
                (name.trim(), Some(inner))
            }
            None => (key, None),
        };

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(invalid());
        }

        let mut tags = vec![];
        if let Some(inner) = filter {
            for pair in inner.split(',') {
                let (k, v) = pair.split_once(':').ok_or_else(invalid)?;
                let k = k.trim();
                if k.is_empty() {
                    return Err(invalid());
                }
                tags.push((k.to_string(), v.trim().to_string()));
            }
            if tags.is_empty() {
                return Err(invalid());
            }
        }
        tags.sort();

        Ok(Self {
            name: name.to_string(),
            tags,
        })
    }

    pub fn is_submetric(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        self.tags
            .iter()
            .all(|(k, v)| tags.get(k).is_some_and(|t| t == v))
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.is_submetric() {
            let pairs: Vec<_> = self.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
            write!(f, "{{{}}}", pairs.join(","))?;
        }
        Ok(())
    }
}
