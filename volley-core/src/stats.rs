use serde::Serialize;

/// Outcome of one threshold rule against a frozen metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    /// Metric or submetric key, e.g. `http_req_duration{name:login}`.
    pub name: String,
    /// Rule expression, e.g. `p(95)<500`.
    pub rule: String,
    pub passed: bool,
    /// `None` when the metric received no samples.
    pub observed: Option<f64>,
}
