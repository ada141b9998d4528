use std::time::Duration;

/// How often the run loop re-evaluates the stage target and flushes pending samples.
pub const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// How often `abort_on_fail` thresholds are evaluated during a run.
pub const ABORT_EVAL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-request timeout used when none is configured.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Compression parameter of the latency t-digest.
pub const TDIGEST_COMPRESSION: f64 = 100.;

pub const TDIGEST_BACKLOG_SIZE: usize = 100;

/// Percentiles always present in reports.
pub const REPORTED_PERCENTILES: [f64; 4] = [50., 90., 95., 99.];
