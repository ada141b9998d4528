use thiserror::Error;

/// Problems with a run's configuration. Always raised before any virtual user starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("run profile must contain at least one stage")]
    NoStages,

    #[error("stage durations add up to more than the longest supported run")]
    DurationOverflow,

    #[error("invalid duration `{value}`: {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid metric selector `{0}`")]
    InvalidSelector(String),

    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("statistic `{statistic}` is not available for {kind} metric `{metric}`")]
    StatisticMismatch {
        metric: String,
        kind: String,
        statistic: String,
    },

    #[error("metric `{name}` is already registered as a {existing} metric")]
    KindConflict { name: String, existing: String },

    #[error("failed to read run profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse run profile: {0}")]
    Parse(#[from] serde_json::Error),
}
