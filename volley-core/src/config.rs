use crate::constants::DEFAULT_HTTP_TIMEOUT;
use crate::error::ConfigError;
use crate::metrics::MetricKind;
use crate::threshold::{Rule, Threshold};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

/// One segment of a load profile: ramp linearly from the previous target to `target` over
/// `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "human_duration")]
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }

    /// Combined duration of `stages`, or [`ConfigError::DurationOverflow`] when it isn't
    /// representable.
    pub fn total(stages: &[Stage]) -> Result<Duration, ConfigError> {
        stages.iter().try_fold(Duration::ZERO, |total, stage| {
            total
                .checked_add(stage.duration)
                .ok_or(ConfigError::DurationOverflow)
        })
    }
}

/// Stages, thresholds and run options, as read from configuration.
///
/// # Example
/// ```
/// use volley_core::RunProfile;
///
/// let profile = RunProfile::from_json(r#"{
///     "stages": [
///         { "duration": "30s", "target": 50 },
///         { "duration": "1m", "target": 50 },
///         { "duration": "30s", "target": 0 }
///     ],
///     "thresholds": {
///         "http_req_duration": ["p(95)<500"],
///         "http_req_failed": [{ "threshold": "rate<0.05", "abortOnFail": true }]
///     }
/// }"#).unwrap();
///
/// assert_eq!(profile.stages().len(), 3);
/// assert_eq!(profile.thresholds().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRunProfile")]
pub struct RunProfile {
    stages: Vec<Stage>,
    thresholds: Vec<Threshold>,
    /// Virtual users alive when the first stage starts ramping.
    pub start_vus: u64,
    /// Idle time between two iterations of the same virtual user.
    pub pause: Duration,
    /// How long to wait for in-flight iterations at the end of the run before aborting them.
    /// `None` waits for every iteration to finish.
    pub graceful_stop: Option<Duration>,
    pub http_timeout: Duration,
    /// Global cap on HTTP requests per second across all virtual users.
    pub rps: Option<NonZeroU32>,
}

impl RunProfile {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        Stage::total(&stages)?;

        Ok(Self {
            stages,
            thresholds: vec![],
            start_vus: 0,
            pause: Duration::ZERO,
            graceful_stop: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            rps: None,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    /// Attach a threshold, merging its rules into an existing threshold on the same selector.
    pub fn add_threshold(&mut self, threshold: Threshold) {
        match self
            .thresholds
            .iter_mut()
            .find(|t| t.selector == threshold.selector)
        {
            Some(existing) => existing.rules.extend(threshold.rules),
            None => self.thresholds.push(threshold),
        }
    }

    pub fn total_duration(&self) -> Duration {
        // Checked on construction.
        Stage::total(&self.stages).unwrap_or(Duration::MAX)
    }
}

/// Everything a scenario run needs besides the scenario function itself.
///
/// Filled in piecemeal by the scenario builder; [`ScenarioConfig::profile`] validates it into a
/// [`RunProfile`] when the run starts.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub name: String,
    pub stages: Vec<Stage>,
    pub thresholds: Vec<Threshold>,
    pub start_vus: u64,
    pub pause: Duration,
    pub graceful_stop: Option<Duration>,
    pub http_timeout: Duration,
    pub rps: Option<NonZeroU32>,
    /// Custom metrics declared up front so thresholds may reference them.
    pub metrics: Vec<(String, MetricKind)>,
}

impl ScenarioConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: vec![],
            thresholds: vec![],
            start_vus: 0,
            pause: Duration::ZERO,
            graceful_stop: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            rps: None,
            metrics: vec![],
        }
    }

    /// Replace stages, thresholds and options with those of `profile`.
    pub fn apply_profile(&mut self, profile: RunProfile) {
        self.start_vus = profile.start_vus;
        self.pause = profile.pause;
        self.graceful_stop = profile.graceful_stop;
        self.http_timeout = profile.http_timeout;
        self.rps = profile.rps;
        self.stages = profile.stages;
        self.thresholds = profile.thresholds;
    }

    pub fn profile(&self) -> Result<RunProfile, ConfigError> {
        let mut profile = RunProfile::new(self.stages.clone())?;
        profile.start_vus = self.start_vus;
        profile.pause = self.pause;
        profile.graceful_stop = self.graceful_stop;
        profile.http_timeout = self.http_timeout;
        profile.rps = self.rps;
        for threshold in &self.thresholds {
            profile.add_threshold(threshold.clone());
        }
        Ok(profile)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawRunProfile {
    stages: Vec<Stage>,
    #[serde(default)]
    thresholds: BTreeMap<String, Vec<RawThreshold>>,
    #[serde(default, rename = "startVUs")]
    start_vus: u64,
    #[serde(default, with = "human_duration::option")]
    pause: Option<Duration>,
    #[serde(default, with = "human_duration::option")]
    graceful_stop: Option<Duration>,
    #[serde(default, with = "human_duration::option")]
    timeout: Option<Duration>,
    #[serde(default)]
    rps: Option<NonZeroU32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Expression(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        #[serde(default, with = "human_duration::option")]
        delay_abort_eval: Option<Duration>,
    },
}

impl TryFrom<RawRunProfile> for RunProfile {
    type Error = ConfigError;

    fn try_from(raw: RawRunProfile) -> Result<Self, Self::Error> {
        let mut profile = RunProfile::new(raw.stages)?;
        profile.start_vus = raw.start_vus;
        profile.pause = raw.pause.unwrap_or_default();
        profile.graceful_stop = raw.graceful_stop;
        profile.http_timeout = raw.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT);
        profile.rps = raw.rps;

        for (key, raws) in raw.thresholds {
            let mut threshold = Threshold::parse::<&str>(&key, &[])?;
            for raw in raws {
                let rule = match raw {
                    RawThreshold::Expression(expr) => Rule::parse(&key, &expr)?,
                    RawThreshold::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let rule = Rule::parse(&key, &threshold)?;
                        if abort_on_fail {
                            rule.abort_on_fail(delay_abort_eval)
                        } else {
                            rule
                        }
                    }
                };
                threshold.rules.push(rule);
            }
            profile.add_threshold(threshold);
        }

        Ok(profile)
    }
}

/// Durations as humantime strings (`"30s"`, `"1m 30s"`) or whole seconds.
mod human_duration {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    impl Raw {
        fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
            match self {
                Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
                Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(|e| {
                    E::custom(ConfigError::InvalidDuration {
                        value: text,
                        reason: e.to_string(),
                    })
                }),
            }
        }
    }

    pub fn serialize<S: Serializer>(dur: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*dur))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Raw::deserialize(deserializer)?.into_duration()
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(Raw::into_duration)
                .transpose()
        }
    }
}
