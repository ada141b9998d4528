use std::time::Duration;
use volley_core::{ConfigError, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// Desired number of live virtual users.
    Target(u64),
    /// Elapsed time is past the end of the last stage.
    Finished,
}

/// Converts a list of stages into a target concurrency at any point of the run.
///
/// Each stage ramps linearly from the previous stage's target (or the starting VU count) to its
/// own target. The value at the end of every stage is exactly that stage's target.
#[derive(Debug, Clone)]
pub(crate) struct StageScheduler {
    start_vus: u64,
    /// `(start offset, end offset, stage)` for each stage.
    stages: Vec<(Duration, Duration, Stage)>,
    total: Duration,
}

impl StageScheduler {
    pub fn new(stages: &[Stage], start_vus: u64) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }

        let mut offset = Duration::ZERO;
        let mut spans = Vec::with_capacity(stages.len());
        for stage in stages {
            let start = offset;
            offset = offset
                .checked_add(stage.duration)
                .ok_or(ConfigError::DurationOverflow)?;
            spans.push((start, offset, *stage));
        }

        Ok(Self {
            start_vus,
            stages: spans,
            total: offset,
        })
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn tick(&self, elapsed: Duration) -> Tick {
        if elapsed >= self.total {
            Tick::Finished
        } else {
            Tick::Target(self.target_at(elapsed))
        }
    }

    /// Index of the stage active at `elapsed`, `None` once the run is over.
    pub fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        self.stages.iter().position(|(_, end, _)| *end > elapsed)
    }

    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let Some(idx) = self.stage_index(elapsed) else {
            return self.stages.last().map_or(self.start_vus, |(_, _, s)| s.target);
        };

        let (start, end, stage) = &self.stages[idx];
        let from = if idx == 0 {
            self.start_vus
        } else {
            self.stages[idx - 1].2.target
        };

        // A zero-length stage never contains `elapsed`, so the span is non-zero here.
        let span = (*end - *start).as_nanos() as i128;
        let progress = (elapsed - *start).as_nanos() as i128;
        let delta = stage.target as i128 - from as i128;

        // Truncation toward zero keeps the value on the `from` side, so ramps never overshoot.
        let step = match delta.checked_mul(progress) {
            Some(scaled) => scaled / span,
            None => (delta as f64 * (progress as f64 / span as f64)) as i128,
        };
        let (low, high) = (from.min(stage.target), from.max(stage.target));
        (from as i128 + step).clamp(low as i128, high as i128) as u64
    }
}
