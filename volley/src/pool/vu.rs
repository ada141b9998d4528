use crate::collector::MetricsCollector;
use crate::context::VuContext;
use crate::http::{millis, Http};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, trace, warn};
use volley_core::{Tags, INTERRUPTED_ITERATIONS, ITERATIONS, ITERATION_DURATION};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    Starting = 0,
    Running = 1,
    /// Asked to stop; finishing its current iteration.
    Retiring = 2,
    Stopped = 3,
}

impl VuState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => VuState::Starting,
            1 => VuState::Running,
            2 => VuState::Retiring,
            _ => VuState::Stopped,
        }
    }

    fn can_become(self, next: VuState) -> bool {
        use VuState::*;
        matches!(
            (self, next),
            (Starting, Running) | (Running, Retiring) | (Retiring, Stopped)
        )
    }
}

/// Lifecycle state of one virtual user, shared between the user and its pool.
#[derive(Debug)]
pub(crate) struct VuStateCell(AtomicU8);

impl VuStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(VuState::Starting as u8))
    }

    pub fn get(&self) -> VuState {
        VuState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Fails when the state is no longer `from` or the transition
    /// isn't part of the lifecycle.
    pub fn transition(&self, from: VuState, to: VuState) -> bool {
        from.can_become(to)
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// One simulated user, looping over the scenario until told to stop.
pub(crate) struct VirtualUser<T> {
    pub id: u64,
    pub scenario: T,
    pub collector: Arc<MetricsCollector>,
    pub http: Http,
    pub pause: Duration,
    pub state: Arc<VuStateCell>,
    pub stop: watch::Receiver<bool>,
}

impl<T, F> VirtualUser<T>
where
    T: Fn(VuContext) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    pub async fn run(mut self) {
        self.state.transition(VuState::Starting, VuState::Running);
        trace!("VU {} started", self.id);

        let mut iteration = 0;
        while !self.stopping() {
            self.iterate(iteration).await;
            iteration += 1;

            if self.pause.is_zero() {
                // A scenario that never awaits must still yield between iterations.
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.pause) => {}
                _ = self.stop.changed() => break,
            }
        }

        self.state.transition(VuState::Running, VuState::Retiring);
        self.state.transition(VuState::Retiring, VuState::Stopped);
        trace!("VU {} stopped after {iteration} iterations", self.id);
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    async fn iterate(&self, iteration: u64) {
        let ctx = VuContext::new(
            self.id,
            iteration,
            self.collector.clone(),
            self.http.clone(),
        );

        let start = Instant::now();
        let res = AssertUnwindSafe((self.scenario)(ctx)).catch_unwind().await;
        let elapsed = start.elapsed();

        match res {
            Ok(()) => {
                self.collector.add_counter(ITERATIONS, 1., Tags::new());
                self.collector
                    .add_trend(ITERATION_DURATION, millis(elapsed), Tags::new());
            }
            Err(panic) => {
                self.collector
                    .add_counter(INTERRUPTED_ITERATIONS, 1., Tags::new());
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "VU {} iteration {iteration} panicked: {reason}. Continuing with the next iteration.",
                    self.id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VuState::*;

    #[test]
    fn lifecycle_transitions() {
        let state = VuStateCell::new();
        assert_eq!(state.get(), Starting);
        assert!(!state.transition(Starting, Retiring));
        assert!(state.transition(Starting, Running));
        assert!(!state.transition(Starting, Running));
        assert!(state.transition(Running, Retiring));
        assert!(!state.transition(Running, Retiring));
        assert!(state.transition(Retiring, Stopped));
        assert_eq!(state.get(), Stopped);
        assert!(!state.transition(Stopped, Starting));
    }
}
