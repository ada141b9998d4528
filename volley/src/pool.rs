//! The set of live virtual users and how it grows and shrinks.
mod vu;

use crate::collector::MetricsCollector;
use crate::context::VuContext;
use crate::http::Http;
use crate::transaction::{TransactionData, TRANSACTION_HOOK};
use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};
use vu::VirtualUser;
pub(crate) use vu::{VuState, VuStateCell};

struct VuHandle {
    id: u64,
    state: Arc<VuStateCell>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl VuHandle {
    fn retire(&self) {
        // Errors only when the user already exited.
        let _ = self.stop.send(true);
        self.state.transition(VuState::Running, VuState::Retiring);
    }
}

/// Spawns, retires and reaps virtual users to follow the scheduler's target.
///
/// Retired users are never interrupted: they finish their current iteration (and skip the pause
/// after it) before exiting, so the number of live users may briefly exceed the target by the
/// number still retiring.
pub(crate) struct VuPool<T> {
    scenario: T,
    collector: Arc<MetricsCollector>,
    http: Http,
    pause: Duration,
    next_id: u64,
    active: Vec<VuHandle>,
    retiring: Vec<VuHandle>,
}

impl<T, F> VuPool<T>
where
    T: Fn(VuContext) -> F + Send + Sync + Clone + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    pub fn new(scenario: T, collector: Arc<MetricsCollector>, http: Http, pause: Duration) -> Self {
        Self {
            scenario,
            collector,
            http,
            pause,
            next_id: 0,
            active: vec![],
            retiring: vec![],
        }
    }

    /// Users neither retiring nor stopped.
    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Retired users still finishing their iteration, as of the last reap.
    pub fn retiring(&self) -> usize {
        self.retiring.len()
    }

    /// Users which haven't reached [`VuState::Stopped`].
    pub fn live(&self) -> usize {
        self.active
            .iter()
            .chain(&self.retiring)
            .filter(|h| h.state.get() != VuState::Stopped)
            .count()
    }

    pub fn scale_to(&mut self, target: usize) {
        self.reap();

        let current = self.active.len();
        if current < target {
            for _ in current..target {
                self.spawn();
            }
            trace!("Scaled up from {current} to {target} VUs");
        } else if current > target {
            // Newest first.
            let retired: Vec<_> = self.active.drain(target..).rev().collect();
            for handle in &retired {
                handle.retire();
            }
            self.retiring.extend(retired);
            trace!("Scaled down from {current} to {target} VUs");
        }
    }

    /// Retire every user and wait for them to finish, aborting stragglers once `graceful_stop`
    /// expires.
    pub async fn shutdown(mut self, graceful_stop: Option<Duration>) {
        self.scale_to(0);
        let mut tasks: Vec<_> = self.retiring.drain(..).map(|h| h.task).collect();

        let finished = match graceful_stop {
            None => {
                join_all(tasks.iter_mut()).await;
                true
            }
            Some(limit) => tokio::time::timeout(limit, join_all(tasks.iter_mut()))
                .await
                .is_ok(),
        };

        if !finished {
            let stragglers = tasks.iter().filter(|t| !t.is_finished()).count();
            warn!(
                "Aborting {stragglers} VUs still running after the graceful stop of {}.",
                humantime::format_duration(graceful_stop.unwrap_or_default())
            );
            for task in &tasks {
                task.abort();
            }
        }
    }

    fn spawn(&mut self) {
        self.next_id += 1;
        let state = Arc::new(VuStateCell::new());
        let (stop, stop_rx) = watch::channel(false);

        let vu = VirtualUser {
            id: self.next_id,
            scenario: self.scenario.clone(),
            collector: self.collector.clone(),
            http: self.http.clone(),
            pause: self.pause,
            state: state.clone(),
            stop: stop_rx,
        };
        let hook = TransactionData {
            collector: self.collector.clone(),
        };
        let task = tokio::spawn(TRANSACTION_HOOK.scope(hook, vu.run()));

        self.active.push(VuHandle {
            id: self.next_id,
            state,
            stop,
            task,
        });
    }

    fn reap(&mut self) {
        self.retiring.retain(|h| !h.task.is_finished());
        self.active.retain(|h| {
            let finished = h.task.is_finished();
            if finished {
                error!("VU {} exited without being retired.", h.id);
            }
            !finished
        });
    }
}

impl<T> Drop for VuPool<T> {
    fn drop(&mut self) {
        for handle in self.active.iter().chain(&self.retiring) {
            let _ = handle.stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::MockClient;
    use std::sync::atomic::{AtomicU64, Ordering};
    use volley_core::{INTERRUPTED_ITERATIONS, ITERATIONS};

    fn pool<T, F>(scenario: T, pause: Duration) -> (VuPool<T>, Arc<MetricsCollector>)
    where
        T: Fn(VuContext) -> F + Send + Sync + Clone + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let collector = Arc::new(MetricsCollector::new(&[], &[]).unwrap());
        let http = Http::new(
            Arc::new(MockClient::new(200, Duration::ZERO)),
            collector.clone(),
            None,
            Duration::from_secs(1),
        );
        (VuPool::new(scenario, collector.clone(), http, pause), collector)
    }

    async fn slow_iteration(_ctx: VuContext) {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn scales_up_and_down() {
        let (mut pool, _) = pool(slow_iteration, Duration::ZERO);

        pool.scale_to(10);
        assert_eq!(pool.active(), 10);
        assert_eq!(pool.live(), 10);

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.scale_to(3);
        assert_eq!(pool.active(), 3);
        assert_eq!(pool.retiring(), 7);
        assert!(pool.live() <= 3 + pool.retiring());

        // Retired users finish their iteration, then exit.
        tokio::time::sleep(Duration::from_millis(600)).await;
        pool.scale_to(3);
        assert_eq!(pool.retiring(), 0);
        assert_eq!(pool.live(), 3);

        pool.shutdown(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn retiring_users_finish_their_iteration() {
        let (mut pool, collector) = pool(slow_iteration, Duration::from_secs(1));

        pool.scale_to(4);
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown(None).await;

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.get(ITERATIONS).unwrap().sum(), 4.);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_aborts_stragglers() {
        let started = Arc::new(AtomicU64::new(0));
        let counter = started.clone();
        let scenario = move |_ctx: VuContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
        };
        let (mut pool, collector) = pool(scenario, Duration::ZERO);

        pool.scale_to(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown(Some(Duration::from_secs(1))).await;

        assert_eq!(started.load(Ordering::Relaxed), 2);
        assert_eq!(collector.snapshot().get(ITERATIONS).unwrap().sum(), 0.);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_iterations_do_not_kill_the_user() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let scenario = move |_ctx: VuContext| {
            let counter = counter.clone();
            async move {
                let run = counter.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(10)).await;
                if run == 0 {
                    panic!("boom");
                }
            }
        };
        let (mut pool, collector) = pool(scenario, Duration::ZERO);

        pool.scale_to(1);
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(pool.live(), 1);
        pool.shutdown(None).await;

        assert!(runs.load(Ordering::Relaxed) >= 3);
        let snapshot = collector.snapshot();
        let iterations = snapshot.get(ITERATIONS).unwrap().sum();
        assert_eq!(iterations, runs.load(Ordering::Relaxed) as f64 - 1.);
        assert_eq!(snapshot.get(INTERRUPTED_ITERATIONS).unwrap().sum(), 1.);
    }
}
