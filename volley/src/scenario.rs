//! Scenario logic and the run loop
use crate::collector::MetricsCollector;
use crate::context::VuContext;
use crate::error::Error;
use crate::http::{Http, HttpClient};
use crate::pool::VuPool;
use crate::report::{RunOutcome, RunSummary};
use crate::scheduler::{StageScheduler, Tick};
use crate::thresholds::ThresholdSet;
use crate::timer::Timer;
use governor::{Quota, RateLimiter};
use std::{
    future::Future,
    num::NonZeroU32,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};
use volley_core::{
    ConfigError, MetricKind, Rule, RunProfile, ScenarioConfig, Stage, Threshold,
    ABORT_EVAL_INTERVAL, SCHEDULER_TICK, VUS, VUS_MAX,
};

/// Load test scenario structure
///
/// Handler for running scenarios. Not intended for manual creation, use the
/// [`#[scenario]`](volley_macros::scenario) macro which will add these methods to functions.
#[pin_project::pin_project]
pub struct Scenario<T> {
    func: T,
    runner_fut: Option<Pin<Box<dyn Future<Output = Result<RunSummary, Error>> + Send>>>,
    config: ScenarioConfig,
    client: Option<Arc<dyn HttpClient>>,
    stop: StopHandle,
    error: Option<ConfigError>,
}

impl<T> Scenario<T> {
    #[doc(hidden)]
    pub fn new(name: &str, func: T) -> Self {
        Self {
            func,
            runner_fut: None,
            config: ScenarioConfig::new(name),
            client: None,
            stop: StopHandle::default(),
            error: None,
        }
    }

    fn fail(&mut self, err: ConfigError) {
        self.error.get_or_insert(err);
    }
}

impl<T, F> Future for Scenario<T>
where
    T: Fn(VuContext) -> F + Send + Sync + Clone + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    type Output = Result<RunSummary, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.runner_fut.is_none() {
            let func = self.func.clone();
            let config = self.config.clone();
            let client = self.client.take();
            let stop = self.stop.clone();
            let error = self.error.take();
            self.runner_fut = Some(Box::pin(async move {
                if let Some(err) = error {
                    return Err(err.into());
                }
                run_scenario(func, config, client, stop).await
            }));
        }

        if let Some(runner) = &mut self.runner_fut {
            runner.as_mut().poll(cx)
        } else {
            unreachable!()
        }
    }
}

#[cfg(feature = "reqwest")]
fn default_client() -> Result<Arc<dyn HttpClient>, Error> {
    Ok(Arc::new(crate::http::ReqwestClient::new()))
}

#[cfg(not(feature = "reqwest"))]
fn default_client() -> Result<Arc<dyn HttpClient>, Error> {
    Err(Error::NoHttpClient)
}

/// Requests an early, graceful end of a running scenario.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Builder methods available on every `#[scenario]` function's return value.
///
/// Configuration mistakes (an invalid threshold expression, a missing stage list) surface as the
/// `Err` of the awaited scenario, before any load is generated.
pub trait ConfigurableScenario: Future<Output = Result<RunSummary, Error>> + Sized + Send {
    /// Use the stages, thresholds and options of a [`RunProfile`], replacing any set so far.
    ///
    /// # Example
    /// ```no_run
    /// use volley::prelude::*;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let profile = RunProfile::from_path("profile.json").unwrap();
    ///     let summary = my_scenario().profile(profile).await.unwrap();
    ///     println!("{summary}");
    /// }
    ///
    /// #[scenario]
    /// async fn my_scenario(ctx: VuContext) {
    ///     ctx.http().get("http://localhost:8080/").await;
    /// }
    /// ```
    fn profile(self, profile: RunProfile) -> Self;

    /// Ramp through the given stages.
    ///
    /// # Example
    /// ```no_run
    /// use volley::prelude::*;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     my_scenario()
    ///         .stages(&[
    ///             Stage::new(Duration::from_secs(30), 50),
    ///             Stage::new(Duration::from_secs(60), 50),
    ///             Stage::new(Duration::from_secs(30), 0),
    ///         ])
    ///         .threshold("http_req_duration", &["p(95)<500"])
    ///         .await
    ///         .unwrap();
    /// }
    ///
    /// #[scenario]
    /// async fn my_scenario(ctx: VuContext) {
    ///     ctx.http().get("http://localhost:8080/").await;
    /// }
    /// ```
    fn stages(self, stages: &[Stage]) -> Self;

    /// Virtual users alive when the first stage starts ramping.
    fn start_vus(self, vus: u64) -> Self;

    /// Attach rules to a metric or submetric, e.g. `("http_req_duration{name:login}", &["p(95)<300"])`.
    fn threshold(self, metric: &str, rules: &[&str]) -> Self;

    /// Attach a rule which stops the run as soon as it fails, evaluated every couple of seconds
    /// once the run is at least `delay` old.
    fn abort_threshold(self, metric: &str, rule: &str, delay: Option<Duration>) -> Self;

    /// Declare a custom metric up front so thresholds may reference it.
    fn metric(self, name: &str, kind: MetricKind) -> Self;

    /// Idle time between two iterations of the same virtual user.
    fn pause(self, pause: Duration) -> Self;

    /// How long in-flight iterations may run at the end before being aborted.
    fn graceful_stop(self, limit: Duration) -> Self;

    fn http_timeout(self, timeout: Duration) -> Self;

    /// Cap HTTP requests per second across all virtual users.
    fn rps(self, rps: NonZeroU32) -> Self;

    /// Replace the default `reqwest` transport.
    fn http_client(self, client: impl HttpClient + 'static) -> Self;

    fn stop_handle(&self) -> StopHandle;
}

impl<T, F> ConfigurableScenario for Scenario<T>
where
    T: Fn(VuContext) -> F + Send + Sync + Clone + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    fn profile(mut self, profile: RunProfile) -> Self {
        self.config.apply_profile(profile);
        self
    }

    fn stages(mut self, stages: &[Stage]) -> Self {
        self.config.stages = stages.to_vec();
        self
    }

    fn start_vus(mut self, vus: u64) -> Self {
        self.config.start_vus = vus;
        self
    }

    fn threshold(mut self, metric: &str, rules: &[&str]) -> Self {
        match Threshold::parse(metric, rules) {
            Ok(threshold) => self.config.thresholds.push(threshold),
            Err(err) => self.fail(err),
        }
        self
    }

    fn abort_threshold(mut self, metric: &str, rule: &str, delay: Option<Duration>) -> Self {
        match Threshold::parse::<&str>(metric, &[]).and_then(|mut threshold| {
            threshold
                .rules
                .push(Rule::parse(metric, rule)?.abort_on_fail(delay));
            Ok(threshold)
        }) {
            Ok(threshold) => self.config.thresholds.push(threshold),
            Err(err) => self.fail(err),
        }
        self
    }

    fn metric(mut self, name: &str, kind: MetricKind) -> Self {
        self.config.metrics.push((name.to_string(), kind));
        self
    }

    fn pause(mut self, pause: Duration) -> Self {
        self.config.pause = pause;
        self
    }

    fn graceful_stop(mut self, limit: Duration) -> Self {
        self.config.graceful_stop = Some(limit);
        self
    }

    fn http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout = timeout;
        self
    }

    fn rps(mut self, rps: NonZeroU32) -> Self {
        self.config.rps = Some(rps);
        self
    }

    fn http_client(mut self, client: impl HttpClient + 'static) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }
}

#[instrument(name="scenario", skip_all, fields(name=config.name))]
pub(crate) async fn run_scenario<T, F>(
    scenario: T,
    config: ScenarioConfig,
    client: Option<Arc<dyn HttpClient>>,
    stop: StopHandle,
) -> Result<RunSummary, Error>
where
    T: Fn(VuContext) -> F + Send + Sync + Clone + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let profile = config.profile()?;
    let scheduler = StageScheduler::new(profile.stages(), profile.start_vus)?;
    let selectors: Vec<_> = profile
        .thresholds()
        .iter()
        .map(|t| t.selector.clone())
        .collect();
    let collector = Arc::new(MetricsCollector::new(&config.metrics, &selectors)?);
    let thresholds = ThresholdSet::new(profile.thresholds());
    thresholds.validate(&collector)?;
    let client = match client {
        Some(client) => client,
        None => default_client()?,
    };

    info!(
        "Running {} over {} stages for {}",
        config.name,
        profile.stages().len(),
        humantime::format_duration(scheduler.total_duration())
    );

    let limiter = profile
        .rps
        .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));
    let http = Http::new(client, collector.clone(), limiter, profile.http_timeout);
    let mut pool = VuPool::new(scenario, collector.clone(), http, profile.pause);

    // NOTE: This loop is time-sensitive. Any long awaits or blocking will skew the ramp.
    let start = Instant::now();
    let mut timer = Timer::new(SCHEDULER_TICK).await;
    let mut stage = None;
    let mut peak = 0;
    let mut last_abort_eval = Duration::ZERO;
    let mut outcome = RunOutcome::Completed;
    loop {
        let elapsed = start.elapsed();
        if stop.is_stopped() {
            info!("Stop requested after {}", humantime::format_duration(elapsed));
            outcome = RunOutcome::Stopped;
            break;
        }

        let target = match scheduler.tick(elapsed) {
            Tick::Target(target) => target,
            Tick::Finished => break,
        };

        let current = scheduler.stage_index(elapsed);
        if current != stage {
            if let Some(idx) = current {
                let next = profile.stages()[idx];
                info!(
                    "Stage {}/{}: ramping to {} VUs over {}",
                    idx + 1,
                    profile.stages().len(),
                    next.target,
                    humantime::format_duration(next.duration)
                );
            }
            stage = current;
        }

        pool.scale_to(usize::try_from(target).unwrap_or(usize::MAX));
        peak = peak.max(pool.live());
        collector.set_gauge(VUS, pool.live() as f64);
        collector.set_gauge(VUS_MAX, peak as f64);
        collector.flush();

        if thresholds.has_abort_rules() && elapsed - last_abort_eval >= ABORT_EVAL_INTERVAL {
            last_abort_eval = elapsed;
            if let Some(failed) = thresholds.first_abort(&collector.snapshot(), elapsed)? {
                warn!(
                    "Threshold `{} {}` crossed (observed {:?}); aborting the run.",
                    failed.name, failed.rule, failed.observed
                );
                outcome = RunOutcome::Aborted;
                break;
            }
        }

        timer.tick().await;
    }

    debug!(
        "Stopping {} VUs ({} already retiring)",
        pool.live(),
        pool.retiring()
    );
    pool.shutdown(profile.graceful_stop).await;
    collector.set_gauge(VUS, 0.);

    let snapshot = collector.snapshot();
    let results = thresholds.evaluate(&snapshot)?;
    for result in results.iter().filter(|r| r.observed.is_none()) {
        warn!(
            "Threshold `{} {}` had no samples to evaluate.",
            result.name, result.rule
        );
    }

    let summary = RunSummary {
        scenario: config.name,
        duration: start.elapsed(),
        outcome,
        snapshot,
        thresholds: results,
    };
    if summary.passed() {
        info!("Scenario complete");
    } else {
        warn!(
            "Scenario complete with {} failed thresholds",
            summary.thresholds.iter().filter(|t| !t.passed).count()
        );
    }
    Ok(summary)
}
