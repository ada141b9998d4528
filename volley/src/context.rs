use crate::collector::MetricsCollector;
use crate::http::{Http, HttpResponse};
use std::any::Any;
use std::sync::Arc;
use volley_core::{Sample, Tags};

/// Handed to the scenario function on every iteration.
#[derive(Clone)]
pub struct VuContext {
    vu: u64,
    iteration: u64,
    collector: Arc<MetricsCollector>,
    http: Http,
}

impl VuContext {
    pub(crate) fn new(vu: u64, iteration: u64, collector: Arc<MetricsCollector>, http: Http) -> Self {
        Self {
            vu,
            iteration,
            collector,
            http,
        }
    }

    /// Identifier of the virtual user running this iteration, starting at 1.
    pub fn vu(&self) -> u64 {
        self.vu
    }

    /// Zero-based iteration count of this virtual user.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn http(&self) -> &Http {
        &self.http
    }

    /// Run named assertions against `value`, recording each outcome in the `checks` metric.
    ///
    /// Checks against an [`HttpResponse`] are tagged like the request's samples, so
    /// `checks{check:list ok,method:GET}` only sees checks of `GET` responses.
    ///
    /// ```ignore
    /// let ok = ctx
    ///     .check(&res)
    ///     .that("status is 201", |r| r.status == 201)
    ///     .that("has id", |r| r.json::<Value>().map_or(false, |v| v["id"].is_number()))
    ///     .passed();
    /// ```
    pub fn check<'a, T: Any>(&'a self, value: &'a T) -> Check<'a, T> {
        let tags = (value as &dyn Any)
            .downcast_ref::<HttpResponse>()
            .map(|res| res.tags.clone())
            .unwrap_or_default();
        Check {
            ctx: self,
            value,
            tags,
            passed: true,
        }
    }

    pub fn add_counter(&self, name: &str, value: f64) {
        self.collector.add_counter(name, value, Tags::new());
    }

    pub fn add_rate(&self, name: &str, hit: bool) {
        self.collector.add_rate(name, hit, Tags::new());
    }

    pub fn add_trend(&self, name: &str, value: f64) {
        self.collector.add_trend(name, value, Tags::new());
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.collector.set_gauge(name, value);
    }

    /// Record a fully specified sample, tags included.
    pub fn record(&self, sample: Sample) {
        self.collector.record(sample);
    }
}

/// A group of checks against one value. See [`VuContext::check`].
#[must_use = "checks are recorded as they run; call `passed()` to learn whether all held"]
pub struct Check<'a, T> {
    ctx: &'a VuContext,
    value: &'a T,
    tags: Tags,
    passed: bool,
}

impl<'a, T> Check<'a, T> {
    /// Tag the checks that follow.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn that(mut self, name: &str, predicate: impl FnOnce(&T) -> bool) -> Self {
        let ok = predicate(self.value);
        self.ctx.collector.record_check(name, ok, self.tags.clone());
        self.passed &= ok;
        self
    }

    /// Whether every check of the group held.
    pub fn passed(self) -> bool {
        self.passed
    }
}
