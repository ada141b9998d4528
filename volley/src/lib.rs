#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod collector;
mod context;
mod error;
pub mod http;
mod pool;
pub mod report;
pub mod scenario;
mod scheduler;
pub mod thresholds;
mod timer;
#[doc(hidden)]
pub mod transaction;

pub use collector::{CheckTally, MetricValues, MetricsCollector, MetricsSnapshot};
pub use context::{Check, VuContext};
pub use error::Error;
pub use report::{RunOutcome, RunSummary};
pub use scenario::{ConfigurableScenario, Scenario, StopHandle};
pub use volley_core as core;
pub use volley_macros::{scenario, transaction};

pub mod prelude {
    pub use crate::context::VuContext;
    pub use crate::http::{HttpRequest, HttpResponse, Method};
    pub use crate::report::{RunOutcome, RunSummary};
    pub use crate::scenario::{ConfigurableScenario, StopHandle};
    pub use volley_core::{MetricKind, RunProfile, Stage};
    pub use volley_macros::{scenario, transaction};
}
