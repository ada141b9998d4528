mod config;
mod constants;
mod error;
mod metrics;
mod stats;
pub mod threshold;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use metrics::*;
pub use stats::*;
pub use threshold::{Comparator, Rule, Statistic, Threshold};
