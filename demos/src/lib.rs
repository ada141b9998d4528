//! Load scenarios shared by the demo binaries and the integration tests.
pub mod transaction_api;
