use thiserror::Error;
use volley_core::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no HTTP client configured; enable the `reqwest` feature or call `.http_client()`")]
    NoHttpClient,

    #[error("failed to write the summary: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize the summary: {0}")]
    Json(#[from] serde_json::Error),
}
