use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use mock_service::MockConfig;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Stand-in for the operator and transaction API, with configurable latency and capacity.
#[derive(Parser, Debug)]
#[command(version = "0.1")]
struct Cli {
    #[arg(long, env = "MOCK_ADDR", default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Where Prometheus scrapes the service's own metrics.
    #[arg(long, env = "MOCK_METRICS_ADDR", default_value = "0.0.0.0:8081")]
    metrics_addr: SocketAddr,

    /// Mean latency added before answering, in milliseconds.
    #[arg(long, env = "MOCK_DELAY_MS", default_value_t = 20)]
    delay_ms: u64,

    /// Standard deviation of the added latency, in milliseconds.
    #[arg(long, env = "MOCK_JITTER_MS", default_value_t = 5)]
    jitter_ms: u64,

    /// Requests per second served before answering `500`. `0` serves everything.
    #[arg(long, env = "MOCK_MAX_RPS", default_value_t = 0)]
    max_rps: u32,
}

impl Cli {
    fn config(&self) -> MockConfig {
        MockConfig {
            delay: Duration::from_millis(self.delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            max_rps: NonZeroU32::new(self.max_rps),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mock_service=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    PrometheusBuilder::new()
        .with_http_listener(cli.metrics_addr)
        .install()?;

    mock_service::run(cli.addr, cli.config()).await
}
