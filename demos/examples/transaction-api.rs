use clap::Parser;
use demos::transaction_api::{self, Settings, DEFAULT_BASE_URL};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use volley::prelude::*;

/// Ramp virtual users against the operator and transaction API.
#[derive(Parser, Debug)]
#[command(version = "0.1")]
struct Cli {
    #[arg(long, env = "BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Run profile (JSON). Defaults to the bundled 4 minute ramp up to 100 users.
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Where to write the JSON summary.
    #[arg(short, long, default_value = "summary.json")]
    output: PathBuf,

    /// Sleep after every call, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    think_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("volley=info")),
        )
        .init();

    let cli = Cli::parse();
    let profile = match &cli.profile {
        Some(path) => RunProfile::from_path(path)?,
        None => transaction_api::default_profile()?,
    };
    transaction_api::configure(Settings {
        base_url: cli.base_url.clone(),
        think_time: Duration::from_millis(cli.think_ms),
    });

    info!(
        "Running against {} for {}s",
        cli.base_url,
        profile.total_duration().as_secs()
    );
    let scenario = transaction_api::scenario().profile(profile);
    let stop = scenario.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping virtual users.");
            stop.stop();
        }
    });

    let summary = scenario.await?;
    println!("{summary}");
    summary.write_json(&cli.output)?;
    info!("Summary written to {}", cli.output.display());

    if !summary.passed() {
        std::process::exit(99);
    }
    Ok(())
}
