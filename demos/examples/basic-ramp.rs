use mock_service::MockConfig;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing_subscriber::FmtSubscriber;
use volley::prelude::*;

const ADDR: &str = "127.0.0.1:3002";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter("volley=debug,mock_service=info")
        .init();

    let addr: SocketAddr = ADDR.parse()?;
    tokio::spawn(mock_service::run(
        addr,
        MockConfig {
            delay: Duration::from_millis(10),
            jitter: Duration::from_millis(3),
            max_rps: NonZeroU32::new(400),
        },
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let summary = list_transactions()
        .stages(&[
            Stage::new(Duration::from_secs(10), 20),
            Stage::new(Duration::from_secs(20), 20),
            Stage::new(Duration::from_secs(5), 0),
        ])
        .pause(Duration::from_millis(50))
        .threshold("http_req_duration", &["p(95)<100", "avg<50"])
        .abort_threshold("http_req_failed", "rate<0.10", Some(Duration::from_secs(5)))
        .await?;

    println!("{summary}");
    if !summary.passed() {
        std::process::exit(99);
    }
    Ok(())
}

#[scenario]
async fn list_transactions(ctx: VuContext) {
    ctx.http()
        .get(format!("http://{ADDR}/api/transacoes"))
        .await;
}
