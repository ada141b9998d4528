mod utils;
#[allow(unused)]
use utils::*;

#[cfg(feature = "integration")]
mod tests {
    use super::*;

    use ntest::timeout;
    use std::sync::OnceLock;
    use std::time::{Duration, Instant};
    use volley::prelude::*;

    static BASE_URL: OnceLock<String> = OnceLock::new();

    #[tokio::test(flavor = "multi_thread")]
    #[timeout(30_000)]
    async fn shed_load_aborts_the_run() {
        let mocks = init();
        let _ = BASE_URL.set(mocks.limited.clone());

        let start = Instant::now();
        let summary = hammer_transactions()
            .stages(&[Stage::new(Duration::from_secs(20), 20)])
            .abort_threshold("http_req_failed", "rate<0.05", Some(Duration::from_secs(2)))
            .await
            .unwrap();

        println!("{summary}");
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert!(!summary.passed());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(summary.error_rate() > 0.05);

        let shed = summary.snapshot.get("http_req_failed").unwrap();
        assert!(shed.rate().unwrap() > 0.05);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[timeout(30_000)]
    async fn strict_latency_threshold_fails() {
        let mocks = init();

        let url = format!("{}/api/operadores", mocks.api);
        let summary = volley::Scenario::new("list_operators", move |ctx: VuContext| {
            let url = url.clone();
            async move {
                ctx.http().get(url).await;
            }
        })
        .stages(&[Stage::new(Duration::from_secs(2), 4)])
        .pause(Duration::from_millis(20))
        .threshold("http_req_duration", &["p(95)<1", "max<5000"])
        .await
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert!(!summary.passed());

        let failed: Vec<_> = summary
            .thresholds
            .iter()
            .filter(|t| !t.passed)
            .map(|t| t.rule.as_str())
            .collect();
        assert_eq!(failed, ["p(95)<1"]);
        assert!(summary.latency().unwrap().percentile(95.).unwrap() >= 5.);
    }

    #[scenario]
    async fn hammer_transactions(ctx: VuContext) {
        let base_url = BASE_URL.get().map(String::as_str).unwrap_or_default();
        ctx.http()
            .request(
                HttpRequest::get(format!("{base_url}/api/transacoes"))
                    .tag("name", "list_transactions"),
            )
            .await;
    }
}
