mod utils;
#[allow(unused)]
use utils::*;

#[cfg(feature = "integration")]
mod tests {
    use super::*;

    use demos::transaction_api::{self, Settings, ERRORS};
    use ntest::timeout;
    use std::time::Duration;
    use volley::prelude::*;

    #[tokio::test(flavor = "multi_thread")]
    #[timeout(30_000)]
    async fn transaction_api_ramp_passes() {
        let mocks = init();
        transaction_api::configure(Settings {
            base_url: mocks.api.clone(),
            think_time: Duration::from_millis(50),
        });

        let summary = transaction_api::scenario()
            .stages(&[
                Stage::new(Duration::from_secs(2), 5),
                Stage::new(Duration::from_secs(3), 5),
                Stage::new(Duration::from_secs(1), 0),
            ])
            .threshold("http_req_duration", &["p(95)<500"])
            .threshold("http_req_failed", &["rate<0.05"])
            .threshold(ERRORS, &["rate<0.05"])
            .graceful_stop(Duration::from_secs(5))
            .await
            .unwrap();

        println!("{summary}");
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert!(summary.passed(), "{summary}");
        assert!(summary.requests() > 20);
        assert_eq!(summary.error_rate(), 0.);

        let checks = &summary.snapshot.checks;
        for check in [
            "operator created",
            "operators listed",
            "transaction created",
            "transactions listed",
        ] {
            let tally = &checks[check];
            assert!(tally.passes > 0, "{check}");
            assert_eq!(tally.fails, 0, "{check}");
        }

        let json = summary.to_json();
        assert_eq!(json["metrics"][ERRORS]["values"]["rate"], 0.);
        assert_eq!(json["metrics"]["vus"]["values"]["value"], 0.);
        assert_eq!(json["metrics"]["vus_max"]["values"]["max"], 5.);

        if let Some(prometheus) = &mocks.prometheus {
            let rendered = prometheus.render();
            assert!(rendered.contains("volley_http_reqs"), "{rendered}");
            assert!(rendered.contains("volley_transaction_duration"), "{rendered}");
        }
    }
}
