#![allow(dead_code)]

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use mock_service::MockConfig;
use std::num::NonZeroU32;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::FmtSubscriber;

/// Mock APIs shared by every test of one test binary.
pub struct Mocks {
    /// Answers everything after roughly 5ms.
    pub api: String,
    /// Answers after 1ms but sheds anything over 50 requests per second.
    pub limited: String,
    pub prometheus: Option<PrometheusHandle>,
}

#[allow(unused)]
pub fn init() -> &'static Mocks {
    static MOCKS: OnceLock<Mocks> = OnceLock::new();

    MOCKS.get_or_init(|| {
        let _ = FmtSubscriber::builder()
            .with_env_filter("volley=debug,mock_service=info")
            .try_init();

        let prometheus = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| error!("Prometheus recorder unavailable: {e}"))
            .ok();

        let api = bind();
        let limited = bind();
        let mocks = Mocks {
            api: base_url(&api),
            limited: base_url(&limited),
            prometheus,
        };

        // Each test has its own runtime, so the mocks get a runtime that outlives them all.
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("mock runtime");
            rt.block_on(async move {
                let api = tokio::net::TcpListener::from_std(api).expect("api listener");
                let limited = tokio::net::TcpListener::from_std(limited).expect("limited listener");
                let res = tokio::try_join!(
                    mock_service::serve(
                        api,
                        MockConfig {
                            delay: Duration::from_millis(5),
                            ..Default::default()
                        },
                    ),
                    mock_service::serve(
                        limited,
                        MockConfig {
                            delay: Duration::from_millis(1),
                            max_rps: NonZeroU32::new(50),
                            ..Default::default()
                        },
                    ),
                );
                if let Err(err) = res {
                    error!("Mock service stopped: {err}");
                }
            });
        });

        mocks
    })
}

fn bind() -> std::net::TcpListener {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
    listener.set_nonblocking(true).expect("non-blocking listener");
    listener
}

fn base_url(listener: &std::net::TcpListener) -> String {
    let addr = listener.local_addr().expect("mock address");
    format!("http://{addr}")
}
