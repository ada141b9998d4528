use crate::collector::MetricsCollector;
use crate::http::millis;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use volley_core::{Tags, TRANSACTION_DURATION, TRANSACTION_FAILED};

/// Transaction hook used by the `#[transaction]` macro. Not intended to be used manually.
pub async fn transaction_hook<T, R, E>(name: &'static str, func: T) -> T::Output
where
    T: Future<Output = Result<R, E>>,
{
    let Ok(hook) = TRANSACTION_HOOK.try_with(|v| v.clone()) else {
        tracing::error!("No hook available for transaction `{name}`.");
        return func.await;
    };

    let start = Instant::now();
    let res = func.await;
    let elapsed = start.elapsed();

    let mut tags = Tags::new();
    tags.insert("transaction".to_string(), name.to_string());
    hook.collector
        .add_trend(TRANSACTION_DURATION, millis(elapsed), tags.clone());
    hook.collector
        .add_rate(TRANSACTION_FAILED, res.is_err(), tags);

    #[cfg(feature = "metrics")]
    {
        metrics::histogram!("volley_transaction_duration", "transaction" => name)
            .record(elapsed.as_secs_f64());
        if res.is_err() {
            metrics::counter!("volley_transaction_failed", "transaction" => name).increment(1);
        }
    }

    res
}

#[derive(Clone)]
pub(crate) struct TransactionData {
    pub collector: Arc<MetricsCollector>,
}

tokio::task_local! {
    pub(crate) static TRANSACTION_HOOK: TransactionData;
}
