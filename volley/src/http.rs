//! HTTP client seam and the instrumented wrapper handed to scenarios.
use crate::collector::MetricsCollector;
use async_trait::async_trait;
use governor::DefaultDirectRateLimiter;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, trace};
use volley_core::{Tags, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Falls back to the run's configured HTTP timeout when unset.
    pub timeout: Option<Duration>,
    /// Extra tags attached to the samples of this request (e.g. `name`).
    pub tags: Tags,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: vec![],
            body: None,
            timeout: None,
            tags: Tags::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body along with its `Content-Type`.
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(value.to_string())
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tag the request's samples, e.g. `.tag("name", "create_operator")` to target it with a
    /// `http_req_duration{name:create_operator}` threshold.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Result of an HTTP call. Network failures and timeouts are responses too, with status `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub duration: Duration,
    pub body: Vec<u8>,
    pub error: Option<String>,
    /// Tags of the samples recorded for this call. Filled in by [`Http`]; checks against the
    /// response carry them too.
    pub tags: Tags,
}

impl HttpResponse {
    pub fn new(status: u16, duration: Duration, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            duration,
            body: body.into(),
            error: None,
            tags: Tags::new(),
        }
    }

    pub fn failed(duration: Duration, error: impl Into<String>) -> Self {
        Self {
            status: 0,
            duration,
            body: vec![],
            error: Some(error.into()),
            tags: Tags::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// The transport used by scenarios.
///
/// Implementations must never fail outright: connection errors and timeouts are reported as an
/// [`HttpResponse`] with status `0` so checks can still evaluate them.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> HttpResponse;
}

/// Instrumented client given to scenarios through [`VuContext::http`](crate::VuContext::http).
///
/// Every request records `http_reqs`, `http_req_duration` and `http_req_failed` samples, tagged
/// with `method`, `url`, `status` and the request's own tags. A call outliving its timeout is
/// cut short and reported as a failed response, whatever the underlying client does.
#[derive(Clone)]
pub struct Http {
    client: Arc<dyn HttpClient>,
    collector: Arc<MetricsCollector>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    timeout: Duration,
}

impl Http {
    pub(crate) fn new(
        client: Arc<dyn HttpClient>,
        collector: Arc<MetricsCollector>,
        limiter: Option<Arc<DefaultDirectRateLimiter>>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            collector,
            limiter,
            timeout,
        }
    }

    pub async fn get(&self, url: impl Into<String>) -> HttpResponse {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post_json(&self, url: impl Into<String>, body: &serde_json::Value) -> HttpResponse {
        self.request(HttpRequest::post(url).json(body)).await
    }

    pub async fn request(&self, mut request: HttpRequest) -> HttpResponse {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let timeout = *request.timeout.get_or_insert(self.timeout);
        let method = request.method;
        let mut tags = request.tags.clone();
        tags.insert("method".to_string(), method.to_string());
        tags.insert("url".to_string(), request.url.clone());

        let mut response =
            match tokio::time::timeout(timeout, self.client.request(request)).await {
                Ok(response) => response,
                Err(_) => HttpResponse::failed(
                    timeout,
                    format!("request timed out after {}", humantime::format_duration(timeout)),
                ),
            };
        let failed = !response.is_success();
        if let Some(error) = &response.error {
            debug!("{method} {} failed: {error}", tags["url"]);
        }

        tags.insert("status".to_string(), response.status.to_string());
        self.collector.add_counter(HTTP_REQS, 1., tags.clone());
        self.collector
            .add_trend(HTTP_REQ_DURATION, millis(response.duration), tags.clone());
        self.collector.add_rate(HTTP_REQ_FAILED, failed, tags.clone());

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("volley_http_reqs", "method" => method.as_str()).increment(1);
            metrics::histogram!("volley_http_req_duration", "method" => method.as_str())
                .record(response.duration.as_secs_f64());
            if failed {
                metrics::counter!("volley_http_req_failed", "method" => method.as_str())
                    .increment(1);
            }
        }

        response.tags = tags;
        response
    }
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.
}

#[cfg(feature = "reqwest")]
pub use reqwest_client::ReqwestClient;

#[cfg(feature = "reqwest")]
mod reqwest_client {
    use super::*;
    use std::time::Instant;

    /// Default [`HttpClient`] backed by a shared `reqwest` connection pool.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestClient {
        client: reqwest::Client,
    }

    impl ReqwestClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn request(&self, request: HttpRequest) -> HttpResponse {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
                Method::Head => reqwest::Method::HEAD,
                Method::Options => reqwest::Method::OPTIONS,
            };

            let mut builder = self.client.request(method, request.url.as_str());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let start = Instant::now();
            let res = match builder.send().await {
                Ok(res) => res,
                Err(err) => return HttpResponse::failed(start.elapsed(), describe(&err)),
            };

            let status = res.status().as_u16();
            match res.bytes().await {
                Ok(body) => HttpResponse::new(status, start.elapsed(), body.to_vec()),
                Err(err) => HttpResponse::failed(start.elapsed(), describe(&err)),
            }
        }
    }

    fn describe(err: &reqwest::Error) -> String {
        if err.is_timeout() {
            format!("request timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        }
    }
}
