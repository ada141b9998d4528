//! Operator and transaction traffic against the cash-register API.
//!
//! Every iteration creates an operator, lists operators, records a card transaction and lists
//! transactions, sleeping for the think time after each call. A call whose checks fail counts
//! towards the `errors` rate.
use anyhow::{anyhow, Result};
use rand::Rng;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, warn};
use volley::core::ConfigError;
use volley::prelude::*;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Custom rate metric fed by every failed check group.
pub const ERRORS: &str = "errors";

const PROFILE: &str = include_str!("../profiles/transaction-api.json");

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub think_time: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            think_time: Duration::from_secs(1),
        }
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Set the target API and think time. Only the first call takes effect.
pub fn configure(settings: Settings) {
    if SETTINGS.set(settings).is_err() {
        warn!("Transaction API settings were already configured; keeping the first ones.");
    }
}

fn settings() -> &'static Settings {
    SETTINGS.get_or_init(Settings::default)
}

/// Two stages ramping to 50 users, two ramping to 100, then a ramp down, with latency and error
/// thresholds.
pub fn default_profile() -> Result<RunProfile, ConfigError> {
    RunProfile::from_json(PROFILE)
}

/// The scenario with its custom metric declared, ready for a profile.
pub fn scenario() -> impl ConfigurableScenario {
    transaction_api().metric(ERRORS, MetricKind::Rate)
}

#[scenario]
async fn transaction_api(ctx: VuContext) {
    let _ = create_operator(&ctx).await;
    think().await;

    let _ = list_operators(&ctx).await;
    think().await;

    let _ = create_transaction(&ctx).await;
    think().await;

    let _ = list_transactions(&ctx).await;
    think().await;
}

async fn think() {
    let pause = settings().think_time;
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
}

fn url(path: &str) -> String {
    format!("{}{path}", settings().base_url.trim_end_matches('/'))
}

#[transaction]
async fn create_operator(ctx: &VuContext) -> Result<()> {
    let body = json!({
        "nome": format!("Operador Teste {}-{}", ctx.vu(), ctx.iteration()),
        "cpf": generate_cpf(&mut rand::thread_rng()),
        "turno": "MANHA",
    });
    let request = HttpRequest::post(url("/api/operadores"))
        .json(&body)
        .tag("name", "create_operator");
    let res = ctx.http().request(request).await;
    verify(ctx, &res, "operator created", 201)
}

#[transaction]
async fn list_operators(ctx: &VuContext) -> Result<()> {
    let request = HttpRequest::get(url("/api/operadores")).tag("name", "list_operators");
    let res = ctx.http().request(request).await;
    verify(ctx, &res, "operators listed", 200)
}

#[transaction]
async fn create_transaction(ctx: &VuContext) -> Result<()> {
    let amount = rand::thread_rng().gen::<f64>() * 1_000. + 10.;
    let body = json!({
        "valor": amount,
        "tipoPagamento": "CARTAO",
    });
    let request = HttpRequest::post(url("/api/transacoes"))
        .json(&body)
        .tag("name", "create_transaction");
    let res = ctx.http().request(request).await;
    verify(ctx, &res, "transaction created", 201)
}

#[transaction]
async fn list_transactions(ctx: &VuContext) -> Result<()> {
    let request = HttpRequest::get(url("/api/transacoes")).tag("name", "list_transactions");
    let res = ctx.http().request(request).await;
    verify(ctx, &res, "transactions listed", 200)
}

fn verify(ctx: &VuContext, res: &HttpResponse, check: &str, status: u16) -> Result<()> {
    let passed = ctx
        .check(res)
        .that(check, |r| r.status == status)
        .that("response time < 500ms", |r| {
            r.duration < Duration::from_millis(500)
        })
        .passed();
    ctx.add_rate(ERRORS, !passed);

    if passed {
        Ok(())
    } else {
        debug!("Check `{check}` failed: {} {}", res.status, res.text());
        Err(anyhow!("`{check}` failed with status {}", res.status))
    }
}

/// A random, well-formed CPF: nine random digits followed by their two check digits.
pub fn generate_cpf(rng: &mut impl Rng) -> String {
    let mut digits: Vec<u32> = (0..9).map(|_| rng.gen_range(0..10)).collect();
    // All-equal digits are never valid.
    if digits.iter().all(|d| *d == digits[0]) {
        digits[8] = (digits[8] + 1) % 10;
    }

    for len in [9, 10] {
        let sum: u32 = digits
            .iter()
            .enumerate()
            .map(|(i, d)| d * (len as u32 + 1 - i as u32))
            .sum();
        digits.push(match sum % 11 {
            0 | 1 => 0,
            r => 11 - r,
        });
    }
    digits.iter().map(|d| char::from(b'0' + *d as u8)).collect()
}
