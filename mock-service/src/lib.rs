//! In-memory stand-in for the cash-register transaction API, used to exercise load scenarios
//! without the real backend.
use axum::{
    debug_handler,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::counter;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
#[allow(unused)]
use tracing::{debug, info, warn};

/// Behavior of the mock, applied to every API request.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Mean latency added before answering.
    pub delay: Duration,
    /// Standard deviation of the added latency.
    pub jitter: Duration,
    /// Requests per second served before answering `500`.
    pub max_rps: Option<NonZeroU32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Shift {
    Manha,
    Tarde,
    Noite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentType {
    Dinheiro,
    Cartao,
    Pix,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOperator {
    pub nome: String,
    pub cpf: String,
    pub turno: Shift,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub id: u64,
    pub nome: String,
    pub cpf: String,
    pub turno: Shift,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub valor: f64,
    pub tipo_pagamento: PaymentType,
    pub operador_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: u64,
    pub valor: f64,
    pub tipo_pagamento: PaymentType,
    pub operador_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: u16,
    message: String,
}

fn reject(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        status: status.as_u16(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

#[derive(Default)]
struct Store {
    operators: RwLock<Vec<Operator>>,
    transactions: RwLock<Vec<Transaction>>,
    next_id: AtomicU64,
}

impl Store {
    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Clone)]
pub struct AppState {
    config: MockConfig,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    store: Arc<Store>,
}

impl AppState {
    pub fn new(config: MockConfig) -> Self {
        let limiter = config
            .max_rps
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));
        Self {
            config,
            limiter,
            store: Arc::default(),
        }
    }

    fn latency(&self) -> Duration {
        let mean = self.config.delay.as_secs_f64();
        let std_dev = self.config.jitter.as_secs_f64();
        if std_dev == 0. {
            return self.config.delay;
        }
        match Normal::new(mean, std_dev) {
            Ok(normal) => Duration::from_secs_f64(normal.sample(&mut rand::thread_rng()).max(0.)),
            Err(_) => self.config.delay,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/operadores", get(list_operators).post(create_operator))
        .route("/api/operadores/:id", get(find_operator))
        .route(
            "/api/transacoes",
            get(list_transactions).post(create_transaction),
        )
        .route("/api/transacoes/:id", get(find_transaction))
        .layer(middleware::from_fn_with_state(state.clone(), shape_traffic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(addr: SocketAddr, config: MockConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, config).await
}

/// Serve the API on an already bound listener.
pub async fn serve(listener: TcpListener, config: MockConfig) -> anyhow::Result<()> {
    info!("Mock transaction API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(AppState::new(config))).await?;
    Ok(())
}

/// Applies the configured latency, then sheds requests over the rps limit.
async fn shape_traffic(State(state): State<AppState>, request: Request, next: Next) -> Response {
    counter!("mock_service_requests").increment(1);
    tokio::time::sleep(state.latency()).await;

    if let Some(limiter) = &state.limiter {
        if limiter.check().is_err() {
            counter!("mock_service_shed").increment(1);
            debug!("Shedding {} {}", request.method(), request.uri());
            return reject(StatusCode::INTERNAL_SERVER_ERROR, "Capacity exceeded");
        }
    }
    next.run(request).await
}

#[debug_handler]
async fn create_operator(
    State(state): State<AppState>,
    Json(new): Json<NewOperator>,
) -> Response {
    let name_len = new.nome.trim().chars().count();
    if !(3..=100).contains(&name_len) {
        return reject(StatusCode::BAD_REQUEST, "Nome deve ter entre 3 e 100 caracteres");
    }
    if !valid_cpf(&new.cpf) {
        return reject(StatusCode::BAD_REQUEST, "CPF inválido");
    }

    let operator = Operator {
        id: state.store.id(),
        nome: new.nome,
        cpf: new.cpf.chars().filter(char::is_ascii_digit).collect(),
        turno: new.turno,
    };
    let Ok(mut operators) = state.store.operators.write() else {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable");
    };
    if operators.iter().any(|o| o.cpf == operator.cpf) {
        return reject(StatusCode::CONFLICT, "CPF já cadastrado");
    }
    operators.push(operator.clone());
    (StatusCode::CREATED, Json(operator)).into_response()
}

async fn list_operators(State(state): State<AppState>) -> Response {
    match state.store.operators.read() {
        Ok(operators) => Json(operators.clone()).into_response(),
        Err(_) => reject(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable"),
    }
}

async fn find_operator(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    let found = state
        .store
        .operators
        .read()
        .ok()
        .and_then(|ops| ops.iter().find(|o| o.id == id).cloned());
    match found {
        Some(operator) => Json(operator).into_response(),
        None => reject(StatusCode::NOT_FOUND, format!("Operador {id} não encontrado")),
    }
}

#[debug_handler]
async fn create_transaction(
    State(state): State<AppState>,
    Json(new): Json<NewTransaction>,
) -> Response {
    if new.valor.is_nan() || new.valor <= 0. {
        return reject(StatusCode::BAD_REQUEST, "Valor deve ser positivo");
    }

    let transaction = Transaction {
        id: state.store.id(),
        valor: new.valor,
        tipo_pagamento: new.tipo_pagamento,
        operador_id: new.operador_id,
    };
    match state.store.transactions.write() {
        Ok(mut transactions) => transactions.push(transaction.clone()),
        Err(_) => return reject(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable"),
    }
    (StatusCode::CREATED, Json(transaction)).into_response()
}

async fn list_transactions(State(state): State<AppState>) -> Response {
    match state.store.transactions.read() {
        Ok(transactions) => Json(transactions.clone()).into_response(),
        Err(_) => reject(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable"),
    }
}

async fn find_transaction(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    let found = state
        .store
        .transactions
        .read()
        .ok()
        .and_then(|txs| txs.iter().find(|t| t.id == id).cloned());
    match found {
        Some(transaction) => Json(transaction).into_response(),
        None => reject(StatusCode::NOT_FOUND, format!("Transação {id} não encontrada")),
    }
}

/// Eleven digits, formatting ignored, with both check digits correct and not all the same digit.
pub fn valid_cpf(cpf: &str) -> bool {
    let digits: Vec<u32> = cpf.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 {
        return false;
    }
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let check = |len: usize| {
        let sum: u32 = digits[..len]
            .iter()
            .enumerate()
            .map(|(i, d)| d * (len as u32 + 1 - i as u32))
            .sum();
        match sum % 11 {
            0 | 1 => 0,
            r => 11 - r,
        }
    };
    check(9) == digits[9] && check(10) == digits[10]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn cpf_check_digits() {
        assert!(valid_cpf("52998224725"));
        assert!(!valid_cpf("52998224724"));
        assert!(!valid_cpf("11111111111"));
        assert!(!valid_cpf("5299822472"));
        assert!(valid_cpf("529.982.247-25"));
    }

    #[tokio::test]
    async fn creates_and_lists_operators() {
        let app = router(AppState::new(MockConfig::default()));

        let operator = json!({"nome": "Operador Teste 1-0", "cpf": "52998224725", "turno": "MANHA"});
        let response = app
            .clone()
            .oneshot(post("/api/operadores", operator.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body(response).await;
        assert_eq!(created["nome"], "Operador Teste 1-0");

        let duplicate = app
            .clone()
            .oneshot(post("/api/operadores", operator))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let response = app.clone().oneshot(get("/api/operadores")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await.as_array().unwrap().len(), 1);

        let id = created["id"].as_u64().unwrap();
        let response = app
            .oneshot(get(&format!("/api/operadores/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_invalid_operators() {
        let app = router(AppState::new(MockConfig::default()));

        let bad_cpf = json!({"nome": "Operador", "cpf": "12345678900", "turno": "TARDE"});
        let response = app
            .clone()
            .oneshot(post("/api/operadores", bad_cpf))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let short_name = json!({"nome": "Op", "cpf": "52998224725", "turno": "TARDE"});
        let response = app.oneshot(post("/api/operadores", short_name)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn creates_and_lists_transactions() {
        let app = router(AppState::new(MockConfig::default()));

        let response = app
            .clone()
            .oneshot(post(
                "/api/transacoes",
                json!({"valor": 120.5, "tipoPagamento": "CARTAO"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body(response).await["tipoPagamento"], "CARTAO");

        let negative = app
            .clone()
            .oneshot(post(
                "/api/transacoes",
                json!({"valor": -1, "tipoPagamento": "PIX"}),
            ))
            .await
            .unwrap();
        assert_eq!(negative.status(), StatusCode::BAD_REQUEST);

        let response = app.clone().oneshot(get("/api/transacoes")).await.unwrap();
        assert_eq!(body(response).await.as_array().unwrap().len(), 1);

        let missing = app.oneshot(get("/api/transacoes/999")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sheds_requests_over_the_rps_limit() {
        let app = router(AppState::new(MockConfig {
            max_rps: NonZeroU32::new(2),
            ..Default::default()
        }));

        let mut statuses = vec![];
        for _ in 0..5 {
            let response = app.clone().oneshot(get("/api/transacoes")).await.unwrap();
            statuses.push(response.status());
        }
        let shed = statuses
            .iter()
            .filter(|s| **s == StatusCode::INTERNAL_SERVER_ERROR)
            .count();
        assert!(shed >= 3, "{statuses:?}");
    }
}
