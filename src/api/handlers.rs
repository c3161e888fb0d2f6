use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use log::{info, warn, error, debug};

use crate::auth::{Claims, JwtGenerator, SessionManager, extract_jwt_from_headers};
use crate::data::{Ohlcv, PubSubManager, ReplayCommand, ReplayController, ReplayState, TickLog, TradeTick};

pub const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Clone)]
pub struct ApiState {
    pub session_manager: SessionManager,
    pub jwt_generator: Arc<JwtGenerator>,
    pub pubsub_manager: Arc<PubSubManager>,
    pub tick_log: Arc<dyn TickLog>,
    pub replay_controller: Arc<ReplayController>,
    pub api_key: Arc<str>,
    pub public_ws_url: Arc<str>,
    pub token_ttl_secs: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

type ApiError = (StatusCode, Json<ApiMessage>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ApiMessage { success: false, message: message.into() }))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub ws_url: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct QuoteResponse {
    pub symbol: String,
    pub data: Ohlcv,
}

#[derive(Debug, Deserialize)]
pub struct TickRequest {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub size: f64,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TickResponse {
    pub success: bool,
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub success: bool,
    pub message: String,
    pub state: ReplayState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub active_sessions: usize,
    pub channels: usize,
    pub subscribed_sessions: usize,
    pub symbols: Vec<String>,
    pub replay_state: ReplayState,
    pub replay_symbols: usize,
    pub replay_ticks: usize,
}

// Service-to-service calls carry the shared API key
fn require_api_key(headers: &HeaderMap, state: &ApiState) -> Result<(), ApiError> {
    match headers.get(API_KEY_HEADER).and_then(|value| value.to_str().ok()) {
        Some(key) if key == &*state.api_key => Ok(()),
        Some(_) => {
            warn!("Rejected request with wrong API key");
            Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"))
        }
        None => Err(api_error(StatusCode::UNAUTHORIZED, "Missing X-Api-Key header")),
    }
}

// Authenticate request and extract user claims
fn authenticate_request(headers: &HeaderMap, session_manager: &SessionManager) -> Result<Claims, ApiError> {
    let token = extract_jwt_from_headers(headers)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Missing Authorization header"))?;

    session_manager.validate_jwt(&token)
        .map_err(|_| api_error(StatusCode::UNAUTHORIZED, "Invalid or expired token"))
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "candle_relay_api",
        "timestamp": chrono::Utc::now()
    }))
}

// GET /api/stats - Channel, session and replay counters
pub async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let (channels, subscribed_sessions) = state.pubsub_manager.get_stats();
    let (replay_state, replay_symbols, replay_ticks) = state.replay_controller.get_status_info();

    Json(StatsResponse {
        active_sessions: state.session_manager.get_session_count(),
        channels,
        subscribed_sessions,
        symbols: state.pubsub_manager.get_symbol_list(),
        replay_state,
        replay_symbols,
        replay_ticks,
    })
}

// POST /api/token - Issue a short-lived access token
pub async fn issue_token(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    require_api_key(&headers, &state)?;

    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "user_id must not be empty"));
    }

    let (token, claims) = state.jwt_generator
        .issue(user_id, state.token_ttl_secs)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    info!("Issued token for {} (expires at {})", user_id, claims.exp);
    Ok(Json(TokenResponse {
        token,
        ws_url: state.public_ws_url.to_string(),
        expires_at: claims.exp,
    }))
}

// GET /api/quote/:symbol - Last published bar for a symbol
pub async fn get_quote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(symbol): Path<String>,
) -> Result<Json<QuoteResponse>, ApiError> {
    let claims = authenticate_request(&headers, &state.session_manager)?;

    let symbol = symbol.trim().to_uppercase();
    match state.pubsub_manager.last_bar(&symbol) {
        Some(data) => {
            debug!("Backfill {} served to {}", symbol, claims.user_id);
            Ok(Json(QuoteResponse { symbol, data }))
        }
        None => Err(api_error(StatusCode::NOT_FOUND, format!("No data for {}", symbol))),
    }
}

// POST /api/ticks - Append one trade to the upstream log
pub async fn post_tick(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<TickRequest>,
) -> Result<Json<TickResponse>, ApiError> {
    require_api_key(&headers, &state)?;

    let tick = TradeTick {
        symbol: request.symbol.trim().to_uppercase(),
        price: request.price,
        size: request.size,
        timestamp: request.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        entry_id: String::new(),
    };
    if tick.symbol.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "symbol must not be empty"));
    }
    if !tick.price.is_finite() || tick.price <= 0.0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "price must be a positive number"));
    }

    match state.tick_log.append(tick.to_fields()).await {
        Ok(id) => Ok(Json(TickResponse { success: true, id })),
        Err(e) => {
            error!("Failed to append tick for {}: {}", tick.symbol, e);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

// POST /api/replay/:command - Drive the CSV replay feed
pub async fn control_replay(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(command): Path<String>,
) -> Result<Json<ReplayResponse>, ApiError> {
    require_api_key(&headers, &state)?;

    let command: ReplayCommand = command.parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;

    match state.replay_controller.execute_command(command) {
        Ok(message) => Ok(Json(ReplayResponse {
            success: true,
            message,
            state: state.replay_controller.get_state(),
        })),
        Err(e) => {
            warn!("Replay command {:?} rejected: {}", command, e);
            Err(api_error(StatusCode::CONFLICT, e))
        }
    }
}

// Create the API router
pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/token", post(issue_token))
        .route("/quote/:symbol", get(get_quote))
        .route("/ticks", post(post_tick))
        .route("/replay/:command", post(control_replay))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use crate::data::{MemoryLog, ReadCursor};

    const SECRET: &str = "api-test-secret-0123456789abcdefgh";
    const KEY: &str = "api-key-0123456789";

    fn test_state() -> (ApiState, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new(1000));
        let state = ApiState {
            session_manager: SessionManager::new(SECRET),
            jwt_generator: Arc::new(JwtGenerator::new(SECRET)),
            pubsub_manager: Arc::new(PubSubManager::new("candles:", 16)),
            tick_log: log.clone(),
            replay_controller: Arc::new(ReplayController::new(
                log.clone(),
                std::env::temp_dir().join("candle_relay_api_missing_dir"),
                Duration::from_millis(10),
            )),
            api_key: Arc::from(KEY),
            public_ws_url: Arc::from("ws://relay.test/ws"),
            token_ttl_secs: 60,
        };
        (state, log)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = test_state();
        let response = create_api_router(state)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_requires_api_key() {
        let (state, _) = test_state();
        let request = Request::post("/api/token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"user_id":"watcher"}"#))
            .unwrap();
        let response = create_api_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_issued_and_accepted_by_sessions() {
        let (state, _) = test_state();
        let sessions = state.session_manager.clone();
        let request = Request::post("/api/token")
            .header("content-type", "application/json")
            .header(API_KEY_HEADER, KEY)
            .body(Body::from(r#"{"user_id":"watcher"}"#))
            .unwrap();
        let response = create_api_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: TokenResponse = body_json(response).await;
        assert_eq!(body.ws_url, "ws://relay.test/ws");
        let claims = sessions.validate_jwt(&body.token).unwrap();
        assert_eq!(claims.user_id, "watcher");
        assert_eq!(claims.exp, body.expires_at);
    }

    #[tokio::test]
    async fn test_quote_backfill() {
        let (state, _) = test_state();
        let (token, _) = state.jwt_generator.issue("watcher", 60).unwrap();
        let bar = Ohlcv { o: 1.0, h: 2.0, l: 0.5, c: 1.5, v: 3.0, t: 42 };
        state.pubsub_manager.publish("MSFT", &bar).unwrap();
        let router = create_api_router(state);

        let unauthenticated = router.clone()
            .oneshot(Request::get("/api/quote/msft").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

        let found = router.clone()
            .oneshot(
                Request::get("/api/quote/msft")
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let body: QuoteResponse = body_json(found).await;
        assert_eq!(body, QuoteResponse { symbol: "MSFT".to_string(), data: bar });

        let missing = router
            .oneshot(
                Request::get("/api/quote/ZZZZ")
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_tick_appends_to_log() {
        let (state, log) = test_state();
        log.create_group("g").await.unwrap();
        let router = create_api_router(state);

        let request = Request::post("/api/ticks")
            .header("content-type", "application/json")
            .header(API_KEY_HEADER, KEY)
            .body(Body::from(r#"{"symbol":"aapl","price":101.5,"size":3,"timestamp":1700000000000}"#))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let entries = log.read_group("g", "c", ReadCursor::New, 10, Duration::ZERO).await.unwrap();
        assert_eq!(entries.len(), 1);
        let tick = TradeTick::from_fields(&entries[0].id, &entries[0].fields).unwrap();
        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.price, 101.5);
        assert_eq!(tick.timestamp, 1_700_000_000_000);

        let bad = Request::post("/api/ticks")
            .header("content-type", "application/json")
            .header(API_KEY_HEADER, KEY)
            .body(Body::from(r#"{"symbol":"aapl","price":-1}"#))
            .unwrap();
        assert_eq!(router.oneshot(bad).await.unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_replay_commands() {
        let (state, _) = test_state();
        let router = create_api_router(state);

        let unknown = Request::post("/api/replay/rewind")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        assert_eq!(router.clone().oneshot(unknown).await.unwrap().status(), StatusCode::BAD_REQUEST);

        let pause = Request::post("/api/replay/pause")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        assert_eq!(router.clone().oneshot(pause).await.unwrap().status(), StatusCode::CONFLICT);

        let stop = Request::post("/api/replay/stop")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(stop).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ReplayResponse = body_json(response).await;
        assert_eq!(body.state, ReplayState::Stopped);
    }
}
