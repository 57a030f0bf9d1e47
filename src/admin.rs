/// Admin HTTP API.
///
/// Bound on loopback, guarded by a static bearer token. Every endpoint
/// except `GET /health` requires `Authorization: Bearer <ADMIN_TOKEN>`;
/// when no token is configured the API rejects everything, so an operator
/// cannot accidentally expose an open control surface. Failed auth gets an
/// opaque 401 regardless of whether the token was missing, empty, or wrong.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RateConfig;
use crate::error::ProxyError;
use crate::ratelimit::{BanReason, RateLimiter};
use crate::registry::SessionRegistry;

type ApiError = (StatusCode, Json<Value>);
type Auth = Option<TypedHeader<Authorization<Bearer>>>;

#[derive(Clone)]
pub struct AdminState {
    token: Option<String>,
    started: Instant,
    limiter: Arc<RateLimiter>,
    registry: Arc<SessionRegistry>,
}

impl AdminState {
    pub fn new(
        token: Option<String>,
        limiter: Arc<RateLimiter>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            token,
            started: Instant::now(),
            limiter,
            registry,
        }
    }
}

/// Build the admin router. Separate from [`serve`] so tests can drive it
/// without a socket.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(kick_session))
        .route("/bans", get(list_bans))
        .route("/bans", post(create_ban))
        .route("/bans/{ip}", delete(remove_ban))
        .route("/ratelimits", get(get_ratelimits))
        .route("/ratelimits", put(set_ratelimits))
        .with_state(state)
}

/// Bind the admin listener on loopback. An occupied port is a startup
/// failure, not something to limp along without.
pub async fn bind(port: u16) -> Result<TcpListener, ProxyError> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let listener = TcpListener::bind(addr).await?;
    info!("admin api listening on {addr}");
    Ok(listener)
}

/// Serve the admin API on an already-bound listener.
pub async fn serve(listener: TcpListener, state: AdminState) -> Result<(), ProxyError> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Constant-shape 401 for every authentication failure.
fn unauthorized() -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
}

fn authorize(state: &AdminState, auth: &Auth) -> Result<(), ApiError> {
    let Some(expected) = state.token.as_deref() else {
        // No token configured: the API is a locked door.
        return Err(unauthorized());
    };
    match auth {
        Some(TypedHeader(bearer)) if bearer.token() == expected => Ok(()),
        _ => Err(unauthorized()),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AdminState>, auth: Auth) -> Result<Json<Value>, ApiError> {
    authorize(&state, &auth)?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
        "sessions": state.registry.len(),
        "bans": state.limiter.bans().len(),
    })))
}

async fn list_sessions(
    State(state): State<AdminState>,
    auth: Auth,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &auth)?;
    Ok(Json(json!({ "sessions": state.registry.snapshot() })))
}

async fn kick_session(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    auth: Auth,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &auth)?;
    if state.registry.kick(id) {
        info!(id, "session kicked by admin");
        Ok(Json(json!({ "kicked": id })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such session" })),
        ))
    }
}

async fn list_bans(State(state): State<AdminState>, auth: Auth) -> Result<Json<Value>, ApiError> {
    authorize(&state, &auth)?;
    Ok(Json(json!({ "bans": state.limiter.bans() })))
}

#[derive(Deserialize)]
struct BanRequest {
    ip: String,
    /// Optional override of the configured ban duration.
    minutes: Option<u64>,
}

async fn create_ban(
    State(state): State<AdminState>,
    auth: Auth,
    Json(req): Json<BanRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &auth)?;
    let ip: IpAddr = req.ip.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid ip address" })),
        )
    })?;
    if req.minutes == Some(0) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "minutes must be greater than 0" })),
        ));
    }
    warn!(%ip, minutes = ?req.minutes, "address banned by admin");
    match req.minutes {
        Some(minutes) => {
            let secs = minutes.checked_mul(60).ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "minutes out of range" })),
                )
            })?;
            state
                .limiter
                .ban_for(ip, BanReason::Admin, Duration::from_secs(secs));
        }
        None => state.limiter.ban(ip, BanReason::Admin),
    }
    Ok(Json(json!({ "banned": req.ip })))
}

async fn remove_ban(
    State(state): State<AdminState>,
    Path(ip): Path<String>,
    auth: Auth,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &auth)?;
    let ip: IpAddr = ip.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid ip address" })),
        )
    })?;
    if state.limiter.unban(ip) {
        Ok(Json(json!({ "unbanned": ip.to_string() })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "address is not banned" })),
        ))
    }
}

async fn get_ratelimits(
    State(state): State<AdminState>,
    auth: Auth,
) -> Result<Json<RateConfig>, ApiError> {
    authorize(&state, &auth)?;
    Ok(Json(state.limiter.config()))
}

async fn set_ratelimits(
    State(state): State<AdminState>,
    auth: Auth,
    Json(cfg): Json<RateConfig>,
) -> Result<Json<RateConfig>, ApiError> {
    authorize(&state, &auth)?;
    // Same bounds as startup validation: only auto_ban may be zero.
    if cfg.conn_per_min == 0
        || cfg.msg_per_sec == 0
        || cfg.msg_burst == 0
        || cfg.ban_duration_min == 0
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "rate values must be greater than 0" })),
        ));
    }
    state.limiter.set_config(cfg);
    Ok(Json(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn test_state(token: Option<&str>) -> AdminState {
        let limiter = Arc::new(RateLimiter::new(RateConfig {
            conn_per_min: 10,
            msg_per_sec: 4,
            msg_burst: 8,
            auto_ban: 5,
            ban_duration_min: 15,
        }));
        let registry = Arc::new(SessionRegistry::new());
        limiter.attach_registry(registry.clone());
        AdminState::new(token.map(str::to_owned), limiter, registry)
    }

    async fn call(router: Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get_req(path: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn bind_fails_when_port_is_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(bind(port).await.is_err());
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let (status, body) = call(router(test_state(Some("secret"))), get_req("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_token_gets_opaque_401() {
        let (status, body) = call(router(test_state(Some("secret"))), get_req("/status", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn wrong_token_gets_same_401() {
        let (status, body) =
            call(router(test_state(Some("secret"))), get_req("/status", Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn unset_token_rejects_even_correct_guesses() {
        let (status, _) = call(router(test_state(None)), get_req("/status", Some("anything"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let state = test_state(Some("secret"));
        state.registry.register("10.0.0.1".parse().unwrap(), false);
        let (status, body) = call(router(state), get_req("/status", Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["bans"], 0);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn sessions_lists_live_connections() {
        let state = test_state(Some("secret"));
        let handle = state.registry.register("10.0.0.1".parse().unwrap(), true);
        handle.set_nick("alice");

        let (status, body) = call(router(state), get_req("/sessions", Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"][0]["nick"], "alice");
        assert_eq!(body["sessions"][0]["tls"], true);
    }

    #[tokio::test]
    async fn kick_cancels_session() {
        let state = test_state(Some("secret"));
        let handle = state.registry.register("10.0.0.1".parse().unwrap(), false);
        let token = handle.cancelled();

        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/sessions/{}", handle.id))
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(router(state), req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn kick_unknown_session_is_404() {
        let req = Request::builder()
            .method("DELETE")
            .uri("/sessions/999")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(router(test_state(Some("secret"))), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ban_and_unban_roundtrip() {
        let state = test_state(Some("secret"));
        let limiter = state.limiter.clone();

        let req = Request::builder()
            .method("POST")
            .uri("/bans")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"ip":"10.0.0.1"}"#))
            .unwrap();
        let (status, _) = call(router(state.clone()), req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(limiter.is_banned("10.0.0.1".parse().unwrap()));

        let (status, body) = call(router(state.clone()), get_req("/bans", Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bans"][0]["ip"], "10.0.0.1");
        assert_eq!(body["bans"][0]["reason"], "admin");

        let req = Request::builder()
            .method("DELETE")
            .uri("/bans/10.0.0.1")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(router(state), req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!limiter.is_banned("10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn ban_accepts_explicit_duration() {
        let state = test_state(Some("secret"));
        let limiter = state.limiter.clone();

        let req = Request::builder()
            .method("POST")
            .uri("/bans")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"ip":"10.0.0.1","minutes":60}"#))
            .unwrap();
        let (status, _) = call(router(state), req).await;
        assert_eq!(status, StatusCode::OK);

        let bans = limiter.bans();
        assert_eq!(bans.len(), 1);
        // Configured default is 15 minutes; the request asked for 60.
        assert!(bans[0].remaining_secs > 30 * 60);
    }

    #[tokio::test]
    async fn ban_with_overflowing_minutes_is_400() {
        let req = Request::builder()
            .method("POST")
            .uri("/bans")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"ip":"10.0.0.1","minutes":307445734561825861}"#))
            .unwrap();
        let (status, body) = call(router(test_state(Some("secret"))), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "minutes out of range");
    }

    #[tokio::test]
    async fn ban_with_zero_minutes_is_400() {
        let req = Request::builder()
            .method("POST")
            .uri("/bans")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"ip":"10.0.0.1","minutes":0}"#))
            .unwrap();
        let (status, _) = call(router(test_state(Some("secret"))), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ban_with_invalid_ip_is_400() {
        let req = Request::builder()
            .method("POST")
            .uri("/bans")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"ip":"not-an-ip"}"#))
            .unwrap();
        let (status, _) = call(router(test_state(Some("secret"))), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unban_unknown_ip_is_404() {
        let req = Request::builder()
            .method("DELETE")
            .uri("/bans/10.0.0.9")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(router(test_state(Some("secret"))), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ratelimits_roundtrip() {
        let state = test_state(Some("secret"));
        let limiter = state.limiter.clone();

        let (status, body) = call(router(state.clone()), get_req("/ratelimits", Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["msg_burst"], 8);

        let req = Request::builder()
            .method("PUT")
            .uri("/ratelimits")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"conn_per_min":5,"msg_per_sec":2,"msg_burst":4,"auto_ban":3,"ban_duration_min":30}"#,
            ))
            .unwrap();
        let (status, body) = call(router(state), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["msg_burst"], 4);
        assert_eq!(limiter.config().ban_duration_min, 30);
    }

    #[tokio::test]
    async fn zero_rate_values_are_rejected() {
        let req = Request::builder()
            .method("PUT")
            .uri("/ratelimits")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"conn_per_min":0,"msg_per_sec":2,"msg_burst":4,"auto_ban":3,"ban_duration_min":30}"#,
            ))
            .unwrap();
        let (status, _) = call(router(test_state(Some("secret"))), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
