//! Control Plane API Server
//!
//! HTTP surface for readiness probes and instance registration. Every
//! `/api/v1` route passes through admission control keyed on the
//! caller's identity.

use crate::application::{ControlError, ControlPlane};
use crate::domain::entities::Instance;
use crate::infrastructure::registry::RegistryError;
use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tower_http::compression::predicate::SizeAbove;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Responses smaller than this are sent uncompressed.
const COMPRESSION_MIN_SIZE: u16 = 1000;

/// Registration request from an instance.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Reject the request if the id is already registered
    #[serde(default)]
    pub strict: bool,
}

fn default_weight() -> u32 {
    1
}

/// Instance as reported by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub healthy: bool,
    /// Unix seconds
    pub registered_at: u64,
    /// Unix seconds
    pub last_health_check: Option<u64>,
    pub active_connections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstancesListResponse {
    pub instances: Vec<InstanceStatus>,
    pub total: usize,
    pub healthy: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub operation: String,
    pub state: String,
    pub failures: u32,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// API Server state.
#[derive(Clone)]
pub struct ApiState {
    pub plane: Arc<ControlPlane>,
}

impl ApiState {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self { plane }
    }

    fn status(&self, instance: &Instance) -> InstanceStatus {
        InstanceStatus {
            id: instance.id.clone(),
            host: instance.host.clone(),
            port: instance.port,
            weight: instance.weight,
            healthy: instance.healthy,
            registered_at: unix_secs(instance.registered_at),
            last_health_check: instance.last_health_check.map(unix_secs),
            active_connections: self.plane.registry().active_connections(&instance.id),
        }
    }
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/instances", post(register_handler).get(list_instances_handler))
        .route(
            "/instances/:id",
            get(get_instance_handler).delete(deregister_handler),
        )
        .route("/circuits", get(list_circuits_handler))
        .route("/circuits/:operation/reset", post(reset_circuit_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ));

    let health_path = state.plane.health_path().to_string();

    Router::new()
        .route(&health_path, get(health_handler))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new().compress_when(SizeAbove::new(COMPRESSION_MIN_SIZE)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API server for the control plane.
pub struct ApiServer {
    listen_addr: SocketAddr,
    state: ApiState,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, plane: Arc<ControlPlane>) -> Self {
        Self {
            listen_addr,
            state: ApiState::new(plane),
        }
    }

    /// Serve until `shutdown` completes.
    pub async fn run<S>(&self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());

        let listener = TcpListener::bind(self.listen_addr).await?;
        tracing::info!("control plane API listening on {}", self.listen_addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }
}

/// Identify the caller: first `X-Forwarded-For` hop, else the peer
/// address, else `unknown`.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

async fn admission_middleware(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = client_identity(request.headers(), peer);

    let _guard = match state.plane.admit(&identity).await {
        Ok(guard) => guard,
        Err(ControlError::RateLimited { retry_after_ms }) => {
            tracing::debug!("rejected {}: rate limited", identity);
            let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": "rate limit exceeded",
                    "retry_after_ms": retry_after_ms
                })),
            )
                .into_response();
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs),
            );
            return response;
        }
        Err(ControlError::ShuttingDown) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "shutting down" })),
            )
                .into_response();
        }
    };

    next.run(request).await
}

// Handler functions

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let report = state.plane.health_report().await;
    let status = if report.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

async fn register_handler(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let registry = state.plane.registry();

    let instance = if req.strict {
        match registry.register_strict(&req.id, &req.host, req.port, req.weight) {
            Ok(instance) => instance,
            Err(e @ RegistryError::DuplicateInstance(_)) => {
                return (
                    StatusCode::CONFLICT,
                    Json(serde_json::json!({ "id": req.id, "error": e.to_string() })),
                )
                    .into_response();
            }
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response();
            }
        }
    } else {
        registry.register(&req.id, &req.host, req.port, req.weight)
    };

    (StatusCode::CREATED, Json(state.status(&instance))).into_response()
}

async fn list_instances_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let instances: Vec<_> = state
        .plane
        .registry()
        .all()
        .iter()
        .map(|i| state.status(i))
        .collect();
    let total = instances.len();
    let healthy = instances.iter().filter(|i| i.healthy).count();
    Json(InstancesListResponse {
        instances,
        total,
        healthy,
    })
}

async fn get_instance_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.plane.registry().get(&id) {
        Some(instance) => Json(state.status(&instance)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "id": id, "error": "instance not found" })),
        )
            .into_response(),
    }
}

async fn deregister_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    // Deregistering an unknown id is not an error
    let removed = state.plane.registry().deregister(&id);
    Json(serde_json::json!({ "id": id, "deregistered": removed }))
}

async fn list_circuits_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let breaker = state.plane.breaker();
    let mut circuits: Vec<CircuitStatus> = breaker
        .all_states()
        .into_iter()
        .map(|(operation, circuit_state)| CircuitStatus {
            failures: breaker.metrics(&operation).failures,
            state: circuit_state.to_string(),
            operation,
        })
        .collect();
    circuits.sort_by(|a, b| a.operation.cmp(&b.operation));
    Json(circuits)
}

async fn reset_circuit_handler(
    State(state): State<ApiState>,
    Path(operation): Path<String>,
) -> impl IntoResponse {
    state.plane.breaker().reset(&operation);
    Json(serde_json::json!({
        "operation": operation,
        "state": state.plane.breaker().state(&operation).to_string()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryStore;
    use crate::config::{AppConfig, ScalingConfig, ScalingMode};
    use crate::infrastructure::connection_pool::{DatabasePool, PoolConfig};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        state: ApiState,
    }

    fn test_app(max_requests: u64) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db").to_string_lossy().to_string();

        let mut scaling = ScalingConfig::for_mode(ScalingMode::Production);
        scaling.rate_limit_max_requests = max_requests;
        let config = AppConfig {
            scaling,
            database_path: path.clone(),
            ..Default::default()
        };

        let store = Arc::new(MemoryStore::new());
        let database = Arc::new(DatabasePool::new(PoolConfig::new(path, 2)));
        let plane = Arc::new(ControlPlane::new(&config, store.clone(), database));

        TestApp {
            _dir: dir,
            store,
            state: ApiState::new(plane),
        }
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_client_identity() {
        let peer: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_identity(&headers, Some(peer)), "192.0.2.7");
        assert_eq!(client_identity(&headers, None), "unknown");

        headers.insert("x-forwarded-for", "203.0.113.1, 10.0.0.1".parse().unwrap());
        assert_eq!(client_identity(&headers, Some(peer)), "203.0.113.1");
    }

    #[test]
    fn test_default_weight() {
        let req: RegisterRequest =
            serde_json::from_value(serde_json::json!({"id": "a", "host": "h", "port": 1}))
                .unwrap();
        assert_eq!(req.weight, 1);
        assert!(!req.strict);
    }

    #[tokio::test]
    async fn test_health_ok() {
        let app = test_app(100);
        let response = router(app.state.clone()).oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["checks"]["database"], true);
        assert_eq!(body["checks"]["store"], true);
        assert_eq!(body["version"], "1.0.0");
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_store_down() {
        let app = test_app(100);
        app.store.set_available(false);

        let response = router(app.state.clone()).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_register_list_deregister() {
        let app = test_app(100);
        let router = router(app.state.clone());

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/v1/instances",
                serde_json::json!({"id": "a", "host": "10.0.0.1", "port": 8080, "weight": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["weight"], 3);
        assert_eq!(created["healthy"], true);

        let response = router.clone().oneshot(get("/api/v1/instances")).await.unwrap();
        let list = json_body(response).await;
        assert_eq!(list["total"], 1);
        assert_eq!(list["healthy"], 1);

        let response = router
            .clone()
            .oneshot(get("/api/v1/instances/a"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let delete = HttpRequest::builder()
            .method("DELETE")
            .uri("/api/v1/instances/a")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(delete).await.unwrap();
        assert_eq!(json_body(response).await["deregistered"], true);

        let response = router.oneshot(get("/api/v1/instances/a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_strict_register_conflict() {
        let app = test_app(100);
        app.state.plane.registry().register("a", "10.0.0.1", 8080, 1);

        let response = router(app.state.clone())
            .oneshot(post_json(
                "/api/v1/instances",
                serde_json::json!({"id": "a", "host": "10.0.0.2", "port": 8080, "strict": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(app.state.plane.registry().get("a").unwrap().host, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_api_is_rate_limited() {
        let app = test_app(2);
        let router = router(app.state.clone());

        let from = |ip: &str| {
            HttpRequest::builder()
                .uri("/api/v1/instances")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..2 {
            let response = router.clone().oneshot(from("203.0.113.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router.clone().oneshot(from("203.0.113.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        let response = router.clone().oneshot(from("203.0.113.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Readiness probes are never limited
        let response = router.oneshot(get("/health")).await.unwrap();
        assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_api_refuses_work_during_shutdown() {
        let app = test_app(100);
        app.state.plane.shutdown_controller().shutdown();

        let response = router(app.state.clone())
            .oneshot(get("/api/v1/instances"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_any_origin() {
        let app = test_app(100);
        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/api/v1/instances")
            .header(header::ORIGIN, "https://dashboard.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();

        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn test_large_responses_are_gzipped() {
        let app = test_app(100);
        for i in 0..30 {
            app.state
                .plane
                .registry()
                .register(&format!("instance-{}", i), "10.0.0.1", 8000 + i, 1);
        }
        let router = router(app.state.clone());

        let gzip_get = |uri: &str| {
            HttpRequest::builder()
                .uri(uri)
                .header(header::ACCEPT_ENCODING, "gzip")
                .body(Body::empty())
                .unwrap()
        };

        let response = router
            .clone()
            .oneshot(gzip_get("/api/v1/instances"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");

        // The health report is well under the threshold
        let response = router.oneshot(gzip_get("/health")).await.unwrap();
        assert!(!response.headers().contains_key(header::CONTENT_ENCODING));
    }

    #[tokio::test]
    async fn test_circuits_listing_and_reset() {
        let app = test_app(100);
        let plane = app.state.plane.clone();
        for _ in 0..5 {
            let _: Result<(), _> = plane.protect("db", || async { Err("down") }).await;
        }

        let router = router(app.state.clone());
        let response = router.clone().oneshot(get("/api/v1/circuits")).await.unwrap();
        let circuits = json_body(response).await;
        assert_eq!(circuits[0]["operation"], "db");
        assert_eq!(circuits[0]["state"], "open");

        let response = router
            .oneshot(post_json("/api/v1/circuits/db/reset", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["state"], "closed");
    }
}
