//! HTTP surface (axum).
//!
//! | Method | Path | Auth | Scope |
//! |--------|------|------|-------|
//! | GET | `/healthz`, `/readyz` | none | — |
//! | GET | `/v1/auth/modes` | none | — |
//! | POST | `/v1/auth/token` | api key in body | — |
//! | POST | `/v1/auth/revoke` | yes | `write:projects` |
//! | GET | `/v1/projects` | yes | `read:basic` |
//! | POST | `/v1/projects` | yes | `write:projects` |
//! | DELETE | `/v1/projects/{pid}` | yes | `write:projects` |
//! | GET/POST/DELETE | `/v1/projects/{pid}/faqs[...]` | yes | read / write |
//! | GET/POST/DELETE | `/v1/projects/{pid}/kb[...]` | yes | read / write |
//! | POST | `/v1/projects/{pid}/documents` | yes | `write:projects` |
//! | POST | `/v1/projects/{pid}/rebuild-indexes` | yes | `write:projects` |
//! | GET | `/v1/projects/{pid}/build-status` | yes | `read:basic` |
//! | POST | `/v1/query` | yes | `read:basic` |
//! | GET/POST | `/v1/tools[...]` | yes | `read:basic` |
//! | GET | `/v1/traces[...]`, `/v1/metrics/summary` | yes | `read:traces` |
//!
//! A tracing middleware wraps every request: it buffers the body (rejecting
//! oversized payloads with 413), hashes it, and appends one scrubbed trace
//! record with the response status and latency. Handler deadlines are 30 s
//! for queries and 120 s for uploads; hitting one surfaces `Timeout`.
//!
//! Error responses are JSON: `{"error":{"code":"...","message":"..."}}`.

use axum::{
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::content::KbFetch;
use crate::error::ServiceError;
use crate::models::{QueryRequest, Trace};
use crate::services::Services;
use crate::trace::{scrub_headers, TraceFilter};

/// Handler deadline for queries.
const QUERY_DEADLINE: Duration = Duration::from_secs(30);
/// Handler deadline for document uploads.
const UPLOAD_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
}

/// Build the router and serve until shutdown.
pub async fn run_server(services: Arc<Services>) -> anyhow::Result<()> {
    let bind_addr = services.config.bind_addr.clone();
    let app = build_router(services);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;
    Ok(())
}

pub fn build_router(services: Arc<Services>) -> Router {
    let cors = match &services.config.allowed_origins {
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        Some(origins) => {
            let parsed: Vec<axum::http::HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(parsed)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    let max_bytes = services.config.max_request_bytes;
    let state = AppState { services };

    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/readyz", get(handle_readyz))
        .route("/v1/auth/modes", get(handle_auth_modes))
        .route("/v1/auth/token", post(handle_auth_token))
        .route("/v1/auth/revoke", post(handle_auth_revoke))
        .route("/v1/projects", get(handle_list_projects).post(handle_put_project))
        .route("/v1/projects/{pid}", axum::routing::delete(handle_deactivate_project))
        .route("/v1/projects/{pid}/faqs", get(handle_list_faqs).post(handle_add_faq))
        .route(
            "/v1/projects/{pid}/faqs/{id}",
            get(handle_get_faq).delete(handle_delete_faq),
        )
        .route("/v1/projects/{pid}/kb", get(handle_list_kb).post(handle_add_kb))
        .route(
            "/v1/projects/{pid}/kb/{id}",
            get(handle_get_kb).delete(handle_delete_kb),
        )
        .route("/v1/projects/{pid}/documents", post(handle_upload_document))
        .route("/v1/projects/{pid}/rebuild-indexes", post(handle_rebuild))
        .route("/v1/projects/{pid}/build-status", get(handle_build_status))
        .route("/v1/query", post(handle_query))
        .route("/v1/tools", get(handle_list_tools))
        .route("/v1/tools/{name}", post(handle_invoke_tool))
        .route("/v1/traces", get(handle_list_traces))
        .route("/v1/traces/{id}", get(handle_get_trace))
        .route("/v1/metrics/summary", get(handle_metrics_summary))
        .layer(middleware::from_fn_with_state(state.clone(), trace_middleware))
        .layer(DefaultBodyLimit::max(max_bytes))
        .layer(cors)
        .with_state(state)
}

// ============ error mapping ============

struct AppError(ServiceError);

impl From<ServiceError> for AppError {
    fn from(e: ServiceError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
        }
        // Internal detail stays in the trace log; the body is opaque.
        let message = match &self.0 {
            ServiceError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let body = json!({"error": {"code": self.0.code(), "message": message}});
        let mut response = (status, Json(body)).into_response();
        response
            .extensions_mut()
            .insert(TraceError(self.0.to_string()));
        response
    }
}

/// Response extension carrying error detail into the trace middleware.
#[derive(Clone)]
struct TraceError(String);

type HandlerResult<T> = std::result::Result<T, AppError>;

// ============ tracing middleware ============

async fn trace_middleware(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query_params = parse_query(request.uri().query());
    let headers = request.headers().clone();
    let ip = client_ip(&headers, peer);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let session_id = state.services.auth.identify(&headers).await;

    // Buffer the body so its hash can be recorded; the cap was already
    // enforced by DefaultBodyLimit, this to_bytes is just the buffering.
    let (parts, body) = request.into_parts();
    let (response, body_sha256) =
        match axum::body::to_bytes(body, state.services.config.max_request_bytes).await {
            Ok(bytes) => {
                let body_sha256 = if bytes.is_empty() {
                    None
                } else {
                    Some(format!("{:x}", Sha256::digest(&bytes)))
                };
                let request = Request::from_parts(parts, Body::from(bytes));
                (next.run(request).await, body_sha256)
            }
            Err(_) => {
                let body = json!({"error": {"code": "bad_request", "message": "request body exceeds size limit"}});
                (
                    (StatusCode::PAYLOAD_TOO_LARGE, Json(body)).into_response(),
                    None,
                )
            }
        };

    let error = response.extensions().get::<TraceError>().map(|e| e.0.clone());
    let trace = Trace {
        id: format!("tr_{}", Uuid::new_v4().simple()),
        ts: Utc::now(),
        method,
        path,
        status: response.status().as_u16(),
        latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
        ip,
        user_agent,
        headers_scrubbed: scrub_headers(&headers),
        query_params,
        body_sha256,
        session_id,
        error,
    };
    if let Err(e) = state.services.traces.append(&trace).await {
        error!(error = %e, "failed to append trace");
    }
    response
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            return first.trim().to_string();
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return xri.to_string();
    }
    peer.ip().to_string()
}

fn parse_query(query: Option<&str>) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let mut iter = pair.splitn(2, '=');
            let key = iter.next().unwrap_or_default();
            let value = iter.next().unwrap_or_default();
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

// ============ health ============

async fn handle_healthz() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

async fn handle_readyz(State(state): State<AppState>) -> Response {
    if state.services.ready().await {
        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not ready"})),
        )
            .into_response()
    }
}

// ============ auth ============

async fn handle_auth_modes(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "bearer_enabled": true,
        "api_key_enabled": state.services.auth.api_key_enabled(),
    }))
}

#[derive(Deserialize)]
struct TokenRequest {
    api_key: String,
    client_name: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    ttl_seconds: Option<i64>,
}

async fn handle_auth_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> HandlerResult<Json<crate::auth::TokenGrant>> {
    let grant = state
        .services
        .auth
        .issue_token(
            &request.api_key,
            &request.client_name,
            request.scopes,
            request.ttl_seconds,
        )
        .await?;
    Ok(Json(grant))
}

#[derive(Deserialize)]
struct RevokeRequest {
    session_id: String,
}

async fn handle_auth_revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RevokeRequest>,
) -> HandlerResult<StatusCode> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    if state.services.auth.revoke(&request.session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::NotFound(format!("session '{}' not found", request.session_id)).into())
    }
}

fn require_scope(ctx: &crate::auth::AuthContext, scope: &str) -> Result<(), AppError> {
    if ctx.has_scope(scope) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(format!("missing scope '{}'", scope)).into())
    }
}

// ============ projects ============

async fn handle_list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    let projects = state.services.content.list_projects().await?;
    Ok(Json(json!({"projects": projects})))
}

#[derive(Deserialize)]
struct ProjectRequest {
    id: String,
    name: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

async fn handle_put_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ProjectRequest>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    if request.id.trim().is_empty() || request.name.trim().is_empty() {
        return Err(ServiceError::BadRequest("id and name must not be empty".to_string()).into());
    }
    let project = state
        .services
        .content
        .create_or_update_project(request.id.trim(), request.name.trim(), request.active)
        .await?;
    Ok(Json(serde_json::to_value(project).map_err(ServiceError::from)?))
}

async fn handle_deactivate_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
) -> HandlerResult<StatusCode> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    state.services.content.deactivate_project(&pid).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ FAQs ============

async fn handle_list_faqs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    let faqs = state.services.content.list_faqs(&pid).await?;
    Ok(Json(json!({"faqs": faqs})))
}

#[derive(Deserialize)]
struct FaqRequest {
    question: String,
    answer: String,
}

async fn handle_add_faq(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
    Json(request): Json<FaqRequest>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    let faq = state
        .services
        .content
        .add_faq(&pid, &request.question, &request.answer)
        .await?;
    Ok(Json(serde_json::to_value(faq).map_err(ServiceError::from)?))
}

async fn handle_get_faq(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((pid, id)): Path<(String, String)>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    let faq = state.services.content.get_faq(&pid, &id).await?;
    Ok(Json(serde_json::to_value(faq).map_err(ServiceError::from)?))
}

async fn handle_delete_faq(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((pid, id)): Path<(String, String)>,
) -> HandlerResult<StatusCode> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    if state.services.content.delete_faq(&pid, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::NotFound(format!("FAQ '{}' not found", id)).into())
    }
}

// ============ KB ============

async fn handle_list_kb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    let kb = state.services.content.list_kb(&pid).await?;
    Ok(Json(json!({"kb": kb})))
}

#[derive(Deserialize)]
struct KbRequest {
    title: String,
    content: String,
}

async fn handle_add_kb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
    Json(request): Json<KbRequest>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    let record = state
        .services
        .content
        .add_kb(&pid, &request.title, &request.content)
        .await?;
    Ok(Json(serde_json::to_value(record).map_err(ServiceError::from)?))
}

/// Uploaded records stream back their original bytes with the stored MIME
/// type; manual records come back as JSON.
async fn handle_get_kb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((pid, id)): Path<(String, String)>,
) -> HandlerResult<Response> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    match state.services.content.get_kb(&pid, &id).await? {
        KbFetch::Attachment { meta, bytes, .. } => {
            let mut response = bytes.into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                meta.mime.parse().unwrap_or_else(|_| {
                    header::HeaderValue::from_static("application/octet-stream")
                }),
            );
            let disposition = format!("inline; filename=\"{}\"", meta.original_name);
            if let Ok(value) = disposition.parse() {
                response
                    .headers_mut()
                    .insert(header::CONTENT_DISPOSITION, value);
            }
            Ok(response)
        }
        KbFetch::Record(record) => Ok(Json(
            serde_json::to_value(record).map_err(ServiceError::from)?,
        )
        .into_response()),
    }
}

async fn handle_delete_kb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((pid, id)): Path<(String, String)>,
) -> HandlerResult<StatusCode> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    if state.services.content.delete_kb(&pid, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::NotFound(format!("KB record '{}' not found", id)).into())
    }
}

// ============ documents ============

async fn handle_upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
    mut multipart: Multipart,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;

    let mut file_bytes: Option<Vec<u8>> = None;
    let mut mime: Option<String> = None;
    let mut title: Option<String> = None;
    let mut file_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                mime = field.content_type().map(|m| m.to_string());
                file_name = field.file_name().map(|n| n.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::BadRequest(format!("invalid upload: {}", e)))?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("title") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServiceError::BadRequest(format!("invalid title field: {}", e)))?;
                title = Some(text);
            }
            _ => {}
        }
    }

    let bytes = file_bytes
        .ok_or_else(|| ServiceError::BadRequest("multipart field 'file' is required".to_string()))?;
    let mime = mime
        .or_else(|| file_name.as_deref().and_then(mime_from_name))
        .ok_or_else(|| {
            ServiceError::UnsupportedMime("upload has no detectable content type".to_string())
        })?;
    let title = title
        .or_else(|| file_name.as_deref().map(title_from_name))
        .unwrap_or_default();

    let outcome = tokio::time::timeout(
        UPLOAD_DEADLINE,
        state
            .services
            .content
            .upload_document(&pid, &bytes, &mime, &title),
    )
    .await
    .map_err(|_| ServiceError::Timeout("document upload".to_string()))??;

    Ok(Json(serde_json::to_value(outcome).map_err(ServiceError::from)?))
}

fn mime_from_name(name: &str) -> Option<String> {
    let ext = name.rsplit('.').next()?.to_lowercase();
    match ext.as_str() {
        "pdf" => Some("application/pdf".to_string()),
        "docx" => Some(crate::extract::MIME_DOCX.to_string()),
        "txt" => Some("text/plain".to_string()),
        "md" => Some("text/markdown".to_string()),
        _ => None,
    }
}

fn title_from_name(name: &str) -> String {
    let stem = name.rsplit('/').next().unwrap_or(name);
    let stem = stem.rsplit_once('.').map(|(s, _)| s).unwrap_or(stem);
    stem.replace(['_', '-'], " ")
}

// ============ index lifecycle ============

async fn handle_rebuild(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
) -> HandlerResult<(StatusCode, Json<Value>)> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "write:projects")?;
    state.services.content.require_project(&pid).await?;
    state.services.index.mark_dirty(&pid).await?;
    let build_state = state.services.index.status(&pid).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "build_state": build_state})),
    ))
}

async fn handle_build_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(pid): Path<String>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    state.services.content.require_project(&pid).await?;
    let build_state = state.services.index.status(&pid).await?;
    let published = state.services.index.published_meta(&pid).await?;
    let retained = state.services.index.retained_versions(&pid).await?;
    Ok(Json(json!({
        "build_state": build_state,
        "published": published,
        "retained_versions": retained,
    })))
}

// ============ query ============

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    if request.question.trim().is_empty() {
        return Err(ServiceError::BadRequest("question must not be empty".to_string()).into());
    }
    let response = tokio::time::timeout(QUERY_DEADLINE, state.services.orchestrator.answer(request))
        .await
        .map_err(|_| ServiceError::Timeout("query".to_string()))??;
    Ok(Json(serde_json::to_value(response).map_err(ServiceError::from)?))
}

// ============ tools ============

async fn handle_list_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    Ok(Json(json!({"tools": state.services.tools.list()})))
}

async fn handle_invoke_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:basic")?;
    let params = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let usage = state.services.tools.execute(&name, params).await?;
    Ok(Json(serde_json::to_value(usage).map_err(ServiceError::from)?))
}

// ============ traces & metrics ============

#[derive(Deserialize)]
struct TraceQuery {
    since: Option<chrono::DateTime<Utc>>,
    status: Option<u16>,
    path_prefix: Option<String>,
    has_error: Option<bool>,
    #[serde(default = "default_trace_limit")]
    limit: i64,
}

fn default_trace_limit() -> i64 {
    100
}

async fn handle_list_traces(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TraceQuery>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:traces")?;
    let filter = TraceFilter {
        since: params.since,
        status: params.status,
        path_prefix: params.path_prefix,
        has_error: params.has_error,
    };
    let items = state.services.traces.list(&filter, params.limit).await?;
    Ok(Json(json!({"items": items})))
}

async fn handle_get_trace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:traces")?;
    let trace = state
        .services
        .traces
        .get(&id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("trace '{}' not found", id)))?;
    Ok(Json(serde_json::to_value(trace).map_err(ServiceError::from)?))
}

#[derive(Deserialize)]
struct MetricsQuery {
    #[serde(default = "default_metrics_window")]
    window_seconds: i64,
}

fn default_metrics_window() -> i64 {
    3_600
}

async fn handle_metrics_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<MetricsQuery>,
) -> HandlerResult<Json<Value>> {
    let ctx = state.services.auth.authenticate(&headers).await?;
    require_scope(&ctx, "read:traces")?;
    let window = params.window_seconds.clamp(60, 24 * 3_600);
    let summary = state.services.traces.metrics_summary(window).await?;
    Ok(Json(serde_json::to_value(summary).map_err(ServiceError::from)?))
}
