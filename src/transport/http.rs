use super::TransportState;
use crate::models::{
    AgentRecord, AgentTaskResponse, CompletionDetails, Priority, ResponseStatus, TaskDescriptor,
    TransportKind,
};
use crate::rate_limit::rate_limit_middleware;
use crate::LoomError;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};
use validator::Validate;

const ROUTE_HEALTH: &str = "/health";
const ROUTE_REGISTER: &str = "/agents/register";
const ROUTE_AGENT_TASKS: &str = "/agents/{agent_id}/tasks";
const ROUTE_AGENT_RESPONSE: &str = "/agents/{agent_id}/tasks/{task_id}/response";
const ROUTE_AGENT_STATUS: &str = "/agents/{agent_id}/status";
const ROUTE_AGENT_HEARTBEAT: &str = "/agents/{agent_id}/heartbeat";
const ROUTE_DELIVER: &str = "/tasks/deliver";
const ROUTE_EVENTS: &str = "/events/{session_id}";
const ROUTE_SYSTEM_METRICS: &str = "/system/metrics";

/// Error half of every handler: maps the error taxonomy onto HTTP statuses
/// with the `{success:false, error, message?}` envelope.
pub struct ApiError(pub LoomError);

impl From<LoomError> for ApiError {
    fn from(err: LoomError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use crate::error::ErrorKind as K;
        let kind = self.0.kind();
        let status = match kind {
            K::Validation => StatusCode::BAD_REQUEST,
            K::Auth if matches!(self.0, LoomError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            K::Auth => StatusCode::UNAUTHORIZED,
            K::NotFound => StatusCode::NOT_FOUND,
            K::AlreadyExists | K::Conflict => StatusCode::CONFLICT,
            K::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            K::SecurityViolation => StatusCode::FORBIDDEN,
            K::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal detail stays server-side; clients get the taxonomy code.
        let message = match kind {
            K::Internal | K::StorageFailure | K::Transport => None,
            _ => Some(self.0.to_string()),
        };
        if message.is_none() {
            warn!("internal error surfaced as 500: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": kind.code(),
                "message": message,
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentRequest {
    #[validate(length(min = 1, max = 64))]
    pub agent_id: String,
    #[validate(length(min = 1))]
    pub capabilities: Vec<String>,
    #[validate(url)]
    pub http_endpoint: Option<String>,
    pub http_auth_token: Option<String>,
    pub max_concurrent_tasks: Option<usize>,
    pub polling_interval: Option<u64>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentResponse {
    pub success: bool,
    pub agent_id: String,
    pub session_id: String,
    pub auth_token: String,
    pub transport_type: String,
    pub polling_endpoint: String,
    pub response_endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickupQuery {
    pub max_tasks: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponseRequest {
    pub status: ResponseStatus,
    pub response: String,
    pub completion_details: Option<CompletionDetails>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeliverTaskRequest {
    #[validate(length(min = 1))]
    pub agent_id: String,
    #[validate(length(min = 1))]
    pub task_id: String,
    pub task_payload: serde_json::Value,
    pub priority: Option<Priority>,
    pub deadline: Option<chrono::DateTime<Utc>>,
}

pub fn build_router(state: TransportState) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_origin(
            state
                .config
                .transport
                .http
                .cors
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect::<Vec<_>>(),
        )
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    let mut router = Router::new()
        .route(ROUTE_HEALTH, get(health))
        .route(ROUTE_REGISTER, post(register_agent))
        .route(ROUTE_AGENT_TASKS, get(pickup_tasks))
        .route(ROUTE_AGENT_RESPONSE, post(submit_response))
        .route(ROUTE_AGENT_STATUS, get(agent_status))
        .route(ROUTE_AGENT_HEARTBEAT, post(heartbeat))
        .route(ROUTE_DELIVER, post(deliver_task))
        .route(ROUTE_SYSTEM_METRICS, get(system_metrics));

    if state.config.transport.sse.enabled {
        router = router.route(ROUTE_EVENTS, get(super::sse::subscribe));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit_middleware,
                ))
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(state)
}

/// Bearer-token gate for everything except health, registration, CORS
/// preflight, and the SSE stream (which is session-addressed).
async fn auth_middleware(
    State(state): State<TransportState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: middleware::Next,
) -> std::result::Result<Response, Response> {
    let path = request.uri().path();
    if request.method() == Method::OPTIONS
        || path == ROUTE_HEALTH
        || path == ROUTE_REGISTER
        || path.starts_with("/events/")
    {
        return Ok(next.run(request).await);
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(LoomError::Unauthorized).into_response())?;

    // Admin key short-circuits; agent tokens resolve through auth sessions.
    if let Some(admin_key) = &state.config.security.api_key {
        let equal: bool = token.as_bytes().ct_eq(admin_key.as_bytes()).into();
        if equal {
            return Ok(next.run(request).await);
        }
    }
    state
        .auth
        .validate(token)
        .map_err(|e| ApiError(e).into_response())?;

    Ok(next.run(request).await)
}

async fn health(State(state): State<TransportState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "status": "healthy",
        "timestamp": Utc::now(),
        "uptime": state.monitor.uptime_seconds(),
    }))
}

async fn system_metrics(State(state): State<TransportState>) -> Json<serde_json::Value> {
    let metrics = state.monitor.get_current_metrics().await;
    Json(serde_json::json!({ "success": true, "metrics": metrics }))
}

async fn register_agent(
    State(state): State<TransportState>,
    Json(request): Json<RegisterAgentRequest>,
) -> ApiResult<(StatusCode, Json<RegisterAgentResponse>)> {
    request
        .validate()
        .map_err(|e| LoomError::Validation(e.to_string()))?;

    let session = state.auth.authenticate(&request.agent_id, "agent")?;

    let mut agent = AgentRecord::new(
        &request.agent_id,
        request.capabilities.clone(),
        TransportKind::Http,
    );
    agent.http_endpoint = request.http_endpoint.clone();
    agent.http_auth_token = request.http_auth_token.clone();
    agent.session_id = Some(session.session_id.clone());
    if let Some(max) = request.max_concurrent_tasks {
        agent.config.max_concurrent_tasks = max.clamp(1, 32);
    }

    state.registry.register(agent, request.force)?;
    debug!(agent_id = %request.agent_id, "agent registered over http");

    Ok((
        StatusCode::CREATED,
        Json(RegisterAgentResponse {
            success: true,
            agent_id: request.agent_id.clone(),
            session_id: session.session_id,
            auth_token: session.token,
            transport_type: "http".to_string(),
            polling_endpoint: format!("/agents/{}/tasks", request.agent_id),
            response_endpoint: format!("/agents/{}/tasks/:taskId/response", request.agent_id),
        }),
    ))
}

async fn pickup_tasks(
    State(state): State<TransportState>,
    Path(agent_id): Path<String>,
    Query(query): Query<PickupQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.registry.get(&agent_id).is_none() {
        return Err(LoomError::NotFound(format!("agent {agent_id}")).into());
    }
    let max = query.max_tasks.unwrap_or(1).clamp(1, 16);
    let tasks = state.queues.get_tasks(&agent_id, max);
    state.registry.update_heartbeat(&agent_id)?;

    Ok(Json(serde_json::json!({
        "success": true,
        "agentId": agent_id,
        "tasks": tasks,
        "remainingInQueue": state.queues.len(&agent_id),
    })))
}

async fn submit_response(
    State(state): State<TransportState>,
    Path((agent_id, task_id)): Path<(String, String)>,
    Json(request): Json<SubmitResponseRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    // Responses are stored and rebroadcast; hostile content stops here.
    let scan = state.security.sanitizer.scan(&request.response);
    if !scan.successful {
        return Err(LoomError::Validation(
            "response contains disallowed content".to_string(),
        )
        .into());
    }

    let response = AgentTaskResponse {
        agent_id,
        task_id,
        status: request.status,
        response: request.response,
        completion_details: request.completion_details,
        received_at: Utc::now(),
    };
    let report = state.processor.process(response).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "processedAt": report.processed_at,
    })))
}

async fn agent_status(
    State(state): State<TransportState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state
        .registry
        .get(&agent_id)
        .ok_or_else(|| LoomError::NotFound(format!("agent {agent_id}")))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "status": agent.state,
        "capabilities": agent.capabilities,
        "transportType": agent.transport,
        "maxConcurrentTasks": agent.config.max_concurrent_tasks,
        "currentTasks": agent.current_tasks,
        "queueLength": state.queues.len(&agent_id),
        "lastSeen": agent.last_heartbeat,
        "registeredAt": agent.registered_at,
    })))
}

async fn heartbeat(
    State(state): State<TransportState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.update_heartbeat(&agent_id)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "timestamp": Utc::now(),
    })))
}

async fn deliver_task(
    State(state): State<TransportState>,
    Json(request): Json<DeliverTaskRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    request
        .validate()
        .map_err(|e| LoomError::Validation(e.to_string()))?;

    let agent = state
        .registry
        .get(&request.agent_id)
        .ok_or_else(|| LoomError::NotFound(format!("agent {}", request.agent_id)))?;

    let descriptor = TaskDescriptor {
        task_id: request.task_id.clone(),
        title: request.task_id.clone(),
        payload: request.task_payload,
        priority: request.priority.unwrap_or(Priority::Medium),
        deadline: request.deadline,
        enqueued_at: Utc::now(),
    };

    state
        .queues
        .add_task(&agent.id, descriptor.clone(), agent.config.max_concurrent_tasks)?;
    deliver_best_effort(&state, &agent, &descriptor).await;

    Ok(Json(serde_json::json!({
        "success": true,
        "deliveredAt": Utc::now(),
    })))
}

/// Queue insertion is the contract; a live push on top is opportunistic.
async fn deliver_best_effort(state: &TransportState, agent: &AgentRecord, descriptor: &TaskDescriptor) {
    if agent.transport != TransportKind::Http {
        if let Err(e) = state.delivery.deliver(agent, descriptor).await {
            debug!(agent_id = %agent.id, "push delivery skipped: {e}");
        }
    }
}
