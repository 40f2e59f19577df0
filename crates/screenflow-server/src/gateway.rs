//! HTTP routes for the session workflow.
//!
//! Every handler authenticates through [`Caller`] before touching the
//! engine. Handlers only translate between HTTP and engine calls; fan-out
//! to WebSocket clients happens in the event bridge.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use screenflow_core::activity::{ActivityAction, ActivityQuery, Origin};
use screenflow_core::identity::Participant;
use screenflow_core::ids::{ApprovalId, ConnectionId, ParticipantId, PatientId, SessionId};
use screenflow_core::session::LockRecord;
use screenflow_core::workflow::{ApprovalDecision, SessionStatus, WorkflowStep};
use screenflow_engine::{ApprovalSubmission, CreateSession, LockRequest, StepUpdate};
use screenflow_store::SessionFilter;

use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::presence::PresenceInfo;
use crate::server::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/steps/{step}", put(update_step))
        .route("/sessions/{id}/activity-logs", get(activity_logs))
        .route("/sessions/{id}/lock", post(request_lock).delete(release_lock))
        .route("/sessions/{id}/approval-requests", post(request_approval))
        .route("/approval-requests/{id}", put(resolve_approval))
        .route("/sessions/{id}/cancel", post(cancel_session))
        .route(
            "/sessions/{id}/participants",
            post(join_session).delete(leave_session),
        )
        .route("/sessions/{id}/realtime-status", get(realtime_status))
}

// ── Extractors ──────────────────────────────────────────────────────────

/// Resolve the bearer token from the header, or from `query_token` when
/// the client cannot set headers (browser WebSockets).
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<String>,
) -> Result<Participant, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .or_else(|| {
            query_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from)
        })
        .ok_or(ApiError::Unauthorized)?;
    state
        .auth
        .authenticate(&token)
        .await
        .ok_or(ApiError::Unauthorized)
}

/// Authenticated participant plus request provenance for the audit trail.
pub struct Caller {
    pub participant: Participant,
    pub origin: Origin,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let participant = authenticate(state, &parts.headers, None).await?;
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let request_id = header("x-request-id").unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let origin = Origin {
            request_id: Some(request_id),
            remote_addr: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.to_string()),
            user_agent: header(USER_AGENT.as_str()),
        };
        Ok(Self {
            participant,
            origin,
        })
    }
}

/// `Json` with rejections reported in the gateway's error shape.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(|rejection| ApiError::BadInput(rejection.body_text()))
    }
}

/// `Query` with rejections reported in the gateway's error shape.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, ApiError> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|rejection| ApiError::BadInput(rejection.body_text()))
    }
}

/// Parse a body that may be absent entirely.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadInput(format!("invalid JSON body: {e}")))
}

fn parse_step(raw: &str) -> Result<WorkflowStep, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::UnknownRoute(format!("unknown step '{raw}'")))
}

fn parse_filter<T: std::str::FromStr<Err = String>>(raw: Option<String>) -> Result<Option<T>, ApiError> {
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().map_err(ApiError::BadInput))
        .transpose()
}

// ── Sessions ────────────────────────────────────────────────────────────

async fn create_session(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<CreateSession>,
) -> Result<Response, ApiError> {
    let session = state
        .engine
        .create_session(req, &caller.participant, caller.origin)
        .await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    patient_id: Option<String>,
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_sessions(
    State(state): State<AppState>,
    _caller: Caller,
    ApiQuery(params): ApiQuery<ListParams>,
) -> Result<Response, ApiError> {
    let filter = SessionFilter {
        patient_id: params
            .patient_id
            .filter(|p| !p.is_empty())
            .map(PatientId::from_raw),
        status: parse_filter::<SessionStatus>(params.status)?,
        limit: params.limit,
    };
    let sessions = state.engine.list_sessions(&filter).await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.engine.get_session(&SessionId::from_raw(id)).await?;
    Ok(Json(session).into_response())
}

async fn update_step(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, step)): Path<(String, String)>,
    ApiJson(update): ApiJson<StepUpdate>,
) -> Result<Response, ApiError> {
    let step = parse_step(&step)?;
    let session = state
        .engine
        .update_step(
            &SessionId::from_raw(id),
            step,
            &caller.participant,
            update,
            caller.origin,
        )
        .await?;
    Ok(Json(session).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ActivityParams {
    limit: Option<u32>,
    step: Option<String>,
    action: Option<String>,
    actor_id: Option<String>,
    after_sequence: Option<i64>,
    /// `asc` for oldest first; anything else is newest first.
    order: Option<String>,
}

async fn activity_logs(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<ActivityParams>,
) -> Result<Response, ApiError> {
    let query = ActivityQuery {
        step: parse_filter::<WorkflowStep>(params.step)?,
        action: parse_filter::<ActivityAction>(params.action)?,
        actor_id: params
            .actor_id
            .filter(|a| !a.is_empty())
            .map(ParticipantId::from_raw),
        after_sequence: params.after_sequence,
        limit: params.limit,
        ascending: params
            .order
            .is_some_and(|o| o.eq_ignore_ascii_case("asc")),
    };
    let session_id = SessionId::from_raw(id);
    let entries = state.engine.activity(&session_id, &query).await?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "entries": entries,
        "limit": query.effective_limit(),
    }))
    .into_response())
}

// ── Locks ───────────────────────────────────────────────────────────────

async fn request_lock(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<LockRequest>,
) -> Result<(StatusCode, Json<LockRecord>), ApiError> {
    let lock = state
        .engine
        .request_lock(&SessionId::from_raw(id), &caller.participant, req, caller.origin)
        .await?;
    Ok((StatusCode::CREATED, Json(lock)))
}

async fn release_lock(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let _ = state
        .engine
        .release_lock(&SessionId::from_raw(id), &caller.participant, caller.origin)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Approvals ───────────────────────────────────────────────────────────

async fn request_approval(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    ApiJson(submission): ApiJson<ApprovalSubmission>,
) -> Result<Response, ApiError> {
    let request = state
        .engine
        .request_approval(
            &SessionId::from_raw(id),
            &caller.participant,
            submission,
            caller.origin,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(request)).into_response())
}

#[derive(Debug, Deserialize)]
struct Resolution {
    decision: ApprovalDecision,
    #[serde(default)]
    notes: Option<String>,
}

async fn resolve_approval(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    ApiJson(resolution): ApiJson<Resolution>,
) -> Result<Response, ApiError> {
    let request = state
        .engine
        .resolve_approval(
            &ApprovalId::from_raw(id),
            &caller.participant,
            resolution.decision,
            resolution.notes,
            caller.origin,
        )
        .await?;
    Ok(Json(request).into_response())
}

// ── Lifecycle & participation ───────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let CancelBody { reason } = optional_body(&body)?;
    let session = state
        .engine
        .cancel_session(&SessionId::from_raw(id), &caller.participant, reason, caller.origin)
        .await?;
    Ok(Json(session).into_response())
}

async fn join_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .engine
        .join_session(&SessionId::from_raw(id), &caller.participant, caller.origin)
        .await?;
    Ok(Json(session).into_response())
}

async fn leave_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .engine
        .leave_session(&SessionId::from_raw(id), &caller.participant, caller.origin)
        .await?;
    Ok(Json(session).into_response())
}

// ── Realtime ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RealtimeParams {
    connection_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RealtimeStatus {
    session_id: SessionId,
    current_step: WorkflowStep,
    overall_status: SessionStatus,
    lock: Option<LockRecord>,
    version: i64,
    last_sequence: i64,
    subscribed_connections: Vec<ConnectionId>,
    connected_participants: Vec<PresenceInfo>,
}

/// Subscribe the caller's live connection(s) to the session room and
/// report what other clients see. Calling it again changes nothing.
async fn realtime_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<RealtimeParams>,
) -> Result<Response, ApiError> {
    let session_id = SessionId::from_raw(id);
    let session = state.engine.get_session(&session_id).await?;
    let last_sequence = state.engine.last_sequence(&session_id).await?;

    let connections = match params.connection_id.filter(|c| !c.is_empty()) {
        Some(raw) => {
            let conn_id = ConnectionId::from_raw(raw);
            if state.presence.owner_of(&conn_id).as_ref() != Some(&caller.participant.id) {
                return Err(ApiError::UnknownRoute(format!("connection {conn_id}")));
            }
            vec![conn_id]
        }
        None => state.presence.connections_of(&caller.participant.id),
    };
    for conn_id in &connections {
        let _ = state.presence.join_room(conn_id, &session_id);
    }

    let status = RealtimeStatus {
        current_step: session.current_step,
        overall_status: session.overall_status,
        lock: session.lock,
        version: session.version,
        last_sequence,
        subscribed_connections: connections,
        connected_participants: state.presence.room_participants(&session_id),
        session_id,
    };
    Ok(Json(status).into_response())
}
