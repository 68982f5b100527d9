//! Control-plane REST API.
//!
//! HTTP mirror of the call operations for clients without a live socket —
//! mobile apps answering from a push notification, backends initiating calls
//! on a user's behalf. The acting user id is carried explicitly in each
//! request; platform authentication happens upstream of this service.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::dispatch::DeliveryOutcome;
use crate::error::Error;
use crate::lifecycle;
use crate::protocol::CallSnapshot;
use crate::session::CallType;
use crate::state::AppState;

/// Body for `POST /calls`.
#[derive(Debug, Deserialize)]
pub struct CreateCallRequest {
    pub caller_id: String,
    /// Display name snapshot for notification text; falls back to the id.
    pub caller_name: Option<String>,
    pub callee_id: String,
    pub call_type: String,
    /// Additional participants beyond caller and callee (group calls).
    #[serde(default)]
    pub participants: Vec<String>,
}

/// Body for the per-call action endpoints (answer/decline/end).
#[derive(Debug, Deserialize)]
pub struct CallActionRequest {
    pub user_id: String,
    pub reason: Option<String>,
}

/// Body for `POST /calls/:call_id/sync`.
#[derive(Debug, Deserialize)]
pub struct SyncStatusRequest {
    pub user_id: String,
    pub status: String,
}

/// Body for `POST /push/tokens`.
#[derive(Debug, Deserialize)]
pub struct RegisterTokenRequest {
    pub user_id: String,
    pub token: String,
    pub platform: Option<String>,
}

/// Query parameters for `GET /calls/:call_id`.
#[derive(Debug, Deserialize)]
pub struct CallQuery {
    pub user_id: String,
}

/// Standard call payload returned by every call endpoint.
#[derive(Debug, Serialize)]
pub struct CallResponse {
    pub call: CallSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryOutcome>,
}

/// Initiate a call and dispatch the invitation.
///
/// POST /calls
/// Body: { "caller_id": "u1", "callee_id": "u2", "call_type": "video" }
pub async fn create_call(
    State(state): State<AppState>,
    Json(request): Json<CreateCallRequest>,
) -> impl IntoResponse {
    let Some(call_type) = CallType::parse(&request.call_type) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("Unknown call type: {}", request.call_type)
            })),
        )
            .into_response();
    };

    match lifecycle::create_call(
        &state,
        &request.caller_id,
        request.caller_name.as_deref(),
        &request.callee_id,
        call_type,
        &request.participants,
    )
    .await
    {
        Ok((session, delivery)) => (
            StatusCode::CREATED,
            Json(CallResponse {
                call: CallSnapshot::from(&session),
                delivery: Some(delivery),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Answer a ringing call.
///
/// POST /calls/:call_id/answer
/// Body: { "user_id": "u2" }
pub async fn answer_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Json(request): Json<CallActionRequest>,
) -> impl IntoResponse {
    match lifecycle::answer(&state, &call_id, &request.user_id) {
        Ok(session) => call_response(&session),
        Err(e) => error_response(&e),
    }
}

/// Decline an incoming call.
///
/// POST /calls/:call_id/decline
/// Body: { "user_id": "u2", "reason": "busy" }
pub async fn decline_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Json(request): Json<CallActionRequest>,
) -> impl IntoResponse {
    match lifecycle::decline(&state, &call_id, &request.user_id, request.reason.as_deref()).await {
        Ok(session) => call_response(&session),
        Err(e) => error_response(&e),
    }
}

/// Hang up a call.
///
/// POST /calls/:call_id/end
/// Body: { "user_id": "u1" }
pub async fn end_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Json(request): Json<CallActionRequest>,
) -> impl IntoResponse {
    match lifecycle::end(&state, &call_id, &request.user_id, request.reason.as_deref()).await {
        Ok(session) => call_response(&session),
        Err(e) => error_response(&e),
    }
}

/// Fetch the current state of a call. Participants only.
///
/// GET /calls/:call_id?user_id=u1
pub async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Query(query): Query<CallQuery>,
) -> impl IntoResponse {
    match lifecycle::get_status(&state, &call_id, &query.user_id) {
        Ok(session) => call_response(&session),
        Err(e) => error_response(&e),
    }
}

/// Reconcile a call to the status a reconnecting client observed.
///
/// POST /calls/:call_id/sync
/// Body: { "user_id": "u2", "status": "answered" }
pub async fn sync_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Json(request): Json<SyncStatusRequest>,
) -> impl IntoResponse {
    match lifecycle::sync_status(&state, &call_id, &request.user_id, &request.status) {
        Ok((session, changed)) => Json(serde_json::json!({
            "call": CallSnapshot::from(&session),
            "changed": changed,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Register (or replace) a user's push token.
///
/// POST /push/tokens
/// Body: { "user_id": "u1", "token": "fcm-token", "platform": "android" }
pub async fn register_push_token(
    State(state): State<AppState>,
    Json(request): Json<RegisterTokenRequest>,
) -> impl IntoResponse {
    if request.user_id.trim().is_empty() || request.token.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Missing required fields" })),
        )
            .into_response();
    }

    let platform = request.platform.as_deref().unwrap_or("fcm");
    match state
        .store
        .register_push_token(&request.user_id, &request.token, platform)
    {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

fn call_response(session: &crate::session::CallSession) -> Response {
    Json(CallResponse {
        call: CallSnapshot::from(session),
        delivery: None,
    })
    .into_response()
}

/// Map a lifecycle error onto the HTTP contract. 403 and 404 stay distinct;
/// rejected transitions are conflicts, not client mistakes.
fn error_response(e: &Error) -> Response {
    let status = match e {
        Error::Unauthorized => StatusCode::FORBIDDEN,
        Error::CallNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidTransition => StatusCode::CONFLICT,
        Error::InvalidUser(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::DatabaseError(_) | Error::PushFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}
