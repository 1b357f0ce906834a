use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Json, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use jarvis_schemas::{
    generate_chat_session_id, BufferedMessage, ChatMessageRequest, ChatMessageResponse,
    CreateActionRequest, SessionId, Transcript, UpdateActionRequest, UserId, WebhookPayload,
    DEFAULT_SALUTATION,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::actions::{create_action, delete_action, update_action};
use crate::buffer::persist_buffer;
use crate::clock::format_timestamp;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::vault::{key_preview, validate_omi_key};

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const MAX_SALUTATION_LEN: usize = 50;
const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Webhook
        .route("/webhook", post(webhook))
        .route("/webhook/setup-status", get(setup_status))

        // Actions
        .route("/api/actions", get(list_actions).post(create_action_endpoint))
        .route(
            "/api/actions/:id",
            put(update_action_endpoint).delete(delete_action_endpoint),
        )

        // Preferences
        .route("/api/preferences", get(get_preferences).post(set_preferences))

        // Chat
        .route("/api/chat/history", get(chat_history))
        .route("/api/chat/message", post(chat_message))

        // OMI key management
        .route("/api/omi/csrf-token", get(issue_csrf_token))
        .route(
            "/api/omi/key",
            get(get_omi_key)
                .post(store_omi_key)
                .patch(replace_omi_key)
                .delete(delete_omi_key),
        )

        // Read views
        .route("/api/transcripts", get(list_transcripts))
        .route("/api/analytics", get(get_analytics))

        // Status
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct UidQuery {
    uid: Option<String>,
}

fn require_uid(raw: Option<&str>) -> ApiResult<UserId> {
    match raw.map(str::trim) {
        Some(uid) if !uid.is_empty() => Ok(UserId(uid.to_string())),
        _ => Err(ApiError::bad_request("uid is required")),
    }
}

fn non_blank(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ========== WEBHOOK ==========

async fn webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(payload) = payload?;
    let session_id = non_blank(payload.session_id)
        .map(SessionId)
        .ok_or_else(|| ApiError::bad_request("session_id is required"))?;

    let now = state.now();
    let config = state.buffers.config();
    let handle = state.buffers.get_buffer(&state.db, &session_id, now).await;

    let flushed = {
        let mut buffer = handle.lock().await;
        if let Some(uid) = non_blank(payload.uid) {
            buffer.set_uid(UserId(uid));
        }

        buffer.ingest(&payload.segments, now, config);
        let flushed = buffer.flush_if_due(now, config);

        let db = state.db.lock().await;
        if let Err(e) = persist_buffer(&db, &buffer) {
            warn!("Failed to persist session {}: {}", session_id, e);
        }
        flushed
    };

    let Some(messages) = flushed else {
        return Ok((StatusCode::ACCEPTED, Json(json!({}))).into_response());
    };

    if state.wake_words.any_match(&messages) {
        info!(
            "Wake word in session {} ({} messages), sending notification",
            session_id,
            messages.len()
        );
        let notification = state.synthesizer.renderer().notification(&messages);
        return Ok(Json(json!({ "notification": notification })).into_response());
    }

    Ok(Json(json!({})).into_response())
}

async fn setup_status() -> impl IntoResponse {
    Json(json!({ "is_setup_completed": true }))
}

// ========== ACTIONS ==========

async fn list_actions(
    State(state): State<AppState>,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;

    let db = state.db.lock().await;
    let actions = db
        .get_actions(&uid)
        .map_err(|e| ApiError::internal("Failed to list actions", e))?;

    Ok(Json(json!({ "uid": uid, "actions": actions })))
}

async fn create_action_endpoint(
    State(state): State<AppState>,
    payload: Result<Json<CreateActionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let uid = require_uid(request.uid.as_deref())?;

    let now_millis = state.clock.now_millis();
    let now = format_timestamp(state.now());

    let db = state.db.lock().await;
    let action = db.modify_actions(&uid, &now, |actions| {
        create_action(actions, &request, now_millis, &now)
    })?;

    info!("Created action {} for {}", action.id, uid);
    Ok((StatusCode::CREATED, Json(action)))
}

async fn update_action_endpoint(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateActionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let Json(request) = payload?;
    let uid = require_uid(request.uid.as_deref())?;
    let now = format_timestamp(state.now());

    let db = state.db.lock().await;
    let action = db.modify_actions(&uid, &now, |actions| {
        update_action(actions, id, &request, &now)
    })?;

    Ok(Json(action))
}

async fn delete_action_endpoint(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;
    let now = format_timestamp(state.now());

    let db = state.db.lock().await;
    db.modify_actions(&uid, &now, |actions| delete_action(actions, id))?;

    info!("Deleted action {} for {}", id, uid);
    Ok(Json(json!({ "deleted": id })))
}

// ========== PREFERENCES ==========

#[derive(Debug, Deserialize)]
struct PreferencesRequest {
    uid: Option<String>,
    salutation: Option<String>,
}

async fn get_preferences(
    State(state): State<AppState>,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;

    let db = state.db.lock().await;
    let preferences = db
        .get_preferences(&uid)
        .map_err(|e| ApiError::internal("Failed to read preferences", e))?;

    Ok(Json(json!({ "uid": uid, "salutation": preferences.salutation })))
}

async fn set_preferences(
    State(state): State<AppState>,
    payload: Result<Json<PreferencesRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let uid = require_uid(request.uid.as_deref())?;

    let salutation = non_blank(request.salutation)
        .ok_or_else(|| ApiError::bad_request("salutation is required"))?;
    if salutation.chars().count() > MAX_SALUTATION_LEN {
        return Err(ApiError::bad_request(format!(
            "salutation must be at most {} characters",
            MAX_SALUTATION_LEN
        )));
    }

    let now = format_timestamp(state.now());
    let db = state.db.lock().await;
    let preferences = db
        .set_salutation(&uid, &salutation, &now)
        .map_err(|e| ApiError::internal("Failed to save preferences", e))?;

    Ok(Json(json!({ "uid": uid, "salutation": preferences.salutation })))
}

// ========== CHAT ==========

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    session_id: Option<String>,
}

async fn chat_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let session_id = non_blank(query.session_id)
        .map(SessionId)
        .ok_or_else(|| ApiError::bad_request("session_id is required"))?;

    let messages = match state.buffers.peek(&session_id).await {
        Some(handle) => {
            let buffer = handle.lock().await;
            buffer.messages().to_vec()
        }
        None => {
            let db = state.db.lock().await;
            match db.get_session(&session_id) {
                Ok(Some(record)) => record.messages,
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!("Failed to load history for {}: {}", session_id, e);
                    Vec::new()
                }
            }
        }
    };

    Ok(Json(json!({ "session_id": session_id, "messages": messages })))
}

async fn chat_message(
    State(state): State<AppState>,
    payload: Result<Json<ChatMessageRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let text = non_blank(request.message)
        .ok_or_else(|| ApiError::bad_request("message is required"))?;
    let uid = non_blank(request.uid).map(UserId);
    let session_id = non_blank(request.session_id)
        .map(SessionId)
        .unwrap_or_else(generate_chat_session_id);

    let now = state.now();
    let handle = state.buffers.get_buffer(&state.db, &session_id, now).await;

    // The session lock is released while the providers are consulted
    let history = {
        let mut buffer = handle.lock().await;
        if let Some(ref uid) = uid {
            buffer.set_uid(uid.clone());
        }
        buffer.push_message(
            BufferedMessage {
                text,
                timestamp: now,
                is_user: true,
            },
            now,
        );

        let db = state.db.lock().await;
        if let Err(e) = persist_buffer(&db, &buffer) {
            warn!("Failed to persist session {}: {}", session_id, e);
        }
        buffer.messages().to_vec()
    };

    let salutation = match uid {
        Some(ref uid) => {
            let db = state.db.lock().await;
            db.get_preferences(uid)
                .map(|p| p.salutation)
                .unwrap_or_else(|e| {
                    warn!("Failed to read salutation for {}: {}", uid, e);
                    DEFAULT_SALUTATION.to_string()
                })
        }
        None => DEFAULT_SALUTATION.to_string(),
    };

    let reply = state
        .synthesizer
        .synthesize(&history, &salutation)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    let replied_at = state.now();
    let messages = {
        let mut buffer = handle.lock().await;
        buffer.push_message(
            BufferedMessage {
                text: reply.text.clone(),
                timestamp: replied_at,
                is_user: false,
            },
            replied_at,
        );

        let db = state.db.lock().await;
        if let Err(e) = persist_buffer(&db, &buffer) {
            warn!("Failed to persist session {}: {}", session_id, e);
        }
        buffer.messages().to_vec()
    };

    Ok(Json(ChatMessageResponse {
        session_id,
        reply: reply.text,
        degraded: reply.degraded,
        messages,
    }))
}

// ========== OMI KEY MANAGEMENT ==========

#[derive(Debug, Deserialize)]
struct OmiKeyRequest {
    uid: Option<String>,
    api_key: Option<String>,
}

async fn issue_csrf_token(
    State(state): State<AppState>,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;

    let issued = state.guard.issue_csrf(&uid, state.now()).await;
    Ok(Json(json!({
        "csrf_token": issued.token,
        "expires_in": issued.expires_in
    })))
}

async fn get_omi_key(
    State(state): State<AppState>,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;

    let stored = {
        let db = state.db.lock().await;
        db.get_omi_key(&uid)
            .map_err(|e| ApiError::internal("Failed to read OMI key", e))?
    };

    let preview = match stored {
        Some(ref sealed) => match state.vault.decrypt(sealed) {
            Ok(key) => Some(key_preview(&key)),
            Err(e) => {
                warn!("Stored OMI key for {} is unreadable: {}", uid, e);
                None
            }
        },
        None => None,
    };

    Ok(Json(json!({
        "uid": uid,
        "configured": stored.is_some(),
        "key_preview": preview
    })))
}

fn csrf_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn require_csrf(state: &AppState, headers: &HeaderMap, uid: &UserId) -> ApiResult<()> {
    let token = csrf_token(headers)
        .ok_or_else(|| ApiError::Forbidden("missing CSRF token".to_string()))?;

    if !state.guard.consume_csrf(uid, token, state.now()).await {
        return Err(ApiError::Forbidden("invalid CSRF token".to_string()));
    }
    Ok(())
}

/// Shared body of POST and PATCH: lockout, CSRF, format check, encrypt, store
async fn write_omi_key(
    state: &AppState,
    headers: &HeaderMap,
    request: OmiKeyRequest,
    require_existing: bool,
) -> ApiResult<Response> {
    let uid = require_uid(request.uid.as_deref())?;
    let now = state.now();

    state
        .guard
        .check_lockout(&uid, now)
        .await
        .map_err(|retry_after_secs| ApiError::Locked { retry_after_secs })?;

    require_csrf(state, headers, &uid).await?;

    if require_existing {
        let db = state.db.lock().await;
        let existing = db
            .get_omi_key(&uid)
            .map_err(|e| ApiError::internal("Failed to read OMI key", e))?;
        if existing.is_none() {
            return Err(ApiError::NotFound("no OMI key configured".to_string()));
        }
    }

    let api_key = request.api_key.unwrap_or_default().trim().to_string();
    if let Err(reason) = validate_omi_key(&api_key) {
        if let Some(retry_after_secs) = state.guard.record_failure(&uid, now).await {
            return Err(ApiError::Locked { retry_after_secs });
        }
        return Err(ApiError::BadRequest(reason));
    }

    let sealed = state
        .vault
        .encrypt(&api_key)
        .map_err(|e| ApiError::internal("Failed to encrypt OMI key", e))?;

    {
        let db = state.db.lock().await;
        db.set_omi_key(&uid, Some(&sealed), &format_timestamp(now))
            .map_err(|e| ApiError::internal("Failed to store OMI key", e))?;
    }
    state.guard.clear_failures(&uid).await;

    info!("Stored OMI key for {}", uid);
    Ok(Json(json!({
        "uid": uid,
        "configured": true,
        "key_preview": key_preview(&api_key)
    }))
    .into_response())
}

async fn store_omi_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<OmiKeyRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    write_omi_key(&state, &headers, request, false).await
}

async fn replace_omi_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<OmiKeyRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    write_omi_key(&state, &headers, request, true).await
}

async fn delete_omi_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;
    require_csrf(&state, &headers, &uid).await?;
    let now = format_timestamp(state.now());

    let db = state.db.lock().await;
    db.set_omi_key(&uid, None, &now)
        .map_err(|e| ApiError::internal("Failed to delete OMI key", e))?;

    info!("Deleted OMI key for {}", uid);
    Ok(Json(json!({ "uid": uid, "configured": false, "key_preview": null })))
}

// ========== READ VIEWS ==========

async fn list_transcripts(
    State(state): State<AppState>,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;

    let db = state.db.lock().await;
    let transcripts: Vec<Transcript> = db
        .sessions_for_user(&uid)
        .map_err(|e| ApiError::internal("Failed to list transcripts", e))?
        .into_iter()
        .map(Transcript::from)
        .collect();

    Ok(Json(transcripts))
}

async fn get_analytics(
    State(state): State<AppState>,
    query: Result<Query<UidQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let uid = require_uid(query.uid.as_deref())?;

    let db = state.db.lock().await;
    let summary = db
        .analytics_summary(&uid)
        .map_err(|e| ApiError::internal("Failed to compute analytics", e))?;

    Ok(Json(summary))
}

// ========== STATUS ==========

async fn status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let active_sessions = state.buffers.active_sessions().await;
    let database_sessions = {
        let db = state.db.lock().await;
        db.count_sessions()
            .map_err(|e| ApiError::internal("Failed to count sessions", e))?
    };
    let uptime = (state.now() - state.started_at).max(0.0);

    Ok(Json(json!({
        "active_sessions": active_sessions,
        "database_sessions": database_sessions,
        "uptime": uptime
    })))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<AppState>) -> Response {
    let probe = tokio::time::timeout(READINESS_TIMEOUT, async {
        state.db.lock().await.ping()
    })
    .await;

    match probe {
        Ok(Ok(())) => Json(json!({ "status": "ready" })).into_response(),
        Ok(Err(e)) => {
            warn!("Readiness probe failed: {}", e);
            unavailable()
        }
        Err(_) => {
            warn!("Readiness probe timed out");
            unavailable()
        }
    }
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "unavailable" })),
    )
        .into_response()
}
