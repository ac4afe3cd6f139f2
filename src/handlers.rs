use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use ulid::Ulid;

use crate::models::{
    FilterOutcome, IncomingMessage, InputError, ModerationVerdict, ProcessedEvent, VerdictKind,
};
use crate::pipeline::ModerateOptions;
use crate::state::AppState;
use crate::websocket::handle_session;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "invalid_input", "message": message.to_string()})),
    )
}

fn internal_error(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal", "message": message.to_string()})),
    )
}

#[derive(Debug, Deserialize)]
pub struct ModerateRequest {
    pub message: String,
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub channel_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl ModerateRequest {
    fn into_message(self) -> Result<(IncomingMessage, ModerateOptions), InputError> {
        let opts = ModerateOptions {
            template_name: self.template_name,
            deadline: self.deadline_ms.map(Duration::from_millis),
        };
        let msg = IncomingMessage::new(
            self.user_id,
            self.username,
            self.channel_id,
            self.message,
            self.timestamp,
            self.metadata.unwrap_or_default(),
        )?;
        Ok((msg, opts))
    }
}

/// Full pipeline for one message.
pub async fn moderate(
    State(state): State<AppState>,
    Json(request): Json<ModerateRequest>,
) -> Result<Json<ProcessedEvent>, ApiError> {
    // Template selection is validated at the boundary so an unknown
    // name is a caller error, not a pipeline bug.
    if let Some(name) = &request.template_name {
        if state.templates.get(name).is_err() {
            return Err(bad_request(format!("unknown template: {name}")));
        }
    }

    let (msg, opts) = request.into_message().map_err(bad_request)?;
    let event = state.orchestrator.moderate(msg, opts).await.map_err(|e| {
        error!(error = %e, "template registry failure during moderation");
        internal_error(e)
    })?;
    Ok(Json(event))
}

/// The lightweight filter alone, for composability.
pub async fn filter(
    State(state): State<AppState>,
    Json(request): Json<ModerateRequest>,
) -> Result<Json<FilterOutcome>, ApiError> {
    let (msg, _) = request.into_message().map_err(bad_request)?;
    Ok(Json(state.filter.evaluate(&msg).await))
}

pub async fn list_templates(State(state): State<AppState>) -> Json<Value> {
    let templates: Vec<Value> = state
        .templates
        .list()
        .into_iter()
        .map(|(name, version)| json!({"name": name, "version": version}))
        .collect();
    Json(json!({ "templates": templates }))
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub message: String,
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub channel_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub decision: VerdictKind,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Replay path: run policy and persistence for a pre-made verdict
/// without touching the filter or the upstream moderator.
pub async fn decide(
    State(state): State<AppState>,
    Json(request): Json<DecideRequest>,
) -> Result<Json<ProcessedEvent>, ApiError> {
    if !(0.0..=1.0).contains(&request.confidence) {
        return Err(bad_request("confidence must be within 0.0..=1.0"));
    }

    let mut msg = IncomingMessage::new(
        request.user_id,
        request.username,
        request.channel_id,
        request.message,
        None,
        HashMap::new(),
    )
    .map_err(bad_request)?;

    if let Some(raw) = &request.message_id {
        msg.message_id = Ulid::from_string(raw)
            .map_err(|e| bad_request(format!("invalid message_id: {e}")))?;
    }

    let verdict = ModerationVerdict {
        decision: request.decision,
        confidence: request.confidence,
        reasoning: request.reasoning,
        template_version: "replay".to_string(),
        processing_ns: 0,
        categories: Default::default(),
    };

    let event = state
        .decisions
        .handle(&msg, FilterOutcome::pass(0), verdict, Instant::now())
        .await;
    Ok(Json(event))
}

pub async fn simulate_start(State(state): State<AppState>) -> Json<Value> {
    if state.simulator.start() {
        Json(json!({"status": "simulation started"}))
    } else {
        Json(json!({"status": "simulation already running"}))
    }
}

pub async fn simulate_stop(State(state): State<AppState>) -> Json<Value> {
    state.simulator.stop();
    Json(json!({"status": "simulation stopped"}))
}

/// Health check for the load balancer: reports per-dependency status
/// and degrades to 503 only when the violation store is down.
pub async fn health(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let store_connected = state.store.ping().await;
    let redis_connected = match &state.redis {
        Some(client) => Some(client.ping().await.unwrap_or(false)),
        None => None,
    };

    let body = json!({
        "status": if store_connected { "healthy" } else { "degraded" },
        "store_connected": store_connected,
        "redis_connected": redis_connected,
        "circuit_state": state.llm.breaker().state().as_str(),
        "active_subscribers": state.hub.subscriber_count(),
        "dropped_events": state.hub.lagged_total(),
        "simulation_active": state.simulator.is_running(),
        "timestamp": Utc::now(),
    });

    if store_connected {
        Ok(Json(body))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_session(socket, state))
}
