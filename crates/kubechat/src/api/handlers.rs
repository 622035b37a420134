//! HTTP handlers: health probe and hub administration.

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use kubechat_protocol::{Priority, ServerMessage, Topic};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::ws::{DeliveryReport, HealthStatus, HubMetrics, SessionDescriptor};

/// Health check. 200 while the hub runs (even degraded), 503 otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let report = state.kubechat.health().await;
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report)).into_response()
}

/// Require `Authorization: Bearer <admin token>` on admin routes.
pub async fn admin_middleware(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::forbidden("admin API is disabled"));
    };
    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("Missing or invalid authorization"))?;
    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(ApiError::unauthorized("Invalid admin token"));
    }
    Ok(next.run(req).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn metrics(State(state): State<AppState>) -> ApiResult<Json<HubMetrics>> {
    Ok(Json(state.kubechat.metrics().await?))
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionDescriptor>,
}

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<SessionsResponse>> {
    let sessions = state.kubechat.sessions().await?;
    Ok(Json(SessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

#[instrument(skip(state))]
pub async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.kubechat.disconnect(&id).await? {
        info!(session_id = %id, "Session disconnected by admin");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Session {} not found", id)))
    }
}

/// Body for admin-originated notifications.
#[derive(Debug, Deserialize)]
pub struct NoticeRequest {
    pub title: String,
    pub message: String,
    #[serde(default = "default_kind", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub data: Map<String, Value>,
}

fn default_kind() -> String {
    "system".to_string()
}

impl NoticeRequest {
    fn into_message(self) -> ServerMessage {
        ServerMessage::Notification(kubechat_protocol::NotificationPayload {
            kind: self.kind,
            title: self.title,
            message: self.message,
            priority: self.priority,
            data: self.data,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topics: Vec<String>,
    #[serde(flatten)]
    pub notice: NoticeRequest,
}

pub async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<NoticeRequest>,
) -> ApiResult<Json<DeliveryReport>> {
    let report = state.kubechat.broadcast(request.into_message()).await?;
    Ok(Json(report))
}

pub async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<Json<DeliveryReport>> {
    let topics: Vec<Topic> = request
        .topics
        .iter()
        .filter_map(|name| Topic::parse(name.trim()))
        .collect();
    if topics.is_empty() {
        return Err(ApiError::bad_request("No valid topics provided"));
    }
    let report = state
        .kubechat
        .publish(topics, request.notice.into_message())
        .await?;
    Ok(Json(report))
}

pub async fn send_to_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<NoticeRequest>,
) -> ApiResult<Json<DeliveryReport>> {
    let report = state
        .kubechat
        .send_to_user(&user_id, request.into_message())
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
    }

    #[test]
    fn test_publish_request_defaults() {
        let request: PublishRequest = serde_json::from_str(
            r#"{"topics": ["alerts"], "title": "Node down", "message": "node-3 NotReady"}"#,
        )
        .unwrap();
        assert_eq!(request.notice.kind, "system");
        assert_eq!(request.notice.priority, Priority::Normal);
    }
}
