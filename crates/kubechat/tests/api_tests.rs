//! HTTP API integration tests.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use common::{ADMIN_TOKEN, Client, hub_config, start, test_app};
use kubechat::api::{AppState, create_router};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn admin_get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
        .body(Body::empty())
        .unwrap()
}

fn admin_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_is_degraded_without_collaborators() {
    let kubechat = start(hub_config("seq"));
    let app = test_app(kubechat.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["hub_running"], true);
    assert_eq!(body["connected_sessions"], 0);
    assert_eq!(body["nlp_available"], false);
    kubechat.shutdown().await;
}

#[tokio::test]
async fn test_health_after_shutdown_is_unavailable() {
    let kubechat = start(hub_config("seq"));
    kubechat.shutdown().await;
    let app = test_app(kubechat);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "unhealthy");
}

#[tokio::test]
async fn test_admin_requires_bearer_token() {
    let kubechat = start(hub_config("seq"));
    let app = test_app(kubechat.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/ws/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/ws/metrics")
                .header(header::AUTHORIZATION, "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    let response = app.oneshot(admin_get("/api/ws/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["connected_sessions"], 0);
    kubechat.shutdown().await;
}

#[tokio::test]
async fn test_admin_disabled_without_token() {
    let kubechat = start(hub_config("seq"));
    let app = create_router(AppState::new(kubechat.clone(), None));

    let response = app.oneshot(admin_get("/api/ws/sessions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    kubechat.shutdown().await;
}

#[tokio::test]
async fn test_list_and_disconnect_sessions() {
    let kubechat = start(hub_config("seq"));
    let app = test_app(kubechat.clone());
    let mut client = Client::connect(&kubechat).await;
    client.authenticate("alice").await;
    let id = client.session.id().to_string();

    let response = app
        .clone()
        .oneshot(admin_get("/api/ws/sessions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["sessions"][0]["session_id"], id.as_str());
    assert_eq!(body["sessions"][0]["user_id"], "alice");

    let delete = |uri: String| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap()
    };

    let response = app
        .clone()
        .oneshot(delete(format!("/api/ws/sessions/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(client.closed.is_cancelled());

    let response = app
        .oneshot(delete(format!("/api/ws/sessions/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    kubechat.shutdown().await;
}

#[tokio::test]
async fn test_publish_and_send_to_user() {
    let kubechat = start(hub_config("seq"));
    let app = test_app(kubechat.clone());
    let mut client = Client::connect(&kubechat).await;
    client.authenticate("alice").await;
    client
        .send("subscribe", json!({ "topics": ["alerts"] }))
        .await;
    client.next().await;

    let response = app
        .clone()
        .oneshot(admin_post(
            "/api/ws/publish",
            json!({ "topics": ["pods"], "title": "x", "message": "y" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(admin_post(
            "/api/ws/publish",
            json!({
                "topics": ["alerts"],
                "title": "Node down",
                "message": "node-3 NotReady",
                "priority": "urgent"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["delivered"], 1);

    let message = client.next().await.to_json().unwrap();
    let frame: Value = serde_json::from_str(&message).unwrap();
    assert_eq!(frame["type"], "notification");
    assert_eq!(frame["payload"]["title"], "Node down");
    assert_eq!(frame["payload"]["priority"], "urgent");

    let response = app
        .oneshot(admin_post(
            "/api/ws/users/nobody/send",
            json!({ "title": "hello", "message": "anyone?" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["recipients"], 0);
    kubechat.shutdown().await;
}
