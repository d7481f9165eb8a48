//! Webhook delivery over real HTTP against a local mock dashboard.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::Value;
use tvb_core::{BotIdentity, NotificationAction, NotificationEvent};
use tvb_notify::{
    Notifier, NotifierConfig, ReqwestTransport, TransportError, WebhookTarget, WebhookTransport,
};

/// Mock dashboard webhook endpoint.
struct MockDashboard {
    bodies: Mutex<Vec<Value>>,
    status: AtomicU16,
    delay_ms: AtomicU64,
}

async fn receive(State(dash): State<Arc<MockDashboard>>, Json(body): Json<Value>) -> StatusCode {
    let delay = dash.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    dash.bodies.lock().push(body);
    StatusCode::from_u16(dash.status.load(Ordering::SeqCst)).unwrap()
}

async fn start_dashboard(status: u16) -> (String, Arc<MockDashboard>) {
    let dash = Arc::new(MockDashboard {
        bodies: Mutex::new(Vec::new()),
        status: AtomicU16::new(status),
        delay_ms: AtomicU64::new(0),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/api/webhook", post(receive))
        .with_state(dash.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/webhook"), dash)
}

fn fast_config() -> NotifierConfig {
    let mut config = NotifierConfig::default();
    config.base_timeout = Duration::from_secs(2);
    config.timeout_step = Duration::from_millis(500);
    config.retry_delay = Duration::from_millis(10);
    config.heartbeat.enabled = false;
    config
}

fn notifier(url: &str) -> Notifier {
    let identity = BotIdentity {
        bot_name: "bear".to_string(),
        display_name: "Bearish Bob".to_string(),
        avatar_url: None,
        bio: None,
        wallet_address: Some("0x00000000000000000000000000000000000000b0".to_string()),
    };
    Notifier::start(
        identity,
        WebhookTarget::from_parts(Some(url), Some("bob-secret")),
        fast_config(),
        Arc::new(ReqwestTransport::new()),
    )
}

#[tokio::test]
async fn test_delivers_json_payload() {
    let (url, dash) = start_dashboard(200).await;
    let notifier = notifier(&url);

    let event = NotificationEvent::new(NotificationAction::Startup)
        .with_detail("version", "0.1.0");
    assert!(notifier.send(event).await);

    let bodies = dash.bodies.lock().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["botName"], "bear");
    assert_eq!(bodies[0]["displayName"], "Bearish Bob");
    assert_eq!(bodies[0]["botSecret"], "bob-secret");
    assert_eq!(bodies[0]["action"], "startup");
    assert_eq!(bodies[0]["details"]["version"], "0.1.0");
    notifier.shutdown().await;
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let (url, dash) = start_dashboard(500).await;
    let notifier = notifier(&url);

    assert!(
        !notifier
            .send(NotificationEvent::new(NotificationAction::Error))
            .await
    );
    assert_eq!(dash.bodies.lock().len(), 3);
    assert_eq!(notifier.stats().retries_used, 2);
    notifier.shutdown().await;
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (url, dash) = start_dashboard(401).await;
    let notifier = notifier(&url);

    assert!(
        !notifier
            .send(NotificationEvent::new(NotificationAction::Error))
            .await
    );
    assert_eq!(dash.bodies.lock().len(), 1);
    notifier.shutdown().await;
}

#[tokio::test]
async fn test_non_200_success_status_is_retried() {
    let (url, dash) = start_dashboard(202).await;
    let notifier = notifier(&url);

    assert!(
        !notifier
            .send(NotificationEvent::new(NotificationAction::Startup))
            .await
    );
    assert_eq!(dash.bodies.lock().len(), 3);
    notifier.shutdown().await;
}

#[tokio::test]
async fn test_transport_timeout() {
    let (url, dash) = start_dashboard(200).await;
    dash.delay_ms.store(500, Ordering::SeqCst);

    let transport = ReqwestTransport::new();
    let body = serde_json::json!({"action": "heartbeat"});
    let result = transport
        .post(&url, &body, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(TransportError::Timeout(_))));
}

#[tokio::test]
async fn test_connection_refused_is_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = ReqwestTransport::new();
    let body = serde_json::json!({"action": "heartbeat"});
    let result = transport
        .post(&format!("http://{addr}/hook"), &body, Duration::from_secs(1))
        .await;
    assert!(result.is_err());
}
