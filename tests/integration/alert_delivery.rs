//! Integration tests for alert delivery
//!
//! These tests verify that:
//! - Webhook payloads carry every alert of a batch
//! - Delivery failures do not surface as errors
//! - The alerting worker dequeues alerts even when delivery fails

use std::path::Path;
use std::sync::Arc;

use gullveig::{
    alerts::{AlertDispatcher, AlertManager},
    config::Config,
    status,
    storage::{Backend, HealthTransition, PendingAlert, StatusRecord},
    workers::alerting,
};
use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::helpers::{RecordingBackend, RecordingReports, context_with};

/// Manager built from a config with only a `[webhook]` section
fn webhook_manager(url: &str) -> AlertManager {
    let content = format!(
        r#"
        [server]
        ssl_certificate = "server.crt"
        ssl_certificate_key = "server.key"
        client_key = "k"

        [webhook]
        url = "{url}"
        "#
    );
    let config = Config::parse(&content, Path::new("/")).unwrap();
    let manager = AlertManager::from_config(&config).unwrap();
    assert!(manager.has_channels());
    manager
}

fn alert(id: i64, module: &str) -> PendingAlert {
    PendingAlert {
        id,
        ident: "web-1".to_string(),
        module: module.to_string(),
        previous_status: Some(status::OK),
        status: status::ERROR,
        message: Some("check failed".to_string()),
        created_at: 1_700_000_000_000,
    }
}

#[tokio::test]
async fn test_webhook_receives_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let manager = webhook_manager(&format!("{}/hook", server.uri()));
    manager
        .dispatch_server_alerts(&[alert(1, "mod_fs"), alert(2, "mod_cpu")])
        .await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let alerts = body["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0]["mod"], "mod_fs");
    assert_eq!(alerts[1]["mod"], "mod_cpu");
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("web-1/mod_fs: OK -> ERROR (check failed)")
    );
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_empty_batch_is_not_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let manager = webhook_manager(&server.uri());
    manager.dispatch_server_alerts(&[]).await;
}

#[tokio::test]
async fn test_failed_delivery_still_dequeues() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(RecordingBackend::default());
    let old = StatusRecord::new("web-1", "mod_fs", status::OK, None, 1);
    let new = StatusRecord::new("web-1", "mod_fs", status::ERROR, None, 2);
    backend
        .process_status_update(&new, &HealthTransition::between(Some(&old), &new))
        .await
        .unwrap();

    let ctx = context_with(
        backend.clone(),
        Arc::new(RecordingReports::default()),
        Arc::new(webhook_manager(&server.uri())),
    );

    assert_eq!(alerting::dispatch_pending(&ctx).await.unwrap(), 1);
    assert!(backend.get_pending_alerts().await.unwrap().is_empty());
}
