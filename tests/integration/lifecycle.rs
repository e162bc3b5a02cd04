//! Integration tests for startup and graceful shutdown
//!
//! These tests verify that:
//! - Concurrent shutdown requests close storage once
//! - Shutdown cancels every tracked task
//! - A served TLS listener answers agents and stops on request
//! - A failing worker brings the whole server down
//! - Agents connected over TLS report through the served router and are
//!   sent a Close frame on shutdown

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use gullveig::{
    alerts::AlertManager,
    lifecycle::{Lifecycle, LifecycleState},
    workers::WorkerSchedule,
};
use rustls::pki_types::ServerName;
use serde_json::json;
use tempfile::tempdir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest, http::HeaderValue};

use super::helpers::{
    CLIENT_KEY, RecordingBackend, RecordingReports, context_with, fixture, server_config,
};

fn fast_schedule() -> WorkerSchedule {
    WorkerSchedule {
        cleanup_interval: Duration::from_millis(20),
        alert_interval: Duration::from_millis(20),
        monitor_grace: Duration::from_secs(3600),
        monitor_interval: Duration::from_millis(20),
    }
}

fn lifecycle_with(backend: Arc<RecordingBackend>) -> Arc<Lifecycle> {
    let ctx = context_with(
        backend,
        Arc::new(RecordingReports::default()),
        Arc::new(AlertManager::default()),
    );
    Arc::new(Lifecycle::new(ctx, fast_schedule()))
}

/// Client trusting only the bundled self-signed certificate
fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    let mut pem = BufReader::new(File::open(fixture("server.crt")).unwrap());
    for cert in rustls_pemfile::certs(&mut pem) {
        roots.add(cert.unwrap()).unwrap();
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

async fn connect_agent(addr: SocketAddr) -> WebSocketStream<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls = tls_connector().connect(server_name, tcp).await.unwrap();

    let mut request = "wss://localhost/".into_client_request().unwrap();
    let headers = request.headers_mut();
    headers.insert("x-client-key", HeaderValue::from_static(CLIENT_KEY));
    headers.insert("x-ident", HeaderValue::from_static("web-1"));

    let (ws, response) = tokio_tungstenite::client_async(request, tls).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);
    ws
}

#[tokio::test]
async fn test_concurrent_shutdown_runs_once() {
    let backend = Arc::new(RecordingBackend::default());
    let lifecycle = lifecycle_with(backend.clone());

    let (tx, rx) = oneshot::channel::<()>();
    assert!(
        lifecycle
            .spawn(async move {
                let _tx = tx;
                futures::future::pending::<()>().await;
            })
            .await
    );

    let (first, second) = tokio::join!(lifecycle.shutdown(), lifecycle.shutdown());
    assert!(first ^ second, "exactly one caller runs the sequence");

    assert_eq!(backend.shutdown_count(), 1);
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert!(lifecycle.shutdown_handle().is_triggered());

    // The tracked task was cancelled and dropped its sender
    assert!(rx.await.is_err());

    // Nothing new is accepted afterwards
    assert!(!lifecycle.spawn(async {}).await);
    assert!(!lifecycle.shutdown().await);
    assert_eq!(backend.shutdown_count(), 1);
}

#[tokio::test]
async fn test_serves_tls_until_triggered() {
    let data = tempdir().unwrap();
    let server = server_config(data.path());

    let backend = Arc::new(RecordingBackend::default());
    let lifecycle = lifecycle_with(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut state = lifecycle.subscribe();
    let running = tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move { lifecycle.run_with_listener(listener, &server).await }
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == LifecycleState::Serving),
    )
    .await
    .unwrap()
    .unwrap();

    // A plain HTTPS request lacks the upgrade header and is turned away
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = client
        .get(format!("https://{addr}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(response.text().await.unwrap(), "Missing Upgrade header");

    lifecycle.shutdown_handle().trigger("test finished");

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert_eq!(backend.shutdown_count(), 1);
}

#[tokio::test]
async fn test_worker_failure_stops_server() {
    let data = tempdir().unwrap();
    let server = server_config(data.path());

    let backend = Arc::new(RecordingBackend::failing_cleanup());
    let lifecycle = lifecycle_with(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        lifecycle.run_with_listener(listener, &server),
    )
    .await
    .unwrap();

    assert!(result.is_ok());
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert_eq!(backend.shutdown_count(), 1);
}

#[tokio::test]
async fn test_invalid_tls_material_fails_startup() {
    let data = tempdir().unwrap();
    let mut server = server_config(data.path());
    server.ssl_certificate = data.path().join("missing.crt");

    let backend = Arc::new(RecordingBackend::default());
    let lifecycle = lifecycle_with(backend.clone());

    let err = lifecycle.run(&server).await.unwrap_err();
    assert!(format!("{err:#}").contains("failed to open TLS certificate"));
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_tls_agent_reports_and_is_closed_on_shutdown() {
    let data = tempdir().unwrap();
    let server = server_config(data.path());

    let backend = Arc::new(RecordingBackend::default());
    let reports = Arc::new(RecordingReports::default());
    let ctx = context_with(backend.clone(), reports.clone(), Arc::new(AlertManager::default()));
    let lifecycle = Arc::new(Lifecycle::new(ctx, fast_schedule()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut state = lifecycle.subscribe();
    let running = tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move { lifecycle.run_with_listener(listener, &server).await }
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == LifecycleState::Serving),
    )
    .await
    .unwrap()
    .unwrap();

    let mut ws = connect_agent(addr).await;

    ws.send(Message::Text("not-json".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"a":1}"#.to_string())).await.unwrap();

    let received = reports.wait_for(1).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, json!({"a": 1}));
    assert_eq!(received[0].ident, "web-1");
    assert_eq!(received[0].agent_version, "unknown");
    assert_eq!(received[0].remote_ip.to_string(), "127.0.0.1");

    lifecycle.shutdown_handle().trigger("test finished");

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(frame, Message::Close(_)), "expected Close, got {frame:?}");

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert_eq!(reports.received().len(), 1);
}
