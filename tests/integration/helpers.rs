//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gullveig::{
    alerts::{AlertDispatcher, AlertManager},
    analytics::{ReportError, ReportHandler},
    config::{Config, ServerConfig},
    context::ServerContext,
    storage::{
        AgentRecord, Backend, HealthTransition, MetricRow, PendingAlert, StatusRecord,
        StorageError, StorageResult, memory::MemoryBackend,
    },
};
use serde_json::Value;

pub const CLIENT_KEY: &str = "test-client-key";

/// Memory backend that counts the calls the tests care about
#[derive(Default)]
pub struct RecordingBackend {
    pub inner: MemoryBackend,
    pub shutdown_calls: AtomicUsize,
    pub status_updates: Mutex<Vec<(StatusRecord, HealthTransition)>>,
    pub marked: Mutex<Vec<Vec<i64>>>,
    pub fail_cleanup: AtomicBool,
}

impl RecordingBackend {
    pub fn failing_cleanup() -> Self {
        let backend = Self::default();
        backend.fail_cleanup.store(true, Ordering::SeqCst);
        backend
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn bootstrap(&self) -> StorageResult<()> {
        self.inner.bootstrap().await
    }

    async fn shutdown(&self) -> StorageResult<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.shutdown().await
    }

    async fn cleanup(&self) -> StorageResult<()> {
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(StorageError::QueryFailed("disk I/O error".to_string()));
        }
        self.inner.cleanup().await
    }

    async fn get_pending_alerts(&self) -> StorageResult<Vec<PendingAlert>> {
        self.inner.get_pending_alerts().await
    }

    async fn mark_alerts_sent(&self, ids: &[i64]) -> StorageResult<()> {
        self.marked.lock().unwrap().push(ids.to_vec());
        self.inner.mark_alerts_sent(ids).await
    }

    async fn list_all_status_records(&self) -> StorageResult<Vec<StatusRecord>> {
        self.inner.list_all_status_records().await
    }

    async fn get_status_record(
        &self,
        ident: &str,
        module: &str,
    ) -> StorageResult<Option<StatusRecord>> {
        self.inner.get_status_record(ident, module).await
    }

    async fn upsert_status_record(&self, record: &StatusRecord) -> StorageResult<()> {
        self.inner.upsert_status_record(record).await
    }

    async fn process_status_update(
        &self,
        record: &StatusRecord,
        transition: &HealthTransition,
    ) -> StorageResult<()> {
        self.status_updates
            .lock()
            .unwrap()
            .push((record.clone(), transition.clone()));
        self.inner.process_status_update(record, transition).await
    }

    async fn upsert_agent(&self, agent: &AgentRecord) -> StorageResult<()> {
        self.inner.upsert_agent(agent).await
    }

    async fn insert_metrics(&self, metrics: Vec<MetricRow>) -> StorageResult<()> {
        self.inner.insert_metrics(metrics).await
    }
}

/// A report as seen by the analytics layer
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedReport {
    pub remote_ip: IpAddr,
    pub agent_version: String,
    pub ident: String,
    pub payload: Value,
}

/// Report handler that only records what it receives
#[derive(Default)]
pub struct RecordingReports {
    pub reports: Mutex<Vec<ReceivedReport>>,
}

impl RecordingReports {
    pub fn received(&self) -> Vec<ReceivedReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Poll until `count` reports arrived or a second has passed
    pub async fn wait_for(&self, count: usize) -> Vec<ReceivedReport> {
        for _ in 0..100 {
            if self.reports.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received()
    }
}

#[async_trait]
impl ReportHandler for RecordingReports {
    async fn handle_agent_report(
        &self,
        remote_ip: IpAddr,
        agent_version: &str,
        ident: &str,
        payload: Value,
    ) -> Result<(), ReportError> {
        self.reports.lock().unwrap().push(ReceivedReport {
            remote_ip,
            agent_version: agent_version.to_string(),
            ident: ident.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Dispatcher that remembers every batch it was handed
#[derive(Default)]
pub struct CountingDispatcher {
    pub batches: Mutex<Vec<Vec<PendingAlert>>>,
}

impl CountingDispatcher {
    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl AlertDispatcher for CountingDispatcher {
    async fn dispatch_server_alerts(&self, alerts: &[PendingAlert]) {
        self.batches.lock().unwrap().push(alerts.to_vec());
    }
}

pub fn context_with(
    backend: Arc<dyn Backend>,
    reports: Arc<dyn ReportHandler>,
    alerts: Arc<dyn AlertDispatcher>,
) -> ServerContext {
    ServerContext::new(
        backend,
        reports,
        alerts,
        CLIENT_KEY,
        Duration::from_secs(120),
    )
}

/// Context recording reports, with a log-only alert manager
pub fn recording_context() -> (ServerContext, Arc<RecordingBackend>, Arc<RecordingReports>) {
    let backend = Arc::new(RecordingBackend::default());
    let reports = Arc::new(RecordingReports::default());
    let ctx = context_with(
        backend.clone(),
        reports.clone(),
        Arc::new(AlertManager::default()),
    );
    (ctx, backend, reports)
}

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Server section pointing at the bundled self-signed certificate
pub fn server_config(data_dir: &Path) -> ServerConfig {
    let content = format!(
        r#"
        [server]
        bind_to = "127.0.0.1"
        bind_port = 0
        ssl_certificate = "{}"
        ssl_certificate_key = "{}"
        client_key = "{CLIENT_KEY}"
        data_dir = "{}"
        "#,
        fixture("server.crt").display(),
        fixture("server.key").display(),
        data_dir.display(),
    );
    Config::parse(&content, Path::new("/")).unwrap().server
}

pub fn localhost() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}
