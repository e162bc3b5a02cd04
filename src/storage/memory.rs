//! In-memory storage backend (no persistence)
//!
//! Implements the same semantics as the SQLite backend on plain
//! collections. It's useful for:
//! - Testing without database files
//! - Throwaway deployments where a restart may forget everything
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: Metric samples are capped per agent

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::Backend;
use super::error::{StorageError, StorageResult};
use super::schema::{AgentRecord, HealthTransition, MetricRow, PendingAlert, StatusRecord};

/// Maximum metric samples to keep in memory per agent
const MAX_METRICS_PER_AGENT: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    agents: HashMap<String, AgentRecord>,
    records: BTreeMap<(String, String), StatusRecord>,
    alerts: Vec<PendingAlert>,
    next_alert_id: i64,
    metrics: HashMap<String, VecDeque<MetricRow>>,
    closed: bool,
}

/// In-memory storage backend
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    retention_days: u32,
}

impl MemoryBackend {
    pub fn new(retention_days: u32) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_alert_id: 1,
                ..MemoryState::default()
            }),
            retention_days,
        }
    }

    /// Number of metric samples currently held, across all agents
    pub async fn metric_count(&self) -> usize {
        let state = self.state.lock().await;
        state.metrics.values().map(VecDeque::len).sum()
    }

    /// Look up an agent registry entry
    pub async fn agent(&self, ident: &str) -> Option<AgentRecord> {
        self.state.lock().await.agents.get(ident).cloned()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(30)
    }
}

fn ensure_open(state: &MemoryState) -> StorageResult<()> {
    if state.closed {
        Err(StorageError::Closed)
    } else {
        Ok(())
    }
}

fn key(ident: &str, module: &str) -> (String, String) {
    (ident.to_string(), module.to_string())
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn bootstrap(&self) -> StorageResult<()> {
        ensure_open(&*self.state.lock().await)
    }

    async fn shutdown(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        ensure_open(&state)?;
        state.closed = true;
        Ok(())
    }

    async fn cleanup(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        ensure_open(&state)?;

        let cutoff = (Utc::now() - Duration::days(i64::from(self.retention_days)))
            .timestamp_millis();

        let mut removed = 0;
        for samples in state.metrics.values_mut() {
            let before = samples.len();
            samples.retain(|m| m.recorded_at >= cutoff);
            removed += before - samples.len();
        }
        state.metrics.retain(|_, samples| !samples.is_empty());

        debug!("removed {removed} expired metric samples");
        Ok(())
    }

    async fn get_pending_alerts(&self) -> StorageResult<Vec<PendingAlert>> {
        let state = self.state.lock().await;
        ensure_open(&state)?;
        Ok(state.alerts.clone())
    }

    async fn mark_alerts_sent(&self, ids: &[i64]) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        ensure_open(&state)?;
        state.alerts.retain(|alert| !ids.contains(&alert.id));
        Ok(())
    }

    async fn list_all_status_records(&self) -> StorageResult<Vec<StatusRecord>> {
        let state = self.state.lock().await;
        ensure_open(&state)?;
        Ok(state.records.values().cloned().collect())
    }

    async fn get_status_record(
        &self,
        ident: &str,
        module: &str,
    ) -> StorageResult<Option<StatusRecord>> {
        let state = self.state.lock().await;
        ensure_open(&state)?;
        Ok(state.records.get(&key(ident, module)).cloned())
    }

    async fn upsert_status_record(&self, record: &StatusRecord) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        ensure_open(&state)?;
        state
            .records
            .insert(key(&record.ident, &record.module), record.clone());
        Ok(())
    }

    async fn process_status_update(
        &self,
        record: &StatusRecord,
        transition: &HealthTransition,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        ensure_open(&state)?;

        state
            .records
            .insert(key(&record.ident, &record.module), record.clone());

        if transition.should_alert() {
            let id = state.next_alert_id;
            state.next_alert_id += 1;
            state.alerts.push(PendingAlert {
                id,
                ident: transition.ident.clone(),
                module: transition.module.clone(),
                previous_status: transition.previous,
                status: transition.current,
                message: transition.message.clone(),
                created_at: transition.at,
            });
        }

        Ok(())
    }

    async fn upsert_agent(&self, agent: &AgentRecord) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        ensure_open(&state)?;
        state.agents.insert(agent.ident.clone(), agent.clone());
        Ok(())
    }

    async fn insert_metrics(&self, metrics: Vec<MetricRow>) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        ensure_open(&state)?;

        for metric in metrics {
            let samples = state.metrics.entry(metric.ident.clone()).or_default();
            if samples.len() >= MAX_METRICS_PER_AGENT {
                samples.pop_front();
            }
            samples.push_back(metric);
        }

        Ok(())
    }
}
