//! Persistence backend trait definition
//!
//! This module defines the `Backend` contract that the connection handler,
//! the analytics manager and the background workers share.

use async_trait::async_trait;

use super::error::StorageResult;
use super::schema::{AgentRecord, HealthTransition, MetricRow, PendingAlert, StatusRecord};

/// Trait for persistence backends
///
/// One instance is shared by every component of the server, so
/// implementations must be `Send + Sync` and keep themselves consistent
/// under concurrent calls. Multi-statement operations are expected to be
/// atomic.
///
/// After [`Backend::shutdown`] every operation fails with
/// [`StorageError::Closed`](super::StorageError::Closed) or an equivalent
/// error.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create the schema if it does not exist yet
    ///
    /// Called once at startup; calling it again is harmless.
    async fn bootstrap(&self) -> StorageResult<()>;

    /// Release all resources
    async fn shutdown(&self) -> StorageResult<()>;

    /// Compact storage and drop expired metric samples
    async fn cleanup(&self) -> StorageResult<()>;

    /// All alerts that have not been delivered yet, oldest first
    async fn get_pending_alerts(&self) -> StorageResult<Vec<PendingAlert>>;

    /// Remove delivered alerts from the queue
    async fn mark_alerts_sent(&self, ids: &[i64]) -> StorageResult<()>;

    async fn list_all_status_records(&self) -> StorageResult<Vec<StatusRecord>>;

    async fn get_status_record(&self, ident: &str, module: &str)
    -> StorageResult<Option<StatusRecord>>;

    /// Insert or refresh a status record without raising an alert
    async fn upsert_status_record(&self, record: &StatusRecord) -> StorageResult<()>;

    /// Store `record` and enqueue an alert for `transition` if it warrants one
    ///
    /// Both writes happen atomically.
    async fn process_status_update(
        &self,
        record: &StatusRecord,
        transition: &HealthTransition,
    ) -> StorageResult<()>;

    async fn upsert_agent(&self, agent: &AgentRecord) -> StorageResult<()>;

    async fn insert_metrics(&self, metrics: Vec<MetricRow>) -> StorageResult<()>;
}
