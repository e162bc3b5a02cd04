//! Analytics manager - turns agent reports into status records
//!
//! ## Report format
//!
//! ```json
//! {
//!   "health": [{ "mod": "mod_systemd", "status": 0, "message": "12 units running" }],
//!   "metric": [{ "mod": "mod_res", "subject": "cpu", "metric": "load", "value": 0.4 }]
//! }
//! ```
//!
//! Both arrays are optional and unknown fields are ignored. Agents may only
//! report OK, WARNING or ERROR; a report carrying any other status code is
//! rejected as a whole. Every report
//! also refreshes the synthetic [`AGENT_MODULE`] record, so an agent that
//! goes silent is picked up by the service monitoring worker like any other
//! module.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::status;
use crate::storage::{
    AgentRecord, Backend, HealthTransition, MetricRow, StatusRecord, StorageError,
};

/// Module name of the per-agent liveness record
pub const AGENT_MODULE: &str = "agent";

#[derive(Debug)]
pub enum ReportError {
    /// The payload is valid JSON but not a report
    InvalidPayload(String),

    /// Persisting the report failed
    Storage(StorageError),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::InvalidPayload(msg) => write!(f, "invalid agent report: {}", msg),
            ReportError::Storage(err) => write!(f, "failed to store agent report: {}", err),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Storage(err) => Some(err),
            ReportError::InvalidPayload(_) => None,
        }
    }
}

impl From<StorageError> for ReportError {
    fn from(err: StorageError) -> Self {
        ReportError::Storage(err)
    }
}

/// Consumer of decoded agent reports
#[async_trait]
pub trait ReportHandler: Send + Sync {
    async fn handle_agent_report(
        &self,
        remote_ip: IpAddr,
        agent_version: &str,
        ident: &str,
        payload: Value,
    ) -> Result<(), ReportError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentReport {
    #[serde(default)]
    pub health: Vec<HealthItem>,

    #[serde(default)]
    pub metric: Vec<MetricItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthItem {
    #[serde(rename = "mod")]
    pub module: String,
    pub status: i64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricItem {
    #[serde(rename = "mod")]
    pub module: String,
    pub subject: String,
    pub metric: String,
    pub value: f64,
    pub format: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AgentReport {
    pub fn from_payload(payload: Value) -> Result<Self, ReportError> {
        if !payload.is_object() {
            return Err(ReportError::InvalidPayload(
                "report must be a JSON object".to_string(),
            ));
        }

        let report: AgentReport = serde_json::from_value(payload)
            .map_err(|e| ReportError::InvalidPayload(e.to_string()))?;

        // Outage is only ever declared by the service monitor
        if let Some(item) = report
            .health
            .iter()
            .find(|item| !(status::OK..=status::ERROR).contains(&item.status))
        {
            return Err(ReportError::InvalidPayload(format!(
                "{}: status {} is not an agent status",
                item.module, item.status
            )));
        }

        Ok(report)
    }
}

/// Writes reports through the persistence backend
pub struct AnalyticsManager {
    backend: Arc<dyn Backend>,
}

impl AnalyticsManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Store `record`, raising a transition if its status differs from the
    /// stored one
    async fn apply_status(&self, record: StatusRecord) -> Result<(), StorageError> {
        let current = self
            .backend
            .get_status_record(&record.ident, &record.module)
            .await?;

        match current {
            Some(current) if current.status == record.status => {
                self.backend.upsert_status_record(&record).await
            }
            current => {
                let transition = HealthTransition::between(current.as_ref(), &record);
                debug!(
                    module = %record.module,
                    "status transition {:?} -> {}",
                    transition.previous, transition.current
                );
                self.backend.process_status_update(&record, &transition).await
            }
        }
    }
}

#[async_trait]
impl ReportHandler for AnalyticsManager {
    #[instrument(skip(self, payload), fields(remote = %remote_ip))]
    async fn handle_agent_report(
        &self,
        remote_ip: IpAddr,
        agent_version: &str,
        ident: &str,
        payload: Value,
    ) -> Result<(), ReportError> {
        let report = AgentReport::from_payload(payload)?;
        let now = Utc::now().timestamp_millis();

        self.backend
            .upsert_agent(&AgentRecord {
                ident: ident.to_string(),
                remote_ip: remote_ip.to_string(),
                version: agent_version.to_string(),
                last_seen: now,
            })
            .await?;

        self.apply_status(StatusRecord::new(ident, AGENT_MODULE, status::OK, None, now))
            .await?;

        for item in report.health {
            self.apply_status(StatusRecord::new(
                ident,
                item.module,
                item.status,
                item.message,
                now,
            ))
            .await?;
        }

        if !report.metric.is_empty() {
            let rows = report
                .metric
                .into_iter()
                .map(|item| MetricRow {
                    ident: ident.to_string(),
                    module: item.module,
                    subject: item.subject,
                    metric: item.metric,
                    value: item.value,
                    format: item.format,
                    min: item.min,
                    max: item.max,
                    recorded_at: now,
                })
                .collect();
            self.backend.insert_metrics(rows).await?;
        }

        Ok(())
    }
}
