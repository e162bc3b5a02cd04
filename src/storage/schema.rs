//! Persisted record definitions
//!
//! Status records hold the last-known health of one `(ident, mod)` pair,
//! pending alerts queue notifications until the alerting worker has
//! delivered them, and agent rows remember where an agent last reported from.
//!
//! All timestamps are Unix epoch milliseconds (UTC), matching the
//! `updated_at` arithmetic performed by the service monitoring worker.

use serde::{Deserialize, Serialize};

use crate::status;

/// Last-known status of one module reported by one agent
///
/// Keyed by `(ident, module)`. `updated_at` is refreshed on every accepted
/// report and is what the monitoring worker compares against the
/// configured service timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Agent identity (the `X-Ident` header)
    pub ident: String,

    /// Module / check identifier
    #[serde(rename = "mod")]
    pub module: String,

    /// Status code, see [`crate::status`]
    pub status: i64,

    /// Free-form message attached by the agent
    pub message: Option<String>,

    /// Last refresh, epoch milliseconds
    pub updated_at: i64,
}

impl StatusRecord {
    pub fn new(
        ident: impl Into<String>,
        module: impl Into<String>,
        status: i64,
        message: Option<String>,
        updated_at: i64,
    ) -> Self {
        Self {
            ident: ident.into(),
            module: module.into(),
            status,
            message,
            updated_at,
        }
    }

    pub fn is_outage(&self) -> bool {
        self.status == status::OUTAGE
    }

    /// Whether the record has not been refreshed since `max_age`
    pub fn is_stale(&self, max_age: i64) -> bool {
        self.updated_at < max_age
    }
}

/// A change of status for one `(ident, mod)` pair
///
/// Never persisted on its own; the backend turns it into a pending alert
/// when [`HealthTransition::should_alert`] holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub ident: String,
    pub module: String,

    /// Status before the change, `None` on first sighting
    pub previous: Option<i64>,

    pub current: i64,
    pub message: Option<String>,

    /// When the transition was observed, epoch milliseconds
    pub at: i64,
}

impl HealthTransition {
    /// Build the transition leading from `previous` to `record`
    pub fn between(previous: Option<&StatusRecord>, record: &StatusRecord) -> Self {
        Self {
            ident: record.ident.clone(),
            module: record.module.clone(),
            previous: previous.map(|p| p.status),
            current: record.status,
            message: record.message.clone(),
            at: record.updated_at,
        }
    }

    /// A first sighting of a healthy module is not worth a notification;
    /// everything else is.
    pub fn should_alert(&self) -> bool {
        self.previous.is_some() || self.current != status::OK
    }
}

/// An alert waiting to be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAlert {
    pub id: i64,
    pub ident: String,
    #[serde(rename = "mod")]
    pub module: String,
    pub previous_status: Option<i64>,
    pub status: i64,
    pub message: Option<String>,
    pub created_at: i64,
}

impl PendingAlert {
    /// One-line human readable rendering used by every delivery channel
    pub fn summary(&self) -> String {
        let previous = self
            .previous_status
            .map(status::label)
            .unwrap_or("NEW");
        let mut line = format!(
            "{}/{}: {} -> {}",
            self.ident,
            self.module,
            previous,
            status::label(self.status)
        );
        if let Some(message) = &self.message {
            line.push_str(&format!(" ({message})"));
        }
        line
    }
}

/// Registry entry for a connected agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub ident: String,
    pub remote_ip: String,
    pub version: String,
    pub last_seen: i64,
}

/// A single metric sample reported by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub ident: String,
    #[serde(rename = "mod")]
    pub module: String,
    pub subject: String,
    pub metric: String,
    pub value: f64,
    pub format: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub recorded_at: i64,
}
