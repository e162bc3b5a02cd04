//! Reporting server for gullveig agents
//!
//! Agents connect over TLS-secured WebSockets and stream JSON health and
//! metric reports. The server keeps the last-known status of every
//! `(ident, mod)` pair, declares an outage when a module stops reporting,
//! and mails or posts alerts whenever a status changes.

pub mod alerts;
pub mod analytics;
pub mod api;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod storage;
pub mod tls;
pub mod workers;

/// Status codes shared by agents, status records and alerts
pub mod status {
    pub const OK: i64 = 0;
    pub const WARNING: i64 = 1;
    pub const ERROR: i64 = 2;
    /// Set by the service monitoring worker when reports stop arriving
    pub const OUTAGE: i64 = 3;

    pub fn label(code: i64) -> &'static str {
        match code {
            OK => "OK",
            WARNING => "WARNING",
            ERROR => "ERROR",
            OUTAGE => "OUTAGE",
            _ => "UNKNOWN",
        }
    }
}
