//! Background workers
//!
//! Three independent loops run for the lifetime of the server:
//!
//! - **cleanup**: compacts storage every 30 seconds
//! - **alerting**: delivers pending alerts every 30 seconds
//! - **monitor**: after a 600 second grace period, marks modules whose
//!   reports stopped arriving as being in outage, every 10 seconds
//!
//! A storage error inside any loop is fatal: the worker logs it, stops, and
//! requests a graceful shutdown of the whole server.
//!
//! ```text
//! cleanup  ──┐
//! alerting ──┼──> Backend
//! monitor  ──┘
//!    │ (storage error)
//!    └──> ShutdownHandle::trigger
//! ```

pub mod alerting;
pub mod cleanup;
pub mod monitor;

use std::time::Duration;

/// Cadence of the background workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSchedule {
    pub cleanup_interval: Duration,
    pub alert_interval: Duration,

    /// Delay before the first monitoring sweep, giving agents time to
    /// reconnect after a restart
    pub monitor_grace: Duration,

    pub monitor_interval: Duration,
}

impl Default for WorkerSchedule {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(30),
            alert_interval: Duration::from_secs(30),
            monitor_grace: Duration::from_secs(600),
            monitor_interval: Duration::from_secs(10),
        }
    }
}
