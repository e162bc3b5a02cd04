//! Shared server context handed to the connection handler and the workers

use std::sync::Arc;
use std::time::Duration;

use crate::alerts::AlertDispatcher;
use crate::analytics::ReportHandler;
use crate::lifecycle::ShutdownHandle;
use crate::storage::Backend;

/// Everything a request handler or worker needs
///
/// Built once at startup and cloned into every task; the configuration
/// values are never mutated afterwards.
#[derive(Clone)]
pub struct ServerContext {
    /// Persistence backend shared by every component
    pub backend: Arc<dyn Backend>,

    /// Consumer of decoded agent reports
    pub reports: Arc<dyn ReportHandler>,

    /// Delivery of pending alerts
    pub alerts: Arc<dyn AlertDispatcher>,

    /// Shared secret agents present in `X-Client-Key`
    pub client_key: Arc<str>,

    /// Silence after which a module is declared in outage
    pub service_timeout: Duration,

    /// Requests a graceful shutdown; also observed by live connections
    pub shutdown: ShutdownHandle,
}

impl ServerContext {
    pub fn new(
        backend: Arc<dyn Backend>,
        reports: Arc<dyn ReportHandler>,
        alerts: Arc<dyn AlertDispatcher>,
        client_key: impl Into<Arc<str>>,
        service_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            reports,
            alerts,
            client_key: client_key.into(),
            service_timeout,
            shutdown: ShutdownHandle::new(),
        }
    }
}
