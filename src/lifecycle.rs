//! Server lifecycle coordination
//!
//! ```text
//! NotStarted -> Starting -> Serving -> ShuttingDown -> Stopped
//! ```
//!
//! `Starting` bootstraps storage, loads the TLS material, builds the router
//! and installs signal handlers. `Serving` runs the TLS listener and the
//! background workers as tracked tasks and parks until a shutdown is
//! requested. A request can come from SIGTERM, SIGHUP, SIGINT or a failing
//! worker; all of them funnel into the same [`ShutdownHandle`].
//!
//! The shutdown sequence runs at most once per [`Lifecycle`], no matter how
//! many triggers fire or how many callers invoke [`Lifecycle::shutdown`]
//! concurrently.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::ConnectInfo;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::tls;
use crate::workers::{WorkerSchedule, alerting, cleanup, monitor};

/// Cloneable request for a graceful shutdown
///
/// Triggering is idempotent; every clone observes the same flag.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self, reason: &str) {
        if !self.tx.send_replace(true) {
            info!("shutdown requested: {reason}");
        } else {
            debug!("shutdown already requested, ignoring: {reason}");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once a shutdown has been requested
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

/// Owns the server's long-running tasks and their teardown
pub struct Lifecycle {
    context: ServerContext,
    schedule: WorkerSchedule,
    state: watch::Sender<LifecycleState>,
    shutting_down: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl Lifecycle {
    pub fn new(context: ServerContext, schedule: WorkerSchedule) -> Self {
        let (state, _rx) = watch::channel(LifecycleState::NotStarted);
        Self {
            context,
            schedule,
            state,
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.context.shutdown.clone()
    }

    /// Track a long-running task so shutdown can cancel it
    ///
    /// Returns `false` without spawning once shutdown has begun.
    pub async fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if self.shutting_down.load(Ordering::Acquire) {
            debug!("refusing to spawn task during shutdown");
            return false;
        }
        tasks.spawn(task);
        true
    }

    /// Start the server on the configured address and run until shutdown
    pub async fn run(&self, server: &ServerConfig) -> anyhow::Result<()> {
        let (acceptor, app) = self.prepare(server).await?;

        let addr = server.bind_addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.shutdown().await;
                return Err(e).with_context(|| format!("failed to listen on {addr}"));
            }
        };

        self.serve(listener, acceptor, app).await
    }

    /// Same as [`Lifecycle::run`] on an already bound listener
    pub async fn run_with_listener(
        &self,
        listener: TcpListener,
        server: &ServerConfig,
    ) -> anyhow::Result<()> {
        let (acceptor, app) = self.prepare(server).await?;
        self.serve(listener, acceptor, app).await
    }

    async fn prepare(&self, server: &ServerConfig) -> anyhow::Result<(TlsAcceptor, Router)> {
        self.state.send_replace(LifecycleState::Starting);
        info!("starting gullveig reporting server");

        let result: anyhow::Result<(TlsAcceptor, Router)> = async {
            self.context
                .backend
                .bootstrap()
                .await
                .context("failed to bootstrap storage")?;

            let app = api::router(self.context.clone());
            let acceptor = tls::acceptor(&server.ssl_certificate, &server.ssl_certificate_key)?;
            self.install_signal_handlers().await?;

            Ok((acceptor, app))
        }
        .await;

        if result.is_err() {
            self.shutdown().await;
        }
        result
    }

    async fn serve(
        &self,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        app: Router,
    ) -> anyhow::Result<()> {
        let local = listener
            .local_addr()
            .context("failed to read listener address")?;

        self.spawn(serve_tls(listener, acceptor, app)).await;
        self.start_workers().await;

        self.state.send_replace(LifecycleState::Serving);
        info!("listening on wss://{local}");

        self.context.shutdown.triggered().await;
        self.shutdown().await;

        // Another caller may own the sequence; wait for it to finish
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state == LifecycleState::Stopped)
            .await;

        info!("server stopped");
        Ok(())
    }

    async fn start_workers(&self) {
        let schedule = self.schedule;

        self.spawn(cleanup::run(
            self.context.clone(),
            schedule.cleanup_interval,
        ))
        .await;
        self.spawn(alerting::run(
            self.context.clone(),
            schedule.alert_interval,
        ))
        .await;
        self.spawn(monitor::run(
            self.context.clone(),
            schedule.monitor_grace,
            schedule.monitor_interval,
        ))
        .await;
    }

    #[cfg(unix)]
    async fn install_signal_handlers(&self) -> anyhow::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let signals = [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
            (SignalKind::interrupt(), "SIGINT"),
        ];

        for (kind, name) in signals {
            let mut stream =
                signal(kind).with_context(|| format!("failed to install {name} handler"))?;
            let trigger = self.context.shutdown.clone();

            self.spawn(async move {
                if stream.recv().await.is_some() {
                    trigger.trigger(&format!("received {name}"));
                }
            })
            .await;
        }

        Ok(())
    }

    #[cfg(not(unix))]
    async fn install_signal_handlers(&self) -> anyhow::Result<()> {
        let trigger = self.context.shutdown.clone();
        self.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.trigger("received Ctrl-C");
            }
        })
        .await;
        Ok(())
    }

    /// Run the shutdown sequence
    ///
    /// Closes storage (failures are logged), then cancels and awaits every
    /// tracked task. Returns `false` if the sequence had already started.
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.state.send_replace(LifecycleState::ShuttingDown);
        self.context.shutdown.trigger("shutting down");

        if let Err(e) = self.context.backend.shutdown().await {
            error!("failed to close storage: {e}");
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        debug!("cancelling {} tasks", tasks.len());
        tasks.abort_all();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("task panicked: {e}");
                }
            }
        }

        self.state.send_replace(LifecycleState::Stopped);
        true
    }
}

/// Accept TLS connections and serve the router on each of them
///
/// Connection tasks live in a local set, so cancelling this future closes
/// every open agent connection as well.
async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, app: Router) {
    let mut connections = JoinSet::new();

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("failed to accept connection: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        while connections.try_join_next().is_some() {}

        let acceptor = acceptor.clone();
        let app = app.clone();

        connections.spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%remote, "TLS handshake failed: {e}");
                    return;
                }
            };

            serve_connection(TokioIo::new(stream), remote, app).await;
        });
    }
}

async fn serve_connection<I>(io: TokioIo<I>, remote: SocketAddr, app: Router)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote));
        app.clone().oneshot(request)
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!(%remote, "connection closed with error: {e}");
    }
}
