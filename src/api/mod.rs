//! Agent-facing HTTP surface
//!
//! A single route accepts WebSocket upgrades from agents:
//!
//! - `GET /` with `Upgrade: websocket`, `X-Client-Key`, `X-Ident` and an
//!   optional `X-Agent-Version`
//!
//! After the upgrade, every text frame is one JSON report.

pub mod handshake;
pub mod websocket;

pub use handshake::{AgentIdentity, HandshakeError, authorize};
pub use websocket::AgentSession;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::context::ServerContext;

/// Build the agent router
///
/// The handler needs `ConnectInfo<SocketAddr>` in the request extensions;
/// serve it with `into_make_service_with_connect_info` or insert the
/// extension per connection.
pub fn router(ctx: ServerContext) -> Router {
    Router::new()
        .route("/", get(websocket::agent_handler))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
}
