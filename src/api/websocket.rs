//! WebSocket handler for agent report ingestion

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::context::ServerContext;

use super::handshake::authorize;

/// Per-connection agent state
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub remote_ip: IpAddr,
    pub ident: String,
    pub agent_version: String,
}

/// WebSocket upgrade handler
///
/// GET /
pub async fn agent_handler(
    State(ctx): State<ServerContext>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authorize(&headers, &ctx.client_key) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(remote = %remote.ip(), "rejected agent connection: {e}");
            return e.into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(remote = %remote.ip(), ident = %identity.ident, "invalid upgrade request: {rejection}");
            return rejection.into_response();
        }
    };

    let session = AgentSession {
        remote_ip: remote.ip(),
        ident: identity.ident,
        agent_version: identity.agent_version,
    };

    upgrade.on_upgrade(move |socket| handle_socket(socket, ctx, session))
}

/// Receive loop for one agent connection
///
/// Frames are handled one at a time in arrival order. Pings are answered
/// by the WebSocket layer itself.
async fn handle_socket(mut socket: WebSocket, ctx: ServerContext, session: AgentSession) {
    info!(
        remote = %session.remote_ip,
        ident = %session.ident,
        version = %session.agent_version,
        "agent connected"
    );

    let shutdown = ctx.shutdown.clone();

    loop {
        let message = tokio::select! {
            message = socket.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.triggered() => {
                debug!(ident = %session.ident, "closing connection for shutdown");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        };

        match message {
            Ok(Message::Text(text)) => handle_report(&ctx, &session, &text).await,
            Ok(Message::Ping(_)) => trace!(ident = %session.ident, "received ping"),
            Ok(Message::Pong(_)) => {}
            Ok(Message::Binary(_)) => {
                debug!(ident = %session.ident, "ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                error!(
                    remote = %session.remote_ip,
                    ident = %session.ident,
                    "connection error: {e}"
                );
                break;
            }
        }
    }

    info!(
        remote = %session.remote_ip,
        ident = %session.ident,
        "agent disconnected"
    );
}

async fn handle_report(ctx: &ServerContext, session: &AgentSession, text: &str) {
    let payload = match serde_json::from_str::<Value>(text) {
        Ok(payload) => payload,
        Err(e) => {
            error!(
                remote = %session.remote_ip,
                ident = %session.ident,
                "failed to decode agent report: {e}"
            );
            return;
        }
    };

    if let Err(e) = ctx
        .reports
        .handle_agent_report(
            session.remote_ip,
            &session.agent_version,
            &session.ident,
            payload,
        )
        .await
    {
        error!(
            remote = %session.remote_ip,
            ident = %session.ident,
            "failed to handle agent report: {e}"
        );
    }
}
