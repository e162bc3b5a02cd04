//! Agent handshake validation
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. `Upgrade` header present (400)
//! 2. `Upgrade` equals `websocket`, case-insensitive (400)
//! 3. `X-Client-Key` present (401)
//! 4. `X-Client-Key` matches the configured secret (403)
//! 5. `X-Ident` present (400)

use axum::{
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

pub const CLIENT_KEY_HEADER: &str = "x-client-key";
pub const IDENT_HEADER: &str = "x-ident";
pub const AGENT_VERSION_HEADER: &str = "x-agent-version";

/// Version recorded for agents that do not send `X-Agent-Version`
pub const DEFAULT_AGENT_VERSION: &str = "unknown";

/// Identity claimed by an agent that passed the handshake checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub ident: String,
    pub agent_version: String,
}

/// Handshake rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    MissingUpgrade,
    InvalidUpgrade,
    MissingClientKey,
    InvalidClientKey,
    MissingIdent,
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::MissingUpgrade
            | HandshakeError::InvalidUpgrade
            | HandshakeError::MissingIdent => StatusCode::BAD_REQUEST,
            HandshakeError::MissingClientKey => StatusCode::UNAUTHORIZED,
            HandshakeError::InvalidClientKey => StatusCode::FORBIDDEN,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            HandshakeError::MissingUpgrade => "Missing Upgrade header",
            HandshakeError::InvalidUpgrade => "Upgrade header must be 'websocket'",
            HandshakeError::MissingClientKey => "Missing X-Client-Key header",
            HandshakeError::InvalidClientKey => "Invalid client key",
            HandshakeError::MissingIdent => "Missing X-Ident header",
        }
    }
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (self.status(), self.message()).into_response()
    }
}

/// Validate the upgrade request headers against the configured client key
pub fn authorize(headers: &HeaderMap, client_key: &str) -> Result<AgentIdentity, HandshakeError> {
    let upgrade = headers
        .get(header::UPGRADE)
        .ok_or(HandshakeError::MissingUpgrade)?;

    let is_websocket = upgrade
        .to_str()
        .is_ok_and(|value| value.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return Err(HandshakeError::InvalidUpgrade);
    }

    let presented_key = headers
        .get(CLIENT_KEY_HEADER)
        .ok_or(HandshakeError::MissingClientKey)?;

    if presented_key.as_bytes() != client_key.as_bytes() {
        return Err(HandshakeError::InvalidClientKey);
    }

    let ident = headers
        .get(IDENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(HandshakeError::MissingIdent)?;

    let agent_version = headers
        .get(AGENT_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_AGENT_VERSION);

    Ok(AgentIdentity {
        ident: ident.to_string(),
        agent_version: agent_version.to_string(),
    })
}
