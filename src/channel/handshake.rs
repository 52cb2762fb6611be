//! Session negotiation for the socket channel.
//!
//! Before opening the WebSocket the client asks the server for a session id
//! over plain HTTP:
//!
//! ```text
//! GET  {server}{path}?EIO=4&transport=polling          Authorization: Bearer …
//! <-   0{"sid":"abc123","upgrades":["websocket"],...}
//! WS   {ws-server}{path}?EIO=4&transport=websocket&sid=abc123
//! ```
//!
//! The body may carry a framing prefix before the JSON, so the id is pulled
//! out of the text by its quoted key rather than by parsing the body.
//!
//! Only the negotiation borrows the Engine.IO query parameters. Once the
//! socket is open the server speaks plain JSON frames (see [`super::frame`]):
//! no numeric packet prefixes, and keepalive uses WebSocket ping frames
//! rather than text `"2"` packets.

use crate::constants::SOCKET_PROTOCOL_REVISION;
use crate::ws::http_to_ws_scheme;

use super::ChannelError;

/// Marker preceding the session id in the negotiation body.
const SESSION_ID_MARKER: &str = "\"sid\":\"";

/// A negotiated session. Each connection attempt negotiates a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSession {
    /// Server-assigned session identifier.
    pub session_id: String,
}

impl HandshakeSession {
    /// WebSocket URL that upgrades this session.
    #[must_use]
    pub fn socket_url(&self, server_url: &str, path: &str) -> String {
        format!(
            "{}{}?EIO={}&transport=websocket&sid={}",
            http_to_ws_scheme(server_url.trim_end_matches('/')),
            path,
            SOCKET_PROTOCOL_REVISION,
            self.session_id
        )
    }
}

/// URL of the negotiation request.
#[must_use]
pub fn negotiation_url(server_url: &str, path: &str) -> String {
    format!(
        "{}{}?EIO={}&transport=polling",
        server_url.trim_end_matches('/'),
        path,
        SOCKET_PROTOCOL_REVISION
    )
}

/// Pull the session id out of a negotiation response body.
///
/// Returns `None` when the marker is missing or the id is empty.
#[must_use]
pub fn extract_session_id(body: &str) -> Option<&str> {
    let start = body.find(SESSION_ID_MARKER)? + SESSION_ID_MARKER.len();
    let rest = &body[start..];
    let end = rest.find('"')?;
    let id = &rest[..end];
    (!id.is_empty()).then_some(id)
}

/// Run the negotiation request against `url`.
///
/// # Errors
///
/// [`ChannelError::Negotiation`] on transport failure, a non-success status,
/// or a body without a session id.
pub async fn negotiate(
    client: &reqwest::Client,
    url: &str,
    token: &str,
) -> Result<HandshakeSession, ChannelError> {
    log::debug!("[Socket] Negotiating session: {}", url);

    let response = client
        .get(url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| ChannelError::Negotiation(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ChannelError::Negotiation(format!("HTTP {}", status.as_u16())));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ChannelError::Negotiation(e.to_string()))?;

    let session_id = extract_session_id(&body).ok_or_else(|| {
        ChannelError::Negotiation(format!(
            "no session id in response: {}",
            body.chars().take(80).collect::<String>()
        ))
    })?;

    log::debug!("[Socket] Negotiated session {}", session_id);
    Ok(HandshakeSession {
        session_id: session_id.to_string(),
    })
}
