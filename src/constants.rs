//! Transport-wide constants for chatwire.
//!
//! Defaults for both realtime channels live here so the config layer and
//! the channels agree on them. Everything can be overridden via
//! [`crate::config::Config`].
//!
//! # Categories
//!
//! - **Socket**: negotiation, handshake and reconnect settings
//! - **Stream**: event-stream reconnect settings and record format
//! - **Frames**: action names the client writes during handshake

use std::time::Duration;

// ============================================================================
// Socket Channel
// ============================================================================

/// Default server the client talks to.
pub const DEFAULT_SERVER_URL: &str = "https://chat.example.com";

/// Path of the socket endpoint, used both for negotiation and the upgrade.
pub const DEFAULT_SOCKET_PATH: &str = "/socket.io/";

/// Protocol revision sent in the negotiation and upgrade query strings.
///
/// Selects the session endpoint only; frames on the open socket are plain
/// JSON without Engine.IO packet prefixes.
pub const SOCKET_PROTOCOL_REVISION: &str = "4";

/// Bound on negotiation + socket open combined.
///
/// A handshake that has not produced an open socket within this window is
/// treated as a failed attempt and goes through the normal backoff.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First reconnect delay for the socket channel.
pub const SOCKET_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the socket channel's exponential backoff.
pub const SOCKET_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Reconnect attempts before the socket channel stops retrying.
pub const SOCKET_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Room joined right after authentication.
pub const DEFAULT_ROOM: &str = "lobby";

// ============================================================================
// Stream Channel
// ============================================================================

/// Path of the event stream endpoint.
pub const DEFAULT_STREAM_PATH: &str = "/api/events/stream";

/// Base interval for the stream channel's linear backoff.
pub const STREAM_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Largest multiplier applied to [`STREAM_RECONNECT_INTERVAL`].
pub const STREAM_BACKOFF_MAX_FACTOR: u32 = 5;

/// Reconnect attempts before the stream channel stops retrying.
pub const STREAM_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Prefix carried by every payload record of the event stream.
pub const STREAM_RECORD_PREFIX: &str = "data:";

/// Payload that marks a normal end of stream.
pub const STREAM_END_SENTINEL: &str = "[DONE]";

/// Longest line the stream decoder buffers before dropping it (1 MiB).
pub const STREAM_MAX_RECORD_BYTES: usize = 1024 * 1024;

// ============================================================================
// Frames
// ============================================================================

/// Action written first on every freshly opened socket.
pub const AUTHENTICATE_ACTION: &str = "authenticate";

/// Action written after authentication to enter the default room.
pub const JOIN_ROOM_ACTION: &str = "join_room";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_backoff_bounds_are_ordered() {
        assert!(SOCKET_BACKOFF_BASE <= SOCKET_BACKOFF_CAP);
        assert!(HANDSHAKE_TIMEOUT >= SOCKET_BACKOFF_BASE);
    }

    #[test]
    fn test_stream_record_prefix_has_no_trailing_space() {
        // Records are matched on "data:" and the value is trimmed afterwards,
        // so both "data:{..}" and "data: {..}" decode.
        assert!(!STREAM_RECORD_PREFIX.ends_with(' '));
    }
}
