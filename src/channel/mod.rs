//! Realtime channels and their shared connection bookkeeping.
//!
//! Two independent transports keep the client in sync with the server:
//!
//! ```text
//!   SocketChannel                         StreamChannel
//!     ├── negotiate (HTTP, session id)      ├── GET text/event-stream
//!     ├── WebSocket (frames, both ways)     ├── SseDecoder (line records)
//!     └── Exponential backoff               └── Linear backoff
//!              │                                     │
//!              └──────────► EventDispatcher ◄────────┘
//! ```
//!
//! Each channel owns one background task per connection lifecycle. The task
//! and the public API meet in [`ChannelCore`]: a mutex-guarded state machine
//! plus a `watch` channel that publishes every [`ConnectionState`] change.
//!
//! # Cancellation
//!
//! Every run of the background task is tied to a `CancellationToken`.
//! State changes requested by the task are applied only while its token is
//! live, and `disconnect()` cancels the token and moves to `Closed` under the
//! same lock. A reconnect timer firing after `disconnect()` therefore can't
//! resurrect the connection.

// Rust guideline compliant 2026-02

pub mod frame;
pub mod handshake;
pub mod socket;
pub mod sse;
pub mod stream;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Connection state shared by both channels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected, or `connect()` skipped for lack of a credential.
    #[default]
    Idle,
    /// Socket channel: negotiating a session and opening the socket.
    Handshaking,
    /// Stream channel: request issued, waiting for the response status.
    Connecting,
    /// Connected; frames/records are being decoded and dispatched.
    Open,
    /// Waiting for the reconnect timer.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Milliseconds until the next attempt.
        next_retry_ms: u64,
    },
    /// Reconnecting, but the attempt bound was reached and no retry is scheduled.
    ///
    /// Calling `connect()` again starts over.
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// Explicitly disconnected.
    Closed,
}

impl ConnectionState {
    /// True while a connection attempt, an open connection, or a scheduled
    /// retry is in progress. `connect()` is a no-op in these states.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Handshaking | Self::Connecting | Self::Open | Self::Reconnecting { .. }
        )
    }

    /// True when connected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// True while recovering from a lost connection, scheduled or not.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting { .. } | Self::Exhausted { .. })
    }
}

/// Errors surfaced by the channels.
///
/// None of these escape as panics: they are logged, reported to callbacks,
/// and (where recoverable) followed by a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The credential provider had no token.
    #[error("no credential available")]
    MissingCredential,
    /// The session negotiation request failed or returned no session id.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// The socket or stream could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Negotiation plus socket open did not finish in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// The stream endpoint answered with a non-success status.
    #[error("server responded with HTTP {0}")]
    HttpStatus(u16),
    /// Writing a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The connection broke while open.
    #[error("transport error: {0}")]
    Transport(String),
    /// The reconnect bound was reached; no further attempts are scheduled.
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Mutable bookkeeping guarded by [`ChannelCore`].
#[derive(Debug, Default)]
struct CoreInner {
    state: ConnectionState,
    attempt_count: u32,
    /// Set between `connect()` passing the guard and its task being armed.
    starting: bool,
    /// Set by `mark_open`; whoever takes it reports the close.
    opened: bool,
    cancel: Option<CancellationToken>,
}

/// Outcome of asking [`ChannelCore`] for another reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryStep {
    /// Schedule a retry; the value feeds the backoff policy.
    Retry(u32),
    /// Bound reached after this many attempts; nothing is scheduled.
    Exhausted(u32),
    /// The task was cancelled by `disconnect()`.
    Cancelled,
}

/// State machine shared between a channel's public API and its task.
#[derive(Debug)]
pub(crate) struct ChannelCore {
    inner: Mutex<CoreInner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ChannelCore {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Mutex::new(CoreInner::default()),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &mut CoreInner, state: ConnectionState) {
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn attempt_count(&self) -> u32 {
        self.lock().attempt_count
    }

    pub(crate) fn reset_attempts(&self) {
        self.lock().attempt_count = 0;
    }

    /// Reentrancy guard for `connect()`.
    ///
    /// Returns `false` if a connection is already starting or active.
    pub(crate) fn begin_connect(&self) -> bool {
        let mut inner = self.lock();
        if inner.starting || inner.state.is_active() {
            return false;
        }
        inner.starting = true;
        true
    }

    /// Give up a `connect()` that passed [`Self::begin_connect`] without arming.
    pub(crate) fn abandon_connect(&self) {
        self.lock().starting = false;
    }

    /// Create the cancellation token for a new task run and enter `initial`.
    ///
    /// Returns `None` if `disconnect()` ran since [`Self::begin_connect`].
    pub(crate) fn arm(&self, initial: ConnectionState) -> Option<CancellationToken> {
        let mut inner = self.lock();
        if !inner.starting {
            return None;
        }
        inner.starting = false;
        inner.opened = false;
        if let Some(previous) = inner.cancel.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        inner.cancel = Some(token.clone());
        self.publish(&mut inner, initial);
        Some(token)
    }

    /// Apply a state change requested by the task owning `token`.
    ///
    /// Returns `false` (and changes nothing) once that task was cancelled.
    pub(crate) fn transition(&self, token: &CancellationToken, state: ConnectionState) -> bool {
        let mut inner = self.lock();
        if token.is_cancelled() {
            return false;
        }
        self.publish(&mut inner, state);
        true
    }

    /// Enter `Open`, reset the attempt counter and raise the opened flag
    /// in one step.
    pub(crate) fn mark_open(&self, token: &CancellationToken) -> bool {
        let mut inner = self.lock();
        if token.is_cancelled() {
            return false;
        }
        inner.attempt_count = 0;
        inner.opened = true;
        self.publish(&mut inner, ConnectionState::Open);
        true
    }

    /// Clear the opened flag, returning whether it was set.
    ///
    /// Exactly one caller per opened connection gets `true`.
    pub(crate) fn take_opened(&self) -> bool {
        std::mem::take(&mut self.lock().opened)
    }

    /// Socket channel step: check the bound, then count the attempt.
    ///
    /// `Retry` carries the count *before* the increment. At the bound the
    /// counter is left alone and the state becomes `Exhausted`.
    pub(crate) fn take_attempt(&self, token: &CancellationToken, max: u32) -> RetryStep {
        let mut inner = self.lock();
        if token.is_cancelled() {
            return RetryStep::Cancelled;
        }
        let attempt = inner.attempt_count;
        if attempt >= max {
            self.publish(&mut inner, ConnectionState::Exhausted { attempts: attempt });
            return RetryStep::Exhausted(attempt);
        }
        inner.attempt_count += 1;
        RetryStep::Retry(attempt)
    }

    /// Stream channel step: count the attempt, then check the bound.
    ///
    /// `Retry` carries the count *after* the increment. Once it exceeds
    /// `max` the state becomes `Exhausted` with the attempts actually made.
    pub(crate) fn bump_attempt(&self, token: &CancellationToken, max: u32) -> RetryStep {
        let mut inner = self.lock();
        if token.is_cancelled() {
            return RetryStep::Cancelled;
        }
        inner.attempt_count += 1;
        let attempt = inner.attempt_count;
        if attempt > max {
            let attempts = attempt - 1;
            self.publish(&mut inner, ConnectionState::Exhausted { attempts });
            return RetryStep::Exhausted(attempts);
        }
        RetryStep::Retry(attempt)
    }

    /// Cancel the running task (if any) and enter `Closed`. Idempotent.
    ///
    /// Returns the state that was replaced.
    pub(crate) fn shutdown(&self) -> ConnectionState {
        let mut inner = self.lock();
        if let Some(token) = inner.cancel.take() {
            token.cancel();
        }
        inner.starting = false;
        let previous = inner.state.clone();
        self.publish(&mut inner, ConnectionState::Closed);
        previous
    }
}

pub use frame::{decode_frame, decode_records, encode_action, FrameError};
pub use handshake::{negotiate, HandshakeSession};
pub use socket::{
    SocketChannel, SocketChannelBuilder, SocketConnector, SocketMessage, SocketReader,
    SocketSettings, SocketWriter, WsConnector,
};
pub use sse::{SseDecoder, StreamRecord};
pub use stream::{
    ByteStream, HttpStreamTransport, StreamChannel, StreamOptions, StreamTransport,
};
