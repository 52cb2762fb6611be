//! Unidirectional event stream channel.
//!
//! One long-lived `GET` whose body is a line-oriented event stream:
//!
//! ```text
//! StreamChannel::connect(options)
//!     └── credential lookup (missing -> on_error, no request)
//!         └── spawn run_stream_loop
//!               loop {
//!                 CONNECTING:   GET, wait for a success status
//!                 OPEN:         on_open, then body chunks -> SseDecoder -> on_message + dispatcher
//!                 RECONNECTING: linear backoff, bounded attempts
//!               }
//! ```
//!
//! Unlike the socket channel, `connect()` does not reset the attempt
//! counter; call [`StreamChannel::reset_reconnect_attempts`] after the
//! bound was reached to try again from scratch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::constants::{
    STREAM_BACKOFF_MAX_FACTOR, STREAM_MAX_RECONNECT_ATTEMPTS, STREAM_RECONNECT_INTERVAL,
};
use crate::credentials::{resolve_token, CredentialProvider};
use crate::dispatcher::EventDispatcher;
use crate::event::Event;

use super::sse::{SseDecoder, StreamRecord};
use super::{ChannelCore, ChannelError, ConnectionState, RetryStep};

/// Body of an open stream response.
#[async_trait]
pub trait ByteStream: Send {
    /// Next body chunk, `Ok(None)` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ChannelError>;
}

/// Issues the stream request.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Send the request and return the body once the status is a success.
    ///
    /// A non-success status is [`ChannelError::HttpStatus`].
    async fn open(&self, token: &str) -> Result<Box<dyn ByteStream>, ChannelError>;
}

/// Production transport over reqwest.
#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpStreamTransport {
    /// Transport for the stream endpoint at `url`.
    ///
    /// The client has no request timeout: the response is expected to stay
    /// open indefinitely.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Transport for the stream endpoint in `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.stream_url())
    }
}

/// reqwest response body.
struct ResponseBody(reqwest::Response);

#[async_trait]
impl ByteStream for ResponseBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ChannelError> {
        self.0
            .chunk()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, token: &str) -> Result<Box<dyn ByteStream>, ChannelError> {
        log::debug!("[Stream] GET {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::HttpStatus(status.as_u16()));
        }
        Ok(Box::new(ResponseBody(response)))
    }
}

/// Callback receiving each decoded event.
pub type MessageCallback = Arc<dyn Fn(&Event) + Send + Sync>;
/// Callback receiving errors.
pub type ErrorCallback = Arc<dyn Fn(&ChannelError) + Send + Sync>;
/// Callback for open/close notifications.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks and retry tunables for one [`StreamChannel::connect`] call.
#[derive(Clone)]
pub struct StreamOptions {
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
    on_open: Option<LifecycleCallback>,
    on_close: Option<LifecycleCallback>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            on_message: None,
            on_error: None,
            on_open: None,
            on_close: None,
            reconnect_interval: STREAM_RECONNECT_INTERVAL,
            max_reconnect_attempts: STREAM_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("reconnect_interval", &self.reconnect_interval)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}

impl StreamOptions {
    /// Defaults: no callbacks, 5s interval, 10 attempts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with the interval and bound from the `stream` section of `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .reconnect_interval(config.stream.reconnect_interval())
            .max_reconnect_attempts(config.stream.max_reconnect_attempts)
    }

    /// Called for every decoded event, before the dispatcher.
    #[must_use]
    pub fn on_message(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Called for a missing credential, request and transport failures, and exhaustion.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&ChannelError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called once per successful connection.
    #[must_use]
    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Called when an open connection ends, including via `disconnect()`.
    #[must_use]
    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Unit reconnect delay.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Reconnect attempts before giving up.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::linear(self.reconnect_interval, STREAM_BACKOFF_MAX_FACTOR)
    }

    fn emit_message(&self, event: &Event) {
        if let Some(cb) = &self.on_message {
            guarded("on_message", || cb(event));
        }
    }

    fn emit_error(&self, error: &ChannelError) {
        if let Some(cb) = &self.on_error {
            guarded("on_error", || cb(error));
        }
    }

    fn emit_open(&self) {
        if let Some(cb) = &self.on_open {
            guarded("on_open", || cb());
        }
    }

    fn emit_close(&self) {
        if let Some(cb) = &self.on_close {
            guarded("on_close", || cb());
        }
    }
}

/// Run a user callback, logging instead of unwinding into the channel.
fn guarded(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("[Stream] {} callback panicked", name);
    }
}

/// State shared by the handle and its loop task.
struct Shared {
    core: ChannelCore,
    transport: Arc<dyn StreamTransport>,
    credentials: Arc<dyn CredentialProvider>,
    dispatcher: EventDispatcher,
    /// Options of the current lifecycle, for `disconnect()`'s on_close.
    options: Mutex<Option<StreamOptions>>,
}

impl Shared {
    fn options(&self) -> MutexGuard<'_, Option<StreamOptions>> {
        self.options.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_closed(&self, options: &StreamOptions) {
        if self.core.take_opened() {
            options.emit_close();
        }
    }
}

/// Event stream channel handle.
///
/// Dropping the handle disconnects.
pub struct StreamChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("state", &self.state())
            .field("attempt_count", &self.attempt_count())
            .finish_non_exhaustive()
    }
}

impl StreamChannel {
    /// Channel with a private dispatcher.
    pub fn new(
        transport: impl StreamTransport + 'static,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self::with_dispatcher(transport, credentials, EventDispatcher::new())
    }

    /// Channel delivering to a shared `dispatcher`.
    pub fn with_dispatcher(
        transport: impl StreamTransport + 'static,
        credentials: Arc<dyn CredentialProvider>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: ChannelCore::new(),
                transport: Arc::new(transport),
                credentials,
                dispatcher,
                options: Mutex::new(None),
            }),
        }
    }

    /// Connect, unless a connection is already starting, open or retrying.
    ///
    /// Without a credential, `on_error` receives
    /// [`ChannelError::MissingCredential`] and no request is made.
    pub async fn connect(&self, options: StreamOptions) {
        let shared = &self.shared;
        if !shared.core.begin_connect() {
            log::debug!("[Stream] connect() ignored: already {:?}", shared.core.state());
            return;
        }

        let Some(token) = resolve_token(shared.credentials.as_ref()).await else {
            shared.core.abandon_connect();
            log::warn!("[Stream] No credential, not connecting");
            options.emit_error(&ChannelError::MissingCredential);
            return;
        };

        let Some(cancel) = shared.core.arm(ConnectionState::Connecting) else {
            log::debug!("[Stream] Disconnected while fetching credential");
            return;
        };
        *shared.options() = Some(options.clone());

        tokio::spawn(run_stream_loop(Arc::clone(shared), token, options, cancel));
    }

    /// Abort the response, cancel any pending retry, and enter `Closed`.
    ///
    /// Idempotent. `on_close` fires if the stream was open.
    pub fn disconnect(&self) {
        let previous = self.shared.core.shutdown();
        let options = self.shared.options().take();
        if let Some(options) = options {
            self.shared.notify_closed(&options);
        }
        if previous != ConnectionState::Closed {
            log::info!("[Stream] Disconnected (was {:?})", previous);
        }
    }

    /// Clear the attempt counter without connecting.
    pub fn reset_reconnect_attempts(&self) {
        self.shared.core.reset_attempts();
    }

    /// True while the response body is being read.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.core.state().is_open()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.core.state()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.core.watch()
    }

    /// Failed attempts since the last successful open (or reset).
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.shared.core.attempt_count()
    }

    /// Dispatcher this channel delivers to.
    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.shared.dispatcher
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Why [`read_body`] returned.
enum BodyExit {
    /// `disconnect()` was called.
    Shutdown,
    /// The response ended; reconnect after backoff.
    Ended(&'static str),
}

async fn run_stream_loop(
    shared: Arc<Shared>,
    token: String,
    options: StreamOptions,
    cancel: CancellationToken,
) {
    let backoff = options.backoff();
    let mut decoder = SseDecoder::new();

    loop {
        if !shared.core.transition(&cancel, ConnectionState::Connecting) {
            return;
        }

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = shared.transport.open(&token) => result,
        };

        let reason = match opened {
            Ok(body) => match read_body(&shared, &cancel, &options, &mut decoder, body).await {
                BodyExit::Shutdown => return,
                BodyExit::Ended(reason) => reason,
            },
            Err(e) => {
                log::warn!("[Stream] Request failed: {}", e);
                options.emit_error(&e);
                "request failed"
            }
        };
        decoder.clear();

        let attempt = match shared
            .core
            .bump_attempt(&cancel, options.max_reconnect_attempts)
        {
            RetryStep::Retry(attempt) => attempt,
            RetryStep::Exhausted(attempts) => {
                let error = ChannelError::RetriesExhausted { attempts };
                log::error!("[Stream] {}", error);
                options.emit_error(&error);
                return;
            }
            RetryStep::Cancelled => return,
        };

        let delay = backoff.next_delay(attempt);
        log::info!(
            "[Stream] {}, reconnecting in {}s (attempt {}/{})",
            reason,
            delay.as_secs(),
            attempt,
            options.max_reconnect_attempts
        );
        if !shared.core.transition(
            &cancel,
            ConnectionState::Reconnecting {
                attempt,
                next_retry_ms: delay.as_millis() as u64,
            },
        ) {
            return;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("[Stream] Reconnect timer cancelled");
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn read_body(
    shared: &Shared,
    cancel: &CancellationToken,
    options: &StreamOptions,
    decoder: &mut SseDecoder,
    mut body: Box<dyn ByteStream>,
) -> BodyExit {
    if !shared.core.mark_open(cancel) {
        return BodyExit::Shutdown;
    }
    log::info!("[Stream] Connected");
    options.emit_open();

    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => return BodyExit::Shutdown,
            chunk = body.next_chunk() => chunk,
        };

        match chunk {
            Ok(Some(bytes)) => {
                for record in decoder.feed(&bytes) {
                    // A callback may have called disconnect().
                    if cancel.is_cancelled() {
                        return BodyExit::Shutdown;
                    }
                    match record {
                        StreamRecord::Event(event) => {
                            options.emit_message(&event);
                            shared.dispatcher.dispatch(&event);
                        }
                        StreamRecord::EndOfStream => {
                            log::info!("[Stream] Server ended the stream");
                            shared.notify_closed(options);
                            return BodyExit::Ended("stream finished");
                        }
                    }
                }
            }
            Ok(None) => {
                shared.notify_closed(options);
                return BodyExit::Ended("response ended");
            }
            Err(e) => {
                log::warn!("[Stream] {}", e);
                options.emit_error(&e);
                shared.notify_closed(options);
                return BodyExit::Ended("transport error");
            }
        }
    }
}
