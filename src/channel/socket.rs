//! Bidirectional socket channel.
//!
//! # Architecture
//!
//! ```text
//! SocketChannel::connect()
//!     └── credential lookup (once per connect)
//!         └── spawn run_connection_loop
//!               loop {
//!                 HANDSHAKING: negotiate + open socket   (one shared timeout)
//!                 OPEN:        auth frame, join frame, then run_message_loop
//!                 RECONNECTING: exponential backoff, bounded attempts
//!               }
//! ```
//!
//! Inbound text frames are decoded by [`super::frame`] and pushed to the
//! shared [`EventDispatcher`] on the loop task, in arrival order. Outbound
//! `send()` calls go through a per-connection queue that only exists while
//! the channel is open, so nothing written before or between connections is
//! ever replayed.
//!
//! # Usage
//!
//! ```ignore
//! let channel = SocketChannel::builder(WsConnector::from_config(&config), credentials)
//!     .dispatcher(dispatcher.clone())
//!     .settings(SocketSettings::from_config(&config))
//!     .build();
//! channel.on(EventKind::NewMessage, |event| { /* ... */ Ok(()) });
//! channel.connect().await;
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::constants::{
    AUTHENTICATE_ACTION, DEFAULT_ROOM, HANDSHAKE_TIMEOUT, JOIN_ROOM_ACTION, SOCKET_BACKOFF_BASE,
    SOCKET_BACKOFF_CAP, SOCKET_MAX_RECONNECT_ATTEMPTS,
};
use crate::credentials::{resolve_token, CredentialProvider};
use crate::dispatcher::{EventDispatcher, SubscriptionId};
use crate::event::{Event, EventKind};

use super::frame::{decode_records, encode_action};
use super::handshake::{negotiate, negotiation_url};
use super::{ChannelCore, ChannelError, ConnectionState, RetryStep};

/// Message read from an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    /// UTF-8 text frame, possibly holding several newline-separated records.
    Text(String),
    /// Server ping; answered with a pong carrying the same payload.
    Ping(Vec<u8>),
    /// Close frame.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of an open socket.
#[async_trait]
pub trait SocketWriter: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: &str) -> Result<(), ChannelError>;
    /// Answer a ping.
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), ChannelError>;
    /// Close the socket. Never fails; errors are logged.
    async fn close(&mut self);
}

/// Read half of an open socket.
#[async_trait]
pub trait SocketReader: Send {
    /// Next message, or `None` once the socket has ended.
    async fn recv(&mut self) -> Option<Result<SocketMessage, ChannelError>>;
}

/// Performs the handshake and opens a socket.
///
/// Each call is a fresh attempt with a fresh session.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Negotiate a session with `token` and open the socket for it.
    async fn connect(
        &self,
        token: &str,
    ) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>), ChannelError>;
}

/// Production connector: HTTP negotiation via reqwest, then a WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    client: reqwest::Client,
    server_url: String,
    path: String,
}

impl WsConnector {
    /// Connector for `{server_url}{path}`.
    #[must_use]
    pub fn new(server_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_url: server_url.into(),
            path: path.into(),
        }
    }

    /// Connector for the server and socket path in `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server_url.clone(), config.socket.path.clone())
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(
        &self,
        token: &str,
    ) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>), ChannelError> {
        let url = negotiation_url(&self.server_url, &self.path);
        let session = negotiate(&self.client, &url, token).await?;

        let ws_url = session.socket_url(&self.server_url, &self.path);
        log::debug!("[Socket] Opening {}", ws_url);

        let bearer = format!("Bearer {token}");
        let (writer, reader) =
            crate::ws::connect(&ws_url, &[("Authorization", bearer.as_str())]).await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

/// Tunables for the socket channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSettings {
    /// Bound on negotiation plus socket open.
    pub handshake_timeout: Duration,
    /// Reconnect delay policy (exponential).
    pub backoff: BackoffPolicy,
    /// Random spread added to each delay, capped by the policy.
    pub jitter: Duration,
    /// Reconnect attempts before the channel gives up.
    pub max_reconnect_attempts: u32,
    /// Room joined after authenticating.
    pub default_room: String,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            backoff: BackoffPolicy::exponential(SOCKET_BACKOFF_BASE, SOCKET_BACKOFF_CAP),
            jitter: Duration::ZERO,
            max_reconnect_attempts: SOCKET_MAX_RECONNECT_ATTEMPTS,
            default_room: DEFAULT_ROOM.to_string(),
        }
    }
}

impl SocketSettings {
    /// Settings from the `socket` section of `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.socket.handshake_timeout(),
            backoff: config.socket.backoff(),
            jitter: config.socket.jitter(),
            max_reconnect_attempts: config.socket.max_reconnect_attempts,
            default_room: config.socket.default_room.clone(),
        }
    }
}

/// The open connection as seen from `send()`.
#[derive(Debug)]
struct Link {
    outbound: mpsc::UnboundedSender<String>,
    authenticated: bool,
}

/// State shared by the handle and its loop task.
struct Shared {
    core: ChannelCore,
    connector: Arc<dyn SocketConnector>,
    credentials: Arc<dyn CredentialProvider>,
    dispatcher: EventDispatcher,
    settings: SocketSettings,
    link: Mutex<Option<Link>>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_authenticated(&self, outbound: &mpsc::UnboundedSender<String>) {
        if let Some(link) = self
            .link()
            .as_mut()
            .filter(|l| l.outbound.same_channel(outbound))
        {
            link.authenticated = true;
        }
    }

    /// Drop the link only if it still belongs to `outbound`'s connection.
    fn release_link(&self, outbound: &mpsc::UnboundedSender<String>) {
        let mut link = self.link();
        if link
            .as_ref()
            .is_some_and(|l| l.outbound.same_channel(outbound))
        {
            *link = None;
        }
    }
}

/// Builder for [`SocketChannel`].
pub struct SocketChannelBuilder {
    connector: Arc<dyn SocketConnector>,
    credentials: Arc<dyn CredentialProvider>,
    dispatcher: Option<EventDispatcher>,
    settings: SocketSettings,
}

impl std::fmt::Debug for SocketChannelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannelBuilder")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SocketChannelBuilder {
    /// Share `dispatcher` instead of creating a private one.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replace the default settings.
    #[must_use]
    pub fn settings(mut self, settings: SocketSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the channel (idle until `connect()`).
    #[must_use]
    pub fn build(self) -> SocketChannel {
        SocketChannel {
            shared: Arc::new(Shared {
                core: ChannelCore::new(),
                connector: self.connector,
                credentials: self.credentials,
                dispatcher: self.dispatcher.unwrap_or_default(),
                settings: self.settings,
                link: Mutex::new(None),
            }),
        }
    }
}

/// Socket channel handle.
///
/// Dropping the handle disconnects.
pub struct SocketChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("state", &self.state())
            .field("attempt_count", &self.attempt_count())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl SocketChannel {
    /// Start building a channel.
    pub fn builder(
        connector: impl SocketConnector + 'static,
        credentials: Arc<dyn CredentialProvider>,
    ) -> SocketChannelBuilder {
        SocketChannelBuilder {
            connector: Arc::new(connector),
            credentials,
            dispatcher: None,
            settings: SocketSettings::default(),
        }
    }

    /// Connect, unless a connection is already starting, open or retrying.
    ///
    /// Without a credential this returns quietly and the state stays as it
    /// was. Otherwise the attempt counter is reset and the connection loop
    /// starts in the background; this call does not wait for it to open.
    pub async fn connect(&self) {
        let shared = &self.shared;
        if !shared.core.begin_connect() {
            log::debug!("[Socket] connect() ignored: already {:?}", shared.core.state());
            return;
        }

        let Some(token) = resolve_token(shared.credentials.as_ref()).await else {
            shared.core.abandon_connect();
            log::debug!("[Socket] No credential, not connecting");
            return;
        };

        shared.core.reset_attempts();
        let Some(cancel) = shared.core.arm(ConnectionState::Handshaking) else {
            log::debug!("[Socket] Disconnected while fetching credential");
            return;
        };

        tokio::spawn(run_connection_loop(Arc::clone(shared), token, cancel));
    }

    /// Tear down the connection and cancel any pending retry.
    ///
    /// Idempotent, synchronous, and safe to call from an event handler.
    pub fn disconnect(&self) {
        let previous = self.shared.core.shutdown();
        *self.shared.link() = None;
        if previous != ConnectionState::Closed {
            log::info!("[Socket] Disconnected (was {:?})", previous);
        }
    }

    /// Subscribe to events of `kind` on this channel's dispatcher.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(kind, handler)
    }

    /// Remove a subscription made with [`Self::on`].
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(id)
    }

    /// Send `[action, data]` if open. Returns `false` (and drops it) otherwise.
    pub fn send(&self, action: &str, data: &Value) -> bool {
        let link = self.shared.link();
        let Some(link) = link.as_ref() else {
            log::debug!("[Socket] send('{}') dropped: not connected", action);
            return false;
        };
        link.outbound.send(encode_action(action, data)).is_ok()
    }

    /// True when the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.core.state().is_open()
    }

    /// True once the authentication frame went out on the open socket.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.shared.link().as_ref().is_some_and(|l| l.authenticated)
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

    /// Consecutive failed attempts since the last successful open.
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

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Why [`run_message_loop`] returned.
enum LoopExit {
    /// `disconnect()` was called.
    Shutdown,
    /// The connection was lost; reconnect after backoff.
    Disconnected(ChannelError),
}

async fn run_connection_loop(shared: Arc<Shared>, token: String, cancel: CancellationToken) {
    let settings = &shared.settings;

    loop {
        if !shared.core.transition(&cancel, ConnectionState::Handshaking) {
            return;
        }

        let handshake = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = tokio::time::timeout(settings.handshake_timeout, shared.connector.connect(&token)) => result,
        };

        let failure = match handshake {
            Ok(Ok((writer, reader))) => {
                match run_message_loop(&shared, &cancel, &token, writer, reader).await {
                    LoopExit::Shutdown => return,
                    LoopExit::Disconnected(e) => e,
                }
            }
            Ok(Err(e)) => e,
            Err(_) => ChannelError::HandshakeTimeout(settings.handshake_timeout),
        };

        let attempt = match shared.core.take_attempt(&cancel, settings.max_reconnect_attempts) {
            RetryStep::Retry(attempt) => attempt,
            RetryStep::Exhausted(attempts) => {
                log::error!(
                    "[Socket] {} (last error: {})",
                    ChannelError::RetriesExhausted { attempts },
                    failure
                );
                return;
            }
            RetryStep::Cancelled => return,
        };

        let delay = settings.backoff.jittered_delay(attempt, settings.jitter);
        log::warn!(
            "[Socket] {} (retry {}/{} in {}ms)",
            failure,
            attempt + 1,
            settings.max_reconnect_attempts,
            delay.as_millis()
        );
        if !shared.core.transition(
            &cancel,
            ConnectionState::Reconnecting {
                attempt: attempt + 1,
                next_retry_ms: delay.as_millis() as u64,
            },
        ) {
            return;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("[Socket] Reconnect timer cancelled");
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Authenticate, join, then pump frames until the connection ends.
async fn run_message_loop(
    shared: &Shared,
    cancel: &CancellationToken,
    token: &str,
    mut writer: Box<dyn SocketWriter>,
    mut reader: Box<dyn SocketReader>,
) -> LoopExit {
    if !shared.core.mark_open(cancel) {
        writer.close().await;
        return LoopExit::Shutdown;
    }
    log::info!("[Socket] Connected");

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    *shared.link() = Some(Link {
        outbound: outbound.clone(),
        authenticated: false,
    });

    let exit = match greet(shared, &mut *writer, token, &outbound).await {
        Ok(()) => pump(shared, cancel, &mut *writer, &mut *reader, &mut outbound_rx).await,
        Err(e) => LoopExit::Disconnected(e),
    };

    shared.release_link(&outbound);
    if matches!(exit, LoopExit::Shutdown) {
        writer.close().await;
    }
    exit
}

/// Send the authentication and join frames.
async fn greet(
    shared: &Shared,
    writer: &mut dyn SocketWriter,
    token: &str,
    outbound: &mpsc::UnboundedSender<String>,
) -> Result<(), ChannelError> {
    writer
        .send_text(&encode_action(AUTHENTICATE_ACTION, &json!({ "token": token })))
        .await?;
    shared.mark_authenticated(outbound);

    let room = &shared.settings.default_room;
    writer
        .send_text(&encode_action(JOIN_ROOM_ACTION, &json!({ "room": room })))
        .await?;
    log::debug!("[Socket] Authenticated, joined '{}'", room);
    Ok(())
}

async fn pump(
    shared: &Shared,
    cancel: &CancellationToken,
    writer: &mut dyn SocketWriter,
    reader: &mut dyn SocketReader,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> LoopExit {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => return LoopExit::Shutdown,

            Some(text) = outbound_rx.recv() => {
                if let Err(e) = writer.send_text(&text).await {
                    return LoopExit::Disconnected(e);
                }
            }

            msg = reader.recv() => match msg {
                Some(Ok(SocketMessage::Text(text))) => {
                    for event in decode_records(&text) {
                        // A handler may have called disconnect().
                        if cancel.is_cancelled() {
                            return LoopExit::Shutdown;
                        }
                        shared.dispatcher.dispatch(&event);
                    }
                }
                Some(Ok(SocketMessage::Ping(payload))) => {
                    if let Err(e) = writer.send_pong(payload).await {
                        return LoopExit::Disconnected(e);
                    }
                }
                Some(Ok(SocketMessage::Close { code, reason })) => {
                    return LoopExit::Disconnected(ChannelError::Transport(format!(
                        "closed by server ({code}) {reason}"
                    )));
                }
                Some(Err(e)) => return LoopExit::Disconnected(e),
                None => {
                    return LoopExit::Disconnected(ChannelError::Transport(
                        "socket ended".to_string(),
                    ));
                }
            },
        }
    }
}
