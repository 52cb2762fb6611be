//! Chatwire - realtime transport and reconnection engine for the chat client.
//!
//! Keeps conversation and notification state in sync with the server over
//! two independent channels that both feed one event dispatcher.
//!
//! # Architecture
//!
//! - **SocketChannel** - negotiated WebSocket, bidirectional, exponential backoff
//! - **StreamChannel** - long-lived HTTP event stream, read-only, linear backoff
//! - **EventDispatcher** - typed publish/subscribe shared by both channels
//! - **CredentialProvider** - where bearer tokens come from
//!
//! # Modules
//!
//! - [`channel`] - both channels, framing, handshake, stream decoding
//! - [`dispatcher`] - event subscription registry
//! - [`backoff`] - reconnect delay policies
//! - [`credentials`] - token providers (static, env, OS keyring)
//! - [`config`] - configuration loading/saving

pub mod backoff;
pub mod channel;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod dispatcher;
pub mod event;
pub mod ws;

// Re-export commonly used types
pub use backoff::BackoffPolicy;
pub use channel::{
    ChannelError, ConnectionState, HttpStreamTransport, SocketChannel, SocketSettings,
    StreamChannel, StreamOptions, WsConnector,
};
pub use config::Config;
pub use credentials::{CredentialChain, CredentialProvider, EnvCredentials, KeyringCredentials};
pub use dispatcher::{EventDispatcher, SubscriptionId};
pub use event::{Event, EventKind};
