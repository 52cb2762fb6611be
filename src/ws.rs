//! WebSocket transport for the socket channel.
//!
//! Thin wrapper around `tokio-tungstenite` that exposes the connection as
//! the [`SocketWriter`]/[`SocketReader`] halves the channel loop drives.
//! Nothing else in the crate touches `tokio-tungstenite` directly.
//!
//! Only the frames the chat protocol uses surface to the channel: text,
//! ping and close. Binary and pong frames are skipped here.

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::channel::{ChannelError, SocketMessage, SocketReader, SocketWriter};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl SocketWriter for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<(), ChannelError> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.sink
            .send(tungstenite::Message::Pong(payload))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        // Best effort: the peer may already be gone.
        if let Err(e) = self.sink.send(tungstenite::Message::Close(None)).await {
            log::debug!("[Socket] Close frame not sent: {}", e);
        }
        if let Err(e) = self.sink.close().await {
            log::debug!("[Socket] Sink close failed: {}", e);
        }
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl SocketReader for WsReader {
    async fn recv(&mut self) -> Option<Result<SocketMessage, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(SocketMessage::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Ping(data)) => {
                    return Some(Ok(SocketMessage::Ping(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(SocketMessage::Close { code, reason }));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    log::trace!("[Socket] Skipping binary frame ({} bytes)", data.len());
                }
                Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_)) => {}
                Err(e) => {
                    return Some(Err(ChannelError::Transport(e.to_string())));
                }
            }
        }
    }
}

/// Open a WebSocket to `url`, sending each `(name, value)` as a request header.
///
/// # Errors
///
/// [`ChannelError::ConnectionFailed`] if the URL or a header is invalid, or
/// the upgrade fails.
pub async fn connect(
    url: &str,
    headers: &[(&str, &str)],
) -> Result<(WsWriter, WsReader), ChannelError> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| ChannelError::ConnectionFailed(format!("invalid URL {url}: {e}")))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ChannelError::ConnectionFailed(format!("header {name}: {e}")))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .map_err(|e| ChannelError::ConnectionFailed(format!("header {name}: {e}")))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to the WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
