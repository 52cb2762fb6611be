//! Session negotiation against a real HTTP server.

use std::sync::Arc;
use std::time::Duration;

use chatwire::channel::handshake::negotiation_url;
use chatwire::channel::{
    negotiate, ChannelError, ConnectionState, SocketChannel, SocketConnector, SocketSettings,
    WsConnector,
};
use chatwire::credentials::StaticCredentials;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn server_with_body(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/socket.io/"))
        .and(query_param("EIO", "4"))
        .and(query_param("transport", "polling"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_negotiate_extracts_session_id() {
    let server = server_with_body(
        200,
        r#"0{"sid":"lQ2r-abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000}"#,
    )
    .await;

    let url = negotiation_url(&server.uri(), "/socket.io/");
    let session = negotiate(&reqwest::Client::new(), &url, "tok").await.unwrap();

    assert_eq!(session.session_id, "lQ2r-abc");
    assert_eq!(
        session.socket_url(&server.uri(), "/socket.io/"),
        format!(
            "{}/socket.io/?EIO=4&transport=websocket&sid=lQ2r-abc",
            server.uri().replacen("http://", "ws://", 1)
        )
    );
}

#[tokio::test]
async fn test_negotiate_error_status() {
    let server = server_with_body(503, "maintenance").await;
    let url = negotiation_url(&server.uri(), "/socket.io/");

    let result = negotiate(&reqwest::Client::new(), &url, "tok").await;
    assert_eq!(
        result,
        Err(ChannelError::Negotiation("HTTP 503".to_string()))
    );
}

#[tokio::test]
async fn test_negotiate_body_without_session_id() {
    let server = server_with_body(200, r#"{"upgrades":[]}"#).await;
    let url = negotiation_url(&server.uri(), "/socket.io/");

    let result = negotiate(&reqwest::Client::new(), &url, "tok").await;
    assert!(matches!(result, Err(ChannelError::Negotiation(_))));
}

#[tokio::test]
async fn test_ws_connector_fails_when_upgrade_refused() {
    // Negotiation succeeds, but a plain HTTP server can't upgrade.
    let server = server_with_body(200, r#"{"sid":"s1"}"#).await;
    let connector = WsConnector::new(server.uri(), "/socket.io/");

    let result = connector.connect("tok").await;
    assert!(matches!(result, Err(ChannelError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_socket_channel_retries_after_failed_upgrade() {
    let server = server_with_body(200, r#"{"sid":"s1"}"#).await;
    let channel = SocketChannel::builder(
        WsConnector::new(server.uri(), "/socket.io/"),
        Arc::new(StaticCredentials::new("tok")),
    )
    .settings(SocketSettings {
        handshake_timeout: Duration::from_secs(5),
        ..SocketSettings::default()
    })
    .build();
    let mut state = channel.watch_state();

    channel.connect().await;
    let reconnecting = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(ConnectionState::is_reconnecting),
    )
    .await
    .expect("timed out")
    .expect("state sender dropped")
    .clone();

    assert_eq!(
        reconnecting,
        ConnectionState::Reconnecting {
            attempt: 1,
            next_retry_ms: 1000
        }
    );
    assert!(!channel.is_authenticated());
    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Closed);
}
