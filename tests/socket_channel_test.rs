//! Socket channel lifecycle tests against an in-memory connector.
//!
//! Time is paused, so backoff timers complete instantly but still in order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chatwire::channel::{
    ChannelError, ConnectionState, SocketChannel, SocketConnector, SocketMessage, SocketReader,
    SocketSettings, SocketWriter,
};
use chatwire::credentials::StaticCredentials;
use chatwire::event::EventKind;
use serde_json::json;
use tokio::sync::{mpsc, watch};

/// What the next connect attempt does.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Accept,
    Refuse,
    Hang,
}

/// Frames the client wrote.
#[derive(Debug, PartialEq)]
enum Frame {
    Text(String),
    Pong(Vec<u8>),
    Close,
}

/// Server side of one accepted connection.
struct ServerConn {
    frames: mpsc::UnboundedReceiver<Frame>,
    push: mpsc::UnboundedSender<SocketMessage>,
}

impl ServerConn {
    async fn next_text(&mut self) -> String {
        match tokio::time::timeout(Duration::from_secs(30), self.frames.recv()).await {
            Ok(Some(Frame::Text(text))) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn push_text(&self, text: &str) {
        self.push.send(SocketMessage::Text(text.to_string())).unwrap();
    }
}

#[derive(Clone)]
struct FakeConnector {
    script: Arc<Mutex<VecDeque<Outcome>>>,
    attempts: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    conns: mpsc::UnboundedSender<ServerConn>,
}

impl FakeConnector {
    fn new(script: &[Outcome]) -> (Self, mpsc::UnboundedReceiver<ServerConn>) {
        let (conns, conns_rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(script.iter().copied().collect())),
            attempts: Arc::new(AtomicUsize::new(0)),
            tokens: Arc::new(Mutex::new(Vec::new())),
            conns,
        };
        (connector, conns_rx)
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn push_outcome(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }
}

struct FakeWriter(mpsc::UnboundedSender<Frame>);

#[async_trait]
impl SocketWriter for FakeWriter {
    async fn send_text(&mut self, text: &str) -> Result<(), ChannelError> {
        self.0
            .send(Frame::Text(text.to_string()))
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.0
            .send(Frame::Pong(payload))
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Frame::Close);
    }
}

struct FakeReader(mpsc::UnboundedReceiver<SocketMessage>);

#[async_trait]
impl SocketReader for FakeReader {
    async fn recv(&mut self) -> Option<Result<SocketMessage, ChannelError>> {
        self.0.recv().await.map(Ok)
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(
        &self,
        token: &str,
    ) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.to_string());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Refuse);

        match outcome {
            Outcome::Refuse => Err(ChannelError::ConnectionFailed("refused".to_string())),
            Outcome::Hang => std::future::pending().await,
            Outcome::Accept => {
                let (frames_tx, frames) = mpsc::unbounded_channel();
                let (push, push_rx) = mpsc::unbounded_channel();
                self.conns.send(ServerConn { frames, push }).unwrap();
                Ok((Box::new(FakeWriter(frames_tx)), Box::new(FakeReader(push_rx))))
            }
        }
    }
}

fn channel(connector: &FakeConnector) -> SocketChannel {
    SocketChannel::builder(connector.clone(), Arc::new(StaticCredentials::new("tok")))
        .settings(SocketSettings::default())
        .build()
}

async fn wait_for(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for state")
        .expect("state sender dropped")
        .clone()
}

async fn open_connection(
    channel: &SocketChannel,
    conns: &mut mpsc::UnboundedReceiver<ServerConn>,
) -> ServerConn {
    let mut state = channel.watch_state();
    channel.connect().await;
    let mut conn = conns.recv().await.unwrap();
    wait_for(&mut state, ConnectionState::is_open).await;
    // Auth and join frames.
    conn.next_text().await;
    conn.next_text().await;
    conn
}

#[tokio::test(start_paused = true)]
async fn test_missing_credential_is_silent_noop() {
    let (connector, _conns) = FakeConnector::new(&[Outcome::Accept]);
    let channel = SocketChannel::builder(connector.clone(), Arc::new(StaticCredentials::none()))
        .build();

    channel.connect().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(channel.state(), ConnectionState::Idle);
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_sends_auth_then_join() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();

    channel.connect().await;
    let mut conn = conns.recv().await.unwrap();
    wait_for(&mut state, ConnectionState::is_open).await;

    let auth: serde_json::Value = serde_json::from_str(&conn.next_text().await).unwrap();
    assert_eq!(auth, json!(["authenticate", {"token": "tok"}]));
    let join: serde_json::Value = serde_json::from_str(&conn.next_text().await).unwrap();
    assert_eq!(join, json!(["join_room", {"room": "lobby"}]));

    assert!(channel.is_connected());
    assert!(channel.is_authenticated());
    assert_eq!(channel.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_frames_dispatched_in_order() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept]);
    let channel = channel(&connector);
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    for kind in [EventKind::NewMessage, EventKind::Typing, EventKind::Reaction] {
        let seen_tx = seen_tx.clone();
        channel.on(kind, move |event| {
            seen_tx.send((event.kind, event.payload.clone()))?;
            Ok(())
        });
    }

    let conn = open_connection(&channel, &mut conns).await;
    conn.push_text("[\"new_message\",{\"id\":1}]\n{bad json\n[\"unknown_kind\",{}]\n{\"type\":\"typing\",\"data\":{\"user\":\"a\"}}");
    conn.push_text("[\"reaction\",\"fire\",\"u1\"]");

    assert_eq!(seen.recv().await.unwrap(), (EventKind::NewMessage, json!({"id": 1})));
    assert_eq!(seen.recv().await.unwrap(), (EventKind::Typing, json!({"user": "a"})));
    assert_eq!(seen.recv().await.unwrap(), (EventKind::Reaction, json!(["fire", "u1"])));
    assert!(channel.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_ping_is_answered_with_pong() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept]);
    let channel = channel(&connector);
    let mut conn = open_connection(&channel, &mut conns).await;

    conn.push.send(SocketMessage::Ping(vec![1, 2, 3])).unwrap();
    assert_eq!(conn.frames.recv().await, Some(Frame::Pong(vec![1, 2, 3])));
}

#[tokio::test(start_paused = true)]
async fn test_send_only_while_open() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept]);
    let channel = channel(&connector);

    assert!(!channel.send("react_to_item", &json!({"item": 1})));

    let mut conn = open_connection(&channel, &mut conns).await;
    assert!(channel.send("react_to_item", &json!({"item": 1})));
    let sent: serde_json::Value = serde_json::from_str(&conn.next_text().await).unwrap();
    assert_eq!(sent, json!(["react_to_item", {"item": 1}]));

    channel.disconnect();
    assert!(!channel.send("react_to_item", &json!({"item": 2})));
    assert!(!channel.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_open_is_noop() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept, Outcome::Accept]);
    let channel = channel(&connector);
    let _conn = open_connection(&channel, &mut conns).await;

    channel.connect().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(connector.attempts(), 1);
    assert!(channel.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_drop_schedules_exactly_one_retry_and_reopens() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept, Outcome::Accept]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();
    let conn = open_connection(&channel, &mut conns).await;

    // Server goes away.
    drop(conn);

    let reconnecting = wait_for(&mut state, ConnectionState::is_reconnecting).await;
    assert_eq!(
        reconnecting,
        ConnectionState::Reconnecting {
            attempt: 1,
            next_retry_ms: 1000
        }
    );
    assert!(!channel.is_authenticated());

    let _conn = conns.recv().await.unwrap();
    wait_for(&mut state, ConnectionState::is_open).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(channel.attempt_count(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_frame_triggers_reconnect() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept, Outcome::Accept]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();
    let conn = open_connection(&channel, &mut conns).await;

    conn.push
        .send(SocketMessage::Close {
            code: 1001,
            reason: "going away".to_string(),
        })
        .unwrap();

    wait_for(&mut state, ConnectionState::is_reconnecting).await;
    let _conn = conns.recv().await.unwrap();
    wait_for(&mut state, ConnectionState::is_open).await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_are_exponential_and_capped() {
    let (connector, _conns) = FakeConnector::new(&[]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();

    channel.connect().await;

    let mut delays = Vec::new();
    loop {
        state.changed().await.unwrap();
        match *state.borrow_and_update() {
            ConnectionState::Reconnecting { next_retry_ms, .. } => delays.push(next_retry_ms),
            ConnectionState::Exhausted { .. } => break,
            _ => {}
        }
    }

    assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_stops_then_connect_starts_over() {
    let (connector, _conns) = FakeConnector::new(&[]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();

    channel.connect().await;
    let exhausted = wait_for(&mut state, |s| matches!(s, ConnectionState::Exhausted { .. })).await;
    assert_eq!(exhausted, ConnectionState::Exhausted { attempts: 5 });
    assert_eq!(connector.attempts(), 6);

    // Nothing further is scheduled.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 6);
    assert!(exhausted.is_reconnecting());

    channel.connect().await;
    wait_for(&mut state, |s| matches!(s, ConnectionState::Exhausted { .. })).await;
    assert_eq!(connector.attempts(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_leads_to_reconnect() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Hang, Outcome::Accept]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();

    channel.connect().await;
    wait_for(&mut state, ConnectionState::is_reconnecting).await;
    assert_eq!(connector.attempts(), 1);

    let _conn = conns.recv().await.unwrap();
    wait_for(&mut state, ConnectionState::is_open).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_cancels_retry() {
    let (connector, _conns) = FakeConnector::new(&[Outcome::Refuse]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();

    channel.connect().await;
    wait_for(&mut state, ConnectionState::is_reconnecting).await;

    channel.disconnect();
    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(channel.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_from_inside_handler() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept, Outcome::Accept]);
    let channel = Arc::new(channel(&connector));
    let calls = Arc::new(AtomicUsize::new(0));

    let weak: Weak<SocketChannel> = Arc::downgrade(&channel);
    let c = Arc::clone(&calls);
    channel.on(EventKind::Notification, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = weak.upgrade() {
            channel.disconnect();
        }
        Ok(())
    });

    let mut conn = open_connection(&channel, &mut conns).await;
    conn.push_text("[\"notification\",1]\n[\"notification\",2]");

    assert_eq!(conn.frames.recv().await, Some(Frame::Close));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_token_fetched_once_per_connect() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Refuse, Outcome::Accept]);
    let channel = channel(&connector);
    let mut state = channel.watch_state();

    channel.connect().await;
    let _conn = conns.recv().await.unwrap();
    wait_for(&mut state, ConnectionState::is_open).await;

    assert_eq!(*connector.tokens.lock().unwrap(), vec!["tok", "tok"]);
}

#[tokio::test(start_paused = true)]
async fn test_drop_disconnects() {
    let (connector, mut conns) = FakeConnector::new(&[Outcome::Accept]);
    let channel = channel(&connector);
    let mut conn = open_connection(&channel, &mut conns).await;
    connector.push_outcome(Outcome::Accept);

    drop(channel);

    assert_eq!(conn.frames.recv().await, Some(Frame::Close));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
}
