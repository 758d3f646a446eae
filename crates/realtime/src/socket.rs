//! A logical channel that outlives its physical WebSocket connections.
//!
//! [`ChannelSocket::open`] connects once and then hands the socket to a
//! background task that:
//!
//! - classifies inbound frames into control, passthrough or audio
//! - drains the current connection's outbound queue
//! - sends keepalives once the connection's handshake is out
//! - reconnects with backoff after an unexpected close
//!
//! Each physical connection is surfaced as a new [`ChannelConnection`] via
//! [`ChannelEvent::Connected`], so per-connection state such as the
//! handshake flag starts fresh after every reconnect.

use crate::connection::{ChannelAuth, ChannelConnection};
use crate::error::ChannelError;
use crate::reconnect::ReconnectPolicy;
use converse_core::{
    ChannelKind, Classified, ConnectionId, ConnectionIds, OutboundMessage, SocketState,
    classify_binary, classify_text,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, error, info, info_span, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(3);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Endpoint and behaviour of one channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub kind: ChannelKind,
    pub url: String,
    pub auth: Option<ChannelAuth>,
    /// Periodic `KeepAlive` messages. `None` sends none.
    pub keepalive_interval: Option<Duration>,
    /// Whether keepalives must wait for a handshake on each connection.
    pub requires_handshake: bool,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Id source for every physical connection opened from this spec.
    /// Clones share it, so sockets opened from clones never repeat an id.
    pub connection_ids: Arc<ConnectionIds>,
}

impl ChannelSpec {
    pub fn new(kind: ChannelKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            auth: None,
            keepalive_interval: None,
            requires_handshake: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            connection_ids: Arc::default(),
        }
    }

    /// Agent channel defaults: handshake required, keepalive every 8s.
    pub fn agent(url: impl Into<String>) -> Self {
        Self {
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            requires_handshake: true,
            ..Self::new(ChannelKind::Agent, url)
        }
    }

    pub fn transcription(url: impl Into<String>) -> Self {
        Self::new(ChannelKind::Transcription, url)
    }

    pub fn with_auth(mut self, auth: ChannelAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connection_ids(mut self, ids: Arc<ConnectionIds>) -> Self {
        self.connection_ids = ids;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`ChannelSocket::close`] was called or the socket was dropped.
    Requested,
    ServerClosed { code: Option<u16>, reason: String },
    Transport(String),
}

#[derive(Debug)]
pub enum ChannelEvent {
    StateChanged(SocketState),
    /// A new physical connection is open.
    Connected(Arc<ChannelConnection>),
    Frame {
        connection: ConnectionId,
        frame: Classified,
    },
    Disconnected {
        connection: ConnectionId,
        reason: CloseReason,
        reconnecting: bool,
    },
    /// Reconnection stopped for good.
    GaveUp { attempts: u32, error: String },
}

/// Handle to a running channel. Dropping it closes the channel.
#[derive(Debug)]
pub struct ChannelSocket {
    kind: ChannelKind,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Link {
    ws: WsStream,
    connection: Arc<ChannelConnection>,
    outbound: mpsc::UnboundedReceiver<WsMessage>,
}

enum ConnectionEnd {
    Shutdown,
    Lost(CloseReason),
}

impl ChannelSocket {
    /// Resolves once the first physical connection is open. The first
    /// events on the returned receiver are `StateChanged(Connecting)`,
    /// `StateChanged(Open)` and `Connected`.
    pub async fn open(
        spec: ChannelSpec,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let ids = spec.connection_ids.clone();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let _ = events_tx.try_send(ChannelEvent::StateChanged(SocketState::Connecting));

        let link = connect(&spec, ids.next()).await?;
        info!(channel = %spec.kind, connection = %link.connection.id(), url = %spec.url, "channel connected");
        let _ = events_tx.try_send(ChannelEvent::StateChanged(SocketState::Open));
        let _ = events_tx.try_send(ChannelEvent::Connected(link.connection.clone()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let kind = spec.kind;
        let span = info_span!("channel", channel = %kind);
        let task = tokio::spawn(run(spec, ids, link, events_tx, shutdown_rx).instrument(span));

        Ok((
            Self {
                kind,
                shutdown,
                task,
            },
            events_rx,
        ))
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Closes the current connection and stops reconnecting. The receiver
    /// still gets the closing events before it ends.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ChannelSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    spec: ChannelSpec,
    ids: Arc<ConnectionIds>,
    mut link: Link,
    events: mpsc::Sender<ChannelEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let id = link.connection.id();
        match drive(&spec, link, &events, &mut shutdown).await {
            ConnectionEnd::Shutdown => {
                info!(connection = %id, "channel closed");
                let _ = events.send(ChannelEvent::StateChanged(SocketState::Closed)).await;
                let _ = events
                    .send(ChannelEvent::Disconnected {
                        connection: id,
                        reason: CloseReason::Requested,
                        reconnecting: false,
                    })
                    .await;
                return;
            }
            ConnectionEnd::Lost(reason) => {
                let reconnecting = spec.reconnect.enabled && !events.is_closed();
                warn!(connection = %id, ?reason, reconnecting, "connection lost");
                let _ = events.send(ChannelEvent::StateChanged(SocketState::Closed)).await;
                let _ = events
                    .send(ChannelEvent::Disconnected {
                        connection: id,
                        reason,
                        reconnecting,
                    })
                    .await;
                if !reconnecting {
                    return;
                }
                let Some(next) = reconnect(&spec, &ids, &events, &mut shutdown).await else {
                    return;
                };
                info!(connection = %next.connection.id(), "channel reconnected");
                let _ = events.send(ChannelEvent::StateChanged(SocketState::Open)).await;
                let _ = events
                    .send(ChannelEvent::Connected(next.connection.clone()))
                    .await;
                link = next;
            }
        }
    }
}

/// Pumps one physical connection until it ends.
async fn drive(
    spec: &ChannelSpec,
    link: Link,
    events: &mpsc::Sender<ChannelEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let Link {
        ws,
        connection,
        mut outbound,
    } = link;
    let id = connection.id();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut keepalive = spec.keepalive_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let end = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    connection.set_state(SocketState::Closing);
                    let _ = events.send(ChannelEvent::StateChanged(SocketState::Closing)).await;
                    let _ = tokio::time::timeout(WS_SEND_TIMEOUT, ws_tx.send(WsMessage::Close(None))).await;
                    break ConnectionEnd::Shutdown;
                }
            }
            queued = outbound.recv() => {
                let Some(message) = queued else {
                    break ConnectionEnd::Lost(CloseReason::Transport("outbound queue closed".into()));
                };
                if let Err(reason) = write(&mut ws_tx, message).await {
                    break ConnectionEnd::Lost(reason);
                }
            }
            _ = tick(keepalive.as_mut()) => {
                if !connection.keepalive_permitted() {
                    debug!(connection = %id, "keepalive held until handshake is sent");
                    continue;
                }
                match OutboundMessage::KeepAlive.to_json() {
                    Ok(json) => {
                        if let Err(reason) = write(&mut ws_tx, WsMessage::Text(json.into())).await {
                            break ConnectionEnd::Lost(reason);
                        }
                    }
                    Err(e) => error!(error = ?e, "failed to serialize keepalive"),
                }
            }
            incoming = ws_rx.next() => {
                let frame = match incoming {
                    Some(Ok(WsMessage::Text(text))) => classify_text(text.as_str()),
                    Some(Ok(WsMessage::Binary(payload))) => classify_binary(payload),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if let Err(reason) = write(&mut ws_tx, WsMessage::Pong(payload)).await {
                            break ConnectionEnd::Lost(reason);
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        break ConnectionEnd::Lost(CloseReason::ServerClosed { code, reason });
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break ConnectionEnd::Lost(CloseReason::Transport(e.to_string())),
                    None => break ConnectionEnd::Lost(CloseReason::Transport("stream ended".into())),
                };
                if events.send(ChannelEvent::Frame { connection: id, frame }).await.is_err() {
                    debug!(connection = %id, "event receiver dropped, closing channel");
                    break ConnectionEnd::Shutdown;
                }
            }
        }
    };
    connection.set_state(SocketState::Closed);
    end
}

async fn reconnect(
    spec: &ChannelSpec,
    ids: &ConnectionIds,
    events: &mpsc::Sender<ChannelEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Link> {
    let mut attempts = 0u32;
    let mut last_error = String::from("reconnect disabled");
    while spec.reconnect.should_retry(attempts + 1) {
        attempts += 1;
        let delay = spec.reconnect.delay_for(attempts);
        info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        let _ = events.send(ChannelEvent::StateChanged(SocketState::Connecting)).await;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = events.send(ChannelEvent::StateChanged(SocketState::Closed)).await;
                    return None;
                }
            }
        }

        match connect(spec, ids.next()).await {
            Ok(link) => return Some(link),
            Err(e) if e.is_permanent() => {
                error!(attempt = attempts, error = %e, "reconnect rejected permanently");
                last_error = e.to_string();
                break;
            }
            Err(e) => {
                warn!(attempt = attempts, error = %e, "reconnect attempt failed");
                last_error = e.to_string();
            }
        }
    }
    let _ = events.send(ChannelEvent::StateChanged(SocketState::Closed)).await;
    let _ = events
        .send(ChannelEvent::GaveUp {
            attempts,
            error: last_error,
        })
        .await;
    None
}

async fn connect(spec: &ChannelSpec, id: ConnectionId) -> Result<Link, ChannelError> {
    let request = build_request(spec)?;
    let (ws, response) = tokio::time::timeout(spec.connect_timeout, connect_async(request))
        .await
        .map_err(|_| ChannelError::ConnectTimeout(spec.url.clone()))?
        .map_err(ChannelError::from_connect)?;
    debug!(status = %response.status(), connection = %id, "websocket upgrade complete");

    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let connection = Arc::new(ChannelConnection::new(
        id,
        spec.kind,
        spec.requires_handshake,
        outbound_tx,
    ));
    Ok(Link {
        ws,
        connection,
        outbound,
    })
}

fn build_request(spec: &ChannelSpec) -> Result<Request, ChannelError> {
    let invalid = |reason: String| ChannelError::InvalidRequest {
        url: spec.url.clone(),
        reason,
    };
    let mut request = spec
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| invalid(e.to_string()))?;
    if let Some(auth) = &spec.auth {
        let mut value =
            HeaderValue::from_str(&auth.header_value()).map_err(|e| invalid(e.to_string()))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

async fn write(
    ws_tx: &mut SplitSink<WsStream, WsMessage>,
    message: WsMessage,
) -> Result<(), CloseReason> {
    match tokio::time::timeout(WS_SEND_TIMEOUT, ws_tx.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CloseReason::Transport(e.to_string())),
        Err(_) => Err(CloseReason::Transport("websocket send timed out".into())),
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use converse_core::{InboundMessage, SettingsPayload};
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(3);

    enum ServerAction {
        Send(WsMessage),
        Close,
    }

    struct ServerConn {
        inbound: mpsc::UnboundedReceiver<WsMessage>,
        actions: mpsc::UnboundedSender<ServerAction>,
    }

    impl ServerConn {
        fn send_text(&self, value: Value) {
            let _ = self
                .actions
                .send(ServerAction::Send(WsMessage::Text(value.to_string().into())));
        }

        fn send_binary(&self, payload: &'static [u8]) {
            let _ = self
                .actions
                .send(ServerAction::Send(WsMessage::Binary(Bytes::from_static(payload))));
        }

        fn close(&self) {
            let _ = self.actions.send(ServerAction::Close);
        }

        async fn next_json(&mut self) -> Value {
            loop {
                let msg = tokio::time::timeout(WAIT, self.inbound.recv())
                    .await
                    .expect("server timed out waiting for a frame")
                    .expect("client connection ended");
                if let WsMessage::Text(text) = msg {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
            }
        }
    }

    async fn spawn_server() -> (String, mpsc::UnboundedReceiver<ServerConn>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (conns_tx, conns_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                let (mut sink, mut source) = ws.split();
                let (in_tx, inbound) = mpsc::unbounded_channel();
                let (actions, mut actions_rx) = mpsc::unbounded_channel();
                if conns_tx.send(ServerConn { inbound, actions }).is_err() {
                    break;
                }
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = source.next() => match msg {
                                Some(Ok(msg)) => { let _ = in_tx.send(msg); }
                                _ => break,
                            },
                            action = actions_rx.recv() => match action {
                                Some(ServerAction::Send(msg)) => {
                                    if sink.send(msg).await.is_err() { break; }
                                }
                                Some(ServerAction::Close) | None => {
                                    let _ = sink.send(WsMessage::Close(None)).await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        (url, conns_rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a channel event")
            .expect("channel event stream ended")
    }

    async fn next_connected(rx: &mut mpsc::Receiver<ChannelEvent>) -> Arc<ChannelConnection> {
        loop {
            if let ChannelEvent::Connected(conn) = next_event(rx).await {
                return conn;
            }
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ChannelEvent>) -> Classified {
        loop {
            if let ChannelEvent::Frame { frame, .. } = next_event(rx).await {
                return frame;
            }
        }
    }

    async fn accept(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
        tokio::time::timeout(WAIT, conns.recv())
            .await
            .expect("no client connected")
            .expect("server stopped")
    }

    fn settings() -> OutboundMessage {
        OutboundMessage::Settings(SettingsPayload::default())
    }

    fn fast_reconnect() -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn test_open_emits_initial_events() {
        let (url, mut conns) = spawn_server().await;
        let (_socket, mut rx) = ChannelSocket::open(ChannelSpec::transcription(url))
            .await
            .unwrap();
        let _server = accept(&mut conns).await;

        assert!(matches!(
            next_event(&mut rx).await,
            ChannelEvent::StateChanged(SocketState::Connecting)
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ChannelEvent::StateChanged(SocketState::Open)
        ));
        match next_event(&mut rx).await {
            ChannelEvent::Connected(conn) => {
                assert_eq!(conn.kind(), ChannelKind::Transcription);
                assert!(conn.is_open());
                assert!(!conn.handshake_sent());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_frames_are_classified() {
        let (url, mut conns) = spawn_server().await;
        let (_socket, mut rx) = ChannelSocket::open(ChannelSpec::agent(url)).await.unwrap();
        let server = accept(&mut conns).await;

        server.send_text(json!({ "type": "AgentThinking" }));
        server.send_binary(br#"{"type":"UserStartedSpeaking"}"#);
        server.send_binary(b"\x01\x02\x03\x04");
        server.send_text(json!({ "type": "History", "content": "hi" }));

        assert_eq!(
            next_frame(&mut rx).await,
            Classified::Control(InboundMessage::AgentThinking { content: None })
        );
        assert_eq!(
            next_frame(&mut rx).await,
            Classified::Control(InboundMessage::UserStartedSpeaking)
        );
        assert_eq!(
            next_frame(&mut rx).await,
            Classified::Audio(Bytes::from_static(b"\x01\x02\x03\x04"))
        );
        assert_eq!(
            next_frame(&mut rx).await,
            Classified::Passthrough(json!({ "type": "History", "content": "hi" }))
        );
    }

    #[tokio::test]
    async fn test_outbound_audio_and_messages_reach_server() {
        let (url, mut conns) = spawn_server().await;
        let (_socket, mut rx) = ChannelSocket::open(ChannelSpec::transcription(url))
            .await
            .unwrap();
        let mut server = accept(&mut conns).await;
        let conn = next_connected(&mut rx).await;

        assert!(conn.send_audio(Bytes::from_static(b"pcm")));
        assert!(conn.send_message(&OutboundMessage::InjectUserMessage {
            content: "hello".into()
        }));

        let audio = tokio::time::timeout(WAIT, server.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(audio, WsMessage::Binary(Bytes::from_static(b"pcm")));
        assert_eq!(
            server.next_json().await,
            json!({ "type": "InjectUserMessage", "content": "hello" })
        );
    }

    #[tokio::test]
    async fn test_keepalive_waits_for_handshake() {
        let (url, mut conns) = spawn_server().await;
        let spec = ChannelSpec::agent(url).with_keepalive(Some(Duration::from_millis(40)));
        let (_socket, mut rx) = ChannelSocket::open(spec).await.unwrap();
        let mut server = accept(&mut conns).await;
        let conn = next_connected(&mut rx).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(server.inbound.try_recv().is_err(), "keepalive sent before handshake");

        assert!(conn.try_send_handshake(&settings()));
        assert_eq!(server.next_json().await["type"], "Settings");
        assert_eq!(server.next_json().await["type"], "KeepAlive");
    }

    #[tokio::test]
    async fn test_concurrent_handshake_attempts_send_once() {
        let (url, mut conns) = spawn_server().await;
        let (_socket, mut rx) = ChannelSocket::open(ChannelSpec::agent(url).with_keepalive(None))
            .await
            .unwrap();
        let mut server = accept(&mut conns).await;
        let conn = next_connected(&mut rx).await;

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.try_send_handshake(&settings()) })
            })
            .collect();
        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        assert_eq!(server.next_json().await["type"], "Settings");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.inbound.try_recv().is_err(), "handshake sent twice");
    }

    #[tokio::test]
    async fn test_reconnect_yields_fresh_connection() {
        let (url, mut conns) = spawn_server().await;
        let spec = ChannelSpec::agent(url)
            .with_keepalive(None)
            .with_reconnect(fast_reconnect());
        let (_socket, mut rx) = ChannelSocket::open(spec).await.unwrap();
        let first_server = accept(&mut conns).await;
        let first = next_connected(&mut rx).await;
        assert!(first.try_send_handshake(&settings()));

        first_server.close();
        loop {
            if let ChannelEvent::Disconnected {
                connection,
                reconnecting,
                ..
            } = next_event(&mut rx).await
            {
                assert_eq!(connection, first.id());
                assert!(reconnecting);
                break;
            }
        }

        let _second_server = accept(&mut conns).await;
        let second = next_connected(&mut rx).await;
        assert_ne!(second.id(), first.id());
        assert!(!second.handshake_sent());
        assert!(first.handshake_sent());
        assert!(!first.send_message(&OutboundMessage::KeepAlive));
        assert!(second.try_send_handshake(&settings()));
    }

    #[tokio::test]
    async fn test_reopened_spec_never_repeats_ids() {
        let (url, mut conns) = spawn_server().await;
        let ids = Arc::new(ConnectionIds::default());
        let agent = ChannelSpec::agent(url.clone())
            .with_keepalive(None)
            .with_connection_ids(ids.clone());
        let transcription = ChannelSpec::transcription(url).with_connection_ids(ids);

        let (first_socket, mut first_rx) = ChannelSocket::open(agent.clone()).await.unwrap();
        let _first_server = accept(&mut conns).await;
        let first = next_connected(&mut first_rx).await;
        first_socket.close();

        let (_second_socket, mut second_rx) = ChannelSocket::open(agent).await.unwrap();
        let _second_server = accept(&mut conns).await;
        let second = next_connected(&mut second_rx).await;

        let (_stt_socket, mut stt_rx) = ChannelSocket::open(transcription).await.unwrap();
        let _stt_server = accept(&mut conns).await;
        let stt = next_connected(&mut stt_rx).await;

        assert_ne!(first.id(), second.id());
        assert_ne!(second.id(), stt.id());
        assert_ne!(first.id(), stt.id());
    }

    #[tokio::test]
    async fn test_close_does_not_reconnect() {
        let (url, mut conns) = spawn_server().await;
        let spec = ChannelSpec::agent(url)
            .with_keepalive(None)
            .with_reconnect(fast_reconnect());
        let (socket, mut rx) = ChannelSocket::open(spec).await.unwrap();
        let _server = accept(&mut conns).await;
        let conn = next_connected(&mut rx).await;

        socket.close();
        let mut saw_closing = false;
        loop {
            match next_event(&mut rx).await {
                ChannelEvent::StateChanged(SocketState::Closing) => saw_closing = true,
                ChannelEvent::Disconnected {
                    reason,
                    reconnecting,
                    ..
                } => {
                    assert_eq!(reason, CloseReason::Requested);
                    assert!(!reconnecting);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_closing);
        assert!(!conn.is_open());
        assert!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().is_none());
        assert!(
            tokio::time::timeout(Duration::from_millis(200), conns.recv())
                .await
                .is_err(),
            "socket reconnected after an explicit close"
        );
    }

    #[tokio::test]
    async fn test_server_close_without_reconnect_ends_stream() {
        let (url, mut conns) = spawn_server().await;
        let spec = ChannelSpec::transcription(url).with_reconnect(ReconnectPolicy::disabled());
        let (_socket, mut rx) = ChannelSocket::open(spec).await.unwrap();
        let server = accept(&mut conns).await;
        next_connected(&mut rx).await;

        server.close();
        loop {
            if let ChannelEvent::Disconnected {
                reason,
                reconnecting,
                ..
            } = next_event(&mut rx).await
            {
                assert!(matches!(reason, CloseReason::ServerClosed { .. }));
                assert!(!reconnecting);
                break;
            }
        }
        assert!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let result = ChannelSocket::open(ChannelSpec::agent(url)).await;
        assert!(matches!(result, Err(ChannelError::Transport(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_is_permanent() {
        let spec = ChannelSpec::agent("not a url").with_auth(ChannelAuth::Token(
            SecretString::from("key".to_string()),
        ));
        let err = ChannelSocket::open(spec).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
