use bytes::Bytes;
use converse_core::{
    AtomicSocketState, ChannelKind, ConnectionId, HandshakeGuard, OutboundMessage, SocketState,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, trace};

/// Credentials attached to the upgrade request as an `Authorization` header.
#[derive(Debug, Clone)]
pub enum ChannelAuth {
    /// `Authorization: Token <key>`
    Token(SecretString),
    /// `Authorization: Bearer <token>`
    Bearer(SecretString),
}

impl ChannelAuth {
    pub(crate) fn header_value(&self) -> String {
        match self {
            ChannelAuth::Token(key) => format!("Token {}", key.expose_secret()),
            ChannelAuth::Bearer(token) => format!("Bearer {}", token.expose_secret()),
        }
    }
}

/// Outbound frame handed to [`ChannelConnection::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

impl From<OutboundFrame> for WsMessage {
    fn from(frame: OutboundFrame) -> Self {
        match frame {
            OutboundFrame::Text(text) => WsMessage::Text(text.into()),
            OutboundFrame::Binary(bytes) => WsMessage::Binary(bytes),
        }
    }
}

/// One physical WebSocket connection.
///
/// Created by the socket task each time a connection opens. Holders may
/// outlive the connection; once it closes every send returns `false`.
#[derive(Debug)]
pub struct ChannelConnection {
    id: ConnectionId,
    kind: ChannelKind,
    state: AtomicSocketState,
    requires_handshake: bool,
    handshake: HandshakeGuard,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

impl ChannelConnection {
    pub(crate) fn new(
        id: ConnectionId,
        kind: ChannelKind,
        requires_handshake: bool,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> Self {
        Self {
            id,
            kind,
            state: AtomicSocketState::new(SocketState::Open),
            requires_handshake,
            handshake: HandshakeGuard::new(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> SocketState {
        self.state.load()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.state.store(state);
    }

    /// Queues a frame for the writer. Returns `false` without queueing when
    /// the connection is not open. Never waits.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        if !self.is_open() {
            trace!(channel = %self.kind, connection = %self.id, "send on closed connection dropped");
            return false;
        }
        self.outbound.send(frame.into()).is_ok()
    }

    pub fn send_message(&self, message: &OutboundMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send(OutboundFrame::Text(json)),
            Err(e) => {
                error!(error = ?e, message_type = message.message_type(), "failed to serialize outbound message");
                false
            }
        }
    }

    pub fn send_audio(&self, audio: Bytes) -> bool {
        self.send(OutboundFrame::Binary(audio))
    }

    /// Sends `settings` unless a handshake already went out on this
    /// connection. Returns `true` only when this call sent it.
    pub fn try_send_handshake(&self, settings: &OutboundMessage) -> bool {
        let sent = self.handshake.try_send(|| self.send_message(settings));
        if sent {
            info!(channel = %self.kind, connection = %self.id, "handshake sent");
        }
        sent
    }

    /// Sends `settings` again on this connection, bypassing the once-only
    /// gate. Only for explicit caller requests.
    pub fn resend_handshake(&self, settings: &OutboundMessage) -> bool {
        if !self.handshake.is_sent() {
            return self.try_send_handshake(settings);
        }
        info!(channel = %self.kind, connection = %self.id, "re-sending handshake on request");
        self.send_message(settings)
    }

    pub fn handshake_sent(&self) -> bool {
        self.handshake.is_sent()
    }

    pub fn handshake_acked(&self) -> bool {
        self.handshake.is_acked()
    }

    pub fn mark_handshake_acked(&self) {
        debug!(channel = %self.kind, connection = %self.id, "handshake acknowledged");
        self.handshake.mark_acked();
    }

    /// Channels without a handshake may keep alive as soon as they open.
    pub fn keepalive_permitted(&self) -> bool {
        self.is_open() && (!self.requires_handshake || self.handshake.is_sent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converse_core::ConnectionIds;
    use serde_json::Map;

    fn connection(requires_handshake: bool) -> (ChannelConnection, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = ConnectionIds::default();
        (
            ChannelConnection::new(ids.next(), ChannelKind::Agent, requires_handshake, tx),
            rx,
        )
    }

    fn settings() -> OutboundMessage {
        OutboundMessage::Settings(converse_core::SettingsPayload {
            config: Map::new(),
            context: None,
        })
    }

    #[test]
    fn test_send_requires_open() {
        let (conn, mut rx) = connection(true);
        assert!(conn.send(OutboundFrame::Text("{}".into())));
        conn.set_state(SocketState::Closing);
        assert!(!conn.send(OutboundFrame::Text("{}".into())));
        conn.set_state(SocketState::Closed);
        assert!(!conn.send_audio(Bytes::from_static(b"\x00\x01")));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handshake_goes_out_once() {
        let (conn, mut rx) = connection(true);
        assert!(conn.try_send_handshake(&settings()));
        assert!(!conn.try_send_handshake(&settings()));

        assert_eq!(
            rx.try_recv().unwrap(),
            WsMessage::Text(r#"{"type":"Settings"}"#.into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handshake_on_closed_connection_rolls_back() {
        let (conn, _rx) = connection(true);
        conn.set_state(SocketState::Closed);
        assert!(!conn.try_send_handshake(&settings()));
        assert!(!conn.handshake_sent());
    }

    #[test]
    fn test_keepalive_waits_for_handshake() {
        let (conn, _rx) = connection(true);
        assert!(!conn.keepalive_permitted());
        conn.try_send_handshake(&settings());
        assert!(conn.keepalive_permitted());

        let (plain, _rx) = connection(false);
        assert!(plain.keepalive_permitted());
    }

    #[test]
    fn test_explicit_resend_bypasses_gate() {
        let (conn, mut rx) = connection(true);
        assert!(conn.try_send_handshake(&settings()));
        assert!(conn.resend_handshake(&settings()));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_auth_header_values() {
        let token = ChannelAuth::Token(SecretString::from("abc".to_string()));
        let bearer = ChannelAuth::Bearer(SecretString::from("xyz".to_string()));
        assert_eq!(token.header_value(), "Token abc");
        assert_eq!(bearer.header_value(), "Bearer xyz");
        assert!(!format!("{token:?}").contains("abc"));
    }
}
