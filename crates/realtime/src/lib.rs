//! WebSocket transport for voice-agent channels.
//!
//! A [`ChannelSocket`] owns one logical channel (transcription or agent) and
//! reconnects it as needed. Every physical connection is exposed as an
//! [`Arc<ChannelConnection>`](ChannelConnection) carrying its own handshake
//! state and a non-blocking `send`.

pub mod connection;
pub mod error;
pub mod reconnect;
pub mod socket;

pub use connection::{ChannelAuth, ChannelConnection, OutboundFrame};
pub use error::ChannelError;
pub use reconnect::ReconnectPolicy;
pub use socket::{
    ChannelEvent, ChannelSocket, ChannelSpec, CloseReason, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_KEEPALIVE_INTERVAL,
};
