//! Runtime-independent building blocks of a voice-agent session.
//!
//! - `protocol`: JSON control messages and their `type` discriminators.
//! - `classify`: text/binary frame classification.
//! - `signal`: activity signals and the server-message mapping onto them.
//! - `tracker`: in-flight function call bookkeeping.
//! - `idle`: the idle-timeout state machine.
//! - `handshake`: per-connection exactly-once handshake gate.
//! - `context`: conversation history carried in the handshake.

pub mod channel;
pub mod classify;
pub mod context;
pub mod handshake;
pub mod idle;
pub mod protocol;
pub mod signal;
pub mod tracker;

pub use channel::{AtomicSocketState, ChannelKind, ConnectionId, ConnectionIds, SocketState};
pub use classify::{Classified, ProtocolError, classify_binary, classify_text};
pub use context::{ContextMessage, ConversationContext, Role};
pub use handshake::HandshakeGuard;
pub use idle::{
    DEFAULT_IDLE_TIMEOUT, IdlePhase, IdleTimeoutCoordinator, IdleTransition,
    SessionActivityState, TimerToken,
};
pub use protocol::{InboundMessage, OutboundMessage, SettingsPayload};
pub use signal::{ActivityEvent, ActivitySignal, AgentState, normalize};
pub use tracker::FunctionCallTracker;
