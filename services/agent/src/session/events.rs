use super::function_calls::{FunctionCallRequest, Settlement};
use bytes::Bytes;
use converse_core::{AgentState, ChannelKind, InboundMessage, SocketState};
use serde_json::Value;
use std::sync::Arc;

/// Everything the session reports to its owner, in processing order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStateChanged {
        channel: ChannelKind,
        state: SocketState,
    },
    /// The server accepted `Settings` on the current connection.
    SettingsApplied { channel: ChannelKind },
    AgentStateChanged(AgentState),
    FunctionCallRequested(FunctionCallRequest),
    /// A function call finished, by any path, and its response was sent.
    FunctionCallCompleted(Settlement),
    /// Conversational content and informational server messages.
    Message {
        channel: ChannelKind,
        message: InboundMessage,
    },
    /// JSON with an unknown `type`, exactly as received.
    Unrecognized { channel: ChannelKind, payload: Value },
    /// Agent audio for playback.
    Audio(Bytes),
    IdleTimeout,
    /// The session was torn down. No further events follow.
    Closed,
}

pub type IdleTimeoutCallback = Arc<dyn Fn() + Send + Sync>;
pub type ConnectionStateCallback = Arc<dyn Fn(ChannelKind, SocketState) + Send + Sync>;
pub type AgentStateCallback = Arc<dyn Fn(AgentState) + Send + Sync>;

/// Registered callbacks. Each slot holds the latest registration and is
/// read at invocation time.
#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    pub(crate) idle_timeout: Option<IdleTimeoutCallback>,
    pub(crate) connection_state: Option<ConnectionStateCallback>,
    pub(crate) agent_state: Option<AgentStateCallback>,
}
