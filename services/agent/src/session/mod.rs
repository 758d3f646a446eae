//! Voice-agent session orchestration.
//!
//! [`SessionOrchestrator::connect`] opens the agent channel (and the optional
//! transcription channel) and starts a runtime task that owns all session
//! state: the `Settings` handshake, activity tracking, the idle timer and
//! function-call settlement. The returned [`Session`] is a cheap cloneable
//! handle; [`SessionEvent`]s arrive on the accompanying receiver.

mod events;
mod function_calls;
mod handle;
mod runtime;

pub use events::{AgentStateCallback, ConnectionStateCallback, IdleTimeoutCallback, SessionEvent};
pub use function_calls::{
    FnHandler, FunctionCallHandler, FunctionCallRequest, FunctionCallResponder, Settlement,
    SettlementKind, error_output, handler_fn,
};
pub use handle::{Session, SessionOrchestrator};

use converse_core::{ChannelKind, ConversationContext, DEFAULT_IDLE_TIMEOUT};
use converse_realtime::{ChannelError, ChannelSpec};
use serde_json::{Map, Value};
use std::time::Duration;

pub const DEFAULT_FUNCTION_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent: ChannelSpec,
    pub transcription: Option<ChannelSpec>,
    /// Agent configuration sent as the body of every `Settings` message.
    pub settings: Map<String, Value>,
    /// Prior turns attached to the next `Settings` message.
    pub context: ConversationContext,
    /// `None` disables the idle timer.
    pub idle_timeout: Option<Duration>,
    /// Close both channels when the idle timer fires.
    pub disconnect_on_idle: bool,
    pub function_call_timeout: Duration,
}

impl SessionConfig {
    pub fn new(agent: ChannelSpec) -> Self {
        Self {
            agent,
            transcription: None,
            settings: Map::new(),
            context: ConversationContext::new(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            disconnect_on_idle: true,
            function_call_timeout: DEFAULT_FUNCTION_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to open {channel} channel: {source}")]
    Connect {
        channel: ChannelKind,
        #[source]
        source: ChannelError,
    },
}
