//! Activity signals and the mapping from server messages onto them.
//!
//! Only liveness-relevant messages become signals. Transcripts, conversation
//! text and anything unrecognized stay on the content path.

use crate::protocol::InboundMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl AgentState {
    /// Thinking or speaking counts as ongoing agent activity.
    pub fn is_busy(self) -> bool {
        matches!(self, AgentState::Thinking | AgentState::Speaking)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Listening => "listening",
            AgentState::Thinking => "thinking",
            AgentState::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivitySignal {
    UserSpeakingStarted,
    UserSpeakingStopped,
    UtteranceEnd,
    AgentStateChanged { state: AgentState },
    PlaybackStateChanged { is_playing: bool },
    FunctionCallStarted { id: String },
    FunctionCallCompleted { id: String },
}

impl ActivitySignal {
    pub fn name(&self) -> &'static str {
        match self {
            ActivitySignal::UserSpeakingStarted => "user_speaking_started",
            ActivitySignal::UserSpeakingStopped => "user_speaking_stopped",
            ActivitySignal::UtteranceEnd => "utterance_end",
            ActivitySignal::AgentStateChanged { .. } => "agent_state_changed",
            ActivitySignal::PlaybackStateChanged { .. } => "playback_state_changed",
            ActivitySignal::FunctionCallStarted { .. } => "function_call_started",
            ActivitySignal::FunctionCallCompleted { .. } => "function_call_completed",
        }
    }
}

/// A signal together with the instant it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub signal: ActivitySignal,
    pub at: Instant,
}

impl ActivityEvent {
    pub fn new(signal: ActivitySignal, at: Instant) -> Self {
        Self { signal, at }
    }

    pub fn now(signal: ActivitySignal) -> Self {
        Self::new(signal, Instant::now())
    }
}

/// Maps a decoded server message to at most one activity signal.
pub fn normalize(message: &InboundMessage) -> Option<ActivitySignal> {
    let signal = match message {
        InboundMessage::UserStartedSpeaking | InboundMessage::SpeechStarted { .. } => {
            ActivitySignal::UserSpeakingStarted
        }
        InboundMessage::UserStoppedSpeaking => ActivitySignal::UserSpeakingStopped,
        InboundMessage::UtteranceEnd { .. } => ActivitySignal::UtteranceEnd,
        InboundMessage::AgentThinking { .. } => ActivitySignal::AgentStateChanged {
            state: AgentState::Thinking,
        },
        InboundMessage::AgentStartedSpeaking { .. } => ActivitySignal::AgentStateChanged {
            state: AgentState::Speaking,
        },
        InboundMessage::AgentAudioDone => ActivitySignal::AgentStateChanged {
            state: AgentState::Idle,
        },
        InboundMessage::FunctionCallRequest {
            function_call_id, ..
        } => ActivitySignal::FunctionCallStarted {
            id: function_call_id.clone(),
        },
        InboundMessage::Welcome { .. }
        | InboundMessage::SettingsApplied
        | InboundMessage::ConversationText { .. }
        | InboundMessage::Error { .. }
        | InboundMessage::Warning { .. }
        | InboundMessage::Results { .. }
        | InboundMessage::Metadata { .. } => return None,
    };
    Some(signal)
}
