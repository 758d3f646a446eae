//! JSON control messages exchanged with the voice-agent backend.
//!
//! Every control message is an object with a `type` discriminator. Only the
//! types listed in [`RECOGNIZED_INBOUND_TYPES`] are decoded into
//! [`InboundMessage`]; anything else travels to the content path untouched.

use crate::context::{ConversationContext, Role};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `type` values this crate knows how to decode.
pub const RECOGNIZED_INBOUND_TYPES: &[&str] = &[
    "Welcome",
    "SettingsApplied",
    "UserStartedSpeaking",
    "UserStoppedSpeaking",
    "AgentThinking",
    "AgentStartedSpeaking",
    "AgentAudioDone",
    "FunctionCallRequest",
    "ConversationText",
    "Error",
    "Warning",
    "SpeechStarted",
    "UtteranceEnd",
    "Results",
    "Metadata",
];

/// Error code the agent returns when `Settings` arrives twice on one connection.
pub const SETTINGS_ALREADY_APPLIED: &str = "SETTINGS_ALREADY_APPLIED";

pub fn is_recognized_type(message_type: &str) -> bool {
    RECOGNIZED_INBOUND_TYPES.contains(&message_type)
}

/// Messages sent from the server to this client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// First message on a fresh agent connection.
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    /// The `Settings` handshake was accepted.
    SettingsApplied,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentThinking {
        #[serde(default)]
        content: Option<String>,
    },
    AgentStartedSpeaking {
        #[serde(default)]
        total_latency: Option<f64>,
    },
    /// The server has finished sending audio for the current agent turn.
    AgentAudioDone,
    /// The agent wants the client to run a function and answer with
    /// [`OutboundMessage::FunctionCallResponse`].
    FunctionCallRequest {
        function_call_id: String,
        function_name: String,
        #[serde(default)]
        input: Value,
    },
    /// A finished conversational turn, either side.
    ConversationText { role: Role, content: String },
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default, alias = "message")]
        description: Option<String>,
    },
    Warning {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    /// Voice activity detected on the transcription channel.
    SpeechStarted {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    UtteranceEnd {
        #[serde(default)]
        last_word_end: Option<f64>,
    },
    /// Transcript results. Content only; never treated as activity.
    Results {
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    Metadata {
        #[serde(flatten)]
        body: Map<String, Value>,
    },
}

impl InboundMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            InboundMessage::Welcome { .. } => "Welcome",
            InboundMessage::SettingsApplied => "SettingsApplied",
            InboundMessage::UserStartedSpeaking => "UserStartedSpeaking",
            InboundMessage::UserStoppedSpeaking => "UserStoppedSpeaking",
            InboundMessage::AgentThinking { .. } => "AgentThinking",
            InboundMessage::AgentStartedSpeaking { .. } => "AgentStartedSpeaking",
            InboundMessage::AgentAudioDone => "AgentAudioDone",
            InboundMessage::FunctionCallRequest { .. } => "FunctionCallRequest",
            InboundMessage::ConversationText { .. } => "ConversationText",
            InboundMessage::Error { .. } => "Error",
            InboundMessage::Warning { .. } => "Warning",
            InboundMessage::SpeechStarted { .. } => "SpeechStarted",
            InboundMessage::UtteranceEnd { .. } => "UtteranceEnd",
            InboundMessage::Results { .. } => "Results",
            InboundMessage::Metadata { .. } => "Metadata",
        }
    }

    /// True for the server's "settings already applied" rejection, which is
    /// an acknowledgment in disguise rather than a failure.
    pub fn is_settings_already_applied(&self) -> bool {
        match self {
            InboundMessage::Error { code, description } => {
                code.as_deref() == Some(SETTINGS_ALREADY_APPLIED)
                    || description
                        .as_deref()
                        .is_some_and(|d| d.to_ascii_lowercase().contains("already applied"))
            }
            _ => false,
        }
    }
}

/// Body of the `Settings` handshake.
///
/// `config` is opaque agent configuration supplied by the caller and is
/// flattened into the top-level object next to `context`.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct SettingsPayload {
    #[serde(flatten)]
    pub config: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ConversationContext>,
}

impl SettingsPayload {
    pub fn new(config: Map<String, Value>, context: &ConversationContext) -> Self {
        Self {
            config,
            context: (!context.is_empty()).then(|| context.clone()),
        }
    }
}

/// Messages sent from this client to the server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    Settings(SettingsPayload),
    KeepAlive,
    InjectUserMessage {
        content: String,
    },
    FunctionCallResponse {
        function_call_id: String,
        output: String,
    },
}

impl OutboundMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            OutboundMessage::Settings(_) => "Settings",
            OutboundMessage::KeepAlive => "KeepAlive",
            OutboundMessage::InjectUserMessage { .. } => "InjectUserMessage",
            OutboundMessage::FunctionCallResponse { .. } => "FunctionCallResponse",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_flattens_config_next_to_context() {
        let mut config = Map::new();
        config.insert("audio".into(), json!({ "input": { "encoding": "linear16" } }));
        let context = ConversationContext::new().with_user("hi");

        let msg = OutboundMessage::Settings(SettingsPayload::new(config, &context));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "Settings");
        assert_eq!(value["audio"]["input"]["encoding"], "linear16");
        assert_eq!(value["context"]["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_settings_omits_empty_context() {
        let msg = OutboundMessage::Settings(SettingsPayload::new(
            Map::new(),
            &ConversationContext::new(),
        ));
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"Settings"}"#);
    }

    #[test]
    fn test_keepalive_wire_shape() {
        assert_eq!(
            OutboundMessage::KeepAlive.to_json().unwrap(),
            r#"{"type":"KeepAlive"}"#
        );
    }

    #[test]
    fn test_function_call_response_wire_shape() {
        let msg = OutboundMessage::FunctionCallResponse {
            function_call_id: "fc_1".into(),
            output: "{\"ok\":true}".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "FunctionCallResponse",
                "function_call_id": "fc_1",
                "output": "{\"ok\":true}"
            })
        );
    }

    #[test]
    fn test_function_call_request_decodes() {
        let raw = json!({
            "type": "FunctionCallRequest",
            "function_call_id": "fc_9",
            "function_name": "lookup_order",
            "input": { "order": 42 }
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            msg,
            InboundMessage::FunctionCallRequest {
                function_call_id: "fc_9".into(),
                function_name: "lookup_order".into(),
                input: json!({ "order": 42 }),
            }
        );
    }

    #[test]
    fn test_unit_messages_ignore_extra_fields() {
        let msg: InboundMessage =
            serde_json::from_value(json!({ "type": "SettingsApplied", "extra": 1 })).unwrap();
        assert_eq!(msg, InboundMessage::SettingsApplied);
    }

    #[test]
    fn test_results_keep_transcript_body() {
        let raw = json!({
            "type": "Results",
            "is_final": true,
            "channel": { "alternatives": [{ "transcript": "hello there" }] }
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        match msg {
            InboundMessage::Results {
                is_final,
                speech_final,
                body,
            } => {
                assert!(is_final);
                assert!(!speech_final);
                assert_eq!(
                    body["channel"]["alternatives"][0]["transcript"],
                    "hello there"
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_already_applied_detection() {
        let by_code = InboundMessage::Error {
            code: Some(SETTINGS_ALREADY_APPLIED.into()),
            description: None,
        };
        let by_text = InboundMessage::Error {
            code: None,
            description: Some("Settings already applied".into()),
        };
        let other = InboundMessage::Error {
            code: Some("UNPARSABLE_CLIENT_MESSAGE".into()),
            description: Some("bad json".into()),
        };

        assert!(by_code.is_settings_already_applied());
        assert!(by_text.is_settings_already_applied());
        assert!(!other.is_settings_already_applied());
        assert!(!InboundMessage::SettingsApplied.is_settings_already_applied());
    }

    #[test]
    fn test_error_accepts_message_alias() {
        let msg: InboundMessage =
            serde_json::from_value(json!({ "type": "Error", "message": "boom" })).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Error {
                code: None,
                description: Some("boom".into())
            }
        );
    }

    #[test]
    fn test_recognized_types_cover_every_variant_name() {
        let samples = [
            InboundMessage::SettingsApplied,
            InboundMessage::AgentAudioDone,
            InboundMessage::UserStartedSpeaking,
            InboundMessage::UserStoppedSpeaking,
            InboundMessage::UtteranceEnd {
                last_word_end: None,
            },
        ];
        for msg in samples {
            assert!(is_recognized_type(msg.message_type()));
        }
        assert!(!is_recognized_type("History"));
    }
}
