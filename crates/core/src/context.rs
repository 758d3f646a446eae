use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

/// Prior turns delivered to the agent inside the `Settings` handshake.
///
/// The caller owns this value. A session keeps the most recent copy it was
/// given and includes it only when a new physical connection performs its
/// handshake; replacing the context never triggers a send on its own.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    pub messages: Vec<ContextMessage>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.push(Role::User, content);
        self
    }

    pub fn with_assistant(mut self, content: impl Into<String>) -> Self {
        self.push(Role::Assistant, content);
        self
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ContextMessage {
            role,
            content: content.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
