use super::events::{Callbacks, SessionEvent};
use super::function_calls::FunctionCallHandler;
use super::runtime::{SessionCommand, SessionRuntime, SessionShared};
use super::{SessionConfig, SessionError};
use bytes::Bytes;
use converse_core::{
    AgentState, ChannelKind, ConnectionIds, ConversationContext, OutboundMessage, SocketState,
};
use converse_realtime::{ChannelConnection, ChannelSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Builds and starts a [`Session`].
pub struct SessionOrchestrator {
    config: SessionConfig,
    handler: Option<Arc<dyn FunctionCallHandler>>,
    callbacks: Callbacks,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            handler: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Without a handler every function call is answered with an error.
    pub fn with_function_handler(mut self, handler: Arc<dyn FunctionCallHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Registered here, the callback also sees the initial `Connecting` and
    /// `Open` states of each channel.
    pub fn on_connection_state_change(
        mut self,
        callback: impl Fn(ChannelKind, SocketState) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.connection_state = Some(Arc::new(callback));
        self
    }

    pub fn on_agent_state_change(
        mut self,
        callback: impl Fn(AgentState) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.agent_state = Some(Arc::new(callback));
        self
    }

    pub fn on_idle_timeout(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.idle_timeout = Some(Arc::new(callback));
        self
    }

    /// Opens the configured channels and starts the session runtime.
    ///
    /// Only the first connection attempt is reported here. Later transport
    /// failures and reconnects surface as [`SessionEvent`]s.
    pub async fn connect(
        mut self,
    ) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let ids = Arc::new(ConnectionIds::default());
        self.config.agent.connection_ids = ids.clone();
        if let Some(spec) = self.config.transcription.as_mut() {
            spec.connection_ids = ids;
        }

        let agent = ChannelSocket::open(self.config.agent.clone())
            .await
            .map_err(|source| SessionError::Connect {
                channel: ChannelKind::Agent,
                source,
            })?;

        let transcription = match self.config.transcription.clone() {
            Some(spec) => Some(ChannelSocket::open(spec).await.map_err(|source| {
                SessionError::Connect {
                    channel: ChannelKind::Transcription,
                    source,
                }
            })?),
            None => None,
        };

        let shared = Arc::new(SessionShared::new(self.callbacks));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let runtime = SessionRuntime::new(
            self.config,
            self.handler,
            agent,
            transcription,
            shared.clone(),
            events_tx,
            commands_rx,
        );
        tokio::spawn(runtime.run());
        info!("session started");

        Ok((
            Session {
                commands: commands_tx,
                shared,
            },
            events_rx,
        ))
    }
}

/// Handle to a running session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<SessionCommand>,
    shared: Arc<SessionShared>,
}

impl Session {
    fn command(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Replaces the context delivered with `Settings`. Nothing is sent on
    /// the current connection; the next connection carries it.
    pub fn send_context(&self, context: ConversationContext) -> bool {
        self.command(SessionCommand::SetContext(context))
    }

    /// Sends `Settings` again on the current agent connection, with the
    /// latest context. Returns `false` when no agent connection is open.
    pub async fn resend_settings(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if !self.command(SessionCommand::ResendSettings(reply)) {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Sends a user turn as text.
    pub fn inject_user_message(&self, content: impl Into<String>) -> bool {
        let message = OutboundMessage::InjectUserMessage {
            content: content.into(),
        };
        self.connection(ChannelKind::Agent)
            .is_some_and(|conn| conn.send_message(&message))
    }

    /// Microphone audio goes to every open channel.
    pub fn send_audio(&self, audio: Bytes) -> bool {
        let mut sent = false;
        for kind in [ChannelKind::Agent, ChannelKind::Transcription] {
            if let Some(conn) = self.connection(kind) {
                sent |= conn.send_audio(audio.clone());
            }
        }
        sent
    }

    /// Reports whether agent audio is currently playing locally.
    pub fn report_playback(&self, is_playing: bool) -> bool {
        self.command(SessionCommand::Playback(is_playing))
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) -> bool {
        self.command(SessionCommand::SetIdleTimeout(timeout))
    }

    /// Reopens channels that are closed, for example after an idle
    /// disconnect. Live channels are left alone.
    pub fn reconnect(&self) -> bool {
        self.command(SessionCommand::Reconnect)
    }

    /// Stops the session. Pending function calls are abandoned and no
    /// callback runs after this returns.
    pub async fn close(&self) {
        let (ack, rx) = oneshot::channel();
        if self.command(SessionCommand::Close(ack)) {
            let _ = rx.await;
        }
        debug!("session handle closed");
    }

    pub fn on_idle_timeout(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared
            .update_callbacks(|callbacks| callbacks.idle_timeout = Some(Arc::new(callback)));
    }

    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(ChannelKind, SocketState) + Send + Sync + 'static,
    ) {
        self.shared
            .update_callbacks(|callbacks| callbacks.connection_state = Some(Arc::new(callback)));
    }

    pub fn on_agent_state_change(&self, callback: impl Fn(AgentState) + Send + Sync + 'static) {
        self.shared
            .update_callbacks(|callbacks| callbacks.agent_state = Some(Arc::new(callback)));
    }

    /// The current physical connection of a channel, if it is up.
    pub fn connection(&self, kind: ChannelKind) -> Option<Arc<ChannelConnection>> {
        self.shared.connection(kind)
    }

    pub fn is_connected(&self) -> bool {
        self.connection(ChannelKind::Agent)
            .is_some_and(|conn| conn.is_open())
    }
}
