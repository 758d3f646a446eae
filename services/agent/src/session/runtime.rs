//! The single task that owns a session's mutable state.
//!
//! Channel events, handle commands, function-call settlements and the idle
//! deadline are all processed here one at a time, so every activity signal
//! is fully applied before the next one is looked at.

use super::SessionConfig;
use super::events::{Callbacks, SessionEvent};
use super::function_calls::{
    self, FunctionCallHandler, FunctionCallRequest, Settlement, SettlementKind, error_output,
};
use converse_core::{
    ActivityEvent, ActivitySignal, AgentState, ChannelKind, Classified, ConnectionId,
    ConversationContext, IdleTimeoutCoordinator, IdleTransition, InboundMessage, OutboundMessage,
    SettingsPayload, SocketState, TimerToken, normalize,
};
use converse_realtime::{
    ChannelConnection, ChannelError, ChannelEvent, ChannelSocket, ChannelSpec, CloseReason,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, instrument, warn};

pub(crate) enum SessionCommand {
    SetContext(ConversationContext),
    ResendSettings(oneshot::Sender<bool>),
    Playback(bool),
    SetIdleTimeout(Option<Duration>),
    Reconnect,
    Close(oneshot::Sender<()>),
}

/// State shared between the runtime and every [`Session`](super::Session)
/// clone. Locks are never held across an await.
#[derive(Default)]
pub(crate) struct SessionShared {
    agent: RwLock<Option<Arc<ChannelConnection>>>,
    transcription: RwLock<Option<Arc<ChannelConnection>>>,
    callbacks: RwLock<Callbacks>,
}

impl SessionShared {
    pub(crate) fn new(callbacks: Callbacks) -> Self {
        Self {
            callbacks: RwLock::new(callbacks),
            ..Self::default()
        }
    }

    fn slot(&self, kind: ChannelKind) -> &RwLock<Option<Arc<ChannelConnection>>> {
        match kind {
            ChannelKind::Agent => &self.agent,
            ChannelKind::Transcription => &self.transcription,
        }
    }

    pub(crate) fn connection(&self, kind: ChannelKind) -> Option<Arc<ChannelConnection>> {
        self.slot(kind)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_connection(&self, kind: ChannelKind, connection: Option<Arc<ChannelConnection>>) {
        *self.slot(kind).write().unwrap_or_else(PoisonError::into_inner) = connection;
    }

    pub(crate) fn update_callbacks(&self, update: impl FnOnce(&mut Callbacks)) {
        update(&mut self.callbacks.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn callbacks(&self) -> Callbacks {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Default)]
struct ChannelSlot {
    socket: Option<ChannelSocket>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    current: Option<ConnectionId>,
    opening: bool,
}

impl ChannelSlot {
    fn attach(&mut self, socket: ChannelSocket, events: mpsc::Receiver<ChannelEvent>) {
        self.socket = Some(socket);
        self.events = Some(events);
        self.opening = false;
    }

    fn is_idle(&self) -> bool {
        self.socket.is_none() && self.events.is_none() && !self.opening
    }
}

struct Opened {
    kind: ChannelKind,
    result: Result<(ChannelSocket, mpsc::Receiver<ChannelEvent>), ChannelError>,
}

pub(crate) struct SessionRuntime {
    agent_spec: ChannelSpec,
    transcription_spec: Option<ChannelSpec>,
    settings: Map<String, Value>,
    context: ConversationContext,
    disconnect_on_idle: bool,
    function_call_timeout: Duration,
    handler: Option<Arc<dyn FunctionCallHandler>>,

    coordinator: IdleTimeoutCoordinator,
    last_agent_state: AgentState,
    idle_sleep: Option<Pin<Box<Sleep>>>,
    idle_token: Option<TimerToken>,
    in_flight: HashMap<String, ConnectionId>,

    agent: ChannelSlot,
    transcription: ChannelSlot,
    shared: Arc<SessionShared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    settlements_tx: mpsc::UnboundedSender<Settlement>,
    settlements: mpsc::UnboundedReceiver<Settlement>,
    opened_tx: mpsc::UnboundedSender<Opened>,
    opened: mpsc::UnboundedReceiver<Opened>,
}

impl SessionRuntime {
    pub(crate) fn new(
        config: SessionConfig,
        handler: Option<Arc<dyn FunctionCallHandler>>,
        agent: (ChannelSocket, mpsc::Receiver<ChannelEvent>),
        transcription: Option<(ChannelSocket, mpsc::Receiver<ChannelEvent>)>,
        shared: Arc<SessionShared>,
        events: mpsc::UnboundedSender<SessionEvent>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let (settlements_tx, settlements) = mpsc::unbounded_channel();
        let (opened_tx, opened) = mpsc::unbounded_channel();

        let mut agent_slot = ChannelSlot::default();
        agent_slot.attach(agent.0, agent.1);
        let mut transcription_slot = ChannelSlot::default();
        if let Some((socket, rx)) = transcription {
            transcription_slot.attach(socket, rx);
        }

        Self {
            agent_spec: config.agent,
            transcription_spec: config.transcription,
            settings: config.settings,
            context: config.context,
            disconnect_on_idle: config.disconnect_on_idle,
            function_call_timeout: config.function_call_timeout,
            handler,
            coordinator: IdleTimeoutCoordinator::new(config.idle_timeout),
            last_agent_state: AgentState::default(),
            idle_sleep: None,
            idle_token: None,
            in_flight: HashMap::new(),
            agent: agent_slot,
            transcription: transcription_slot,
            shared,
            events,
            commands,
            settlements_tx,
            settlements,
            opened_tx,
            opened,
        }
    }

    #[instrument(skip_all, name = "session", fields(agent_url = %self.agent_spec.url))]
    pub(crate) async fn run(mut self) {
        info!("session runtime started");
        let transition = self.coordinator.recompute(Instant::now());
        self.apply_transition(transition);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all session handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                event = next_channel_event(&mut self.agent.events) => {
                    self.handle_channel_event(ChannelKind::Agent, event);
                }
                event = next_channel_event(&mut self.transcription.events) => {
                    self.handle_channel_event(ChannelKind::Transcription, event);
                }
                Some(settlement) = self.settlements.recv() => self.handle_settlement(settlement),
                Some(opened) = self.opened.recv() => self.handle_opened(opened),
                _ = idle_elapsed(&mut self.idle_sleep) => self.handle_idle_elapsed(),
            }
        }
        info!("session runtime stopped");
    }

    fn slot_mut(&mut self, kind: ChannelKind) -> &mut ChannelSlot {
        match kind {
            ChannelKind::Agent => &mut self.agent,
            ChannelKind::Transcription => &mut self.transcription,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn settings_message(&self) -> OutboundMessage {
        OutboundMessage::Settings(SettingsPayload::new(self.settings.clone(), &self.context))
    }

    // --- Commands ---

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetContext(context) => {
                debug!(turns = context.len(), "context updated, delivered on next connection");
                self.context = context;
            }
            SessionCommand::ResendSettings(reply) => {
                let settings = self.settings_message();
                let sent = self
                    .shared
                    .connection(ChannelKind::Agent)
                    .is_some_and(|conn| conn.resend_handshake(&settings));
                let _ = reply.send(sent);
            }
            SessionCommand::Playback(is_playing) => {
                self.apply_signal(ActivitySignal::PlaybackStateChanged { is_playing });
            }
            SessionCommand::SetIdleTimeout(timeout) => {
                info!(timeout_ms = timeout.map(|t| t.as_millis() as u64), "idle timeout changed");
                let transition = self.coordinator.set_timeout(timeout, Instant::now());
                self.apply_transition(transition);
            }
            SessionCommand::Reconnect => self.reopen_channels(),
            // Handled by the run loop.
            SessionCommand::Close(_) => {}
        }
    }

    fn reopen_channels(&mut self) {
        let mut specs = vec![self.agent_spec.clone()];
        specs.extend(self.transcription_spec.clone());
        for spec in specs {
            let kind = spec.kind;
            let slot = self.slot_mut(kind);
            if !slot.is_idle() {
                debug!(channel = %kind, "channel still active, not reopening");
                continue;
            }
            slot.opening = true;
            info!(channel = %kind, "reopening channel");
            let opened_tx = self.opened_tx.clone();
            tokio::spawn(async move {
                let result = ChannelSocket::open(spec).await;
                let _ = opened_tx.send(Opened { kind, result });
            });
        }
    }

    fn handle_opened(&mut self, opened: Opened) {
        let Opened { kind, result } = opened;
        match result {
            Ok((socket, events)) => self.slot_mut(kind).attach(socket, events),
            Err(e) => {
                error!(channel = %kind, error = %e, "failed to reopen channel");
                self.slot_mut(kind).opening = false;
                self.notify_connection_state(kind, SocketState::Closed);
            }
        }
    }

    // --- Channel events ---

    fn handle_channel_event(&mut self, kind: ChannelKind, event: Option<ChannelEvent>) {
        let Some(event) = event else {
            debug!(channel = %kind, "channel task finished");
            let slot = self.slot_mut(kind);
            slot.events = None;
            slot.socket = None;
            slot.current = None;
            self.shared.set_connection(kind, None);
            return;
        };

        match event {
            ChannelEvent::StateChanged(state) => self.notify_connection_state(kind, state),
            ChannelEvent::Connected(connection) => self.on_connected(connection),
            ChannelEvent::Frame { connection, frame } => {
                if self.slot_mut(kind).current != Some(connection) {
                    debug!(channel = %kind, %connection, "frame from a stale connection dropped");
                    return;
                }
                self.handle_frame(kind, frame);
            }
            ChannelEvent::Disconnected {
                connection,
                reason,
                reconnecting,
            } => self.on_disconnected(kind, connection, reason, reconnecting),
            ChannelEvent::GaveUp { attempts, error } => {
                error!(channel = %kind, attempts, %error, "channel gave up reconnecting");
            }
        }
    }

    fn on_connected(&mut self, connection: Arc<ChannelConnection>) {
        let kind = connection.kind();
        self.slot_mut(kind).current = Some(connection.id());
        self.shared.set_connection(kind, Some(connection.clone()));

        if kind == ChannelKind::Agent {
            let settings = self.settings_message();
            if connection.try_send_handshake(&settings) {
                info!(connection = %connection.id(), context_turns = self.context.len(), "settings sent");
            }
            let transition = self.coordinator.resume(Instant::now());
            self.apply_transition(transition);
        }
    }

    fn on_disconnected(
        &mut self,
        kind: ChannelKind,
        connection: ConnectionId,
        reason: CloseReason,
        reconnecting: bool,
    ) {
        info!(channel = %kind, %connection, ?reason, reconnecting, "channel disconnected");
        let slot = self.slot_mut(kind);
        if slot.current == Some(connection) {
            slot.current = None;
            self.shared.set_connection(kind, None);
        }

        if kind == ChannelKind::Agent {
            let (abandoned, transition) = self.coordinator.reset_remote_activity(Instant::now());
            self.abandon_calls(&abandoned);
            self.apply_transition(transition);
            self.notify_agent_state_if_changed();
        } else {
            // No end-of-speech will arrive from a dead transcription connection.
            self.apply_signal(ActivitySignal::UserSpeakingStopped);
        }
    }

    fn handle_frame(&mut self, kind: ChannelKind, frame: Classified) {
        match frame {
            Classified::Control(message) => self.handle_control(kind, message),
            Classified::Passthrough(payload) => {
                self.emit(SessionEvent::Unrecognized {
                    channel: kind,
                    payload,
                });
            }
            Classified::Audio(audio) => self.emit(SessionEvent::Audio(audio)),
            Classified::Malformed(e) => {
                warn!(channel = %kind, error = %e, "discarding malformed frame");
            }
        }
    }

    fn handle_control(&mut self, kind: ChannelKind, message: InboundMessage) {
        if message.is_settings_already_applied() {
            warn!(channel = %kind, "server reports settings already applied, continuing");
            if let Some(conn) = self.shared.connection(kind) {
                conn.mark_handshake_acked();
            }
            return;
        }

        match &message {
            InboundMessage::SettingsApplied => {
                if let Some(conn) = self.shared.connection(kind) {
                    conn.mark_handshake_acked();
                }
                info!(channel = %kind, "settings applied");
                self.emit(SessionEvent::SettingsApplied { channel: kind });
                return;
            }
            InboundMessage::FunctionCallRequest {
                function_call_id,
                function_name,
                input,
            } => {
                let request = FunctionCallRequest {
                    id: function_call_id.clone(),
                    name: function_name.clone(),
                    arguments: input.clone(),
                };
                self.start_function_call(kind, request);
                return;
            }
            InboundMessage::Error { code, description } => {
                warn!(channel = %kind, ?code, ?description, "server reported an error");
            }
            InboundMessage::Warning { code, description } => {
                warn!(channel = %kind, ?code, ?description, "server warning");
            }
            _ => {}
        }

        match normalize(&message) {
            Some(signal) => self.apply_signal(signal),
            None => self.emit(SessionEvent::Message {
                channel: kind,
                message,
            }),
        }
    }

    // --- Function calls ---

    fn start_function_call(&mut self, kind: ChannelKind, request: FunctionCallRequest) {
        let Some(connection) = self.slot_mut(kind).current else {
            warn!(call_id = %request.id, "function call request without a live connection");
            return;
        };
        if self.in_flight.contains_key(&request.id) {
            warn!(call_id = %request.id, "duplicate function call request ignored");
            return;
        }
        info!(call_id = %request.id, name = %request.name, "function call requested");
        self.in_flight.insert(request.id.clone(), connection);
        self.apply_signal(ActivitySignal::FunctionCallStarted {
            id: request.id.clone(),
        });
        self.emit(SessionEvent::FunctionCallRequested(request.clone()));

        match &self.handler {
            Some(handler) => {
                function_calls::dispatch(
                    handler.clone(),
                    request,
                    connection,
                    self.function_call_timeout,
                    self.settlements_tx.clone(),
                );
            }
            None => {
                warn!(call_id = %request.id, "no function call handler registered");
                let _ = self.settlements_tx.send(Settlement {
                    call_id: request.id,
                    connection,
                    kind: SettlementKind::Failed,
                    output: error_output("no function call handler registered"),
                });
            }
        }
    }

    fn handle_settlement(&mut self, settlement: Settlement) {
        if self.in_flight.get(&settlement.call_id) != Some(&settlement.connection) {
            debug!(call_id = %settlement.call_id, "settlement for an abandoned call dropped");
            return;
        }
        self.in_flight.remove(&settlement.call_id);

        let response = OutboundMessage::FunctionCallResponse {
            function_call_id: settlement.call_id.clone(),
            output: settlement.output.clone(),
        };
        let delivered = self
            .shared
            .connection(ChannelKind::Agent)
            .filter(|conn| conn.id() == settlement.connection)
            .is_some_and(|conn| conn.send_message(&response));
        if delivered {
            info!(call_id = %settlement.call_id, kind = ?settlement.kind, "function call response sent");
        } else {
            warn!(call_id = %settlement.call_id, "function call response could not be delivered");
        }

        self.apply_signal(ActivitySignal::FunctionCallCompleted {
            id: settlement.call_id.clone(),
        });
        self.emit(SessionEvent::FunctionCallCompleted(settlement));
    }

    fn abandon_calls(&mut self, ids: &[String]) {
        for id in ids {
            if self.in_flight.remove(id).is_some() {
                warn!(call_id = %id, "function call abandoned");
            }
        }
    }

    // --- Idle coordination ---

    fn apply_signal(&mut self, signal: ActivitySignal) {
        let transition = self.coordinator.apply(&ActivityEvent::now(signal));
        self.apply_transition(transition);
        self.notify_agent_state_if_changed();
    }

    fn apply_transition(&mut self, transition: IdleTransition) {
        match transition {
            IdleTransition::Armed { deadline, token } => {
                self.idle_sleep = Some(Box::pin(tokio::time::sleep_until(deadline)));
                self.idle_token = Some(token);
            }
            IdleTransition::Disarmed => {
                self.idle_sleep = None;
                self.idle_token = None;
            }
            IdleTransition::Unchanged => {}
        }
    }

    fn handle_idle_elapsed(&mut self) {
        self.idle_sleep = None;
        let Some(token) = self.idle_token.take() else {
            return;
        };
        if !self.coordinator.fire(token, Instant::now()) {
            return;
        }

        self.emit(SessionEvent::IdleTimeout);
        if let Some(callback) = self.shared.callbacks().idle_timeout {
            callback();
        }
        if self.disconnect_on_idle {
            info!("closing channels after idle timeout");
            self.close_channels();
        }
    }

    fn notify_agent_state_if_changed(&mut self) {
        let state = self.coordinator.activity().agent_state();
        if state == self.last_agent_state {
            return;
        }
        self.last_agent_state = state;
        debug!(%state, "agent state changed");
        self.emit(SessionEvent::AgentStateChanged(state));
        if let Some(callback) = self.shared.callbacks().agent_state {
            callback(state);
        }
    }

    fn notify_connection_state(&self, channel: ChannelKind, state: SocketState) {
        self.emit(SessionEvent::ConnectionStateChanged { channel, state });
        if let Some(callback) = self.shared.callbacks().connection_state {
            callback(channel, state);
        }
    }

    // --- Teardown ---

    /// Closes a channel and forgets it. Events still queued on the old
    /// socket are discarded.
    fn release_channel(&mut self, kind: ChannelKind) {
        let slot = std::mem::take(self.slot_mut(kind));
        let was_live = slot.current.is_some();
        if let Some(socket) = slot.socket {
            socket.close();
        }
        self.shared.set_connection(kind, None);
        if was_live {
            self.notify_connection_state(kind, SocketState::Closed);
        }
    }

    fn close_channels(&mut self) {
        self.release_channel(ChannelKind::Agent);
        self.release_channel(ChannelKind::Transcription);
        let (abandoned, transition) = self.coordinator.reset_remote_activity(Instant::now());
        self.abandon_calls(&abandoned);
        self.apply_transition(transition);
        self.notify_agent_state_if_changed();
    }

    fn shutdown(&mut self) {
        info!("session closing");
        let abandoned = self.coordinator.shutdown();
        self.abandon_calls(&abandoned);
        self.in_flight.clear();
        self.idle_sleep = None;
        self.idle_token = None;

        self.release_channel(ChannelKind::Agent);
        self.release_channel(ChannelKind::Transcription);
        self.emit(SessionEvent::Closed);
    }
}

async fn next_channel_event(
    events: &mut Option<mpsc::Receiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn idle_elapsed(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
