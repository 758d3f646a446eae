//! Idle-timeout coordination.
//!
//! [`IdleTimeoutCoordinator`] is a clock-injected state machine: callers pass
//! the current [`Instant`] in and get back an [`IdleTransition`] telling them
//! what to do with their timer. It owns no timer itself, so the session
//! runtime decides how to sleep and tests can drive it with plain instants.
//!
//! Every signal funnels through [`IdleTimeoutCoordinator::recompute`]. The
//! timer is armed only while nothing suppresses it:
//!
//! * the user is speaking
//! * the agent is thinking or speaking
//! * audio is playing locally
//! * a function call is in flight

use crate::signal::{ActivityEvent, ActivitySignal, AgentState};
use crate::tracker::FunctionCallTracker;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Latest value per activity category. Only [`IdleTimeoutCoordinator`]
/// mutates it.
#[derive(Debug, Clone, Default)]
pub struct SessionActivityState {
    agent_state: AgentState,
    is_user_speaking: bool,
    is_playing: bool,
    function_calls: FunctionCallTracker,
}

impl SessionActivityState {
    fn apply(&mut self, signal: &ActivitySignal) {
        match signal {
            ActivitySignal::UserSpeakingStarted => {
                self.is_user_speaking = true;
                // Barge-in: an interrupted agent turn may never send AgentAudioDone.
                if self.agent_state.is_busy() {
                    self.agent_state = AgentState::Listening;
                }
            }
            ActivitySignal::UserSpeakingStopped | ActivitySignal::UtteranceEnd => {
                self.is_user_speaking = false
            }
            ActivitySignal::AgentStateChanged { state } => self.agent_state = *state,
            ActivitySignal::PlaybackStateChanged { is_playing } => self.is_playing = *is_playing,
            ActivitySignal::FunctionCallStarted { id } => {
                self.function_calls.start(id);
            }
            ActivitySignal::FunctionCallCompleted { id } => {
                self.function_calls.complete(id);
            }
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.is_user_speaking
            || self.agent_state.is_busy()
            || self.is_playing
            || self.function_calls.active_count() > 0
    }

    pub fn agent_state(&self) -> AgentState {
        self.agent_state
    }

    pub fn is_user_speaking(&self) -> bool {
        self.is_user_speaking
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn function_calls(&self) -> &FunctionCallTracker {
        &self.function_calls
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    Disabled,
    Armed,
    Fired,
}

/// Identifies one scheduled deadline. A fire attempt carrying an outdated
/// token is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

/// Instruction for whoever drives the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTransition {
    /// Drop any pending sleep and schedule a new one for `deadline`.
    Armed { deadline: Instant, token: TimerToken },
    /// Drop any pending sleep.
    Disarmed,
    Unchanged,
}

#[derive(Debug, Default)]
struct IdleTimer {
    pending: Option<(TimerToken, Instant)>,
}

impl IdleTimer {
    fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    fn cancel(&mut self) {
        self.pending = None;
    }
}

#[derive(Debug)]
pub struct IdleTimeoutCoordinator {
    activity: SessionActivityState,
    phase: IdlePhase,
    timer: IdleTimer,
    timeout: Option<Duration>,
    next_token: u64,
}

impl Default for IdleTimeoutCoordinator {
    fn default() -> Self {
        Self::new(Some(DEFAULT_IDLE_TIMEOUT))
    }
}

impl IdleTimeoutCoordinator {
    /// `None` turns the idle timeout off; activity is still tracked.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            activity: SessionActivityState::default(),
            phase: IdlePhase::Disabled,
            timer: IdleTimer::default(),
            timeout,
            next_token: 0,
        }
    }

    pub fn phase(&self) -> IdlePhase {
        self.phase
    }

    pub fn activity(&self) -> &SessionActivityState {
        &self.activity
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.pending.map(|(_, deadline)| deadline)
    }

    pub fn is_suppressed(&self) -> bool {
        self.activity.is_suppressed()
    }

    /// Applies one signal, then recomputes.
    pub fn apply(&mut self, event: &ActivityEvent) -> IdleTransition {
        debug!(signal = event.signal.name(), "applying activity signal");
        self.activity.apply(&event.signal);
        self.recompute(event.at)
    }

    /// The single place where the timer is armed or cancelled.
    pub fn recompute(&mut self, now: Instant) -> IdleTransition {
        let suppressed = self.activity.is_suppressed();
        match (self.phase, suppressed) {
            (IdlePhase::Armed, true) => {
                self.timer.cancel();
                self.phase = IdlePhase::Disabled;
                debug!("idle timer cancelled by activity");
                IdleTransition::Disarmed
            }
            (IdlePhase::Disabled, false) => self.arm(now),
            (IdlePhase::Fired, true) => {
                self.phase = IdlePhase::Disabled;
                IdleTransition::Disarmed
            }
            _ => IdleTransition::Unchanged,
        }
    }

    fn arm(&mut self, now: Instant) -> IdleTransition {
        self.timer.cancel();
        let Some(timeout) = self.timeout else {
            return IdleTransition::Unchanged;
        };
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let deadline = now + timeout;
        self.timer.pending = Some((token, deadline));
        self.phase = IdlePhase::Armed;
        debug!(timeout_ms = timeout.as_millis() as u64, "idle timer armed");
        IdleTransition::Armed { deadline, token }
    }

    /// Called when a scheduled deadline elapses. Returns `true` exactly once
    /// per armed period, and only for the current token.
    pub fn fire(&mut self, token: TimerToken, now: Instant) -> bool {
        match self.timer.pending {
            Some((current, deadline))
                if self.phase == IdlePhase::Armed && current == token && now >= deadline =>
            {
                self.timer.cancel();
                self.phase = IdlePhase::Fired;
                info!("idle timeout fired");
                true
            }
            _ => {
                debug!(?token, "stale idle timer callback ignored");
                false
            }
        }
    }

    /// Starts a fresh idle period after a fire, e.g. once a new connection
    /// is up. Otherwise identical to [`recompute`](Self::recompute).
    pub fn resume(&mut self, now: Instant) -> IdleTransition {
        if self.phase == IdlePhase::Fired {
            self.phase = IdlePhase::Disabled;
        }
        self.recompute(now)
    }

    /// Changes the timeout used by the next arm. A pending deadline keeps
    /// the duration it was armed with.
    pub fn set_timeout(&mut self, timeout: Option<Duration>, now: Instant) -> IdleTransition {
        self.timeout = timeout;
        match timeout {
            None if self.timer.is_armed() => {
                self.timer.cancel();
                self.phase = IdlePhase::Disabled;
                IdleTransition::Disarmed
            }
            None => IdleTransition::Unchanged,
            Some(_) => self.recompute(now),
        }
    }

    /// Forgets everything the remote side told us: user speech, agent state
    /// and in-flight calls. Local playback state is kept. Returns the
    /// abandoned call ids.
    pub fn reset_remote_activity(&mut self, now: Instant) -> (Vec<String>, IdleTransition) {
        self.activity.is_user_speaking = false;
        self.activity.agent_state = AgentState::Idle;
        let abandoned = self.activity.function_calls.abandon_all();
        (abandoned, self.recompute(now))
    }

    /// Session teardown: cancels the timer and abandons in-flight calls.
    pub fn shutdown(&mut self) -> Vec<String> {
        self.timer.cancel();
        self.phase = IdlePhase::Disabled;
        self.activity.function_calls.abandon_all()
    }
}
