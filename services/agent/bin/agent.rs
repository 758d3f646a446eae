//! Main Entrypoint for the Converse Agent
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the agent settings and any prior conversation context.
//! 3. Starting a session with an echoing function-call handler.
//! 4. Logging session events until the session goes idle or Ctrl+C.

use anyhow::{Context, bail};
use clap::Parser;
use converse_agent::{
    config::Config,
    session::{SessionEvent, SessionOrchestrator, handler_fn},
};
use converse_core::ConversationContext;
use serde_json::{Map, Value, json};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Runs a realtime voice-agent session")]
struct Args {
    /// JSON file with the agent configuration sent as `Settings`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// JSON file with prior conversation turns.
    #[arg(long)]
    context: Option<PathBuf>,

    /// Text injected as a user turn once the settings are applied.
    #[arg(long)]
    say: Option<String>,
}

/// Listens for the `Ctrl+C` signal to end the session.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Closing session...");
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<Map<String, Value>> {
    let Some(path) = path else {
        return Ok(Map::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    match serde_json::from_str::<Value>(&raw).context("Settings file is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("Settings file must contain a JSON object"),
    }
}

fn load_context(path: Option<&PathBuf>) -> anyhow::Result<ConversationContext> {
    let Some(path) = path else {
        return Ok(ConversationContext::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read context file {}", path.display()))?;
    serde_json::from_str(&raw).context("Context file is not a valid conversation context")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Preparing session...");

    // --- 3. Load Settings and Context ---
    let settings = load_settings(args.settings.as_ref())?;
    let context = load_context(args.context.as_ref())?;
    info!(
        settings_keys = settings.len(),
        context_turns = context.len(),
        "Session inputs loaded."
    );

    // --- 4. Connect ---
    let echo = handler_fn(|request| {
        Ok(json!({ "function": request.name, "arguments": request.arguments }).to_string())
    });
    let (session, mut events) = SessionOrchestrator::new(config.session_config(settings, context))
        .with_function_handler(Arc::new(echo))
        .on_agent_state_change(|state| debug!(%state, "Agent state callback"))
        .connect()
        .await
        .context("Failed to start session")?;

    // --- 5. Run Until Idle or Interrupted ---
    let mut pending_say = args.say;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::SettingsApplied { channel } => {
                        info!(%channel, "Settings applied.");
                        if let Some(text) = pending_say.take() {
                            if !session.inject_user_message(text) {
                                warn!("Could not inject user message");
                            }
                        }
                    }
                    SessionEvent::ConnectionStateChanged { channel, state } => {
                        info!(%channel, %state, "Connection state changed.");
                    }
                    SessionEvent::AgentStateChanged(state) => info!(%state, "Agent state changed."),
                    SessionEvent::FunctionCallRequested(request) => {
                        info!(call_id = %request.id, name = %request.name, "Function call requested.");
                    }
                    SessionEvent::FunctionCallCompleted(settlement) => {
                        info!(call_id = %settlement.call_id, kind = ?settlement.kind, "Function call completed.");
                    }
                    SessionEvent::Message { channel, message } => {
                        info!(%channel, message = ?message, "Message received.");
                    }
                    SessionEvent::Unrecognized { channel, payload } => {
                        debug!(%channel, %payload, "Unrecognized message.");
                    }
                    SessionEvent::Audio(audio) => debug!(bytes = audio.len(), "Agent audio received."),
                    SessionEvent::IdleTimeout => {
                        info!("Session went idle.");
                        break;
                    }
                    SessionEvent::Closed => break,
                }
            }
        }
    }

    session.close().await;
    info!("Session has shut down.");
    Ok(())
}
