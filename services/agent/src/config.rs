use crate::session::SessionConfig;
use converse_core::ConversationContext;
use converse_realtime::{ChannelAuth, ChannelSpec, ReconnectPolicy};
use secrecy::SecretString;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// How the API key is presented in the `Authorization` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    Token,
    Bearer,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub agent_url: String,
    pub transcription_url: Option<String>,
    pub api_key: SecretString,
    pub auth_scheme: AuthScheme,
    /// `None` when `IDLE_TIMEOUT_MS=0`.
    pub idle_timeout: Option<Duration>,
    pub reconnect: bool,
    pub keepalive_interval: Duration,
    pub function_call_timeout: Duration,
    pub connect_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let agent_url =
            std::env::var("AGENT_URL").map_err(|_| ConfigError::MissingVar("AGENT_URL".to_string()))?;
        let transcription_url = std::env::var("TRANSCRIPTION_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let api_key = std::env::var("VOICE_API_KEY")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingVar("VOICE_API_KEY".to_string()))?;

        let auth_scheme_str = std::env::var("AUTH_SCHEME").unwrap_or_else(|_| "token".to_string());
        let auth_scheme = match auth_scheme_str.to_lowercase().as_str() {
            "token" => AuthScheme::Token,
            "bearer" => AuthScheme::Bearer,
            other => {
                return Err(ConfigError::InvalidValue(
                    "AUTH_SCHEME".to_string(),
                    format!("'{}' is not one of token, bearer", other),
                ));
            }
        };

        let idle_timeout_ms = parse_millis("IDLE_TIMEOUT_MS", 10_000)?;
        let idle_timeout = (idle_timeout_ms > 0).then(|| Duration::from_millis(idle_timeout_ms));

        let reconnect_str = std::env::var("RECONNECT").unwrap_or_else(|_| "true".to_string());
        let reconnect = match reconnect_str.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                return Err(ConfigError::InvalidValue(
                    "RECONNECT".to_string(),
                    format!("'{}' is not a boolean", other),
                ));
            }
        };

        let keepalive_interval = Duration::from_millis(parse_millis("KEEPALIVE_INTERVAL_MS", 8_000)?);
        let function_call_timeout =
            Duration::from_millis(parse_millis("FUNCTION_CALL_TIMEOUT_MS", 30_000)?);
        let connect_timeout = Duration::from_millis(parse_millis("CONNECT_TIMEOUT_MS", 10_000)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            agent_url,
            transcription_url,
            api_key,
            auth_scheme,
            idle_timeout,
            reconnect,
            keepalive_interval,
            function_call_timeout,
            connect_timeout,
            log_level,
        })
    }

    fn auth(&self) -> ChannelAuth {
        match self.auth_scheme {
            AuthScheme::Token => ChannelAuth::Token(self.api_key.clone()),
            AuthScheme::Bearer => ChannelAuth::Bearer(self.api_key.clone()),
        }
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        if self.reconnect {
            ReconnectPolicy::default()
        } else {
            ReconnectPolicy::disabled()
        }
    }

    /// Builds the session configuration for these endpoints.
    pub fn session_config(
        &self,
        settings: Map<String, Value>,
        context: ConversationContext,
    ) -> SessionConfig {
        let agent = ChannelSpec::agent(&self.agent_url)
            .with_auth(self.auth())
            .with_keepalive(Some(self.keepalive_interval))
            .with_connect_timeout(self.connect_timeout)
            .with_reconnect(self.reconnect_policy());
        let transcription = self.transcription_url.as_ref().map(|url| {
            ChannelSpec::transcription(url)
                .with_auth(self.auth())
                .with_connect_timeout(self.connect_timeout)
                .with_reconnect(self.reconnect_policy())
        });

        SessionConfig {
            agent,
            transcription,
            settings,
            context,
            idle_timeout: self.idle_timeout,
            disconnect_on_idle: true,
            function_call_timeout: self.function_call_timeout,
        }
    }
}

fn parse_millis(var: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
            ConfigError::InvalidValue(
                var.to_string(),
                format!("'{}' is not a number of milliseconds", raw),
            )
        }),
        Err(_) => Ok(default),
    }
}
