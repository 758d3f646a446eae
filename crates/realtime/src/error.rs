use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid websocket request for {url}: {reason}")]
    InvalidRequest { url: String, reason: String },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("server rejected the upgrade with HTTP {0}")]
    Rejected(u16),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
}

impl ChannelError {
    /// Errors that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            ChannelError::InvalidRequest { .. } => true,
            ChannelError::Rejected(status) => matches!(status, 400 | 401 | 403 | 404),
            ChannelError::ConnectTimeout(_) | ChannelError::Transport(_) => false,
        }
    }

    pub(crate) fn from_connect(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => ChannelError::Rejected(response.status().as_u16()),
            other => ChannelError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_rejections_are_permanent() {
        assert!(ChannelError::Rejected(401).is_permanent());
        assert!(ChannelError::Rejected(403).is_permanent());
        assert!(!ChannelError::Rejected(503).is_permanent());
        assert!(!ChannelError::ConnectTimeout("wss://x".into()).is_permanent());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        let err = ChannelError::Transport(tungstenite::Error::ConnectionClosed);
        assert!(!err.is_permanent());
    }
}
