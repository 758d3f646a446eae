use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Transcription,
    Agent,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Transcription => f.write_str("transcription"),
            ChannelKind::Agent => f.write_str("agent"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SocketState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            SocketState::Connecting => 0,
            SocketState::Open => 1,
            SocketState::Closing => 2,
            SocketState::Closed => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SocketState::Connecting,
            1 => SocketState::Open,
            2 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketState::Connecting => "connecting",
            SocketState::Open => "open",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lock-free cell holding a [`SocketState`], shared between a socket task
/// and the handles that read it.
#[derive(Debug)]
pub struct AtomicSocketState(AtomicU8);

impl AtomicSocketState {
    pub fn new(state: SocketState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn load(&self) -> SocketState {
        SocketState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SocketState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

/// Identity of one physical socket. A reconnect always yields a new id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Hands out [`ConnectionId`]s. A session shares one of these across its
/// channels and every reopen, so ids never repeat within a session and no
/// process-wide counter exists.
#[derive(Debug, Default)]
pub struct ConnectionIds(AtomicU64);

impl ConnectionIds {
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_fresh() {
        let ids = ConnectionIds::default();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(a.to_string(), "conn-1");
    }

    #[test]
    fn test_atomic_state_roundtrip() {
        let cell = AtomicSocketState::new(SocketState::Connecting);
        for state in [
            SocketState::Open,
            SocketState::Closing,
            SocketState::Closed,
            SocketState::Connecting,
        ] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }
}
