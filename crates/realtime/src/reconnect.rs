use std::time::Duration;

pub const RECONNECT_BASE_MS: u64 = 800;
pub const RECONNECT_MAX_MS: u64 = 30_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 12;

/// Backoff schedule applied after an unexpected close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(RECONNECT_BASE_MS),
            max_delay: Duration::from_millis(RECONNECT_MAX_MS),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// `attempt` is 1-based.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }

    /// Delay before `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}
