use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Exactly-once gate for the `Settings` handshake of one physical connection.
///
/// The guard lives inside the connection it protects, so a reconnect gets a
/// fresh guard and closing an old connection cannot affect a new one.
#[derive(Debug, Default)]
pub struct HandshakeGuard {
    sent: AtomicBool,
    acked: AtomicBool,
}

impl HandshakeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `send` only if no handshake has been sent on this connection.
    ///
    /// The flag is claimed before `send` runs, so concurrent callers cannot
    /// both get through. If `send` reports failure the claim is released and
    /// a later attempt may try again. Returns `true` only for the caller
    /// whose send went out.
    pub fn try_send<F>(&self, send: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        if self
            .sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("handshake already sent on this connection, skipping");
            return false;
        }
        if send() {
            true
        } else {
            self.sent.store(false, Ordering::Release);
            warn!("handshake send failed, flag rolled back");
            false
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    pub fn mark_acked(&self) {
        self.acked.store(true, Ordering::Release);
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_sends_once() {
        let guard = HandshakeGuard::new();
        let sends = AtomicUsize::new(0);
        let send = || {
            sends.fetch_add(1, Ordering::SeqCst);
            true
        };

        assert!(guard.try_send(send));
        assert!(!guard.try_send(send));
        assert!(!guard.try_send(send));
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert!(guard.is_sent());
    }

    #[test]
    fn test_failed_send_rolls_back() {
        let guard = HandshakeGuard::new();
        assert!(!guard.try_send(|| false));
        assert!(!guard.is_sent());

        assert!(guard.try_send(|| true));
        assert!(guard.is_sent());
    }

    #[test]
    fn test_concurrent_callers_send_once() {
        let guard = Arc::new(HandshakeGuard::new());
        let sends = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let sends = sends.clone();
                std::thread::spawn(move || {
                    guard.try_send(|| {
                        sends.fetch_add(1, Ordering::SeqCst);
                        true
                    })
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fresh_guard_per_connection() {
        let first = HandshakeGuard::new();
        assert!(first.try_send(|| true));
        first.mark_acked();

        let second = HandshakeGuard::new();
        assert!(!second.is_acked());
        assert!(second.try_send(|| true));
        assert!(first.is_acked());
    }
}
