//! Correlates a command originated over HTTP with the UDP `ACK` frame
//! that eventually resolves it.
//!
//! Dispatch is fire-and-forget from the HTTP frontend's point of view:
//! the command is sent and the token is registered as pending, and the
//! request returns immediately. Resolution (or expiry) happens later,
//! out of band, when the device's `ACK` frame arrives or the timeout
//! elapses, matching the at-most-once, no-retry policy the wire
//! protocol commits to.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;

use crate::monitor::{Monitor, Signal};

#[derive(Default)]
pub struct CommandDispatcher {
    pending: Mutex<HashSet<(String, u64)>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly allocated token as awaiting an `ACK`. Spawns a
    /// background task that clears the entry after `command_timeout` if
    /// no `ACK` has resolved it by then.
    pub fn register(self: &std::sync::Arc<Self>, channel_id: &str, token: u64, command_timeout: Duration, monitor: std::sync::Arc<Monitor>) {
        self.pending.lock().insert((channel_id.to_string(), token));

        let dispatcher = self.clone();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(command_timeout).await;
            let expired = dispatcher.pending.lock().remove(&(channel_id, token));
            if expired {
                monitor.record(Signal::CommandExpired);
            }
        });
    }

    /// Resolve a pending command from an inbound `ACK` frame. Returns
    /// `true` if a waiter was actually pending (at-most-once: a second
    /// `ACK` for the same token resolves nothing).
    pub fn resolve(&self, channel_id: &str, token: u64) -> bool {
        self.pending.lock().remove(&(channel_id.to_string(), token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_removes_pending_entry() {
        let dispatcher = Arc::new(CommandDispatcher::new());
        dispatcher.register("ABCD", 1, Duration::from_secs(5), Arc::new(Monitor::default()));
        assert!(dispatcher.resolve("ABCD", 1));
        assert!(!dispatcher.resolve("ABCD", 1));
    }

    #[tokio::test]
    async fn expires_after_timeout() {
        let dispatcher = Arc::new(CommandDispatcher::new());
        dispatcher.register("ABCD", 1, Duration::from_millis(20), Arc::new(Monitor::default()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!dispatcher.resolve("ABCD", 1));
    }

    #[test]
    fn resolve_without_registration_is_a_noop() {
        let dispatcher = CommandDispatcher::new();
        assert!(!dispatcher.resolve("ABCD", 1));
    }
}
