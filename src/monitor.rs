//! Lock-free counters for operational visibility, surfaced over the HTTP
//! API. Modeled on the same `Counts`/atomic-add shape used elsewhere in
//! this codebase for per-worker statistics, just keyed by a handful of
//! named counters instead of per-peer byte/packet totals.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    FrameAccepted,
    FrameRejected,
    HttpRequest,
    CommandSent,
    CommandResolved,
    CommandExpired,
}

#[derive(Default)]
struct Count(AtomicU64);

impl Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide counters.
///
/// # Example
///
/// ```
/// use telehub::monitor::{Monitor, Signal};
///
/// let monitor = Monitor::default();
/// monitor.record(Signal::FrameAccepted);
/// monitor.record(Signal::FrameAccepted);
/// monitor.record(Signal::FrameRejected);
///
/// let snapshot = monitor.snapshot();
/// assert_eq!(snapshot.frames_accepted, 2);
/// assert_eq!(snapshot.frames_rejected, 1);
/// ```
#[derive(Default)]
pub struct Monitor {
    frames_accepted: Count,
    frames_rejected: Count,
    http_requests: Count,
    commands_sent: Count,
    commands_resolved: Count,
    commands_expired: Count,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MonitorSnapshot {
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub http_requests: u64,
    pub commands_sent: u64,
    pub commands_resolved: u64,
    pub commands_expired: u64,
}

impl Monitor {
    pub fn record(&self, signal: Signal) {
        match signal {
            Signal::FrameAccepted => self.frames_accepted.add(1),
            Signal::FrameRejected => self.frames_rejected.add(1),
            Signal::HttpRequest => self.http_requests.add(1),
            Signal::CommandSent => self.commands_sent.add(1),
            Signal::CommandResolved => self.commands_resolved.add(1),
            Signal::CommandExpired => self.commands_expired.add(1),
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            frames_accepted: self.frames_accepted.get(),
            frames_rejected: self.frames_rejected.get(),
            http_requests: self.http_requests.get(),
            commands_sent: self.commands_sent.get(),
            commands_resolved: self.commands_resolved.get(),
            commands_expired: self.commands_expired.get(),
        }
    }
}
