// ABOUTME: Heartbeat bookkeeping: when we last answered a remote ping and when the remote last acked ours.
// ABOUTME: Freshness is judged from these timestamps, independent of what the socket claims.

use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct LivenessTracker {
    timeout: Duration,
    last_inbound_ping: Option<Instant>,
    last_outbound_ack: Option<Instant>,
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_TIMEOUT)
    }
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_inbound_ping: None,
            last_outbound_ack: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The remote pinged us (and we answered)
    pub fn record_inbound_ping(&mut self) {
        self.last_inbound_ping = Some(Instant::now());
    }

    /// The remote acknowledged one of our pings
    pub fn record_outbound_ack(&mut self) {
        self.last_outbound_ack = Some(Instant::now());
    }

    /// Treat a fresh session as live until the first timeout elapses
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.last_inbound_ping = Some(now);
        self.last_outbound_ack = None;
    }

    pub fn last_activity(&self) -> Option<Instant> {
        match (self.last_inbound_ping, self.last_outbound_ack) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        self.last_activity()
            .is_some_and(|seen| now.saturating_duration_since(seen) < self.timeout)
    }
}
