// ABOUTME: Owns the chat session: connect, liveness tracking and backoff-driven reconnection.
// ABOUTME: Reconnect attempts run on spawned tasks and report back; only the event loop changes ConnectionState.

pub mod backoff;
pub mod liveness;

pub use backoff::{BackoffConfig, BackoffState, RetryDelay};
pub use liveness::{LivenessTracker, DEFAULT_LIVENESS_TIMEOUT};

use crate::error::ConnectionError;
use crate::events::{EventBus, Subscription};
use crate::metrics;
use crate::traits::{ChatMessage, ChatTransport, TransportEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// State & Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    fn gauge_value(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the manager publishes to its subscribers
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connecting,
    Connected { address: String, port: u16 },
    Disconnected { reason: String },
    Message(ChatMessage),
    LivenessPing { payload: String },
    LivenessAck,
    StateChanged { from: ConnectionState, to: ConnectionState },
    ReconnectScheduled { attempt: u64, delay: Duration, cooldown: bool },
}

/// Result of one spawned reconnect attempt
#[derive(Debug)]
pub struct AttemptOutcome {
    pub attempt: u64,
    pub result: Result<(), ConnectionError>,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub backoff: BackoffConfig,
    pub liveness_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct ConnectionManager {
    transport: Arc<dyn ChatTransport>,
    state: ConnectionState,
    backoff: BackoffState,
    liveness: LivenessTracker,
    events: EventBus<ConnectionEvent>,
    in_flight: Option<JoinHandle<()>>,
    attempt: u64,
    /// Set by an explicit disconnect or a credential rejection
    halted: bool,
    outcomes: mpsc::UnboundedSender<AttemptOutcome>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Returns the manager and the receiver its reconnect attempts report to.
    /// Feed every outcome back through [`Self::on_attempt_finished`].
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<AttemptOutcome>) {
        let (outcomes, rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            state: ConnectionState::Disconnected,
            backoff: BackoffState::new(config.backoff),
            liveness: LivenessTracker::new(config.liveness_timeout),
            events: EventBus::new(),
            in_flight: None,
            attempt: 0,
            halted: false,
            outcomes,
            cancel,
        };
        (manager, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn reconnect_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Recent heartbeat activity, or the transport says it's open
    pub fn is_alive(&self) -> bool {
        self.liveness.is_fresh() || self.transport.is_open()
    }

    fn set_state(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        metrics::set_connection_state(to.gauge_value());
        tracing::info!(from = %from, to = %to, "Connection state changed");
        self.events.publish(ConnectionEvent::StateChanged { from, to });
    }

    fn mark_connected(&mut self) {
        self.backoff.record_success();
        self.liveness.reset();
        self.set_state(ConnectionState::Connected);
    }

    /// Open the session. A credential rejection is returned; any other
    /// failure schedules a reconnect and reports the resulting state.
    pub async fn connect(&mut self) -> Result<ConnectionState, ConnectionError> {
        self.halted = false;
        self.set_state(ConnectionState::Connecting);
        self.events.publish(ConnectionEvent::Connecting);
        tracing::info!(endpoint = %self.transport.endpoint(), "Connecting to chat service");

        match self.transport.connect().await {
            Ok(()) => {
                self.mark_connected();
                Ok(self.state)
            }
            Err(e) if !e.is_retriable() => {
                tracing::error!(error = %e, "Chat service rejected credentials");
                self.halted = true;
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial connect failed, retrying with backoff");
                self.reconnect();
                Ok(self.state)
            }
        }
    }

    /// Close the session and stop any pending reconnect. Idempotent.
    pub async fn disconnect(&mut self) {
        self.halted = true;
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(error = %e, "Disconnect failed");
        }
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.events.publish(ConnectionEvent::Disconnected {
                reason: "requested".to_string(),
            });
        }
    }

    /// Schedule a reconnect attempt after the backoff delay. Returns false if
    /// one is already in flight.
    pub fn reconnect(&mut self) -> bool {
        if self.in_flight.is_some() {
            tracing::debug!("Reconnect already in flight");
            return false;
        }

        let wait = self.backoff.record_failure();
        let delay = wait.duration();
        self.attempt += 1;
        let attempt = self.attempt;

        self.set_state(ConnectionState::Reconnecting);
        metrics::record_reconnect_attempt(wait.is_cooldown());
        if wait.is_cooldown() {
            tracing::warn!(attempt, delay_secs = delay.as_secs(), "Reconnect attempts exhausted, cooling down");
        } else {
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        }
        self.events.publish(ConnectionEvent::ReconnectScheduled {
            attempt,
            delay,
            cooldown: wait.is_cooldown(),
        });

        let transport = Arc::clone(&self.transport);
        let outcomes = self.outcomes.clone();
        let cancel = self.cancel.child_token();

        self.in_flight = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // A stale session may still be half-open
            if let Err(e) = transport.disconnect().await {
                tracing::warn!(attempt, error = %e, "Disconnect before reconnect failed, continuing");
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = transport.connect() => result,
            };
            if outcomes.send(AttemptOutcome { attempt, result }).is_err() {
                tracing::debug!(attempt, "Reconnect outcome dropped, manager is gone");
            }
        }));
        true
    }

    /// Apply the outcome of a spawned attempt. Returns a credential error,
    /// which means retrying has stopped.
    pub fn on_attempt_finished(&mut self, outcome: AttemptOutcome) -> Result<(), ConnectionError> {
        if outcome.attempt != self.attempt || self.halted {
            tracing::debug!(attempt = outcome.attempt, "Ignoring stale reconnect outcome");
            return Ok(());
        }
        self.in_flight = None;

        match outcome.result {
            Ok(()) => {
                tracing::info!(attempt = outcome.attempt, "Reconnected");
                self.mark_connected();
                Ok(())
            }
            Err(e) if !e.is_retriable() => {
                tracing::error!(error = %e, "Credentials rejected during reconnect, giving up");
                self.halted = true;
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(attempt = outcome.attempt, error = %e, "Reconnect attempt failed");
                self.reconnect();
                Ok(())
            }
        }
    }

    /// Update liveness and state from a transport event and republish it.
    /// Returns the chat message for message events.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<ChatMessage> {
        match event {
            TransportEvent::Connecting => {
                self.events.publish(ConnectionEvent::Connecting);
                None
            }
            TransportEvent::Connected { address, port } => {
                tracing::debug!(address = %address, port, "Transport connected");
                self.events.publish(ConnectionEvent::Connected { address, port });
                None
            }
            TransportEvent::Disconnected { reason } => {
                tracing::warn!(reason = %reason, "Transport disconnected");
                self.events.publish(ConnectionEvent::Disconnected { reason });
                self.check_reconnect();
                None
            }
            TransportEvent::Message(message) => {
                self.events.publish(ConnectionEvent::Message(message.clone()));
                Some(message)
            }
            TransportEvent::LivenessPing { payload } => {
                self.on_liveness_ping(&payload).await;
                self.events.publish(ConnectionEvent::LivenessPing { payload });
                None
            }
            TransportEvent::LivenessAck => {
                self.on_liveness_ack();
                self.events.publish(ConnectionEvent::LivenessAck);
                None
            }
        }
    }

    /// Answer a remote ping immediately and refresh liveness
    pub async fn on_liveness_ping(&mut self, payload: &str) {
        if let Err(e) = self.transport.send_liveness_ack(payload).await {
            tracing::warn!(error = %e, "Failed to acknowledge liveness ping");
        }
        self.liveness.record_inbound_ping();
    }

    pub fn on_liveness_ack(&mut self) {
        self.liveness.record_outbound_ack();
    }

    /// Periodic check: probe the remote while connected, and reconnect when
    /// the transport is closed and heartbeats have gone stale. Returns true
    /// if a reconnect was scheduled.
    pub async fn check_liveness(&mut self) -> bool {
        if self.state == ConnectionState::Connected && self.transport.is_open() {
            if let Err(e) = self.transport.send_liveness_ping().await {
                tracing::debug!(error = %e, "Liveness ping failed");
            }
        }
        self.check_reconnect()
    }

    fn check_reconnect(&mut self) -> bool {
        if self.halted || self.in_flight.is_some() || self.state == ConnectionState::Connecting {
            return false;
        }
        if self.transport.is_open() || self.liveness.is_fresh() {
            return false;
        }
        tracing::warn!(
            timeout_secs = self.liveness.timeout().as_secs(),
            "Heartbeat stale and transport closed, reconnecting"
        );
        self.reconnect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}
