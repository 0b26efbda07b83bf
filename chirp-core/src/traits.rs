// ABOUTME: Chat transport contract and the message types that cross it.
// ABOUTME: Any chat service (IRC, WebSocket gateways, test doubles) plugs in by implementing ChatTransport.

use crate::error::ConnectionError;
use crate::events::EventBus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// User Identity
// =============================================================================

/// Role flags reported by the transport. Never inferred from message text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    pub broadcaster: bool,
    pub moderator: bool,
    /// Configured bot owner
    pub owner: bool,
    pub vip: bool,
    pub subscriber: bool,
}

impl Roles {
    /// Moderator, broadcaster or owner: allowed to run mod-only commands
    pub fn is_privileged(&self) -> bool {
        self.broadcaster || self.moderator || self.owner
    }
}

/// Who sent a chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    /// Stable platform user id
    pub id: String,
    /// Login name (lower-case handle)
    pub login: String,
    pub display_name: Option<String>,
    pub roles: Roles,
}

impl UserContext {
    pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
            display_name: None,
            roles: Roles::default(),
        }
    }

    pub fn with_roles(mut self, roles: Roles) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name to address the user by in replies
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A chat line received from the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Platform message id, when the service provides one
    pub id: Option<String>,
    /// Channel the message was sent to
    pub target: String,
    pub user: UserContext,
    pub text: String,
    /// Echo of our own message
    pub is_self: bool,
}

impl ChatMessage {
    pub fn new(target: impl Into<String>, user: UserContext, text: impl Into<String>) -> Self {
        Self {
            id: None,
            target: target.into(),
            user,
            text: text.into(),
            is_self: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A chat line we intend to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub target: String,
    pub text: String,
}

impl OutboundMessage {
    pub fn new(target: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            text: text.into(),
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Lifecycle and traffic notifications published by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connecting,
    Connected { address: String, port: u16 },
    Disconnected { reason: String },
    Message(ChatMessage),
    /// Remote keep-alive probe; must be acknowledged with the same payload
    LivenessPing { payload: String },
    /// Remote acknowledged a probe we sent
    LivenessAck,
}

/// Connection to a real-time chat service.
///
/// `send` and the liveness methods enqueue work and return quickly; the
/// transport owns whatever writer task actually talks to the network.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open the session, authenticate and join configured channels
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Close the session. Safe to call when already closed.
    async fn disconnect(&self) -> Result<(), ConnectionError>;

    /// Send a chat line to a channel
    async fn send(&self, target: &str, text: &str) -> Result<(), ConnectionError>;

    /// Probe the remote; it answers with [`TransportEvent::LivenessAck`]
    async fn send_liveness_ping(&self) -> Result<(), ConnectionError>;

    /// Answer a remote [`TransportEvent::LivenessPing`]
    async fn send_liveness_ack(&self, payload: &str) -> Result<(), ConnectionError>;

    /// Raw transport state. May lag reality; combine with heartbeat tracking.
    fn is_open(&self) -> bool;

    /// Event stream for lifecycle, messages and liveness signals
    fn events(&self) -> &EventBus<TransportEvent>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_roles() {
        assert!(!Roles::default().is_privileged());
        assert!(Roles {
            moderator: true,
            ..Roles::default()
        }
        .is_privileged());
        assert!(Roles {
            broadcaster: true,
            ..Roles::default()
        }
        .is_privileged());
        assert!(Roles {
            owner: true,
            ..Roles::default()
        }
        .is_privileged());
        assert!(!Roles {
            vip: true,
            subscriber: true,
            ..Roles::default()
        }
        .is_privileged());
    }

    #[test]
    fn test_display_prefers_display_name() {
        let user = UserContext::new("42", "alice");
        assert_eq!(user.display(), "alice");
        let user = user.with_display_name("Alice");
        assert_eq!(user.display(), "Alice");
    }
}
