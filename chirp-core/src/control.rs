// ABOUTME: Administrative side-channel contract: verbs, acknowledgments, status snapshots and relayed events
// ABOUTME: Servers hold a ControlHandle; the engine owns the matching ControlReceiver

use crate::connection::ConnectionState;
use crate::registry::PluginStatus;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

// =============================================================================
// Verbs & Acknowledgments
// =============================================================================

/// Operator commands. Wire form: `{"verb": "ENABLE_PLUGIN", "name": "dice"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlVerb {
    GetStatus,
    EnablePlugin { name: String },
    DisablePlugin { name: String },
    ReloadPlugin { name: String },
    Restart,
    Shutdown,
}

impl ControlVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetStatus => "GET_STATUS",
            Self::EnablePlugin { .. } => "ENABLE_PLUGIN",
            Self::DisablePlugin { .. } => "DISABLE_PLUGIN",
            Self::ReloadPlugin { .. } => "RELOAD_PLUGIN",
            Self::Restart => "RESTART",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connection_state: ConnectionState,
    pub uptime_secs: u64,
    pub loaded_plugins: Vec<PluginStatus>,
    pub enabled_commands: Vec<String>,
}

/// Reply to every verb
#[derive(Debug, Clone, Serialize)]
pub struct ControlAck {
    pub verb: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSnapshot>,
}

impl ControlAck {
    pub fn ok(verb: &ControlVerb, message: impl Into<String>) -> Self {
        Self {
            verb: verb.as_str(),
            ok: true,
            message: Some(message.into()),
            status: None,
        }
    }

    pub fn error(verb: &ControlVerb, message: impl Into<String>) -> Self {
        Self {
            verb: verb.as_str(),
            ok: false,
            message: Some(message.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: StatusSnapshot) -> Self {
        self.status = Some(status);
        self
    }
}

// =============================================================================
// Relayed Events
// =============================================================================

/// Pushed to every control client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Status {
        status: StatusSnapshot,
    },
    Connection {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Copy of a chat line we sent
    Outbound {
        target: String,
        text: String,
    },
    Command {
        command: String,
        user: String,
        outcome: &'static str,
    },
    Plugin {
        name: String,
        action: &'static str,
        ok: bool,
    },
}

// =============================================================================
// Channel
// =============================================================================

/// A verb plus the slot its acknowledgment goes to
#[derive(Debug)]
pub struct ControlRequest {
    pub verb: ControlVerb,
    pub reply: oneshot::Sender<ControlAck>,
}

/// Client side: issue verbs, subscribe to events. Cheap to clone.
#[derive(Clone)]
pub struct ControlHandle {
    requests: mpsc::Sender<ControlRequest>,
    events: broadcast::Sender<ControlEvent>,
}

/// Engine side. Outlives individual engines so a restart keeps clients attached.
pub struct ControlReceiver {
    pub requests: mpsc::Receiver<ControlRequest>,
    pub events: broadcast::Sender<ControlEvent>,
}

pub fn control_channel(capacity: usize) -> (ControlHandle, ControlReceiver) {
    let (requests, rx) = mpsc::channel(capacity);
    let (events, _) = broadcast::channel(256);
    (
        ControlHandle {
            requests,
            events: events.clone(),
        },
        ControlReceiver {
            requests: rx,
            events,
        },
    )
}

impl ControlHandle {
    /// Send a verb and wait for its acknowledgment
    pub async fn request(&self, verb: ControlVerb) -> Result<ControlAck> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ControlRequest { verb, reply })
            .await
            .map_err(|_| anyhow::anyhow!("agent is not running"))?;
        rx.await.context("agent dropped the request without acknowledging")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }
}
