// ABOUTME: Error taxonomy for the chat engine: connection, plugin, handler and persistence failures.
// ABOUTME: Only authentication failures are fatal; every other kind is isolated to its origin.

use thiserror::Error;

/// Failure while establishing or maintaining the chat session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The chat service rejected our credentials. Never retried.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Network or protocol failure that backoff may recover from.
    #[error("connection failed: {0}")]
    Transient(String),
}

impl ConnectionError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication(reason.into())
    }

    /// Whether the reconnect loop may try again after this error
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure confined to a single plugin unit.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin source '{source_name}' failed to load: {reason}")]
    Load { source_name: String, reason: String },

    #[error("unknown plugin: {0}")]
    NotFound(String),

    #[error("plugin '{plugin}' {hook} hook failed: {reason}")]
    Hook {
        plugin: String,
        hook: &'static str,
        reason: String,
    },
}

/// A command handler returned an error or panicked.
#[derive(Debug, Error)]
#[error("command '{command}' failed: {reason}")]
pub struct HandlerError {
    pub command: String,
    pub reason: String,
}

/// Writing plugin state to disk failed. In-memory state stays authoritative.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write plugin state to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode plugin state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(ConnectionError::transient("reset by peer").is_retriable());
        assert!(!ConnectionError::authentication("bad token").is_retriable());
    }

    #[test]
    fn test_error_messages_name_the_origin() {
        let err = PluginError::Hook {
            plugin: "dice".to_string(),
            hook: "init",
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "plugin 'dice' init hook failed: boom");

        let err = HandlerError {
            command: "roll".to_string(),
            reason: "bad dice".to_string(),
        };
        assert!(err.to_string().contains("'roll'"));
    }
}
