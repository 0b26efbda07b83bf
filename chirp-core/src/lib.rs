// ABOUTME: Plugin dispatch and connection resilience engine for chat automation
// ABOUTME: Transport-agnostic: concrete chat services implement ChatTransport

pub mod builtins;
pub mod commands;
pub mod config;
pub mod connection;
pub mod control;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod paths;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod store;
pub mod testing;
pub mod traits;

pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState};
pub use control::{control_channel, ControlAck, ControlEvent, ControlHandle, ControlReceiver, ControlVerb};
pub use dedup::DeduplicationCache;
pub use engine::{Engine, EngineConfig, ExitReason};
pub use error::{ConnectionError, HandlerError, PersistenceError, PluginError};
pub use pipeline::MessagePipeline;
pub use registry::{PluginCatalog, PluginRegistry};
pub use router::{CommandRouter, HandledResult};
pub use store::StateStore;

// Re-export the plugin-facing types
pub use plugin::{
    handler_fn, CommandContext, CommandDescriptor, CommandHandler, IncomingTransform, OutgoingTransform, Outbox,
    Plugin, PluginContext, SettingsHandle,
};
pub use traits::{ChatMessage, ChatTransport, OutboundMessage, Roles, TransportEvent, UserContext};
