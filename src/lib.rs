// ABOUTME: Root library module for the chirp binary
// ABOUTME: IRC-over-WebSocket transport, control server, bundled plugins and process wiring

pub mod app;
pub mod control;
pub mod lockfile;
pub mod logging;
pub mod plugins;
pub mod transport;

// Re-export the engine crate modules
pub use chirp_core::config;
pub use chirp_core::metrics;
pub use chirp_core::paths;

pub use chirp_core::{Config, Engine, EngineConfig, ExitReason};
