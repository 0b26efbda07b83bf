// ABOUTME: Process-level wiring: control server, plugin catalog, transport and the engine restart loop
// ABOUTME: RESTART rebuilds everything from a freshly loaded config without leaving the process

use crate::control::{self, ControlState};
use crate::plugins::builtin_catalog;
use crate::transport::IrcTransport;
use anyhow::Result;
use chirp_core::{
    control_channel, metrics, Config, Engine, EngineConfig, ExitReason, PluginRegistry, StateStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the control request queue
const CONTROL_QUEUE: usize = 32;

/// Run the bot until `shutdown` fires or a SHUTDOWN verb arrives.
/// `config_path` is re-read on every RESTART.
pub async fn run(config_path: Option<PathBuf>, mut config: Config, shutdown: CancellationToken) -> Result<()> {
    let prometheus = match metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let (handle, mut receiver) = control_channel(CONTROL_QUEUE);

    let server_cancel = shutdown.child_token();
    let server = if config.control.enabled {
        let state = ControlState::new(handle.clone())
            .with_token(config.control.token.clone())
            .with_metrics(prometheus);
        let control_config = config.control.clone();
        let cancel = server_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = control::serve(&control_config, state, cancel).await {
                tracing::error!(error = %e, "Control server exited");
            }
        }))
    } else {
        tracing::info!("Control server disabled");
        None
    };

    let result = loop {
        let store = StateStore::open(config.state_file());
        let registry = PluginRegistry::new(builtin_catalog(), store)
            .with_default_disabled(config.plugins.disabled.clone());
        let transport = Arc::new(IrcTransport::new(config.chat.clone()));
        let engine = Engine::new(
            EngineConfig::from_config(&config).with_version(VERSION),
            transport,
            registry,
            shutdown.child_token(),
        );

        tracing::info!(
            nick = %config.chat.nick,
            channels = config.chat.channels.len(),
            "Starting engine"
        );

        match engine.run(&mut receiver).await {
            Ok(ExitReason::Shutdown) => break Ok(()),
            Ok(ExitReason::Restart) => {
                if shutdown.is_cancelled() {
                    break Ok(());
                }
                match Config::load(config_path.as_deref()) {
                    Ok(fresh) => {
                        tracing::info!("Configuration reloaded");
                        config = fresh;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Config reload failed, restarting with previous config");
                    }
                }
            }
            Err(e) => break Err(e),
        }
    };

    server_cancel.cancel();
    if let Some(server) = server {
        if let Err(e) = server.await {
            tracing::warn!(error = %e, "Control server task failed");
        }
    }

    result
}
