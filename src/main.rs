// ABOUTME: CLI entry point: parses arguments, initializes logging, takes the instance lock
// ABOUTME: and runs the bot until Ctrl-C, SIGTERM or a SHUTDOWN control verb

use anyhow::Result;
use chirp::{app, lockfile::InstanceLock, logging, paths, plugins::builtin_catalog, Config};
use chirp_core::StateStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "chirp", version, about = "Chat automation bot with hot-swappable plugins")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ./config.toml, then the XDG config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    /// Skip the rolling log file
    #[arg(long, global = true, default_value_t = false)]
    no_log_file: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and serve commands (default)
    Run,
    /// Load and validate the config, then print it with secrets redacted
    CheckConfig,
    /// List bundled plugins and their persisted enable state
    Plugins,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_dir = paths::log_dir();
    let _log_guard = logging::init(cli.log_json, (!cli.no_log_file).then_some(log_dir.as_path()))?;
    logging::install_panic_hook();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.config, config).await,
        Commands::CheckConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Commands::Plugins => list_plugins(&config),
    }
}

async fn run(config_path: Option<PathBuf>, config: Config) -> Result<()> {
    let mut lock = InstanceLock::open(&paths::lock_file())?;
    let _lock_guard = lock.try_acquire()?;

    tracing::info!(version = app::VERSION, "Starting chirp");

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    app::run(config_path, config, shutdown).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        shutdown.cancel();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
                _ = term.recv() => tracing::info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C");
            }
        }
        shutdown.cancel();
    });
}

fn list_plugins(config: &Config) -> Result<()> {
    let catalog = builtin_catalog();
    let store = StateStore::open(config.state_file());

    for source in catalog.sources() {
        let description = match catalog.instantiate(source) {
            Some(Ok(plugin)) => plugin.description().to_string(),
            Some(Err(e)) => format!("(failed to build: {e})"),
            None => continue,
        };
        let enabled = store
            .enabled_preference(source)
            .unwrap_or_else(|| !config.plugins.disabled.iter().any(|d| d == source));
        println!(
            "{:<10} {:<8} {}",
            source,
            if enabled { "enabled" } else { "disabled" },
            description
        );
    }

    if let Some(path) = store.path() {
        println!("\nstate: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["chirp"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.log_json);
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["chirp", "check-config", "--config", "bot.toml", "--log-json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("bot.toml")));
        assert!(cli.log_json);
    }
}
