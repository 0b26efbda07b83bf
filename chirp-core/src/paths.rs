// ABOUTME: XDG Base Directory paths for cross-platform config and data storage
// ABOUTME: Provides standardized paths for logs, plugin state, the lock file and configuration

use directories::ProjectDirs;
use std::path::PathBuf;

/// Application identifier for XDG directories
const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "chirp";
const APPLICATION: &str = "chirp";

/// Get XDG-compliant directories for the application
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Get the data directory path (e.g., ~/.local/share/chirp/)
/// Falls back to ./data if XDG directories unavailable
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Get the log directory path (inside data dir)
/// e.g., ~/.local/share/chirp/logs/
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Plugin enable/disable choices and settings
/// e.g., ~/.local/share/chirp/plugins.json
pub fn plugin_state_file() -> PathBuf {
    data_dir().join("plugins.json")
}

/// Single-instance lock
/// e.g., ~/.local/share/chirp/chirp.lock
pub fn lock_file() -> PathBuf {
    data_dir().join("chirp.lock")
}

/// Get the config directory path (e.g., ~/.config/chirp/)
/// Falls back to current directory if XDG directories unavailable
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default config file path
/// e.g., ~/.config/chirp/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
