// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and provides sensible defaults for optional ones
use crate::connection::{BackoffConfig, ConnectionConfig};
use crate::dedup::DedupConfig;
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// IRC-over-WebSocket endpoint
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub nick: String,
    /// Sent as PASS; "oauth:" is prepended when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    /// Logins treated as bot owners for mod-only commands
    #[serde(default)]
    pub owners: Vec<String>,
}

// Custom Debug impl to redact the token
impl std::fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatConfig")
            .field("server_url", &self.server_url)
            .field("nick", &self.nick)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("channels", &self.channels)
            .field("owners", &self.owners)
            .finish()
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            nick: String::new(),
            token: None,
            channels: Vec::new(),
            owners: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Single-character prefixes; the first is primary
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    /// In-chat notice for failed commands. `{user}` and `{command}` are substituted.
    #[serde(default = "default_failure_notice")]
    pub failure_notice: String,
    /// Register ping/uptime/version/commands as fallbacks
    #[serde(default = "default_true")]
    pub builtins: bool,
    /// How long shutdown waits for in-flight handlers
    #[serde(default = "default_drain_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            failure_notice: default_failure_notice(),
            builtins: true,
            drain_timeout_secs: default_drain_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_dedup_window_ms")]
    pub message_ttl_ms: u64,
    #[serde(default = "default_dedup_window_ms")]
    pub repeat_window_ms: u64,
    #[serde(default = "default_dedup_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            message_ttl_ms: default_dedup_window_ms(),
            repeat_window_ms: default_dedup_window_ms(),
            max_entries: default_dedup_max_entries(),
            eviction_interval_ms: default_eviction_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Failures before the cool-down; 0 disables it
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "default_liveness_check_secs")]
    pub liveness_check_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            liveness_check_secs: default_liveness_check_secs(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_control_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    /// Required as a bearer token when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

// Custom Debug impl to redact the token
impl std::fmt::Debug for ControlConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("status_interval_secs", &self.status_interval_secs)
            .finish()
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_control_host(),
            port: default_control_port(),
            token: None,
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Defaults to the XDG data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
    /// Plugins that start disabled unless enabled at runtime
    #[serde(default)]
    pub disabled: Vec<String>,
}

fn default_server_url() -> String {
    "wss://irc-ws.chat.twitch.tv:443".to_string()
}

fn default_prefixes() -> Vec<String> {
    vec!["!".to_string(), "~".to_string()]
}

fn default_failure_notice() -> String {
    "@{user} sorry, {command} failed".to_string()
}

fn default_true() -> bool {
    true
}

fn default_drain_secs() -> u64 {
    10
}

fn default_dedup_window_ms() -> u64 {
    2000
}

fn default_dedup_max_entries() -> usize {
    10_000
}

fn default_eviction_interval_ms() -> u64 {
    1000
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    10
}

fn default_cooldown_secs() -> u64 {
    300 // 5 minutes
}

fn default_liveness_timeout_secs() -> u64 {
    120
}

fn default_liveness_check_secs() -> u64 {
    30
}

fn default_control_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    13080
}

fn default_status_interval_secs() -> u64 {
    10
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    }
    path.to_string()
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid number, got: {}", key, val))
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. the explicit path (--config)
    /// 2. CHIRP_CONFIG_PATH env var
    /// 3. ./config.toml
    /// 4. ~/.config/chirp/config.toml
    fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            return Ok(Some(path.to_path_buf()));
        }

        if let Ok(env_path) = std::env::var("CHIRP_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Ok(Some(local_config));
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Ok(Some(xdg_config));
        }

        Ok(None)
    }

    /// Load, apply environment overrides and validate
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::find_config_file(explicit)? {
            Some(config_path) => {
                tracing::info!(path = %config_path.display(), "Loading configuration from file");
                let content = std::fs::read_to_string(&config_path)
                    .with_context(|| format!("Failed to read {}", config_path.display()))?;
                toml::from_str::<Config>(&content)
                    .with_context(|| format!("Failed to parse {}", config_path.display()))?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("CHIRP_SERVER_URL") {
            self.chat.server_url = val;
        }
        if let Ok(val) = std::env::var("CHIRP_NICK") {
            self.chat.nick = val;
        }
        if let Ok(val) = std::env::var("CHIRP_TOKEN") {
            self.chat.token = Some(val);
            // Clear from environment to prevent exposure via /proc or ps
            std::env::remove_var("CHIRP_TOKEN");
        }
        if let Ok(val) = std::env::var("CHIRP_CHANNELS") {
            self.chat.channels = split_list(&val);
        }
        if let Ok(val) = std::env::var("CHIRP_OWNERS") {
            self.chat.owners = split_list(&val);
        }
        if let Ok(val) = std::env::var("CHIRP_PREFIXES") {
            self.commands.prefixes = split_list(&val);
        }
        if let Ok(val) = std::env::var("CHIRP_CONTROL_HOST") {
            self.control.host = val;
        }
        if let Ok(val) = std::env::var("CHIRP_CONTROL_PORT") {
            self.control.port = val.parse().with_context(|| {
                format!("CHIRP_CONTROL_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("CHIRP_CONTROL_TOKEN") {
            self.control.token = Some(val);
            std::env::remove_var("CHIRP_CONTROL_TOKEN");
        }
        if let Ok(val) = std::env::var("CHIRP_STATE_FILE") {
            self.plugins.state_file = Some(val);
        }
        if let Ok(val) = std::env::var("CHIRP_LIVENESS_TIMEOUT_SECS") {
            self.connection.liveness_timeout_secs = parse_env("CHIRP_LIVENESS_TIMEOUT_SECS", &val)?;
        }
        Ok(())
    }

    /// Normalize and check every section
    pub fn validate(&mut self) -> Result<()> {
        if self.chat.server_url.trim().is_empty() {
            anyhow::bail!("chat.server_url must not be empty");
        }
        if self.chat.nick.trim().is_empty() {
            anyhow::bail!("chat.nick is required (set in config.toml or CHIRP_NICK env var)");
        }
        self.chat.nick = self.chat.nick.trim().to_lowercase();

        self.chat.channels = self
            .chat
            .channels
            .iter()
            .map(|c| c.trim().trim_start_matches('#').to_lowercase())
            .filter(|c| !c.is_empty())
            .map(|c| format!("#{}", c))
            .collect();
        if self.chat.channels.is_empty() {
            anyhow::bail!("chat.channels must contain at least one channel");
        }
        self.chat.owners = self
            .chat
            .owners
            .iter()
            .map(|o| o.trim().to_lowercase())
            .filter(|o| !o.is_empty())
            .collect();

        if self.commands.prefixes.is_empty() {
            anyhow::bail!("commands.prefixes must contain at least one prefix");
        }
        for prefix in &self.commands.prefixes {
            let mut chars = prefix.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if !c.is_alphanumeric() && !c.is_whitespace() => {}
                _ => anyhow::bail!(
                    "Invalid command prefix '{}': must be a single non-alphanumeric character",
                    prefix
                ),
            }
        }

        if self.dedup.message_ttl_ms == 0 || self.dedup.repeat_window_ms == 0 {
            anyhow::bail!("dedup windows must be greater than zero");
        }
        if self.dedup.max_entries == 0 {
            anyhow::bail!("dedup.max_entries must be greater than zero");
        }
        if self.dedup.eviction_interval_ms == 0 {
            anyhow::bail!("dedup.eviction_interval_ms must be greater than zero");
        }

        let conn = &self.connection;
        if conn.initial_delay_ms == 0 {
            anyhow::bail!("connection.initial_delay_ms must be greater than zero");
        }
        if conn.max_delay_ms < conn.initial_delay_ms {
            anyhow::bail!("connection.max_delay_ms must be at least connection.initial_delay_ms");
        }
        if conn.multiplier == 0 {
            anyhow::bail!("connection.multiplier must be at least 1");
        }
        if conn.liveness_timeout_secs == 0 || conn.liveness_check_secs == 0 {
            anyhow::bail!("connection liveness intervals must be greater than zero");
        }

        if self.control.status_interval_secs == 0 {
            anyhow::bail!("control.status_interval_secs must be greater than zero");
        }

        if let Some(path) = &self.plugins.state_file {
            self.plugins.state_file = Some(expand_tilde(path));
        }
        Ok(())
    }

    /// Validated prefixes as characters
    pub fn prefix_chars(&self) -> Vec<char> {
        self.commands
            .prefixes
            .iter()
            .filter_map(|p| p.chars().next())
            .collect()
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            message_ttl: Duration::from_millis(self.dedup.message_ttl_ms),
            repeat_window: Duration::from_millis(self.dedup.repeat_window_ms),
            max_entries: self.dedup.max_entries,
        }
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.dedup.eviction_interval_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let conn = &self.connection;
        ConnectionConfig {
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(conn.initial_delay_ms),
                max_delay: Duration::from_millis(conn.max_delay_ms),
                multiplier: conn.multiplier,
                max_attempts: conn.max_attempts,
                cooldown: Duration::from_secs(conn.cooldown_secs),
            },
            liveness_timeout: Duration::from_secs(conn.liveness_timeout_secs),
        }
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_secs(self.connection.liveness_check_secs)
    }

    pub fn state_file(&self) -> PathBuf {
        self.plugins
            .state_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::plugin_state_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r##"
        [chat]
        nick = "ChirpBot"
        token = "oauth:secret"
        channels = ["#Lobby", "games"]
    "##;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.chat.nick, "chirpbot");
        assert_eq!(config.chat.channels, vec!["#lobby", "#games"]);
        assert_eq!(config.prefix_chars(), vec!['!', '~']);
        assert_eq!(config.dedup_config().message_ttl, Duration::from_secs(2));
        let conn = config.connection_config();
        assert_eq!(conn.backoff.initial_delay, Duration::from_secs(2));
        assert_eq!(conn.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(conn.liveness_timeout, Duration::from_secs(120));
        assert!(config.control.enabled);
        assert!(config.commands.builtins);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.control.token = Some("hunter2".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("oauth:secret"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_missing_nick_is_rejected() {
        let err = Config::from_toml_str("[chat]\nchannels = [\"#a\"]").unwrap_err();
        assert!(err.to_string().contains("chat.nick"));
    }

    #[test]
    fn test_missing_channels_is_rejected() {
        let err = Config::from_toml_str("[chat]\nnick = \"bot\"").unwrap_err();
        assert!(err.to_string().contains("chat.channels"));
    }

    #[test]
    fn test_multi_char_prefix_is_rejected() {
        let content = format!("{}\n[commands]\nprefixes = [\"!!\"]", MINIMAL);
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("prefix"));

        let content = format!("{}\n[commands]\nprefixes = [\"a\"]", MINIMAL);
        assert!(Config::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let content = format!(
            "{}\n[connection]\ninitial_delay_ms = 5000\nmax_delay_ms = 1000",
            MINIMAL
        );
        assert!(Config::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_sections_override_defaults() {
        let content = format!(
            r#"{}
            [dedup]
            message_ttl_ms = 500
            max_entries = 10

            [connection]
            max_attempts = 0
            cooldown_secs = 30

            [plugins]
            disabled = ["echo"]
            state_file = "/tmp/chirp-state.json"
            "#,
            MINIMAL
        );
        let config = Config::from_toml_str(&content).unwrap();
        assert_eq!(config.dedup_config().message_ttl, Duration::from_millis(500));
        assert_eq!(config.dedup_config().max_entries, 10);
        assert_eq!(config.connection_config().backoff.max_attempts, 0);
        assert_eq!(config.plugins.disabled, vec!["echo"]);
        assert_eq!(config.state_file(), PathBuf::from("/tmp/chirp-state.json"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file_values() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("CHIRP_NICK", "override");
        std::env::set_var("CHIRP_CHANNELS", "one, two");
        std::env::set_var("CHIRP_PREFIXES", "?");
        let config = Config::load(Some(&path));
        std::env::remove_var("CHIRP_NICK");
        std::env::remove_var("CHIRP_CHANNELS");
        std::env::remove_var("CHIRP_PREFIXES");

        let config = config.unwrap();
        assert_eq!(config.chat.nick, "override");
        assert_eq!(config.chat.channels, vec!["#one", "#two"]);
        assert_eq!(config.prefix_chars(), vec!['?']);
    }

    #[test]
    #[serial]
    fn test_token_env_var_is_cleared_after_load() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("CHIRP_TOKEN", "oauth:fromenv");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.chat.token.as_deref(), Some("oauth:fromenv"));
        assert!(std::env::var("CHIRP_TOKEN").is_err());
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let tmpdir = tempfile::tempdir().unwrap();
        let missing = tmpdir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
