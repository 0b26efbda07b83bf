// ABOUTME: Prometheus metrics for command dispatch and connection health
// ABOUTME: Recording helpers are no-ops until init_metrics installs the global recorder

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub const COMMANDS_TOTAL: &str = "chirp_commands_total";
pub const DEDUP_REJECTIONS_TOTAL: &str = "chirp_dedup_rejections_total";
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "chirp_reconnect_attempts_total";
pub const CONNECTION_STATE: &str = "chirp_connection_state";
pub const MESSAGES_SENT_TOTAL: &str = "chirp_messages_sent_total";
pub const PLUGINS_ENABLED: &str = "chirp_plugins_enabled";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; later calls
/// return the first handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// Handle installed by [`init_metrics`], if any
pub fn handle() -> Option<PrometheusHandle> {
    HANDLE.get().cloned()
}

/// `outcome` is one of executed, declined, failed, rejected
pub fn record_command(command: &str, outcome: &'static str) {
    counter!(COMMANDS_TOTAL, "command" => command.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_dedup_rejection(guard: &'static str) {
    counter!(DEDUP_REJECTIONS_TOTAL, "guard" => guard).increment(1);
}

pub fn record_reconnect_attempt(cooldown: bool) {
    let kind = if cooldown { "cooldown" } else { "backoff" };
    counter!(RECONNECT_ATTEMPTS_TOTAL, "kind" => kind).increment(1);
}

/// 0 disconnected, 1 connecting, 2 connected, 3 reconnecting
pub fn set_connection_state(value: u8) {
    gauge!(CONNECTION_STATE).set(f64::from(value));
}

pub fn record_message_sent() {
    counter!(MESSAGES_SENT_TOTAL).increment(1);
}

pub fn set_plugins_enabled(count: usize) {
    gauge!(PLUGINS_ENABLED).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        record_command("roll", "executed");
        record_dedup_rejection("repeat");
        record_reconnect_attempt(false);
        set_connection_state(2);
        record_message_sent();
        set_plugins_enabled(3);
    }
}
