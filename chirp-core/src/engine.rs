// ABOUTME: The agent's event loop: multiplexes chat events, plugin sends, reconnect outcomes, handlers and control verbs
// ABOUTME: Sole writer of the command table and connection state; handlers run on a JoinSet and report back

use crate::builtins::{register_builtins, CommandIndex};
use crate::config::Config;
use crate::connection::{AttemptOutcome, ConnectionConfig, ConnectionEvent, ConnectionManager};
use crate::control::{ControlAck, ControlEvent, ControlReceiver, ControlRequest, ControlVerb, StatusSnapshot};
use crate::dedup::{DedupConfig, DedupVerdict, DeduplicationCache};
use crate::events::Subscription;
use crate::metrics;
use crate::pipeline::MessagePipeline;
use crate::plugin::{Outbox, PluginSend};
use crate::registry::{PluginRegistry, ReloadOutcome};
use crate::router::{CommandRouter, HandledResult, Invocation, Resolution};
use crate::traits::{ChatMessage, ChatTransport, OutboundMessage, TransportEvent};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why [`Engine::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    /// Rebuild the agent and run again
    Restart,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub prefixes: Vec<char>,
    pub dedup: DedupConfig,
    pub eviction_interval: Duration,
    pub connection: ConnectionConfig,
    pub liveness_check_interval: Duration,
    pub status_interval: Duration,
    /// `{user}` and `{command}` are substituted
    pub failure_notice: String,
    pub drain_timeout: Duration,
    pub builtins: bool,
    pub version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefixes: vec!['!', '~'],
            dedup: DedupConfig::default(),
            eviction_interval: Duration::from_secs(1),
            connection: ConnectionConfig::default(),
            liveness_check_interval: Duration::from_secs(30),
            status_interval: Duration::from_secs(10),
            failure_notice: "@{user} sorry, {command} failed".to_string(),
            drain_timeout: Duration::from_secs(10),
            builtins: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefixes: config.prefix_chars(),
            dedup: config.dedup_config(),
            eviction_interval: config.eviction_interval(),
            connection: config.connection_config(),
            liveness_check_interval: config.liveness_check_interval(),
            status_interval: Duration::from_secs(config.control.status_interval_secs),
            failure_notice: config.commands.failure_notice.clone(),
            drain_timeout: Duration::from_secs(config.commands.drain_timeout_secs),
            builtins: config.commands.builtins,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Outbound text produced off the loop, ready for delivery
struct Delivery {
    origin: Origin,
    messages: Vec<OutboundMessage>,
}

enum Origin {
    Command {
        command: String,
        user: String,
        outcome: &'static str,
    },
    Plugin(String),
}

fn failure_notice(template: &str, user: &str, command: &str) -> String {
    template.replace("{user}", user).replace("{command}", command)
}

async fn run_invocation(invocation: Invocation, pipeline: MessagePipeline, notice: String) -> Delivery {
    let user = invocation.context().user.display().to_string();
    let target = invocation.context().target.clone();
    let result = invocation.execute().await;
    let outcome = result.outcome();

    let (command, mut replies) = match result {
        HandledResult::Executed { command, replies, .. } => (command, replies),
        HandledResult::Failed { command, replies, .. } => {
            let mut replies = replies;
            replies.push(OutboundMessage::new(
                target,
                failure_notice(&notice, &user, &command),
            ));
            (command, replies)
        }
        HandledResult::NoMatch | HandledResult::Rejected { .. } => (String::new(), Vec::new()),
    };
    replies.retain(|m| !m.text.trim().is_empty());

    Delivery {
        origin: Origin::Command {
            command,
            user,
            outcome,
        },
        messages: pipeline.process_outgoing_all(replies).await,
    }
}

pub struct Engine {
    config: EngineConfig,
    registry: PluginRegistry,
    router: CommandRouter,
    dedup: Arc<DeduplicationCache>,
    connection: ConnectionManager,
    attempts: mpsc::UnboundedReceiver<AttemptOutcome>,
    transport_events: Subscription<TransportEvent>,
    connection_events: Subscription<ConnectionEvent>,
    plugin_tx: mpsc::UnboundedSender<PluginSend>,
    plugin_rx: mpsc::UnboundedReceiver<PluginSend>,
    handlers: JoinSet<Delivery>,
    command_index: CommandIndex,
    control_events: Option<broadcast::Sender<ControlEvent>>,
    started: Instant,
    /// Shutdown trigger (signals, SHUTDOWN verb)
    shutdown: CancellationToken,
    /// Background tasks owned by this engine instance
    tasks: CancellationToken,
    background: Vec<JoinHandle<()>>,
    drained: bool,
}

impl Engine {
    /// Subscribes to the transport immediately, so nothing published after
    /// construction is missed.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn ChatTransport>,
        registry: PluginRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let tasks = shutdown.child_token();
        let transport_events = transport.events().subscribe();
        let (connection, attempts) =
            ConnectionManager::new(transport, config.connection.clone(), tasks.clone());
        let connection_events = connection.subscribe();
        let (plugin_tx, plugin_rx) = mpsc::unbounded_channel();

        let started = Instant::now();
        let command_index = CommandIndex::default();
        let mut router = CommandRouter::new(config.prefixes.clone());
        if config.builtins {
            register_builtins(&mut router, started, &config.version, command_index.clone());
        }

        Self {
            dedup: Arc::new(DeduplicationCache::new(config.dedup.clone())),
            config,
            registry,
            router,
            connection,
            attempts,
            transport_events,
            connection_events,
            plugin_tx,
            plugin_rx,
            handlers: JoinSet::new(),
            command_index,
            control_events: None,
            started,
            shutdown,
            tasks,
            background: Vec::new(),
            drained: false,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Start plugins and the session, serve until shutdown or restart, then drain.
    /// Fails only if the chat service rejects our credentials at startup.
    pub async fn run(mut self, control: &mut ControlReceiver) -> Result<ExitReason> {
        self.control_events = Some(control.events.clone());

        if let Err(e) = self.start().await {
            self.drain().await;
            return Err(e);
        }

        let reason = self.event_loop(control).await;
        tracing::info!(reason = ?reason, "Event loop stopped, draining");
        self.drain().await;
        Ok(reason)
    }

    async fn start(&mut self) -> Result<()> {
        let store = self.registry.store().clone();
        self.background.push(store.spawn_writer(self.tasks.child_token()));
        self.background.push(
            self.dedup
                .spawn_eviction(self.config.eviction_interval, self.tasks.child_token()),
        );

        let load = self.registry.load();
        let init = self.registry.init(Outbox::new(self.plugin_tx.clone())).await;
        tracing::info!(
            loaded = load.loaded.len(),
            skipped = load.skipped.len(),
            initialized = init.initialized.len(),
            failed = init.failed.len(),
            "Plugins ready"
        );
        self.refresh_commands();

        self.connection.connect().await.map_err(|e| {
            anyhow::Error::new(e).context("Chat service rejected credentials, not starting")
        })?;
        Ok(())
    }

    async fn event_loop(&mut self, control: &mut ControlReceiver) -> ExitReason {
        let period = self.config.liveness_check_interval;
        let mut liveness = tokio::time::interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let period = self.config.status_interval;
        let mut status = tokio::time::interval_at(Instant::now() + period, period);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut control_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break ExitReason::Shutdown,

                event = self.transport_events.recv() => match event {
                    Some(event) => {
                        if let Some(message) = self.connection.handle_transport_event(event).await {
                            self.handle_message(message);
                        }
                    }
                    None => {
                        tracing::error!("Transport event stream closed");
                        break ExitReason::Shutdown;
                    }
                },

                Some(outcome) = self.attempts.recv() => {
                    if let Err(e) = self.connection.on_attempt_finished(outcome) {
                        tracing::error!(error = %e, "Cannot reconnect, shutting down");
                        break ExitReason::Shutdown;
                    }
                }

                Some(event) = self.connection_events.recv() => self.relay_connection_event(event),

                Some(send) = self.plugin_rx.recv() => self.spawn_plugin_send(send),

                Some(joined) = self.handlers.join_next() => match joined {
                    Ok(delivery) => self.deliver(delivery).await,
                    Err(e) => tracing::error!(error = %e, "Handler task failed"),
                },

                request = control.requests.recv(), if control_open => match request {
                    Some(request) => {
                        if let Some(reason) = self.handle_control(request).await {
                            break reason;
                        }
                    }
                    None => control_open = false,
                },

                _ = liveness.tick() => {
                    self.connection.check_liveness().await;
                }

                _ = status.tick() => {
                    self.router.prune_cooldowns();
                    let status = self.status();
                    self.publish(ControlEvent::Status { status });
                }
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn handle_message(&mut self, message: ChatMessage) {
        if message.is_self {
            return;
        }
        let message = self.registry.pipeline().process_incoming(message);
        if !self.router.is_candidate(&message.text) {
            return;
        }

        let verdict = self
            .dedup
            .check(&message.user.id, &message.text, message.id.as_deref());
        if verdict != DedupVerdict::Accept {
            metrics::record_dedup_rejection(verdict.as_str());
            tracing::debug!(
                user = %message.user.login,
                guard = verdict.as_str(),
                "Suppressed duplicate command"
            );
            return;
        }

        match self.router.resolve(self.registry.command_table(), &message) {
            Resolution::NoMatch => {}
            Resolution::Rejected { command, reason } => {
                metrics::record_command(&command, "rejected");
                self.publish(ControlEvent::Command {
                    command,
                    user: message.user.login.clone(),
                    outcome: reason.as_str(),
                });
            }
            Resolution::Ready(invocation) => {
                tracing::info!(
                    command = %invocation.command(),
                    plugin = %invocation.plugin(),
                    user = %message.user.login,
                    channel = %message.target,
                    "Dispatching command"
                );
                let pipeline = self.registry.pipeline().clone();
                let notice = self.config.failure_notice.clone();
                self.handlers.spawn(run_invocation(invocation, pipeline, notice));
            }
        }
    }

    fn spawn_plugin_send(&mut self, send: PluginSend) {
        let pipeline = self.registry.pipeline().clone();
        self.handlers.spawn(async move {
            Delivery {
                messages: pipeline.process_outgoing(send.message).await,
                origin: Origin::Plugin(send.plugin),
            }
        });
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    async fn deliver(&mut self, delivery: Delivery) {
        match delivery.origin {
            Origin::Command {
                command,
                user,
                outcome,
            } => {
                metrics::record_command(&command, outcome);
                self.publish(ControlEvent::Command {
                    command,
                    user,
                    outcome,
                });
            }
            Origin::Plugin(plugin) => {
                tracing::debug!(plugin = %plugin, count = delivery.messages.len(), "Delivering plugin messages");
            }
        }

        for message in delivery.messages {
            match self
                .connection
                .transport()
                .send(&message.target, &message.text)
                .await
            {
                Ok(()) => {
                    metrics::record_message_sent();
                    self.publish(ControlEvent::Outbound {
                        target: message.target,
                        text: message.text,
                    });
                }
                Err(e) => {
                    tracing::warn!(channel = %message.target, error = %e, "Failed to send message");
                }
            }
        }
    }

    fn publish(&self, event: ControlEvent) {
        if let Some(events) = &self.control_events {
            // No receivers is fine
            let _ = events.send(event);
        }
    }

    fn relay_connection_event(&mut self, event: ConnectionEvent) {
        let (state, detail) = match event {
            ConnectionEvent::StateChanged { to, .. } => (to, None),
            ConnectionEvent::ReconnectScheduled {
                attempt,
                delay,
                cooldown,
            } => (
                self.connection.state(),
                Some(format!(
                    "attempt {} in {}ms{}",
                    attempt,
                    delay.as_millis(),
                    if cooldown { " (cool-down)" } else { "" }
                )),
            ),
            ConnectionEvent::Disconnected { reason } => (self.connection.state(), Some(reason)),
            _ => return,
        };
        self.publish(ControlEvent::Connection { state, detail });
    }

    // =========================================================================
    // Control
    // =========================================================================

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            connection_state: self.connection.state(),
            uptime_secs: self.started.elapsed().as_secs(),
            loaded_plugins: self.registry.statuses(),
            enabled_commands: self.command_index.get(),
        }
    }

    fn refresh_commands(&mut self) {
        let mut names: Vec<String> = self
            .registry
            .commands()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        for builtin in self.router.builtins().descriptors() {
            if self.registry.command_table().lookup(&builtin.name).is_none() {
                names.push(builtin.name.clone());
            }
        }
        let mut seen = std::collections::HashSet::new();
        names.retain(|n| seen.insert(n.clone()));
        self.command_index.set(names);
        metrics::set_plugins_enabled(
            self.registry
                .statuses()
                .iter()
                .filter(|s| s.enabled)
                .count(),
        );
    }

    /// Returns an exit reason for RESTART and SHUTDOWN
    async fn handle_control(&mut self, request: ControlRequest) -> Option<ExitReason> {
        let ControlRequest { verb, reply } = request;
        tracing::info!(verb = verb.as_str(), "Control verb received");

        let (ack, exit) = match &verb {
            ControlVerb::GetStatus => (ControlAck::ok(&verb, "status").with_status(self.status()), None),
            ControlVerb::EnablePlugin { name } => {
                let ack = match self.registry.enable(name).await {
                    Ok(true) => ControlAck::ok(&verb, format!("{} enabled", name)),
                    Ok(false) => ControlAck::ok(&verb, format!("{} already enabled", name)),
                    Err(e) => ControlAck::error(&verb, e.to_string()),
                };
                self.after_plugin_change(name, "enable", ack.ok);
                (ack, None)
            }
            ControlVerb::DisablePlugin { name } => {
                let ack = match self.registry.disable(name).await {
                    Ok(true) => ControlAck::ok(&verb, format!("{} disabled", name)),
                    Ok(false) => ControlAck::ok(&verb, format!("{} already disabled", name)),
                    Err(e) => ControlAck::error(&verb, e.to_string()),
                };
                self.after_plugin_change(name, "disable", ack.ok);
                (ack, None)
            }
            ControlVerb::ReloadPlugin { name } => {
                let ack = match self.registry.reload(name).await {
                    Ok(ReloadOutcome::Reloaded { initialized: true }) => {
                        ControlAck::ok(&verb, format!("{} reloaded", name))
                    }
                    Ok(ReloadOutcome::Reloaded { initialized: false }) => {
                        ControlAck::ok(&verb, format!("{} reloaded but not active", name))
                    }
                    Ok(ReloadOutcome::Unregistered) => {
                        ControlAck::ok(&verb, format!("{} source removed, unregistered", name))
                    }
                    Err(e) => ControlAck::error(&verb, e.to_string()),
                };
                self.after_plugin_change(name, "reload", ack.ok);
                (ack, None)
            }
            ControlVerb::Restart => (ControlAck::ok(&verb, "restarting"), Some(ExitReason::Restart)),
            ControlVerb::Shutdown => (ControlAck::ok(&verb, "shutting down"), Some(ExitReason::Shutdown)),
        };

        if reply.send(ack).is_err() {
            tracing::debug!(verb = verb.as_str(), "Control client went away before the ack");
        }
        exit
    }

    fn after_plugin_change(&mut self, name: &str, action: &'static str, ok: bool) {
        self.refresh_commands();
        self.publish(ControlEvent::Plugin {
            name: name.to_string(),
            action,
            ok,
        });
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Wait for in-flight handlers (bounded), deliver their replies, then
    /// disconnect and stop background tasks. Safe to call twice.
    async fn drain(&mut self) {
        if self.drained {
            return;
        }
        self.drained = true;

        let deadline = Instant::now() + self.config.drain_timeout;
        while !self.handlers.is_empty() {
            match tokio::time::timeout_at(deadline, self.handlers.join_next()).await {
                Ok(Some(Ok(delivery))) => self.deliver(delivery).await,
                Ok(Some(Err(e))) => tracing::warn!(error = %e, "Handler task failed during drain"),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = self.handlers.len(),
                        "Drain timeout reached, aborting in-flight handlers"
                    );
                    self.handlers.abort_all();
                    break;
                }
            }
        }

        while let Ok(send) = self.plugin_rx.try_recv() {
            let messages = self.registry.pipeline().process_outgoing(send.message).await;
            self.deliver(Delivery {
                origin: Origin::Plugin(send.plugin),
                messages,
            })
            .await;
        }

        self.registry.shutdown().await;
        self.connection.disconnect().await;

        self.tasks.cancel();
        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task failed during shutdown");
            }
        }
        tracing::info!("Engine drained");
    }
}
