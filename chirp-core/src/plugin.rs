// ABOUTME: Plugin contract: lifecycle hooks, command descriptors, message transforms and the capability handle
// ABOUTME: Plugins are trait objects; the router dispatches through descriptors without inspecting plugin types

use crate::commands::Command;
use crate::store::StateStore;
use crate::traits::{ChatMessage, OutboundMessage, UserContext};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Command Handlers
// =============================================================================

/// Everything a handler sees about one invocation, plus a reply buffer.
///
/// Replies go back through the outgoing pipeline before being sent, so
/// handlers never talk to the transport directly.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Channel the command was issued in
    pub target: String,
    pub user: UserContext,
    /// Full message text as received (after incoming transforms)
    pub raw_text: String,
    pub command: Command,
    replies: Vec<String>,
}

impl CommandContext {
    pub fn new(
        target: impl Into<String>,
        user: UserContext,
        raw_text: impl Into<String>,
        command: Command,
    ) -> Self {
        Self {
            target: target.into(),
            user,
            raw_text: raw_text.into(),
            command,
            replies: Vec::new(),
        }
    }

    /// Queue a chat line for the invoking channel
    pub fn reply(&mut self, text: impl Into<String>) {
        self.replies.push(text.into());
    }

    pub fn replies(&self) -> &[String] {
        &self.replies
    }

    pub fn into_replies(self) -> Vec<OutboundMessage> {
        let target = self.target;
        self.replies
            .into_iter()
            .map(|text| OutboundMessage::new(target.clone(), text))
            .collect()
    }
}

/// Executes a command. `Ok(false)` means "recognized but declined"; errors are
/// reported to the user as a terse failure notice.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: &mut CommandContext) -> Result<bool>;
}

/// Adapter for synchronous closures
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&mut CommandContext) -> Result<bool> + Send + Sync,
{
    async fn call(&self, ctx: &mut CommandContext) -> Result<bool> {
        (self.0)(ctx)
    }
}

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(&mut CommandContext) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

// =============================================================================
// Command Descriptors
// =============================================================================

/// Registered metadata and gating rules for one invocable command
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub aliases: Vec<String>,
    pub mod_only: bool,
    /// Per-user cooldown; zero disables it
    pub cooldown: Duration,
    pub enabled: bool,
    /// Narrows the globally accepted prefixes for this command
    pub prefixes: Option<Vec<char>>,
    pub description: Option<String>,
    /// Name of the owning plugin. Lookup only; set by the registry.
    pub plugin: String,
    pub handler: Arc<dyn CommandHandler>,
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("mod_only", &self.mod_only)
            .field("cooldown", &self.cooldown)
            .field("enabled", &self.enabled)
            .field("prefixes", &self.prefixes)
            .field("plugin", &self.plugin)
            .finish()
    }
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            mod_only: false,
            cooldown: Duration::ZERO,
            enabled: true,
            prefixes: None,
            description: None,
            plugin: String::new(),
            handler,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn mod_only(mut self, mod_only: bool) -> Self {
        self.mod_only = mod_only;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn cooldown_secs(self, secs: u64) -> Self {
        self.cooldown(Duration::from_secs(secs))
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn prefixes(mut self, prefixes: impl Into<Vec<char>>) -> Self {
        self.prefixes = Some(prefixes.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Name followed by aliases
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(|a| a.as_str()))
    }

    pub fn accepts_prefix(&self, prefix: char) -> bool {
        self.prefixes
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&prefix))
    }
}

// =============================================================================
// Message Transforms
// =============================================================================

/// Rewrites an inbound message before dedup and routing
pub trait IncomingTransform: Send + Sync {
    fn transform(&self, message: ChatMessage) -> Result<ChatMessage>;
}

/// Rewrites the outbound list; may add, drop or split messages
#[async_trait]
pub trait OutgoingTransform: Send + Sync {
    async fn transform(&self, messages: Vec<OutboundMessage>) -> Result<Vec<OutboundMessage>>;
}

// =============================================================================
// Capabilities
// =============================================================================

/// A message a plugin asked to send outside of a command reply
#[derive(Debug, Clone)]
pub struct PluginSend {
    pub plugin: String,
    pub message: OutboundMessage,
}

/// Send capability handed to plugins. Messages still pass the outgoing pipeline.
#[derive(Clone)]
pub struct Outbox {
    plugin: String,
    tx: mpsc::UnboundedSender<PluginSend>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<PluginSend>) -> Self {
        Self {
            plugin: String::new(),
            tx,
        }
    }

    pub(crate) fn for_plugin(&self, plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            tx: self.tx.clone(),
        }
    }

    /// Queue a message. Returns false once the agent has shut down.
    pub fn send(&self, target: impl Into<String>, text: impl Into<String>) -> bool {
        self.tx
            .send(PluginSend {
                plugin: self.plugin.clone(),
                message: OutboundMessage::new(target, text),
            })
            .is_ok()
    }
}

/// Shared accessor for one plugin's settings object. Survives reloads.
#[derive(Clone)]
pub struct SettingsHandle {
    plugin: String,
    value: Arc<RwLock<Value>>,
    store: StateStore,
}

impl fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsHandle")
            .field("plugin", &self.plugin)
            .field("value", &self.get())
            .finish()
    }
}

impl SettingsHandle {
    pub fn new(plugin: impl Into<String>, value: Value, store: StateStore) -> Self {
        Self {
            plugin: plugin.into(),
            value: Arc::new(RwLock::new(value)),
            store,
        }
    }

    pub fn get(&self) -> Value {
        self.value
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Deserialize the settings into a typed struct
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.get())?)
    }

    /// Mutate in place and persist
    pub fn update(&self, f: impl FnOnce(&mut Value)) {
        let snapshot = {
            let mut value = self
                .value
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut value);
            value.clone()
        };
        self.store.set_settings(&self.plugin, snapshot);
    }

    pub fn replace(&self, value: Value) {
        self.update(|current| *current = value);
    }
}

/// Capability handle passed to [`Plugin::init`]
#[derive(Clone)]
pub struct PluginContext {
    pub plugin: String,
    pub outbox: Outbox,
    pub settings: SettingsHandle,
    /// Span carrying the plugin name; enter it or use it as a parent
    pub span: tracing::Span,
}

// =============================================================================
// Plugin Trait
// =============================================================================

/// An independently enable/disable-able bundle of commands and transforms
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique key; lower-case ASCII letters, digits, '-' and '_'
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn description(&self) -> &str {
        ""
    }

    /// Defaults merged under any saved settings at load time
    fn default_settings(&self) -> Value {
        Value::Object(Default::default())
    }

    /// Called once before the plugin's commands go live. `Ok(false)` or an
    /// error leaves the plugin disabled.
    async fn init(&mut self, ctx: PluginContext) -> Result<bool>;

    async fn enable(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn disable(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        Vec::new()
    }

    fn incoming_transform(&self) -> Option<Arc<dyn IncomingTransform>> {
        None
    }

    fn outgoing_transform(&self) -> Option<Arc<dyn OutgoingTransform>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn noop() -> Arc<dyn CommandHandler> {
        handler_fn(|_| Ok(true))
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = CommandDescriptor::new("roll", noop())
            .aliases(["dice", "r"])
            .cooldown_secs(3)
            .mod_only(true);
        assert_eq!(desc.names().collect::<Vec<_>>(), vec!["roll", "dice", "r"]);
        assert_eq!(desc.cooldown, Duration::from_secs(3));
        assert!(desc.mod_only);
        assert!(desc.enabled);
    }

    #[test]
    fn test_prefix_narrowing() {
        let open = CommandDescriptor::new("a", noop());
        assert!(open.accepts_prefix('!'));
        assert!(open.accepts_prefix('~'));

        let narrow = CommandDescriptor::new("b", noop()).prefixes(vec!['!']);
        assert!(narrow.accepts_prefix('!'));
        assert!(!narrow.accepts_prefix('~'));
    }

    #[test]
    fn test_context_replies_target_invoking_channel() {
        let cmd = Command::new('!', "roll", vec![], "");
        let mut ctx = CommandContext::new("#chan", UserContext::new("1", "alice"), "!roll", cmd);
        ctx.reply("one");
        ctx.reply("two");
        let replies = ctx.into_replies();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.target == "#chan"));
    }

    #[tokio::test]
    async fn test_fn_handler_runs_closure() {
        let handler = handler_fn(|ctx| {
            ctx.reply(format!("hi {}", ctx.user.display()));
            Ok(true)
        });
        let cmd = Command::new('!', "hi", vec![], "");
        let mut ctx = CommandContext::new("#c", UserContext::new("1", "bob"), "!hi", cmd);
        assert!(handler.call(&mut ctx).await.unwrap());
        assert_eq!(ctx.replies(), &["hi bob".to_string()]);
    }

    #[test]
    fn test_settings_handle_persists_updates() {
        #[derive(Deserialize)]
        struct Dice {
            sides: u32,
        }

        let store = StateStore::in_memory();
        let settings = SettingsHandle::new("dice", json!({"sides": 6}), store.clone());
        assert_eq!(settings.get_as::<Dice>().unwrap().sides, 6);

        settings.update(|v| v["sides"] = json!(20));
        assert_eq!(settings.get_as::<Dice>().unwrap().sides, 20);
        assert_eq!(store.settings("dice"), Some(json!({"sides": 20})));
    }

    #[test]
    fn test_outbox_stamps_plugin_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx).for_plugin("echo");
        assert!(outbox.send("#c", "hello"));
        let sent = rx.try_recv().unwrap();
        assert_eq!(sent.plugin, "echo");
        assert_eq!(sent.message, OutboundMessage::new("#c", "hello"));
    }
}
