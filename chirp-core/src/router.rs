// ABOUTME: Resolves chat text to a command descriptor, applies gating rules and executes the handler
// ABOUTME: Plugin commands take precedence; the built-in table is consulted only when nothing matches

use crate::commands::{looks_like_command, parse_message, Command};
use crate::error::HandlerError;
use crate::plugin::{CommandContext, CommandDescriptor};
use crate::registry::CommandTable;
use crate::traits::{ChatMessage, OutboundMessage};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Owner name stamped on built-in descriptors
pub const BUILTIN_OWNER: &str = "builtin";

/// Why a matched command was not executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The descriptor's own enabled flag is off
    Disabled,
    /// The command narrows prefixes and this one isn't among them
    PrefixNotAccepted(char),
    /// Caller lacks moderator, broadcaster or owner role
    ModOnly,
    /// Same user ran the same command too recently
    Cooldown { remaining: Duration },
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::PrefixNotAccepted(_) => "prefix",
            Self::ModOnly => "mod_only",
            Self::Cooldown { .. } => "cooldown",
        }
    }
}

/// Outcome of routing one message
#[derive(Debug)]
pub enum HandledResult {
    /// Not a command, or no descriptor by that name
    NoMatch,
    Rejected {
        command: String,
        reason: Rejection,
    },
    /// Handler ran; `handled` is its own verdict
    Executed {
        command: String,
        handled: bool,
        replies: Vec<OutboundMessage>,
    },
    /// Handler returned an error or panicked. Replies queued before the
    /// failure are kept.
    Failed {
        command: String,
        error: HandlerError,
        replies: Vec<OutboundMessage>,
    },
}

impl HandledResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::Rejected { .. } => "rejected",
            Self::Executed { handled: true, .. } => "executed",
            Self::Executed { handled: false, .. } => "declined",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Self::NoMatch => None,
            Self::Rejected { command, .. }
            | Self::Executed { command, .. }
            | Self::Failed { command, .. } => Some(command),
        }
    }

    pub fn replies(&self) -> &[OutboundMessage] {
        match self {
            Self::Executed { replies, .. } | Self::Failed { replies, .. } => replies,
            _ => &[],
        }
    }
}

/// A gated, ready-to-run command. Owns everything it needs, so it can run
/// on its own task while the router keeps serving other messages.
pub struct Invocation {
    descriptor: Arc<CommandDescriptor>,
    ctx: CommandContext,
}

impl Invocation {
    pub fn command(&self) -> &str {
        &self.descriptor.name
    }

    pub fn plugin(&self) -> &str {
        &self.descriptor.plugin
    }

    pub fn context(&self) -> &CommandContext {
        &self.ctx
    }

    /// Run the handler. Errors and panics become [`HandledResult::Failed`].
    pub async fn execute(self) -> HandledResult {
        let Invocation { descriptor, mut ctx } = self;
        let command = descriptor.name.clone();

        let span = tracing::debug_span!("command", name = %command, plugin = %descriptor.plugin);
        let outcome = AssertUnwindSafe(descriptor.handler.call(&mut ctx).instrument(span))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(handled)) => {
                tracing::debug!(command = %command, user = %ctx.user.login, handled, "Command executed");
                HandledResult::Executed {
                    command,
                    handled,
                    replies: ctx.into_replies(),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(command = %command, user = %ctx.user.login, error = %e, "Command handler failed");
                HandledResult::Failed {
                    error: HandlerError {
                        command: command.clone(),
                        reason: format!("{:#}", e),
                    },
                    command,
                    replies: ctx.into_replies(),
                }
            }
            Err(_) => {
                tracing::error!(command = %command, user = %ctx.user.login, "Command handler panicked");
                HandledResult::Failed {
                    error: HandlerError {
                        command: command.clone(),
                        reason: "handler panicked".to_string(),
                    },
                    command,
                    replies: ctx.into_replies(),
                }
            }
        }
    }
}

/// Result of [`CommandRouter::resolve`]
pub enum Resolution {
    NoMatch,
    Rejected { command: String, reason: Rejection },
    Ready(Invocation),
}

/// Parses, looks up and gates commands
pub struct CommandRouter {
    prefixes: Vec<char>,
    /// (user id, command name) -> when the user may run it again
    cooldowns: HashMap<(String, String), Instant>,
    builtins: CommandTable,
}

impl CommandRouter {
    pub fn new(prefixes: impl Into<Vec<char>>) -> Self {
        Self {
            prefixes: prefixes.into(),
            cooldowns: HashMap::new(),
            builtins: CommandTable::default(),
        }
    }

    pub fn prefixes(&self) -> &[char] {
        &self.prefixes
    }

    /// Add a command to the fallback table
    pub fn register_builtin(&mut self, mut descriptor: CommandDescriptor) {
        descriptor.name = descriptor.name.to_lowercase();
        descriptor.plugin = BUILTIN_OWNER.to_string();
        self.builtins.insert(Arc::new(descriptor));
    }

    pub fn builtins(&self) -> &CommandTable {
        &self.builtins
    }

    /// Cheap pre-check: does the text look like a command at all?
    pub fn is_candidate(&self, text: &str) -> bool {
        looks_like_command(text, &self.prefixes)
    }

    /// Parse, look up and gate a message. Records the cooldown on success.
    pub fn resolve(&mut self, table: &CommandTable, message: &ChatMessage) -> Resolution {
        self.resolve_at(table, message, Instant::now())
    }

    fn resolve_at(&mut self, table: &CommandTable, message: &ChatMessage, now: Instant) -> Resolution {
        let Some(command) = parse_message(&message.text, &self.prefixes).into_command() else {
            return Resolution::NoMatch;
        };

        let Some(descriptor) = table
            .lookup(&command.name)
            .or_else(|| self.builtins.lookup(&command.name))
            .cloned()
        else {
            tracing::trace!(command = %command.name, "No descriptor for command");
            return Resolution::NoMatch;
        };

        if let Err(reason) = self.gate(&descriptor, &command, message, now) {
            tracing::debug!(
                command = %descriptor.name,
                user = %message.user.login,
                reason = reason.as_str(),
                "Command rejected"
            );
            return Resolution::Rejected {
                command: descriptor.name.clone(),
                reason,
            };
        }

        if !descriptor.cooldown.is_zero() {
            self.cooldowns.insert(
                (message.user.id.clone(), descriptor.name.clone()),
                now + descriptor.cooldown,
            );
        }

        let ctx = CommandContext::new(
            message.target.clone(),
            message.user.clone(),
            message.text.clone(),
            command,
        );
        Resolution::Ready(Invocation { descriptor, ctx })
    }

    fn gate(
        &self,
        descriptor: &CommandDescriptor,
        command: &Command,
        message: &ChatMessage,
        now: Instant,
    ) -> Result<(), Rejection> {
        if !descriptor.enabled {
            return Err(Rejection::Disabled);
        }
        if !descriptor.accepts_prefix(command.prefix) {
            return Err(Rejection::PrefixNotAccepted(command.prefix));
        }
        if descriptor.mod_only && !message.user.roles.is_privileged() {
            return Err(Rejection::ModOnly);
        }
        let key = (message.user.id.clone(), descriptor.name.clone());
        if let Some(ready_at) = self.cooldowns.get(&key) {
            if now < *ready_at {
                return Err(Rejection::Cooldown {
                    remaining: *ready_at - now,
                });
            }
        }
        Ok(())
    }

    /// Resolve and execute in one step
    pub async fn route(&mut self, table: &CommandTable, message: &ChatMessage) -> HandledResult {
        match self.resolve(table, message) {
            Resolution::NoMatch => HandledResult::NoMatch,
            Resolution::Rejected { command, reason } => HandledResult::Rejected { command, reason },
            Resolution::Ready(invocation) => invocation.execute().await,
        }
    }

    /// Forget cooldowns that have run out. Returns how many were dropped.
    pub fn prune_cooldowns(&mut self) -> usize {
        let now = Instant::now();
        let before = self.cooldowns.len();
        self.cooldowns.retain(|_, ready_at| *ready_at > now);
        before - self.cooldowns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::handler_fn;
    use crate::traits::{Roles, UserContext};
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(name: &str, plugin: &str) -> CommandDescriptor {
        let mut d = CommandDescriptor::new(
            name,
            handler_fn(|ctx| {
                ctx.reply(format!("ran {}", ctx.command.name));
                Ok(true)
            }),
        );
        d.plugin = plugin.to_string();
        d
    }

    fn table(descriptors: Vec<CommandDescriptor>) -> CommandTable {
        CommandTable::build(descriptors.into_iter().map(Arc::new))
    }

    fn router() -> CommandRouter {
        CommandRouter::new(vec!['!', '~'])
    }

    fn msg(text: &str) -> ChatMessage {
        ChatMessage::new("#chan", UserContext::new("1", "alice"), text)
    }

    fn mod_msg(text: &str) -> ChatMessage {
        let roles = Roles {
            moderator: true,
            ..Roles::default()
        };
        ChatMessage::new("#chan", UserContext::new("2", "mod").with_roles(roles), text)
    }

    #[tokio::test]
    async fn test_alias_and_name_resolve_to_same_descriptor() {
        let table = table(vec![descriptor("roll", "dice").aliases(["dice", "r"])]);
        let mut router = router();

        for text in ["!roll", "!dice", "!R", "~roll"] {
            match router.resolve(&table, &msg(text)) {
                Resolution::Ready(inv) => {
                    assert_eq!(inv.command(), "roll");
                    assert_eq!(inv.plugin(), "dice");
                }
                _ => panic!("expected {} to resolve", text),
            }
        }
    }

    #[tokio::test]
    async fn test_non_commands_do_not_match() {
        let table = table(vec![descriptor("roll", "dice")]);
        let mut router = router();
        assert!(matches!(router.route(&table, &msg("hello")).await, HandledResult::NoMatch));
        assert!(matches!(router.route(&table, &msg("!unknown")).await, HandledResult::NoMatch));
        assert!(matches!(router.route(&table, &msg("#roll")).await, HandledResult::NoMatch));
        assert!(!router.is_candidate("hello"));
        assert!(router.is_candidate("~roll 1d4"));
    }

    #[tokio::test]
    async fn test_disabled_command_rejected() {
        let table = table(vec![descriptor("roll", "dice").enabled(false)]);
        let mut router = router();
        let result = router.route(&table, &msg("!roll")).await;
        assert!(matches!(
            result,
            HandledResult::Rejected { reason: Rejection::Disabled, .. }
        ));
    }

    #[tokio::test]
    async fn test_narrowed_prefix_rejected() {
        let table = table(vec![descriptor("roll", "dice").prefixes(vec!['!'])]);
        let mut router = router();
        assert!(matches!(
            router.route(&table, &msg("~roll")).await,
            HandledResult::Rejected { reason: Rejection::PrefixNotAccepted('~'), .. }
        ));
        assert!(matches!(
            router.route(&table, &msg("!roll")).await,
            HandledResult::Executed { .. }
        ));
    }

    #[tokio::test]
    async fn test_mod_only_rejects_without_invoking_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut say = CommandDescriptor::new(
            "say",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        )
        .mod_only(true);
        say.plugin = "echo".to_string();
        let table = table(vec![say]);
        let mut router = router();

        let result = router.route(&table, &msg("!say hi")).await;
        assert!(matches!(
            result,
            HandledResult::Rejected { reason: Rejection::ModOnly, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let result = router.route(&table, &mod_msg("!say hi")).await;
        assert_eq!(result.outcome(), "executed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_per_user_and_command() {
        let table = table(vec![descriptor("roll", "dice").alias("r").cooldown_secs(5)]);
        let mut router = router();

        assert_eq!(router.route(&table, &msg("!roll")).await.outcome(), "executed");
        // Alias shares the canonical command's cooldown
        assert!(matches!(
            router.route(&table, &msg("!r")).await,
            HandledResult::Rejected { reason: Rejection::Cooldown { .. }, .. }
        ));
        // Another user is unaffected
        assert_eq!(router.route(&table, &mod_msg("!roll")).await.outcome(), "executed");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(router.route(&table, &msg("!roll")).await.outcome(), "executed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_cooldowns() {
        let table = table(vec![descriptor("roll", "dice").cooldown_secs(1)]);
        let mut router = router();
        router.route(&table, &msg("!roll")).await;
        assert_eq!(router.prune_cooldowns(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(router.prune_cooldowns(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_failure_not_no_match() {
        let mut broken = CommandDescriptor::new(
            "broken",
            handler_fn(|ctx| {
                ctx.reply("partial");
                bail!("upstream timeout")
            }),
        );
        broken.plugin = "x".to_string();
        let table = table(vec![broken]);
        let mut router = router();

        match router.route(&table, &msg("!broken")).await {
            HandledResult::Failed { command, error, replies } => {
                assert_eq!(command, "broken");
                assert!(error.reason.contains("upstream timeout"));
                assert_eq!(replies.len(), 1);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let table = table(vec![CommandDescriptor::new(
            "boom",
            handler_fn(|_| panic!("kaboom")),
        )]);
        let mut router = router();
        let result = router.route(&table, &msg("!boom")).await;
        assert_eq!(result.outcome(), "failed");
    }

    #[tokio::test]
    async fn test_builtin_table_is_fallback() {
        let mut router = router();
        router.register_builtin(descriptor("ping", "ignored"));
        router.register_builtin(descriptor("version", "ignored"));

        let plugins = table(vec![descriptor("version", "custom")]);
        match router.resolve(&plugins, &msg("!version")) {
            Resolution::Ready(inv) => assert_eq!(inv.plugin(), "custom"),
            _ => panic!("expected plugin command"),
        }
        match router.resolve(&plugins, &msg("!ping")) {
            Resolution::Ready(inv) => assert_eq!(inv.plugin(), BUILTIN_OWNER),
            _ => panic!("expected builtin"),
        }
    }

    #[tokio::test]
    async fn test_handler_sees_quoted_args() {
        let table = table(vec![CommandDescriptor::new(
            "quote",
            handler_fn(|ctx| {
                ctx.reply(ctx.command.args.join("|"));
                Ok(true)
            }),
        )]);
        let mut router = router();
        let result = router.route(&table, &msg("!quote \"hello world\" again")).await;
        assert_eq!(result.replies()[0].text, "hello world|again");
        assert_eq!(result.replies()[0].target, "#chan");
    }
}
