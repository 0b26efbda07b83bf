// ABOUTME: Fallback command table: ping, uptime, version and a listing of available commands
// ABOUTME: Consulted only when no plugin claims the command name

use crate::plugin::{handler_fn, CommandDescriptor};
use crate::router::CommandRouter;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Shared, engine-maintained list of invocable command names
#[derive(Debug, Clone, Default)]
pub struct CommandIndex {
    names: Arc<RwLock<Vec<String>>>,
}

impl CommandIndex {
    pub fn set(&self, names: Vec<String>) {
        *self
            .names
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = names;
    }

    pub fn get(&self) -> Vec<String> {
        self.names
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// "1d 2h 3m 4s", dropping leading zero units
pub fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        (total % 86_400) / 3600,
        (total % 3600) / 60,
        total % 60,
    );
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    parts.push(format!("{}s", seconds));
    parts.join(" ")
}

/// Register the built-in commands on a router
pub fn register_builtins(router: &mut CommandRouter, started: Instant, version: &str, index: CommandIndex) {
    let primary = router.prefixes().first().copied().unwrap_or('!');

    router.register_builtin(
        CommandDescriptor::new(
            "ping",
            handler_fn(|ctx| {
                ctx.reply("pong");
                Ok(true)
            }),
        )
        .description("Check that the bot is responsive"),
    );

    router.register_builtin(
        CommandDescriptor::new(
            "uptime",
            handler_fn(move |ctx| {
                ctx.reply(format!("Up for {}", format_uptime(started.elapsed())));
                Ok(true)
            }),
        )
        .description("How long the bot has been running"),
    );

    let version = version.to_string();
    router.register_builtin(
        CommandDescriptor::new(
            "version",
            handler_fn(move |ctx| {
                ctx.reply(format!("chirp v{}", version));
                Ok(true)
            }),
        )
        .description("Running version"),
    );

    router.register_builtin(
        CommandDescriptor::new(
            "commands",
            handler_fn(move |ctx| {
                let names = index.get();
                if names.is_empty() {
                    ctx.reply("No commands available");
                } else {
                    let listed: Vec<String> = names.iter().map(|n| format!("{}{}", primary, n)).collect();
                    ctx.reply(format!("Commands: {}", listed.join(", ")));
                }
                Ok(true)
            }),
        )
        .alias("help")
        .description("List available commands"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CommandTable;
    use crate::traits::{ChatMessage, UserContext};

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(5)), "5s");
        assert_eq!(format_uptime(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_uptime(Duration::from_secs(3600)), "1h 0m 0s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_builtins_reply() {
        let mut router = CommandRouter::new(vec!['!']);
        let index = CommandIndex::default();
        register_builtins(&mut router, Instant::now(), "1.2.3", index.clone());
        index.set(vec!["roll".to_string(), "ping".to_string()]);
        tokio::time::advance(Duration::from_secs(61)).await;

        let empty = CommandTable::default();
        let user = UserContext::new("1", "alice");
        let reply = |text: &str| ChatMessage::new("#c", user.clone(), text);

        let result = router.route(&empty, &reply("!ping")).await;
        assert_eq!(result.replies()[0].text, "pong");
        let result = router.route(&empty, &reply("!uptime")).await;
        assert_eq!(result.replies()[0].text, "Up for 1m 1s");
        let result = router.route(&empty, &reply("!version")).await;
        assert_eq!(result.replies()[0].text, "chirp v1.2.3");
        let result = router.route(&empty, &reply("!help")).await;
        assert_eq!(result.replies()[0].text, "Commands: !roll, !ping");
    }
}
