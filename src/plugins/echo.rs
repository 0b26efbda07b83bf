// ABOUTME: Echo plugin: moderators make the bot say something with `!say`
// ABOUTME: Leading '/' and '.' are stripped so the text can't become a chat command

use anyhow::Result;
use async_trait::async_trait;
use chirp_core::{handler_fn, CommandDescriptor, Plugin, PluginContext};

/// Drop characters the chat service would interpret as a slash command
pub fn defang(text: &str) -> &str {
    text.trim_start_matches(['/', '.', ' '])
}

#[derive(Default)]
pub struct EchoPlugin;

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat text on behalf of moderators"
    }

    async fn init(&mut self, _ctx: PluginContext) -> Result<bool> {
        Ok(true)
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![CommandDescriptor::new(
            "say",
            handler_fn(|ctx| {
                let text = defang(&ctx.command.raw_args).to_string();
                if text.is_empty() {
                    return Ok(false);
                }
                ctx.reply(text);
                Ok(true)
            }),
        )
        .alias("echo")
        .mod_only(true)
        .description("Make the bot say something")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defang() {
        assert_eq!(defang("/ban someone"), "ban someone");
        assert_eq!(defang(" ./timeout x"), "timeout x");
        assert_eq!(defang("hello"), "hello");
        assert_eq!(defang("//"), "");
    }
}
