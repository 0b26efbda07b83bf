// ABOUTME: Incoming transform that strips invisible characters and collapses whitespace
// ABOUTME: Keeps "!roll" and "!roll\u{E0000}" from being treated as different commands

use anyhow::Result;
use async_trait::async_trait;
use chirp_core::{ChatMessage, IncomingTransform, Plugin, PluginContext};
use std::sync::Arc;

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{034F}' | '\u{E0000}'..='\u{E007F}'
    )
}

/// Remove invisible characters, collapse whitespace runs and trim
pub fn normalize(text: &str) -> String {
    let visible: String = text.chars().filter(|&c| !is_invisible(c)).collect();
    visible.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct Normalizer;

impl IncomingTransform for Normalizer {
    fn transform(&self, mut message: ChatMessage) -> Result<ChatMessage> {
        message.text = normalize(&message.text);
        Ok(message)
    }
}

#[derive(Default)]
pub struct SanitizePlugin;

#[async_trait]
impl Plugin for SanitizePlugin {
    fn name(&self) -> &str {
        "sanitize"
    }

    fn description(&self) -> &str {
        "Normalize incoming chat text"
    }

    async fn init(&mut self, _ctx: PluginContext) -> Result<bool> {
        Ok(true)
    }

    fn incoming_transform(&self) -> Option<Arc<dyn IncomingTransform>> {
        Some(Arc::new(Normalizer))
    }
}
