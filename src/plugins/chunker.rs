// ABOUTME: Outgoing transform that splits over-long chat lines into several messages
// ABOUTME: Splits on whitespace where possible, hard-splits words longer than the limit

use anyhow::{Context, Result};
use async_trait::async_trait;
use chirp_core::{OutboundMessage, OutgoingTransform, Plugin, PluginContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Twitch rejects chat lines above 500 characters
pub const DEFAULT_MAX_LENGTH: usize = 500;

#[derive(Debug, Clone, Deserialize)]
struct ChunkerSettings {
    max_length: usize,
}

/// Split `text` into pieces of at most `max` characters
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();

        // Oversized words get hard-split
        while word.len() > max {
            if current_len > 0 {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = word.split_off(max);
            chunks.push(word.into_iter().collect());
            word = rest;
        }

        let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
        if needed > max {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current_len += word.len();
        current.extend(word);
    }
    if current_len > 0 {
        chunks.push(current);
    }
    chunks
}

pub struct Splitter {
    max_length: usize,
}

#[async_trait]
impl OutgoingTransform for Splitter {
    async fn transform(&self, messages: Vec<OutboundMessage>) -> Result<Vec<OutboundMessage>> {
        Ok(messages
            .into_iter()
            .flat_map(|m| {
                split_message(&m.text, self.max_length)
                    .into_iter()
                    .map(move |text| OutboundMessage::new(m.target.clone(), text))
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}

#[derive(Default)]
pub struct ChunkerPlugin {
    splitter: Option<Arc<Splitter>>,
}

#[async_trait]
impl Plugin for ChunkerPlugin {
    fn name(&self) -> &str {
        "chunker"
    }

    fn description(&self) -> &str {
        "Split replies that exceed the chat line limit"
    }

    fn default_settings(&self) -> Value {
        json!({"max_length": DEFAULT_MAX_LENGTH})
    }

    async fn init(&mut self, ctx: PluginContext) -> Result<bool> {
        let settings: ChunkerSettings = ctx.settings.get_as().context("Invalid chunker settings")?;
        if settings.max_length == 0 {
            anyhow::bail!("max_length must be positive");
        }
        self.splitter = Some(Arc::new(Splitter {
            max_length: settings.max_length,
        }));
        Ok(true)
    }

    fn outgoing_transform(&self) -> Option<Arc<dyn OutgoingTransform>> {
        self.splitter
            .clone()
            .map(|s| s as Arc<dyn OutgoingTransform>)
    }
}
