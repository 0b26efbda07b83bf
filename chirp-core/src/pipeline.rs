// ABOUTME: Chains plugin-supplied transforms over inbound and outbound chat text
// ABOUTME: Stages run in plugin registration order; a failing stage is logged and skipped

use crate::plugin::{IncomingTransform, OutgoingTransform};
use crate::traits::{ChatMessage, OutboundMessage};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

struct Stage<T: ?Sized> {
    plugin: String,
    transform: Arc<T>,
}

impl<T: ?Sized> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            plugin: self.plugin.clone(),
            transform: Arc::clone(&self.transform),
        }
    }
}

/// Ordered transform chain.
///
/// Order is significant: with a translator registered before a formatter,
/// the formatter sees translated text; swap the registrations and it doesn't.
/// The registry builds the pipeline in registration order and rebuilds it
/// whenever plugins are enabled, disabled or reloaded.
#[derive(Clone, Default)]
pub struct MessagePipeline {
    incoming: Vec<Stage<dyn IncomingTransform>>,
    outgoing: Vec<Stage<dyn OutgoingTransform>>,
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_incoming(&mut self, plugin: impl Into<String>, transform: Arc<dyn IncomingTransform>) {
        self.incoming.push(Stage {
            plugin: plugin.into(),
            transform,
        });
    }

    pub fn push_outgoing(&mut self, plugin: impl Into<String>, transform: Arc<dyn OutgoingTransform>) {
        self.outgoing.push(Stage {
            plugin: plugin.into(),
            transform,
        });
    }

    /// Plugin names of incoming stages, in application order
    pub fn incoming_stages(&self) -> Vec<&str> {
        self.incoming.iter().map(|s| s.plugin.as_str()).collect()
    }

    /// Plugin names of outgoing stages, in application order
    pub fn outgoing_stages(&self) -> Vec<&str> {
        self.outgoing.iter().map(|s| s.plugin.as_str()).collect()
    }

    /// Apply every incoming stage: B(A(message)) for stages A then B
    pub fn process_incoming(&self, message: ChatMessage) -> ChatMessage {
        let mut current = message;
        for stage in &self.incoming {
            let input = current.clone();
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| stage.transform.transform(input)));
            match result {
                Ok(Ok(next)) => current = next,
                Ok(Err(e)) => {
                    tracing::warn!(plugin = %stage.plugin, error = %e, "Incoming transform failed, skipping");
                }
                Err(_) => {
                    tracing::error!(plugin = %stage.plugin, "Incoming transform panicked, skipping");
                }
            }
        }
        current
    }

    /// Run one outbound message through every outgoing stage.
    ///
    /// Starts as a one-element list; each stage returns the replacement list.
    pub async fn process_outgoing(&self, message: OutboundMessage) -> Vec<OutboundMessage> {
        let mut current = vec![message];
        for stage in &self.outgoing {
            let input = current.clone();
            let result = AssertUnwindSafe(stage.transform.transform(input))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(next)) => current = next,
                Ok(Err(e)) => {
                    tracing::warn!(plugin = %stage.plugin, error = %e, "Outgoing transform failed, skipping");
                }
                Err(_) => {
                    tracing::error!(plugin = %stage.plugin, "Outgoing transform panicked, skipping");
                }
            }
        }
        current
    }

    /// [`Self::process_outgoing`] over several messages, preserving order
    pub async fn process_outgoing_all(&self, messages: Vec<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            out.extend(self.process_outgoing(message).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::UserContext;
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    struct Append(&'static str);

    impl IncomingTransform for Append {
        fn transform(&self, mut message: ChatMessage) -> Result<ChatMessage> {
            message.text.push_str(self.0);
            Ok(message)
        }
    }

    struct Broken;

    impl IncomingTransform for Broken {
        fn transform(&self, _message: ChatMessage) -> Result<ChatMessage> {
            bail!("translation service unavailable")
        }
    }

    struct Panicky;

    impl IncomingTransform for Panicky {
        fn transform(&self, _message: ChatMessage) -> Result<ChatMessage> {
            panic!("boom")
        }
    }

    struct Duplicate;

    #[async_trait]
    impl OutgoingTransform for Duplicate {
        async fn transform(&self, messages: Vec<OutboundMessage>) -> Result<Vec<OutboundMessage>> {
            let mut out = messages.clone();
            for m in messages {
                out.push(OutboundMessage::new(m.target, format!("[copy] {}", m.text)));
            }
            Ok(out)
        }
    }

    struct Upper;

    #[async_trait]
    impl OutgoingTransform for Upper {
        async fn transform(&self, messages: Vec<OutboundMessage>) -> Result<Vec<OutboundMessage>> {
            Ok(messages
                .into_iter()
                .map(|m| OutboundMessage::new(m.target, m.text.to_uppercase()))
                .collect())
        }
    }

    struct FailingOut;

    #[async_trait]
    impl OutgoingTransform for FailingOut {
        async fn transform(&self, _messages: Vec<OutboundMessage>) -> Result<Vec<OutboundMessage>> {
            bail!("nope")
        }
    }

    fn msg(text: &str) -> ChatMessage {
        ChatMessage::new("#c", UserContext::new("1", "alice"), text)
    }

    #[test]
    fn test_incoming_applies_in_registration_order() {
        let mut pipeline = MessagePipeline::new();
        pipeline.push_incoming("a", Arc::new(Append("-A")));
        pipeline.push_incoming("b", Arc::new(Append("-B")));
        assert_eq!(pipeline.process_incoming(msg("x")).text, "x-A-B");
        assert_eq!(pipeline.incoming_stages(), vec!["a", "b"]);
    }

    #[test]
    fn test_incoming_failure_is_skipped() {
        let mut pipeline = MessagePipeline::new();
        pipeline.push_incoming("a", Arc::new(Append("-A")));
        pipeline.push_incoming("broken", Arc::new(Broken));
        pipeline.push_incoming("panicky", Arc::new(Panicky));
        pipeline.push_incoming("b", Arc::new(Append("-B")));
        assert_eq!(pipeline.process_incoming(msg("x")).text, "x-A-B");
    }

    #[tokio::test]
    async fn test_outgoing_fan_out_and_order_matters() {
        let mut dup_then_upper = MessagePipeline::new();
        dup_then_upper.push_outgoing("dup", Arc::new(Duplicate));
        dup_then_upper.push_outgoing("upper", Arc::new(Upper));
        let out = dup_then_upper
            .process_outgoing(OutboundMessage::new("#c", "hi"))
            .await;
        assert_eq!(
            out.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["HI", "[COPY] HI"]
        );

        let mut upper_then_dup = MessagePipeline::new();
        upper_then_dup.push_outgoing("upper", Arc::new(Upper));
        upper_then_dup.push_outgoing("dup", Arc::new(Duplicate));
        let out = upper_then_dup
            .process_outgoing(OutboundMessage::new("#c", "hi"))
            .await;
        assert_eq!(
            out.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["HI", "[copy] HI"]
        );
    }

    #[tokio::test]
    async fn test_outgoing_failure_keeps_previous_list() {
        let mut pipeline = MessagePipeline::new();
        pipeline.push_outgoing("dup", Arc::new(Duplicate));
        pipeline.push_outgoing("failing", Arc::new(FailingOut));
        let out = pipeline
            .process_outgoing_all(vec![OutboundMessage::new("#c", "a"), OutboundMessage::new("#c", "b")])
            .await;
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].text, "a");
        assert_eq!(out[2].text, "b");
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_identity() {
        let pipeline = MessagePipeline::new();
        assert_eq!(pipeline.process_incoming(msg("same")).text, "same");
        let out = pipeline.process_outgoing(OutboundMessage::new("#c", "same")).await;
        assert_eq!(out, vec![OutboundMessage::new("#c", "same")]);
    }
}
