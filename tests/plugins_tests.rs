// ABOUTME: Integration tests for the bundled plugins running inside a real PluginRegistry
// ABOUTME: Checks command tables, pipeline stages, persisted settings and enable state

use chirp::plugins::builtin_catalog;
use chirp_core::{ChatMessage, OutboundMessage, Outbox, PluginRegistry, StateStore, UserContext};
use serde_json::json;
use tokio::sync::mpsc;

async fn started(store: StateStore) -> PluginRegistry {
    let mut registry = PluginRegistry::new(builtin_catalog(), store);
    let report = registry.load();
    assert!(report.skipped.is_empty(), "skipped: {:?}", report.skipped);
    let (tx, _rx) = mpsc::unbounded_channel();
    let report = registry.init(Outbox::new(tx)).await;
    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    registry
}

fn names(registry: &PluginRegistry) -> Vec<String> {
    let mut names: Vec<String> = registry
        .commands()
        .iter()
        .flat_map(|d| d.names().map(String::from).collect::<Vec<_>>())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_bundled_plugins_register_commands_and_stages() {
    let registry = started(StateStore::in_memory()).await;

    assert_eq!(registry.names(), vec!["sanitize", "dice", "echo", "chunker"]);
    assert_eq!(names(&registry), vec!["dice", "echo", "roll", "say"]);
    assert_eq!(registry.pipeline().incoming_stages(), vec!["sanitize"]);
    assert_eq!(registry.pipeline().outgoing_stages(), vec!["chunker"]);

    let say = registry.command_table().lookup("echo").unwrap();
    assert!(say.mod_only);
}

#[tokio::test]
async fn test_incoming_pipeline_normalizes_text() {
    let registry = started(StateStore::in_memory()).await;

    let message = ChatMessage::new("#chan", UserContext::new("1", "alice"), "  !roll\u{200B}   2d6 ");
    let out = registry.pipeline().process_incoming(message);
    assert_eq!(out.text, "!roll 2d6");
}

#[tokio::test]
async fn test_saved_settings_reach_outgoing_pipeline() {
    let store = StateStore::in_memory();
    store.set_settings("chunker", json!({"max_length": 5}));
    let registry = started(store).await;

    let out = registry
        .pipeline()
        .process_outgoing(OutboundMessage::new("#chan", "aaa bbb"))
        .await;
    let texts: Vec<_> = out.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["aaa", "bbb"]);
}

#[tokio::test]
async fn test_invalid_settings_disable_only_that_plugin() {
    let store = StateStore::in_memory();
    store.set_settings("chunker", json!({"max_length": 0}));

    let mut registry = PluginRegistry::new(builtin_catalog(), store);
    registry.load();
    let (tx, _rx) = mpsc::unbounded_channel();
    let report = registry.init(Outbox::new(tx)).await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "chunker");
    assert!(!registry.is_enabled("chunker"));
    assert!(registry.is_enabled("dice"));
    assert!(registry.pipeline().outgoing_stages().is_empty());
}

#[tokio::test]
async fn test_disabling_dice_removes_roll() {
    let store = StateStore::in_memory();
    let mut registry = started(store.clone()).await;

    assert!(registry.disable("dice").await.unwrap());
    assert!(registry.command_table().lookup("roll").is_none());
    assert_eq!(store.enabled_preference("dice"), Some(false));

    assert!(registry.enable("dice").await.unwrap());
    assert!(registry.command_table().lookup("roll").is_some());
}

#[tokio::test]
async fn test_default_disabled_respected_until_enabled() {
    let mut registry =
        PluginRegistry::new(builtin_catalog(), StateStore::in_memory()).with_default_disabled(["echo"]);
    registry.load();
    let (tx, _rx) = mpsc::unbounded_channel();
    registry.init(Outbox::new(tx)).await;

    assert!(!registry.is_enabled("echo"));
    assert!(registry.command_table().lookup("say").is_none());

    assert!(registry.enable("echo").await.unwrap());
    assert!(registry.command_table().lookup("say").is_some());
}
