// ABOUTME: Plugin registry: discovers plugin units from a catalog of factories and owns their lifecycle
// ABOUTME: Aggregates commands and transforms of enabled units in registration order

use crate::error::PluginError;
use crate::pipeline::MessagePipeline;
use crate::plugin::{
    CommandDescriptor, IncomingTransform, Outbox, OutgoingTransform, Plugin, PluginContext,
    SettingsHandle,
};
use crate::store::{merge_settings, StateStore};
use anyhow::Result;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

// =============================================================================
// Catalog
// =============================================================================

/// Factory that constructs a fresh plugin instance
pub type PluginFactory = Box<dyn Fn() -> Result<Box<dyn Plugin>> + Send + Sync>;

/// The plugin source set: named factories, scanned by [`PluginRegistry::load`].
/// Reloading a plugin re-runs its factory.
#[derive(Default)]
pub struct PluginCatalog {
    sources: Vec<(String, PluginFactory)>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory by source name
    pub fn register<F>(mut self, source: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.insert(source, factory);
        self
    }

    /// Add or replace a factory. Replacing keeps the source's position.
    pub fn insert<F>(&mut self, source: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        let factory: PluginFactory = Box::new(factory);
        match self.sources.iter_mut().find(|(name, _)| name == source) {
            Some(slot) => slot.1 = factory,
            None => self.sources.push((source.to_string(), factory)),
        }
    }

    pub fn remove(&mut self, source: &str) -> bool {
        let before = self.sources.len();
        self.sources.retain(|(name, _)| name != source);
        self.sources.len() != before
    }

    pub fn contains(&self, source: &str) -> bool {
        self.sources.iter().any(|(name, _)| name == source)
    }

    pub fn sources(&self) -> Vec<&str> {
        self.sources.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Build a fresh instance; `None` when the source is unknown
    pub fn instantiate(&self, source: &str) -> Option<Result<Box<dyn Plugin>>> {
        let (_, factory) = self.sources.iter().find(|(name, _)| name == source)?;
        Some(
            std::panic::catch_unwind(AssertUnwindSafe(factory))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("factory panicked"))),
        )
    }
}

// =============================================================================
// Command Table
// =============================================================================

/// Name/alias lookup over registered descriptors.
///
/// Descriptors are indexed in registration order; when two claim the same
/// name or alias the later registration wins.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    ordered: Vec<Arc<CommandDescriptor>>,
    index: HashMap<String, usize>,
}

impl CommandTable {
    pub fn build(descriptors: impl IntoIterator<Item = Arc<CommandDescriptor>>) -> Self {
        let mut table = Self::default();
        for descriptor in descriptors {
            table.insert(descriptor);
        }
        table
    }

    pub fn insert(&mut self, descriptor: Arc<CommandDescriptor>) {
        let position = self.ordered.len();
        for name in descriptor.names() {
            if let Some(previous) = self.index.insert(name.to_string(), position) {
                let shadowed = &self.ordered[previous];
                tracing::warn!(
                    command = %name,
                    winner = %descriptor.plugin,
                    shadowed = %shadowed.plugin,
                    "Command name collision, most recent registration wins"
                );
            }
        }
        self.ordered.push(descriptor);
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<CommandDescriptor>> {
        self.index.get(name).map(|&i| &self.ordered[i])
    }

    /// All descriptors in registration order, including shadowed ones
    pub fn descriptors(&self) -> &[Arc<CommandDescriptor>] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Externally visible state of one plugin unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub commands: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// (source, reason)
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct InitReport {
    pub initialized: Vec<String>,
    /// (plugin, reason)
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// New instance registered; `initialized` is false if its init failed
    Reloaded { initialized: bool },
    /// Source is gone; the plugin was removed
    Unregistered,
}

struct PluginEntry {
    source: String,
    name: String,
    version: String,
    plugin: Box<dyn Plugin>,
    enabled: bool,
    initialized: bool,
    last_error: Option<String>,
    settings: SettingsHandle,
    commands: Vec<Arc<CommandDescriptor>>,
    incoming: Option<Arc<dyn IncomingTransform>>,
    outgoing: Option<Arc<dyn OutgoingTransform>>,
}

impl PluginEntry {
    fn is_live(&self) -> bool {
        self.enabled && self.initialized
    }

    fn refresh_hooks(&mut self) -> Result<(), String> {
        self.commands = stamp_commands(self.plugin.as_ref(), &self.name)?;
        self.incoming = self.plugin.incoming_transform();
        self.outgoing = self.plugin.outgoing_transform();
        Ok(())
    }
}

/// Whether `name` is usable as a plugin key
pub fn is_valid_plugin_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn stamp_commands(plugin: &dyn Plugin, owner: &str) -> Result<Vec<Arc<CommandDescriptor>>, String> {
    plugin
        .commands()
        .into_iter()
        .map(|mut descriptor| {
            descriptor.name = descriptor.name.trim().to_lowercase();
            descriptor.aliases = descriptor
                .aliases
                .iter()
                .map(|a| a.trim().to_lowercase())
                .collect();
            if let Some(bad) = descriptor
                .names()
                .find(|n| n.is_empty() || n.chars().any(char::is_whitespace))
            {
                return Err(format!("invalid command name '{}'", bad));
            }
            descriptor.plugin = owner.to_string();
            Ok(Arc::new(descriptor))
        })
        .collect()
}

/// Owns every plugin unit; all mutation goes through its methods.
pub struct PluginRegistry {
    catalog: PluginCatalog,
    /// Registration order
    entries: Vec<PluginEntry>,
    store: StateStore,
    default_disabled: HashSet<String>,
    outbox: Option<Outbox>,
    table: CommandTable,
    pipeline: MessagePipeline,
}

impl PluginRegistry {
    pub fn new(catalog: PluginCatalog, store: StateStore) -> Self {
        Self {
            catalog,
            entries: Vec::new(),
            store,
            default_disabled: HashSet::new(),
            outbox: None,
            table: CommandTable::default(),
            pipeline: MessagePipeline::new(),
        }
    }

    /// Plugins that start disabled unless a saved choice says otherwise
    pub fn with_default_disabled<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_disabled = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut PluginCatalog {
        &mut self.catalog
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn instantiate(
        &self,
        source: &str,
        settings: Option<SettingsHandle>,
        replacing: Option<usize>,
    ) -> Result<PluginEntry, PluginError> {
        let load_err = |reason: String| PluginError::Load {
            source_name: source.to_string(),
            reason,
        };

        let plugin = self
            .catalog
            .instantiate(source)
            .ok_or_else(|| load_err("source not found".to_string()))?
            .map_err(|e| load_err(e.to_string()))?;

        let name = plugin.name().to_string();
        if !is_valid_plugin_name(&name) {
            return Err(load_err(format!("invalid plugin name '{}'", name)));
        }
        let duplicate = self
            .entries
            .iter()
            .enumerate()
            .any(|(i, e)| e.name == name && Some(i) != replacing);
        if duplicate {
            return Err(load_err(format!("plugin name '{}' is already registered", name)));
        }

        let commands = stamp_commands(plugin.as_ref(), &name).map_err(load_err)?;
        let settings = settings.unwrap_or_else(|| {
            let merged = merge_settings(plugin.default_settings(), self.store.settings(&name));
            SettingsHandle::new(&name, merged, self.store.clone())
        });
        let enabled = self
            .store
            .enabled_preference(&name)
            .unwrap_or_else(|| !self.default_disabled.contains(&name));

        Ok(PluginEntry {
            source: source.to_string(),
            version: plugin.version().to_string(),
            incoming: plugin.incoming_transform(),
            outgoing: plugin.outgoing_transform(),
            name,
            plugin,
            enabled,
            initialized: false,
            last_error: None,
            settings,
            commands,
        })
    }

    /// Scan the catalog and register every valid plugin not yet loaded.
    /// Invalid units are skipped with a warning.
    pub fn load(&mut self) -> LoadReport {
        let mut report = LoadReport::default();
        let sources: Vec<String> = self.catalog.sources().into_iter().map(String::from).collect();

        for source in sources {
            if self.entries.iter().any(|e| e.source == source) {
                continue;
            }
            match self.instantiate(&source, None, None) {
                Ok(entry) => {
                    tracing::info!(
                        plugin = %entry.name,
                        version = %entry.version,
                        enabled = entry.enabled,
                        commands = entry.commands.len(),
                        "Plugin loaded"
                    );
                    report.loaded.push(entry.name.clone());
                    self.entries.push(entry);
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Skipping invalid plugin");
                    report.skipped.push((source, e.to_string()));
                }
            }
        }

        self.rebuild();
        report
    }

    fn context_for(&self, idx: usize, outbox: &Outbox) -> PluginContext {
        let entry = &self.entries[idx];
        PluginContext {
            plugin: entry.name.clone(),
            outbox: outbox.for_plugin(&entry.name),
            settings: entry.settings.clone(),
            span: tracing::info_span!("plugin", name = %entry.name),
        }
    }

    /// Run one entry's init hook. On failure the entry is disabled for this run.
    async fn init_entry(&mut self, idx: usize, outbox: &Outbox) -> Result<(), PluginError> {
        let ctx = self.context_for(idx, outbox);
        let entry = &mut self.entries[idx];

        let outcome = AssertUnwindSafe(entry.plugin.init(ctx)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(true)) => match entry.refresh_hooks() {
                Ok(()) => None,
                Err(reason) => Some(reason),
            },
            Ok(Ok(false)) => Some("init returned false".to_string()),
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some("init panicked".to_string()),
        };

        match failure {
            None => {
                entry.initialized = true;
                entry.last_error = None;
                tracing::info!(plugin = %entry.name, "Plugin initialized");
                Ok(())
            }
            Some(reason) => {
                entry.enabled = false;
                entry.initialized = false;
                entry.last_error = Some(reason.clone());
                tracing::error!(plugin = %entry.name, error = %reason, "Plugin init failed, plugin disabled");
                Err(PluginError::Hook {
                    plugin: entry.name.clone(),
                    hook: "init",
                    reason,
                })
            }
        }
    }

    /// Initialize every enabled plugin. A failing plugin is disabled; the rest continue.
    pub async fn init(&mut self, outbox: Outbox) -> InitReport {
        self.outbox = Some(outbox.clone());
        let mut report = InitReport::default();

        for idx in 0..self.entries.len() {
            let entry = &self.entries[idx];
            if !entry.enabled || entry.initialized {
                continue;
            }
            let name = entry.name.clone();
            match self.init_entry(idx, &outbox).await {
                Ok(()) => report.initialized.push(name),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }

        self.rebuild();
        report
    }

    /// Enable a plugin. Returns `Ok(false)` if it was already enabled.
    pub async fn enable(&mut self, name: &str) -> Result<bool, PluginError> {
        let idx = self
            .position(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if self.entries[idx].enabled {
            return Ok(false);
        }

        if !self.entries[idx].initialized {
            if let Some(outbox) = self.outbox.clone() {
                self.init_entry(idx, &outbox).await?;
            }
        }

        let entry = &mut self.entries[idx];
        if entry.initialized {
            let outcome = AssertUnwindSafe(entry.plugin.enable()).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(true)) => None,
                Ok(Ok(false)) => Some("enable returned false".to_string()),
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(_) => Some("enable panicked".to_string()),
            };
            if let Some(reason) = failure {
                entry.last_error = Some(reason.clone());
                tracing::warn!(plugin = %name, error = %reason, "Plugin enable hook failed");
                return Err(PluginError::Hook {
                    plugin: name.to_string(),
                    hook: "enable",
                    reason,
                });
            }
        }

        entry.enabled = true;
        entry.last_error = None;
        self.store.set_enabled(name, true);
        self.rebuild();
        tracing::info!(plugin = %name, "Plugin enabled");
        Ok(true)
    }

    /// Disable a plugin. Returns `Ok(false)` if it was already disabled.
    /// A failing disable hook is logged; the plugin is disabled regardless.
    pub async fn disable(&mut self, name: &str) -> Result<bool, PluginError> {
        let idx = self
            .position(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let entry = &mut self.entries[idx];
        if !entry.enabled {
            return Ok(false);
        }

        if entry.initialized {
            run_disable_hook(entry.plugin.as_mut(), name, "disable").await;
        }

        entry.enabled = false;
        self.store.set_enabled(name, false);
        self.rebuild();
        tracing::info!(plugin = %name, "Plugin disabled");
        Ok(true)
    }

    /// Replace a plugin with a fresh instance from its source, keeping its
    /// settings object. If the source is gone the plugin is unregistered.
    pub async fn reload(&mut self, name: &str) -> Result<ReloadOutcome, PluginError> {
        let idx = self
            .position(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let source = self.entries[idx].source.clone();

        if !self.catalog.contains(&source) {
            let mut old = self.entries.remove(idx);
            if old.is_live() {
                run_disable_hook(old.plugin.as_mut(), name, "unregister").await;
            }
            self.store.forget(name);
            self.rebuild();
            tracing::info!(plugin = %name, source = %source, "Plugin source removed, plugin unregistered");
            return Ok(ReloadOutcome::Unregistered);
        }

        let settings = self.entries[idx].settings.clone();
        let was_enabled = self.entries[idx].enabled;
        let mut fresh = self.instantiate(&source, Some(settings), Some(idx))?;
        fresh.enabled = was_enabled;

        // Re-registration: the fresh instance becomes the most recent
        let mut old = self.entries.remove(idx);
        if old.is_live() {
            run_disable_hook(old.plugin.as_mut(), name, "reload").await;
        }
        if old.name != fresh.name {
            self.store.forget(&old.name);
        }
        drop(old);
        self.entries.push(fresh);
        let new_idx = self.entries.len() - 1;

        let mut initialized = false;
        if was_enabled {
            if let Some(outbox) = self.outbox.clone() {
                initialized = self.init_entry(new_idx, &outbox).await.is_ok();
            }
        }

        self.rebuild();
        tracing::info!(plugin = %name, initialized, "Plugin reloaded");
        Ok(ReloadOutcome::Reloaded { initialized })
    }

    /// Call disable hooks of live plugins without persisting anything
    pub async fn shutdown(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| e.is_live()) {
            run_disable_hook(entry.plugin.as_mut(), &entry.name, "shutdown").await;
        }
    }

    fn rebuild(&mut self) {
        let live: Vec<&PluginEntry> = self.entries.iter().filter(|e| e.is_live()).collect();

        self.table = CommandTable::build(live.iter().flat_map(|e| e.commands.iter().cloned()));

        let mut pipeline = MessagePipeline::new();
        for entry in &live {
            if let Some(transform) = &entry.incoming {
                pipeline.push_incoming(&entry.name, Arc::clone(transform));
            }
            if let Some(transform) = &entry.outgoing {
                pipeline.push_outgoing(&entry.name, Arc::clone(transform));
            }
        }
        self.pipeline = pipeline;
    }

    /// Commands of enabled plugins whose own flag is not disabled
    pub fn commands(&self) -> Vec<Arc<CommandDescriptor>> {
        self.table
            .descriptors()
            .iter()
            .filter(|d| d.enabled)
            .cloned()
            .collect()
    }

    /// Lookup table for routing; includes per-command-disabled entries so the
    /// router can report them as disabled rather than unknown
    pub fn command_table(&self) -> &CommandTable {
        &self.table
    }

    pub fn pipeline(&self) -> &MessagePipeline {
        &self.pipeline
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name && e.enabled)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn settings(&self, name: &str) -> Option<SettingsHandle> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.settings.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.entries
            .iter()
            .map(|e| PluginStatus {
                name: e.name.clone(),
                version: e.version.clone(),
                enabled: e.enabled,
                initialized: e.initialized,
                error: e.last_error.clone(),
                commands: e.commands.iter().map(|c| c.name.clone()).collect(),
            })
            .collect()
    }
}

/// Run a plugin's disable hook. Errors, `false` and panics are logged and
/// never propagate to the caller.
async fn run_disable_hook(plugin: &mut dyn Plugin, name: &str, phase: &'static str) {
    match AssertUnwindSafe(plugin.disable()).catch_unwind().await {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            tracing::warn!(plugin = %name, phase, "Plugin disable hook returned false");
        }
        Ok(Err(e)) => {
            tracing::warn!(plugin = %name, phase, error = %e, "Plugin disable hook failed");
        }
        Err(_) => {
            tracing::error!(plugin = %name, phase, "Plugin disable hook panicked");
        }
    }
}
