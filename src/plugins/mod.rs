// ABOUTME: Plugins shipped with the binary and the catalog that registers them
// ABOUTME: Each catalog source builds a fresh instance, so reloads start clean

pub mod chunker;
pub mod dice;
pub mod echo;
pub mod sanitize;

use chirp_core::{Plugin, PluginCatalog};

pub use chunker::ChunkerPlugin;
pub use dice::DicePlugin;
pub use echo::EchoPlugin;
pub use sanitize::SanitizePlugin;

/// Catalog of the bundled plugins. Registration order is pipeline order.
pub fn builtin_catalog() -> PluginCatalog {
    PluginCatalog::new()
        .register("sanitize", || Ok(Box::new(SanitizePlugin) as Box<dyn Plugin>))
        .register("dice", || Ok(Box::new(DicePlugin::new()?) as Box<dyn Plugin>))
        .register("echo", || Ok(Box::new(EchoPlugin) as Box<dyn Plugin>))
        .register("chunker", || Ok(Box::new(ChunkerPlugin::default()) as Box<dyn Plugin>))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_sources() {
        let catalog = builtin_catalog();
        assert_eq!(catalog.sources(), vec!["sanitize", "dice", "echo", "chunker"]);
    }
}
