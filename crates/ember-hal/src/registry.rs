//! [`PluginRegistry`] – central action plugin registry.
//!
//! The registry stores every registered [`ActionPlugin`] by identifier.  The
//! parser asks it whether a command's target is available; the router asks it
//! for the plugin to invoke.  It is built once at startup and shared
//! read-only behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::ActionPlugin;

/// Action plugins keyed by id.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ActionPlugin>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin.  Any previously registered plugin with the same
    /// `id` is replaced.
    pub fn register(&mut self, plugin: Arc<dyn ActionPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ActionPlugin>> {
        self.plugins.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Registered, healthy, and able to execute `action_name`.
    pub fn is_available(&self, id: &str, action_name: &str) -> bool {
        self.plugins
            .get(id)
            .is_some_and(|p| p.is_healthy() && p.supports(action_name))
    }

    /// Registered plugin ids in sorted order.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
