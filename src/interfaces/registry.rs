//! Interface registry - manages available interfaces.

use std::collections::HashMap;
use std::sync::Arc;

use super::command::{CommandInterface, CommandSpec};
use super::types::Interface;
use super::{
    DataGrabberInterface, DataSinkInterface, FunctionInterface, IdentityInterface, MergeInterface,
    SelectInterface,
};
use crate::error::{Error, Result};

/// Registry of available interfaces.
#[derive(Clone)]
pub struct InterfaceRegistry {
    interfaces: HashMap<String, Arc<dyn Interface>>,
}

impl InterfaceRegistry {
    /// Create a new registry with the built-in interfaces.
    pub fn new() -> Self {
        let mut registry = Self {
            interfaces: HashMap::new(),
        };

        registry.register(Arc::new(IdentityInterface::new()));
        registry.register(Arc::new(MergeInterface::new()));
        registry.register(Arc::new(SelectInterface::new()));
        registry.register(Arc::new(FunctionInterface::new()));
        registry.register(Arc::new(DataGrabberInterface::new()));
        registry.register(Arc::new(DataSinkInterface::new()));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            interfaces: HashMap::new(),
        }
    }

    /// Register an interface, replacing any with the same name.
    pub fn register(&mut self, interface: Arc<dyn Interface>) {
        self.interfaces
            .insert(interface.name().to_string(), interface);
    }

    /// Get an interface by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Interface>> {
        self.interfaces.get(name).cloned()
    }

    /// Check if an interface is registered.
    pub fn has(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    /// List all registered interface names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.interfaces.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get descriptions of all registered interfaces, sorted by name.
    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        let mut items: Vec<(&str, &str)> = self
            .interfaces
            .iter()
            .map(|(name, iface)| (name.as_str(), iface.description()))
            .collect();
        items.sort_unstable_by_key(|(name, _)| *name);
        items
    }

    /// A copy of this registry extended with declared command interfaces.
    ///
    /// Declarations may not shadow an interface that is already registered.
    pub fn with_declared(&self, declared: &HashMap<String, CommandSpec>) -> Result<Self> {
        let mut registry = self.clone();
        let mut names: Vec<&String> = declared.keys().collect();
        names.sort();

        for name in names {
            if registry.has(name) {
                return Err(Error::Validation(format!(
                    "Interface '{}' is already defined and cannot be redeclared",
                    name
                )));
            }
            registry.register(Arc::new(CommandInterface::new(name, declared[name].clone())));
        }
        Ok(registry)
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
