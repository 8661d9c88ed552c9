use std::any::TypeId;
use std::collections::HashMap;

use crate::collectors::{Collector, LoadAvgCollector, RawConfig, SupervisorCollector};
use crate::error::RegistryError;

type Factory = fn() -> Box<dyn Collector>;

struct Entry {
    type_id: TypeId,
    build: Factory,
}

fn build_default<C>() -> Box<dyn Collector>
where
    C: Collector + Default + 'static,
{
    Box::new(C::default())
}

/// Maps plugin type names to collector factories.
///
/// Filled once at startup, then shared read-only (usually behind an `Arc`).
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every collector shipped with the crate.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register::<SupervisorCollector>("supervisor")?;
        registry.register::<LoadAvgCollector>("loadavg")?;
        Ok(registry)
    }

    /// Registers `C` under `type_name`.
    ///
    /// Registering the same collector type twice is a no-op; a different type
    /// under a taken name is a conflict.
    pub fn register<C>(&mut self, type_name: &str) -> Result<(), RegistryError>
    where
        C: Collector + Default + 'static,
    {
        let type_id = TypeId::of::<C>();
        if let Some(existing) = self.entries.get(type_name) {
            if existing.type_id == type_id {
                return Ok(());
            }
            return Err(RegistryError::RegistrationConflict(type_name.to_string()));
        }

        self.entries.insert(
            type_name.to_string(),
            Entry {
                type_id,
                build: build_default::<C>,
            },
        );
        Ok(())
    }

    /// Builds a default instance of `type_name` and applies `options` to it.
    pub fn create(&self, type_name: &str, options: &RawConfig) -> Result<Box<dyn Collector>, RegistryError> {
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownPluginType(type_name.to_string()))?;

        let mut collector = (entry.build)();
        collector
            .configure(options)
            .map_err(|source| RegistryError::InvalidConfig {
                type_name: type_name.to_string(),
                source,
            })?;
        Ok(collector)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
