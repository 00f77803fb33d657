//! Factory registry for module construction
//!
//! Hosts register named constructors before loading; the lifecycle manager
//! resolves a validated `EntryKind` against this registry when it needs an
//! instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::loader::EntryKind;
use crate::traits::{Module, ModuleError};

/// Constructor producing a fresh module instance
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// Registry of named module factories
#[derive(Default)]
pub struct FactoryRegistry {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name. Replaces any previous registration.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registering module factory: {}", name);
        self.factories
            .write()
            .expect("factory registry lock poisoned")
            .insert(name, Arc::new(factory));
    }

    /// Construct an instance for the given entry.
    ///
    /// `preloaded` supplies the instance for `EntryKind::Preloaded`; it is
    /// ignored for factory entries.
    pub fn construct(
        &self,
        entry: &EntryKind,
        preloaded: Option<Box<dyn Module>>,
    ) -> Result<Box<dyn Module>, ModuleError> {
        match entry {
            EntryKind::Factory(name) => {
                let factory = {
                    let factories = self
                        .factories
                        .read()
                        .expect("factory registry lock poisoned");
                    factories.get(name).cloned()
                };
                match factory {
                    Some(f) => Ok(f()),
                    None => Err(ModuleError::EntryUnavailable(format!(
                        "no factory registered under '{}'",
                        name
                    ))),
                }
            }
            EntryKind::Preloaded => preloaded.ok_or_else(|| {
                ModuleError::EntryUnavailable(
                    "entry is 'preloaded' but no instance was injected".to_string(),
                )
            }),
        }
    }

    /// Names of all registered factories
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .expect("factory registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
