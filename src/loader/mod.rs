//! Module instantiation
//!
//! A manifest's entry reference resolves at validation time into a closed,
//! tagged set of instantiation strategies. There is no shape-sniffing at
//! load time: either the entry names a registered factory, or an instance
//! was handed to the runtime up front.

pub mod factory;

pub use factory::{FactoryRegistry, ModuleFactory};

use crate::traits::ModuleError;

/// Instantiation strategy for a module, resolved from its manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Construct via a factory registered under this name
    Factory(String),
    /// Use an instance injected before load (tests, marketplace payloads)
    Preloaded,
}

impl EntryKind {
    /// Parse a manifest entry reference.
    ///
    /// Grammar: `factory:<name>` or `preloaded`. Anything else is a
    /// manifest error.
    pub fn parse(entry: &str) -> Result<Self, ModuleError> {
        if let Some(name) = entry.strip_prefix("factory:") {
            if name.is_empty() {
                return Err(ModuleError::InvalidManifest(
                    "entry factory name cannot be empty".to_string(),
                ));
            }
            return Ok(EntryKind::Factory(name.to_string()));
        }
        if entry == "preloaded" {
            return Ok(EntryKind::Preloaded);
        }
        Err(ModuleError::InvalidManifest(format!(
            "unknown entry kind: {} (expected factory:<name> or preloaded)",
            entry
        )))
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Factory(name) => write!(f, "factory:{}", name),
            EntryKind::Preloaded => f.write_str("preloaded"),
        }
    }
}
