//! Module registry, discovery, and dependency resolution
//!
//! Handles manifest parsing, candidate discovery, load-order computation,
//! and the process-wide record store.

pub mod dependencies;
pub mod discovery;
pub mod manifest;
pub mod store;

pub use dependencies::{LoadPlan, ModuleDependencies};
pub use discovery::{DiscoveredModule, DiscoveryScanner};
pub use manifest::{ModuleDependency, ModuleManifest, RawManifest};
pub use store::{
    ModuleHandle, ModuleRecord, ModuleRegistry, ModuleSnapshot, SecurityViolation,
    TransitionOutcome, TransitionRecord, ViolationKind,
};
