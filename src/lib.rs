//! modhost - Embeddable module runtime for long-running host processes
//!
//! This crate provides the machinery for discovering, validating, loading,
//! hot-swapping, and unloading dynamically pluggable modules inside a host
//! process, with a permission gate and per-module resource monitoring.
//!
//! ## Architecture
//!
//! - **Lifecycle State Machine**: every module moves through an explicit
//!   state graph, with deadlines on module hooks and retry with backoff on
//!   transient load failures
//! - **Dependency Ordering**: modules load in dependency order and unload
//!   in strict reverse order; cycles are rejected with the offending path
//! - **Security Gate**: ban/trust lists, a best-effort static pattern scan,
//!   artifact digest checks, and derived trust tiers — an in-process
//!   boundary, not an OS sandbox
//! - **Registry Discipline**: one record per module, mutated only by the
//!   lifecycle manager; everything else reads snapshots
//! - **Runtime Monitoring**: per-running-module sampling against
//!   tier-dependent memory and wall-clock ceilings
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use modhost::{ModuleManager, RuntimeConfig};
//!
//! let manager = ModuleManager::new(RuntimeConfig::default());
//! manager.register_factory("indexer", || Box::new(IndexerModule::default()));
//! manager.load("indexer").await?;
//! ```

pub mod config;
pub mod events;
pub mod loader;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod security;
pub mod traits;
pub mod validation;

// Re-export config types
pub use config::*;

pub use events::{EventBus, RuntimeEvent};
pub use loader::{EntryKind, FactoryRegistry};
pub use manager::{CancelToken, ModuleManager};
pub use monitor::{ResourceLimits, RuntimeMonitor, TierLimits};
pub use registry::{
    DiscoveryScanner, LoadPlan, ModuleDependencies, ModuleHandle, ModuleManifest, ModuleRegistry,
    ModuleSnapshot, RawManifest, SecurityViolation, TransitionOutcome, ViolationKind,
};
pub use security::{Permission, PermissionSet, SecurityGate, SecurityPolicy, TrustTier};
pub use traits::{
    HealthStatus, Module, ModuleContext, ModuleError, ModuleState, ResourceUsage, StateSnapshot,
};
pub use validation::{ManifestValidator, Version, VersionReq};
