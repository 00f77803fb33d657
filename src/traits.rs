//! Module system traits and interfaces
//!
//! Defines the core contract between the host runtime and modules, the
//! lifecycle state graph, and the error taxonomy used across the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::registry::manifest::ModuleManifest;

/// Module lifecycle state
///
/// `Discovered` is the unique initial state. `Unloaded` and `Failed` are
/// terminal: a module in either state must be re-discovered from scratch
/// to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    /// Manifest found by the discovery scanner
    Discovered,
    /// Manifest validated and approved by the security gate
    Validated,
    /// Instance construction in progress
    Loading,
    /// Instance constructed, not yet initialized
    Loaded,
    /// Init hook running under deadline
    Initializing,
    /// Init hook completed
    Initialized,
    /// Transitioning into active operation
    Starting,
    /// Active; runtime monitor attached
    Running,
    /// Transitioning into paused operation
    Pausing,
    /// Suspended; instance retained, monitor detached
    Paused,
    /// Stop hook running under deadline
    Stopping,
    /// Stopped; instance retained, may restart or unload
    Stopped,
    /// Teardown in progress
    Unloading,
    /// Terminal: instance released, record removed from the registry
    Unloaded,
    /// Terminal: record retained for diagnosis until purged
    Failed,
}

impl ModuleState {
    /// Whether this state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleState::Unloaded | ModuleState::Failed)
    }

    /// Whether a direct transition to `next` is defined in the lifecycle graph.
    ///
    /// `Failed` is reachable from every non-terminal state; everything else
    /// must follow the graph edge by edge. Composite operations (load,
    /// unload) walk adjacent states, never skip them.
    pub fn can_transition_to(&self, next: ModuleState) -> bool {
        use ModuleState::*;

        if next == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Discovered, Validated)
                | (Validated, Loading)
                | (Loading, Loaded)
                | (Loaded, Initializing)
                | (Initializing, Initialized)
                | (Initialized, Starting)
                | (Starting, Running)
                | (Running, Pausing)
                | (Running, Stopping)
                | (Pausing, Paused)
                | (Paused, Starting)
                | (Paused, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Stopped, Unloading)
                | (Unloading, Unloaded)
        )
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Opaque module state snapshot, exchanged across hot swaps.
///
/// A module need not support snapshots; `StateSnapshot::empty()` stands in
/// when it does not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Arbitrary module-defined payload
    pub data: serde_json::Value,
}

impl StateSnapshot {
    /// Snapshot carrying no state
    pub fn empty() -> Self {
        Self {
            data: serde_json::Value::Null,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_null()
    }
}

/// Resource usage as reported by a module's health check
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Memory attributed to the module, in bytes
    pub memory_bytes: u64,
    /// Cumulative busy time spent servicing work, in milliseconds
    pub busy_ms: u64,
}

/// Status record returned by a module's optional health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the module considers itself operational
    pub healthy: bool,
    /// Optional human-readable detail
    pub detail: Option<String>,
    /// Self-reported resource usage, if the module tracks it
    pub usage: Option<ResourceUsage>,
}

impl HealthStatus {
    /// Healthy status with no usage report
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: None,
            usage: None,
        }
    }

    /// Unhealthy status with a reason
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
            usage: None,
        }
    }

    /// Attach a usage report
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Context provided to a module instance at initialization
///
/// This is the module's entire view of the host: an instance identity, a
/// private data directory, and its configuration key/values.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Unique identifier for this module instance
    pub instance_id: String,
    /// Directory the module may use for its own state
    pub data_dir: String,
    /// Module configuration (key-value pairs from its config file)
    pub config: HashMap<String, String>,
}

impl ModuleContext {
    pub fn new(instance_id: String, data_dir: String, config: HashMap<String, String>) -> Self {
        Self {
            instance_id,
            data_dir,
            config,
        }
    }

    /// Get a configuration value
    pub fn get_config(&self, key: &str) -> Option<&String> {
        self.config.get(key)
    }

    /// Get a configuration value with default
    pub fn get_config_or(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .map(|s| s.as_str())
            .unwrap_or(default)
            .to_string()
    }
}

/// Module trait implemented by pluggable units of functionality
///
/// These four hooks are the only calls the lifecycle manager makes into a
/// module instance. Everything else (start, pause, resume) is host-side
/// bookkeeping.
#[async_trait]
pub trait Module: Send + Sync {
    /// Initialize the module with its context and manifest.
    ///
    /// `preserved` carries the previous instance's state snapshot across a
    /// hot swap, when one was available.
    async fn init(
        &mut self,
        context: ModuleContext,
        manifest: &ModuleManifest,
        preserved: Option<StateSnapshot>,
    ) -> Result<(), ModuleError>;

    /// Stop the module (graceful shutdown).
    ///
    /// Bounded by the configured stop deadline; exceeding it results in a
    /// forced stop.
    async fn stop(&mut self) -> Result<(), ModuleError>;

    /// Export the module's state for hot-swap preservation.
    ///
    /// Best-effort: the default declines, and the swap proceeds without
    /// state.
    async fn snapshot_state(&self) -> Option<StateSnapshot> {
        None
    }

    /// Report health and resource usage.
    ///
    /// Sampled by the runtime monitor. The default reports healthy with no
    /// usage data, which limits monitoring to wall-clock checks.
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy()
    }
}

/// Module system errors
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("invalid module manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    #[error("security rejection: {0}")]
    SecurityRejection(String),

    #[error("dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("module dependency missing: {0}")]
    DependencyMissing(String),

    #[error("module version incompatible: {0}")]
    VersionIncompatible(String),

    #[error("module {module} has dependents: {}", .dependents.join(", "))]
    DependentsExist {
        module: String,
        dependents: Vec<String>,
    },

    #[error("invalid transition for module {module}: {from} -> {to}")]
    InvalidTransition {
        module: String,
        from: ModuleState,
        to: ModuleState,
    },

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("module already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("module entry unavailable: {0}")]
    EntryUnavailable(String),

    #[error("transient load failure: {0}")]
    TransientLoad(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("module operation failed: {0}")]
    OperationError(String),
}

impl ModuleError {
    /// Whether the retry policy applies to this error.
    ///
    /// Structural errors (validation, security, cycles) and deadline
    /// failures are never retried; only genuinely transient load failures
    /// are.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModuleError::TransientLoad(_))
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        ModuleError::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(e: anyhow::Error) -> Self {
        ModuleError::OperationError(e.to_string())
    }
}
