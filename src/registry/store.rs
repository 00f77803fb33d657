//! Module registry and records
//!
//! The process-wide map from module name to record. Three guarantees:
//! single-writer discipline (only the lifecycle manager mutates records),
//! identifier uniqueness, and transactional dependent-set accuracy. All
//! other components read consistent snapshots.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::monitor::MonitorHandle;
use crate::registry::manifest::ModuleManifest;
use crate::security::gate::TrustTier;
use crate::security::permissions::{Permission, PermissionSet};
use crate::traits::{Module, ModuleError, ModuleState};

/// One entry in a record's state-transition history
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: ModuleState,
    pub to: ModuleState,
    pub at: SystemTime,
    pub outcome: TransitionOutcome,
}

/// How a transition concluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// Transition completed normally
    Completed,
    /// Transition failed with the recorded error
    Failed(String),
    /// Stop deadline expired; the transition was forced through
    Forced,
    /// Hot swap committed with the old instance's state preserved
    SwappedWithState,
    /// Hot swap committed, but the old instance supplied no state
    SwappedWithoutState,
}

/// Kinds of monitor-detected violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Memory usage exceeded the tier ceiling
    MemoryCeiling,
    /// Wall-clock running time exceeded the tier ceiling
    TimeCeiling,
    /// Health probes went unanswered past the configured allowance
    Unresponsive,
}

/// Immutable violation record.
///
/// Appending one never mutates other state directly; it is the trigger for
/// a transition decided by the lifecycle manager.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityViolation {
    pub module: String,
    pub kind: ViolationKind,
    pub detail: String,
    pub at: SystemTime,
}

impl SecurityViolation {
    pub fn new(module: impl Into<String>, kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            kind,
            detail: detail.into(),
            at: SystemTime::now(),
        }
    }
}

/// Shared handle to a module instance.
///
/// The handle's identity is the outer `Arc`: across a hot swap the `Arc`
/// stays, only the boxed instance behind it is replaced, so any component
/// holding the handle keeps a valid reference.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<Mutex<Box<dyn Module>>>,
}

impl ModuleHandle {
    pub fn new(instance: Box<dyn Module>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(instance)),
        }
    }

    /// Lock the instance for a hook call
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Module>> {
        self.inner.lock().await
    }

    /// Replace the instance behind this handle, returning the old one.
    /// The handle identity is unchanged.
    pub async fn replace(&self, new_instance: Box<dyn Module>) -> Box<dyn Module> {
        let mut guard = self.inner.lock().await;
        std::mem::replace(&mut *guard, new_instance)
    }

    /// Whether two handles share the same identity
    pub fn same_identity(&self, other: &ModuleHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle").finish_non_exhaustive()
    }
}

/// Per-module record, owned by the lifecycle manager.
///
/// Mutated only through `transition` (plus the swap/violation appenders),
/// which enforce the lifecycle graph and keep the history complete.
pub struct ModuleRecord {
    /// Validated manifest for the running version
    pub manifest: Arc<ModuleManifest>,
    /// Permissions granted at validation
    pub granted: PermissionSet,
    /// Trust tier derived by the security gate
    pub tier: TrustTier,
    /// Current lifecycle state
    pub state: ModuleState,
    /// Ordered transition log
    pub history: Vec<TransitionRecord>,
    /// Names of modules whose dependency list includes this one
    pub dependents: Vec<String>,
    /// Module configuration passed to the instance at initialization
    pub config: HashMap<String, String>,
    /// Monitor-detected violations
    pub violations: Vec<SecurityViolation>,
    /// Instance handle; present from Loaded until unload/failure release
    pub instance: Option<ModuleHandle>,
    /// Monitor handle; present exactly while Running
    pub monitor: Option<MonitorHandle>,
    /// Unique id for the current instance
    pub instance_id: Option<String>,
    /// Final error for a Failed record
    pub last_error: Option<String>,
}

impl ModuleRecord {
    pub fn new(manifest: Arc<ModuleManifest>, granted: PermissionSet, tier: TrustTier) -> Self {
        Self {
            manifest,
            granted,
            tier,
            state: ModuleState::Discovered,
            history: Vec::new(),
            dependents: Vec::new(),
            config: HashMap::new(),
            violations: Vec::new(),
            instance: None,
            monitor: None,
            instance_id: None,
            last_error: None,
        }
    }

    /// Perform a state transition, enforcing the lifecycle graph.
    pub fn transition(
        &mut self,
        to: ModuleState,
        outcome: TransitionOutcome,
    ) -> Result<(), ModuleError> {
        if !self.state.can_transition_to(to) {
            return Err(ModuleError::InvalidTransition {
                module: self.manifest.name.clone(),
                from: self.state,
                to,
            });
        }
        debug!(
            "Module {} transition: {} -> {} ({:?})",
            self.manifest.name, self.state, to, outcome
        );
        self.history.push(TransitionRecord {
            from: self.state,
            to,
            at: SystemTime::now(),
            outcome,
        });
        self.state = to;
        Ok(())
    }

    /// Record a committed hot swap. Not a state change: the module stays
    /// `Running`, but the history must show the swap and whether state
    /// was carried over.
    pub fn record_swap(&mut self, with_state: bool) {
        let outcome = if with_state {
            TransitionOutcome::SwappedWithState
        } else {
            TransitionOutcome::SwappedWithoutState
        };
        self.history.push(TransitionRecord {
            from: self.state,
            to: self.state,
            at: SystemTime::now(),
            outcome,
        });
    }

    /// Append a violation to this record
    pub fn record_violation(&mut self, violation: SecurityViolation) {
        self.violations.push(violation);
    }
}

/// Read-only view of a record, for observers
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    pub name: String,
    pub version: String,
    pub state: ModuleState,
    pub tier: TrustTier,
    pub granted: Vec<Permission>,
    pub dependents: Vec<String>,
    pub history: Vec<TransitionRecord>,
    pub violations: Vec<SecurityViolation>,
}

/// Registry entry: the record plus its mutation lock.
///
/// Holding the record mutex serializes every mutating operation on one
/// module id; operations on unrelated ids proceed in parallel.
pub struct RegistryEntry {
    pub record: Mutex<ModuleRecord>,
}

/// Process-wide module registry
#[derive(Default)]
pub struct ModuleRegistry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for a new module name.
    ///
    /// Identifier uniqueness: an existing entry under the same name is a
    /// hard error, never a silent replace.
    pub(crate) async fn insert(
        &self,
        record: ModuleRecord,
    ) -> Result<Arc<RegistryEntry>, ModuleError> {
        let name = record.manifest.name.clone();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&name) {
            return Err(ModuleError::AlreadyLoaded(name));
        }
        let entry = Arc::new(RegistryEntry {
            record: Mutex::new(record),
        });
        entries.insert(name, Arc::clone(&entry));
        Ok(entry)
    }

    /// Look up the entry for a module name
    pub async fn entry(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.read().await.get(name).cloned()
    }

    /// Remove an entry. Callers must hold the lifecycle invariants (only
    /// after a successful unload, or an explicit purge of a terminal
    /// record).
    pub(crate) async fn remove(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.write().await.remove(name)
    }

    /// Add `dependent` to `name`'s dependent set
    pub(crate) async fn add_dependent(&self, name: &str, dependent: &str) {
        if let Some(entry) = self.entry(name).await {
            let mut record = entry.record.lock().await;
            if !record.dependents.iter().any(|d| d == dependent) {
                record.dependents.push(dependent.to_string());
            }
        }
    }

    /// Remove `dependent` from `name`'s dependent set
    pub(crate) async fn remove_dependent(&self, name: &str, dependent: &str) {
        if let Some(entry) = self.entry(name).await {
            let mut record = entry.record.lock().await;
            record.dependents.retain(|d| d != dependent);
        }
    }

    /// Names of all registered modules, sorted for determinism
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current state of every registered module
    pub async fn states(&self) -> HashMap<String, ModuleState> {
        let entries: Vec<(String, Arc<RegistryEntry>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut states = HashMap::new();
        for (name, entry) in entries {
            let record = entry.record.lock().await;
            states.insert(name, record.state);
        }
        states
    }

    /// Consistent read-only snapshot of one module
    pub async fn snapshot(&self, name: &str) -> Option<ModuleSnapshot> {
        let entry = self.entry(name).await?;
        let record = entry.record.lock().await;
        Some(ModuleSnapshot {
            name: record.manifest.name.clone(),
            version: record.manifest.version.to_string(),
            state: record.state,
            tier: record.tier,
            granted: record.granted.to_vec(),
            dependents: record.dependents.clone(),
            history: record.history.clone(),
            violations: record.violations.clone(),
        })
    }

    /// Manifests of all registered modules, for dependency resolution
    pub async fn manifests(&self) -> HashMap<String, Arc<ModuleManifest>> {
        let entries: Vec<Arc<RegistryEntry>> =
            self.entries.read().await.values().cloned().collect();

        let mut manifests = HashMap::new();
        for entry in entries {
            let record = entry.record.lock().await;
            manifests.insert(record.manifest.name.clone(), Arc::clone(&record.manifest));
        }
        manifests
    }
}
