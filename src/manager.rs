//! Module manager for orchestrating all modules
//!
//! The lifecycle state machine: drives every module through
//! validate -> gate -> resolve -> load -> initialize -> start, and owns
//! pause/resume, graceful/forced stop, unload, hot swap, and whole-runtime
//! shutdown. The manager is the registry's only writer.
//!
//! Concurrency discipline: every mutating operation on one module id runs
//! under that record's mutex, so overlapping requests for the same id
//! serialize and overlapping loads collapse into one construction.
//! Cross-record locks are only ever taken in the dependent-to-dependency
//! direction, which the acyclic graph keeps deadlock-free.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use rand::Rng;

use crate::config::RuntimeConfig;
use crate::events::{EventBus, RuntimeEvent};
use crate::loader::{EntryKind, FactoryRegistry};
use crate::monitor::{RuntimeMonitor, TierLimits};
use crate::registry::dependencies::ModuleDependencies;
use crate::registry::discovery::DiscoveryScanner;
use crate::registry::manifest::{ModuleManifest, RawManifest};
use crate::registry::store::{
    ModuleHandle, ModuleRecord, ModuleRegistry, ModuleSnapshot, SecurityViolation,
    TransitionOutcome,
};
use crate::security::gate::{SecurityGate, SecurityPolicy};
use crate::traits::{Module, ModuleContext, ModuleError, ModuleState};
use crate::validation::ManifestValidator;

/// Cancellation token for an in-flight load.
///
/// Cancellation is honored at defined checkpoints between dependency
/// steps, never by destroying a partially constructed instance.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Candidate metadata assembled for one top-level load
struct Candidate {
    manifest: Arc<ModuleManifest>,
    source: Option<String>,
    config: HashMap<String, String>,
}

/// Package installed through the marketplace boundary, waiting to load
struct InstalledCandidate {
    manifest: Arc<ModuleManifest>,
    source: Option<String>,
    config: HashMap<String, String>,
}

/// Module manager coordinates all loaded modules
pub struct ModuleManager {
    /// Runtime configuration
    config: RuntimeConfig,
    /// Process-wide record store
    registry: Arc<ModuleRegistry>,
    /// Named constructors for factory entries
    factories: Arc<FactoryRegistry>,
    /// Security policy; snapshotted per top-level load
    policy: std::sync::RwLock<SecurityPolicy>,
    /// Structured event bus
    events: EventBus,
    /// Filesystem discovery scanner
    scanner: DiscoveryScanner,
    /// Per-tier resource limits
    tier_limits: TierLimits,
    /// Monitor template (carries the violation channel)
    monitor: RuntimeMonitor,
    /// Violation handler task
    violation_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Instances injected up front for `preloaded` entries
    pending_instances: Mutex<HashMap<String, Box<dyn Module>>>,
    /// Candidates installed through the marketplace boundary
    installed: Mutex<HashMap<String, InstalledCandidate>>,
}

impl ModuleManager {
    /// Create a new module manager with an empty factory registry
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_factories(config, Arc::new(FactoryRegistry::new()))
    }

    /// Create a new module manager sharing an existing factory registry
    pub fn with_factories(config: RuntimeConfig, factories: Arc<FactoryRegistry>) -> Arc<Self> {
        let (violation_tx, violation_rx) = mpsc::unbounded_channel::<SecurityViolation>();

        let registry = Arc::new(ModuleRegistry::new());
        let events = EventBus::default();
        let scanner = DiscoveryScanner::new(&config.discovery.roots);
        let tier_limits = config.limits.to_tier_limits();
        let monitor = RuntimeMonitor::new(violation_tx)
            .with_interval(config.monitor.sample_interval())
            .with_probe_timeout(config.monitor.probe_timeout())
            .with_max_missed_probes(config.monitor.max_missed_probes);

        let manager = Arc::new(Self {
            policy: std::sync::RwLock::new(config.security.clone()),
            config,
            registry: Arc::clone(&registry),
            factories,
            events: events.clone(),
            scanner,
            tier_limits,
            monitor,
            violation_task: std::sync::Mutex::new(None),
            pending_instances: Mutex::new(HashMap::new()),
            installed: Mutex::new(HashMap::new()),
        });

        // Violation handler: the monitor only requests; this task is where
        // the manager, as sole mutator, drives the module to Failed.
        let handler = tokio::spawn(Self::run_violation_handler(registry, events, violation_rx));
        *manager
            .violation_task
            .lock()
            .expect("violation task lock poisoned") = Some(handler);

        manager
    }

    async fn run_violation_handler(
        registry: Arc<ModuleRegistry>,
        events: EventBus,
        mut violation_rx: mpsc::UnboundedReceiver<SecurityViolation>,
    ) {
        while let Some(violation) = violation_rx.recv().await {
            warn!(
                "Module {} violation: {:?} ({})",
                violation.module, violation.kind, violation.detail
            );
            events.publish(RuntimeEvent::Violation(violation.clone()));

            if let Some(entry) = registry.entry(&violation.module).await {
                let mut record = entry.record.lock().await;
                let reason = format!("{:?}: {}", violation.kind, violation.detail);
                record.record_violation(violation);
                if !record.state.is_terminal() {
                    fail_record(&events, &mut record, reason);
                }
            }
        }
    }

    /// Event bus for runtime observability
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The record store, for read-only observers
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Register a module factory
    pub fn register_factory<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.factories.register(name, factory);
    }

    /// Inject an instance for a module whose manifest entry is `preloaded`.
    /// Consumed by the next load of that module.
    pub async fn provide_instance(&self, name: &str, instance: Box<dyn Module>) {
        self.pending_instances
            .lock()
            .await
            .insert(name.to_string(), instance);
    }

    /// Mutate the security policy. Takes effect on the next top-level load.
    pub fn update_policy(&self, mutate: impl FnOnce(&mut SecurityPolicy)) {
        let mut policy = self.policy.write().expect("policy lock poisoned");
        mutate(&mut policy);
    }

    /// Install a downloaded package through the marketplace boundary.
    ///
    /// Validates the manifest and gate-checks it (including the artifact
    /// digest while the bytes are in hand); from here on, loading is
    /// indistinguishable from loading a locally discovered module.
    pub async fn install_package(
        &self,
        raw: RawManifest,
        source: Option<String>,
        artifact: Option<&[u8]>,
        config: HashMap<String, String>,
    ) -> Result<(), ModuleError> {
        let manifest = Arc::new(ManifestValidator::new().validate(&raw)?);
        let gate = SecurityGate::new(self.policy.read().expect("policy lock poisoned").clone());
        gate.assess(&manifest, source.as_deref(), artifact)?;

        info!("Installed module package: {}", manifest.id());
        self.installed.lock().await.insert(
            manifest.name.clone(),
            InstalledCandidate {
                manifest,
                source,
                config,
            },
        );
        Ok(())
    }

    /// Get list of registered modules
    pub async fn list_modules(&self) -> Vec<String> {
        self.registry.list().await
    }

    /// Get a module's current state
    pub async fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.registry.states().await.get(name).copied()
    }

    /// Read-only snapshot of one module's record
    pub async fn snapshot(&self, name: &str) -> Option<ModuleSnapshot> {
        self.registry.snapshot(name).await
    }

    /// Load a module and drive it to `Running`, recursively loading unmet
    /// dependencies first.
    pub async fn load(&self, name: &str) -> Result<(), ModuleError> {
        self.load_with_cancel(name, &CancelToken::new()).await
    }

    /// Load with an explicit cancellation token.
    pub async fn load_with_cancel(
        &self,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<(), ModuleError> {
        info!("Loading module: {}", name);

        // Policy is re-read per top-level load: a fresh ban is never
        // bypassed by a cached decision.
        let gate = SecurityGate::new(self.policy.read().expect("policy lock poisoned").clone());

        let candidates = self.assemble_candidates().await?;
        if !candidates.contains_key(name) {
            return Err(ModuleError::ModuleNotFound(name.to_string()));
        }

        let known: HashMap<String, &ModuleManifest> = candidates
            .iter()
            .map(|(k, c)| (k.clone(), c.manifest.as_ref()))
            .collect();
        let requested = [name.to_string()];
        let plan = ModuleDependencies::order(&requested, &known)?;
        drop(known);

        for step in &plan.sequence {
            // Cancellation checkpoint between dependency steps.
            if cancel.is_cancelled() {
                return self.cancel_load(name).await;
            }
            self.load_single(step, &candidates, &gate).await?;
        }

        info!("Module {} loaded successfully", name);
        Ok(())
    }

    /// Auto-discover and load all modules found under the configured roots
    pub async fn auto_load(&self) -> Result<(), ModuleError> {
        info!("Auto-discovering and loading modules");

        let discovered = self.scanner.scan()?;
        if discovered.is_empty() {
            info!("No modules discovered");
            return Ok(());
        }

        let mut loaded = 0usize;
        for candidate in &discovered {
            let name = &candidate.manifest.name;
            match self.load(name).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Failed to load module {}: {}", name, e),
            }
        }

        info!("Auto-loaded {} of {} module(s)", loaded, discovered.len());
        Ok(())
    }

    /// Initialize a module that is sitting at `Loaded`
    pub async fn initialize(&self, name: &str) -> Result<(), ModuleError> {
        let entry = self
            .registry
            .entry(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        let mut record = entry.record.lock().await;
        self.step_initialize(&mut record).await
    }

    /// Start a module from `Initialized`, `Paused`, or `Stopped`
    pub async fn start(&self, name: &str) -> Result<(), ModuleError> {
        let entry = self
            .registry
            .entry(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        let mut record = entry.record.lock().await;
        self.step_start(&mut record).await
    }

    /// Pause a running module. The monitor detaches until resume.
    pub async fn pause(&self, name: &str) -> Result<(), ModuleError> {
        let entry = self
            .registry
            .entry(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        let mut record = entry.record.lock().await;

        record.transition(ModuleState::Pausing, TransitionOutcome::Completed)?;
        emit_transition(&self.events, &record);
        if let Some(monitor) = record.monitor.take() {
            monitor.shutdown();
        }
        record.transition(ModuleState::Paused, TransitionOutcome::Completed)?;
        emit_transition(&self.events, &record);

        info!("Module {} paused", name);
        Ok(())
    }

    /// Resume a paused module
    pub async fn resume(&self, name: &str) -> Result<(), ModuleError> {
        self.start(name).await
    }

    /// Stop a module with the graceful-shutdown deadline; a module that
    /// does not acknowledge in time is force-stopped and recorded as such.
    pub async fn stop(&self, name: &str) -> Result<(), ModuleError> {
        let entry = self
            .registry
            .entry(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        let mut record = entry.record.lock().await;
        self.stop_locked(&mut record).await
    }

    /// Unload a module. Rejected while any dependent remains in a
    /// non-terminal state; callers that want cascade must request it
    /// explicitly via `unload_cascade`.
    pub async fn unload(&self, name: &str) -> Result<(), ModuleError> {
        info!("Unloading module: {}", name);

        // Dependent check happens before taking the target's lock so the
        // dependents themselves can be locked without ordering hazards.
        let snapshot = self
            .registry
            .snapshot(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        let live = self.live_dependents(&snapshot.dependents).await;
        if !live.is_empty() {
            return Err(ModuleError::DependentsExist {
                module: name.to_string(),
                dependents: live,
            });
        }

        let entry = self
            .registry
            .entry(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        let mut record = entry.record.lock().await;

        if matches!(record.state, ModuleState::Running | ModuleState::Paused) {
            self.stop_locked(&mut record).await?;
        }

        record.transition(ModuleState::Unloading, TransitionOutcome::Completed)?;
        emit_transition(&self.events, &record);

        // The instance handle is released exactly once, here.
        record.instance = None;
        record.instance_id = None;

        let dependencies: Vec<String> = record
            .manifest
            .dependencies
            .iter()
            .map(|d| d.name.clone())
            .collect();
        for dep in &dependencies {
            self.registry.remove_dependent(dep, name).await;
        }

        record.transition(ModuleState::Unloaded, TransitionOutcome::Completed)?;
        emit_transition(&self.events, &record);
        drop(record);

        self.registry.remove(name).await;
        info!("Module {} unloaded", name);
        Ok(())
    }

    /// Explicitly cascade: unload all transitive dependents (dependents
    /// first), then the module itself.
    pub async fn unload_cascade(&self, name: &str) -> Result<(), ModuleError> {
        info!("Cascade-unloading module: {}", name);

        let order = self.cascade_order(name).await?;
        for module in order {
            self.unload(&module).await?;
        }
        Ok(())
    }

    /// Hot-swap a running module to a new version.
    ///
    /// All-or-nothing: any failure building or initializing the new
    /// instance leaves the old one untouched and running. On commit, the
    /// registry's handle identity is unchanged; only the instance behind
    /// it is replaced, and the old instance is torn down asynchronously.
    pub async fn hot_swap(
        &self,
        name: &str,
        raw_new: RawManifest,
        source: Option<&str>,
    ) -> Result<(), ModuleError> {
        info!("Hot-swapping module: {}", name);

        let new_manifest = Arc::new(ManifestValidator::new().validate(&raw_new)?);
        if new_manifest.name != name {
            return Err(ModuleError::InvalidManifest(format!(
                "hot swap must keep the module name: got {}, expected {}",
                new_manifest.name, name
            )));
        }

        let gate = SecurityGate::new(self.policy.read().expect("policy lock poisoned").clone());
        let decision = match gate.assess(&new_manifest, source, None) {
            Ok(decision) => {
                self.events.publish(RuntimeEvent::SecurityDecision {
                    module: name.to_string(),
                    approved: true,
                    tier: Some(decision.tier),
                    reason: None,
                });
                decision
            }
            Err(e) => {
                self.events.publish(RuntimeEvent::SecurityDecision {
                    module: name.to_string(),
                    approved: false,
                    tier: None,
                    reason: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        let entry = self
            .registry
            .entry(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        let mut record = entry.record.lock().await;

        if record.state != ModuleState::Running {
            return Err(ModuleError::OperationError(format!(
                "hot swap requires Running, module {} is {}",
                name, record.state
            )));
        }

        self.check_dependencies_satisfied(&new_manifest).await?;

        let handle = record
            .instance
            .clone()
            .ok_or_else(|| ModuleError::OperationError(format!("module {} has no instance", name)))?;

        // Best-effort state snapshot from the old instance.
        let snapshot = {
            let guard = handle.lock().await;
            match timeout(
                self.config.lifecycle.snapshot_deadline(),
                guard.snapshot_state(),
            )
            .await
            {
                Ok(snapshot) => snapshot,
                Err(_) => {
                    warn!("Module {} state snapshot timed out; swapping without state", name);
                    None
                }
            }
        };
        let with_state = snapshot.is_some();

        // Build and initialize the new instance. The old instance keeps
        // running; any error from here until the swap commits aborts the
        // whole operation.
        let preloaded = if new_manifest.entry == EntryKind::Preloaded {
            self.pending_instances.lock().await.remove(name)
        } else {
            None
        };
        let mut new_instance = self.factories.construct(&new_manifest.entry, preloaded)?;

        let data_dir = self.module_data_dir(name);
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            ModuleError::TransientLoad(format!("failed to create module data directory: {}", e))
        })?;

        let instance_id = format!("{}_{}", name, uuid::Uuid::new_v4());
        let context = ModuleContext::new(
            instance_id.clone(),
            data_dir.to_string_lossy().to_string(),
            record.config.clone(),
        );

        match timeout(
            self.config.lifecycle.init_deadline(),
            new_instance.init(context, &new_manifest, snapshot),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Hot swap of module {} aborted: new instance init failed: {}", name, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Hot swap of module {} aborted: new instance init timed out", name);
                return Err(ModuleError::Timeout(format!(
                    "module {} init exceeded {:?}",
                    name,
                    self.config.lifecycle.init_deadline()
                )));
            }
        }

        // Commit: swap the instance behind the stable handle.
        let old_instance = handle.replace(new_instance).await;
        let old_version = record.manifest.version.to_string();
        let new_version = new_manifest.version.to_string();

        // Reconcile dependent back-references for a changed dependency list.
        let old_deps: HashSet<String> = record
            .manifest
            .dependencies
            .iter()
            .map(|d| d.name.clone())
            .collect();
        let new_deps: HashSet<String> = new_manifest
            .dependencies
            .iter()
            .map(|d| d.name.clone())
            .collect();
        for removed in old_deps.difference(&new_deps) {
            self.registry.remove_dependent(removed, name).await;
        }
        for added in new_deps.difference(&old_deps) {
            self.registry.add_dependent(added, name).await;
        }

        record.manifest = Arc::clone(&new_manifest);
        record.granted = decision.granted;
        record.tier = decision.tier;
        record.instance_id = Some(instance_id);
        record.record_swap(with_state);

        // The tier may have changed; restart the monitor under the new
        // limits. Handle identity is unchanged.
        if let Some(monitor) = record.monitor.take() {
            monitor.shutdown();
        }
        let limits = self.tier_limits.for_tier(record.tier);
        record.monitor = Some(self.monitor.spawn(name.to_string(), handle.clone(), limits));

        self.events.publish(RuntimeEvent::HotSwapped {
            module: name.to_string(),
            old_version: old_version.clone(),
            new_version: new_version.clone(),
            with_state,
        });
        info!(
            "Module {} hot-swapped: {} -> {} ({})",
            name,
            old_version,
            new_version,
            if with_state { "with state" } else { "without state" }
        );

        // Asynchronous teardown of the old instance.
        let stop_deadline = self.config.lifecycle.stop_deadline();
        let teardown_name = name.to_string();
        tokio::spawn(async move {
            let mut old = old_instance;
            match timeout(stop_deadline, old.stop()).await {
                Ok(Ok(())) => debug!("Old instance of {} stopped", teardown_name),
                Ok(Err(e)) => warn!("Old instance of {} stop failed: {}", teardown_name, e),
                Err(_) => warn!("Old instance of {} did not stop within deadline", teardown_name),
            }
        });

        Ok(())
    }

    /// Remove a terminal (`Failed` or `Unloaded`) record from the registry
    pub async fn purge(&self, name: &str) -> Result<(), ModuleError> {
        let entry = self
            .registry
            .entry(name)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;

        let dependencies: Vec<String> = {
            let record = entry.record.lock().await;
            if !record.state.is_terminal() {
                return Err(ModuleError::OperationError(format!(
                    "module {} is {}; only terminal modules can be purged",
                    name, record.state
                )));
            }
            record
                .manifest
                .dependencies
                .iter()
                .map(|d| d.name.clone())
                .collect()
        };

        self.registry.remove(name).await;
        for dep in &dependencies {
            self.registry.remove_dependent(dep, name).await;
        }
        info!("Module {} purged", name);
        Ok(())
    }

    /// Shut down the whole runtime: unload every module in strict
    /// reverse-dependency order (dependents before dependencies).
    pub async fn shutdown(&self) -> Result<(), ModuleError> {
        info!("Shutting down module runtime");

        let manifests = self.registry.manifests().await;
        let known: HashMap<String, &ModuleManifest> = manifests
            .iter()
            .map(|(k, v)| (k.clone(), v.as_ref()))
            .collect();
        let roots = self.registry.list().await;

        let order = match ModuleDependencies::order(&roots, &known) {
            Ok(plan) => plan.unload_order(),
            Err(e) => {
                warn!(
                    "Dependency resolution failed during shutdown ({}); unloading in reverse listing order",
                    e
                );
                let mut fallback = roots.clone();
                fallback.reverse();
                fallback
            }
        };
        drop(known);

        for name in order {
            let terminal = match self.registry.snapshot(&name).await {
                Some(snapshot) => snapshot.state.is_terminal(),
                None => continue,
            };
            if terminal {
                continue;
            }
            if let Err(e) = self.unload(&name).await {
                warn!("Error unloading module {}: {}", name, e);
            }
        }

        if let Some(handler) = self
            .violation_task
            .lock()
            .expect("violation task lock poisoned")
            .take()
        {
            handler.abort();
        }

        info!("Module runtime shut down");
        Ok(())
    }

    // ---- internal steps -------------------------------------------------

    /// Assemble the candidate universe for one top-level load: registered
    /// manifests, installed packages, and disk candidates, in that
    /// precedence order.
    async fn assemble_candidates(&self) -> Result<HashMap<String, Candidate>, ModuleError> {
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        for (name, manifest) in self.registry.manifests().await {
            candidates.insert(
                name,
                Candidate {
                    manifest,
                    source: None,
                    config: HashMap::new(),
                },
            );
        }

        for (name, installed) in self.installed.lock().await.iter() {
            candidates.entry(name.clone()).or_insert_with(|| Candidate {
                manifest: Arc::clone(&installed.manifest),
                source: installed.source.clone(),
                config: installed.config.clone(),
            });
        }

        for discovered in self.scanner.scan()? {
            let name = discovered.manifest.name.clone();
            if candidates.contains_key(&name) {
                continue;
            }
            let config = DiscoveryScanner::load_module_config(discovered.config_path.as_ref())
                .unwrap_or_else(|e| {
                    warn!("Failed to load config for module {}: {}; using defaults", name, e);
                    HashMap::new()
                });
            candidates.insert(
                name,
                Candidate {
                    manifest: Arc::new(discovered.manifest),
                    source: None,
                    config,
                },
            );
        }

        Ok(candidates)
    }

    /// Load one module of a resolved plan and drive it to `Running`.
    ///
    /// Holding the record lock across every step is what makes
    /// overlapping loads for the same id collapse: the second caller
    /// blocks here and then observes the first's outcome from the record.
    async fn load_single(
        &self,
        name: &str,
        candidates: &HashMap<String, Candidate>,
        gate: &SecurityGate,
    ) -> Result<(), ModuleError> {
        let entry = match self.registry.entry(name).await {
            Some(entry) => entry,
            None => self.admit_candidate(name, candidates, gate).await?,
        };

        let mut record = entry.record.lock().await;
        match record.state {
            ModuleState::Running => return Ok(()),
            ModuleState::Failed => {
                let detail = record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(ModuleError::OperationError(format!(
                    "module {} previously failed: {}; purge and re-discover to retry",
                    name, detail
                )));
            }
            ModuleState::Stopped => {
                // Restart path: the instance survived the stop.
                self.check_dependencies_satisfied(&record.manifest).await?;
                return self.step_start(&mut record).await;
            }
            ModuleState::Validated => {}
            ModuleState::Loaded => {
                self.step_initialize(&mut record).await?;
                return self.step_start(&mut record).await;
            }
            ModuleState::Initialized => {
                return self.step_start(&mut record).await;
            }
            other => {
                return Err(ModuleError::AlreadyLoaded(format!("{} ({})", name, other)));
            }
        }

        // Readiness is rechecked under this record's lock, so a
        // concurrently failed or unloaded dependency is caught here
        // rather than trusted from the stale plan.
        self.check_dependencies_satisfied(&record.manifest).await?;

        self.step_load(&mut record).await?;
        self.step_initialize(&mut record).await?;
        self.step_start(&mut record).await
    }

    /// Gate a candidate and insert its record (Discovered -> Validated)
    async fn admit_candidate(
        &self,
        name: &str,
        candidates: &HashMap<String, Candidate>,
        gate: &SecurityGate,
    ) -> Result<Arc<crate::registry::store::RegistryEntry>, ModuleError> {
        let candidate = candidates
            .get(name)
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;

        let decision = match gate.assess(&candidate.manifest, candidate.source.as_deref(), None) {
            Ok(decision) => {
                self.events.publish(RuntimeEvent::SecurityDecision {
                    module: name.to_string(),
                    approved: true,
                    tier: Some(decision.tier),
                    reason: None,
                });
                decision
            }
            Err(e) => {
                self.events.publish(RuntimeEvent::SecurityDecision {
                    module: name.to_string(),
                    approved: false,
                    tier: None,
                    reason: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        let mut record = ModuleRecord::new(
            Arc::clone(&candidate.manifest),
            decision.granted,
            decision.tier,
        );
        record.config = candidate.config.clone();
        record.transition(ModuleState::Validated, TransitionOutcome::Completed)?;
        emit_transition(&self.events, &record);

        let manifest = Arc::clone(&candidate.manifest);
        let entry = match self.registry.insert(record).await {
            Ok(entry) => {
                // Transactional dependent bookkeeping: the moment this
                // module is present, its dependencies know about it.
                for dep in &manifest.dependencies {
                    if candidates.contains_key(&dep.name) {
                        self.registry.add_dependent(&dep.name, name).await;
                    }
                }
                entry
            }
            // A concurrent load admitted it first; fall back to theirs.
            Err(ModuleError::AlreadyLoaded(_)) => self
                .registry
                .entry(name)
                .await
                .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?,
            Err(e) => return Err(e),
        };
        Ok(entry)
    }

    /// Verify every required dependency is present and `Running`
    async fn check_dependencies_satisfied(
        &self,
        manifest: &ModuleManifest,
    ) -> Result<(), ModuleError> {
        for dep in &manifest.dependencies {
            let entry = match self.registry.entry(&dep.name).await {
                Some(entry) => entry,
                None if dep.optional => continue,
                None => {
                    return Err(ModuleError::DependencyMissing(format!(
                        "{} (required by {})",
                        dep.name, manifest.name
                    )));
                }
            };
            let state = entry.record.lock().await.state;
            if state != ModuleState::Running {
                if dep.optional {
                    warn!(
                        "Optional dependency {} of module {} is {}, continuing without it",
                        dep.name, manifest.name, state
                    );
                    continue;
                }
                return Err(ModuleError::DependencyMissing(format!(
                    "{} is {} (required by {})",
                    dep.name, state, manifest.name
                )));
            }
        }
        Ok(())
    }

    /// Validated -> Loading -> Loaded: construct the instance, retrying
    /// transient failures with exponential backoff up to the configured
    /// ceiling.
    async fn step_load(&self, record: &mut ModuleRecord) -> Result<(), ModuleError> {
        let name = record.manifest.name.clone();
        record.transition(ModuleState::Loading, TransitionOutcome::Completed)?;
        emit_transition(&self.events, record);

        let data_dir = self.module_data_dir(&name);
        let max_attempts = self.config.lifecycle.max_load_attempts.max(1);

        // A preloaded instance is taken exactly once; a retry can only
        // apply to transient construction failures, not to re-consuming it.
        let mut preloaded = if record.manifest.entry == EntryKind::Preloaded {
            self.pending_instances.lock().await.remove(&name)
        } else {
            None
        };

        let mut attempt = 0u32;
        let instance = loop {
            attempt += 1;
            let result = std::fs::create_dir_all(&data_dir)
                .map_err(|e| {
                    ModuleError::TransientLoad(format!(
                        "failed to create module data directory: {}",
                        e
                    ))
                })
                .and_then(|_| {
                    self.factories
                        .construct(&record.manifest.entry, preloaded.take())
                });

            match result {
                Ok(instance) => break instance,
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Transient load failure for module {} (attempt {}/{}): {}; retrying in {:?}",
                        name, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    fail_record(&self.events, record, e.to_string());
                    return Err(e);
                }
            }
        };

        record.instance = Some(ModuleHandle::new(instance));
        record.instance_id = Some(format!("{}_{}", name, uuid::Uuid::new_v4()));
        record.transition(ModuleState::Loaded, TransitionOutcome::Completed)?;
        emit_transition(&self.events, record);
        Ok(())
    }

    /// Loaded -> Initializing -> Initialized: run the init hook under the
    /// configured deadline. Exceeding it fails the module and releases the
    /// instance handle.
    async fn step_initialize(&self, record: &mut ModuleRecord) -> Result<(), ModuleError> {
        let name = record.manifest.name.clone();
        record.transition(ModuleState::Initializing, TransitionOutcome::Completed)?;
        emit_transition(&self.events, record);

        let handle = record.instance.clone().ok_or_else(|| {
            ModuleError::OperationError(format!("module {} has no instance to initialize", name))
        })?;
        let manifest = Arc::clone(&record.manifest);
        let context = ModuleContext::new(
            record.instance_id.clone().unwrap_or_default(),
            self.module_data_dir(&name).to_string_lossy().to_string(),
            record.config.clone(),
        );
        let deadline = self.config.lifecycle.init_deadline();

        let result = {
            let mut guard = handle.lock().await;
            timeout(deadline, guard.init(context, &manifest, None)).await
        };

        match result {
            Ok(Ok(())) => {
                record.transition(ModuleState::Initialized, TransitionOutcome::Completed)?;
                emit_transition(&self.events, record);
                Ok(())
            }
            Ok(Err(e)) => {
                fail_record(&self.events, record, e.to_string());
                Err(e)
            }
            Err(_) => {
                let e = ModuleError::Timeout(format!(
                    "module {} init exceeded {:?}",
                    name, deadline
                ));
                fail_record(&self.events, record, e.to_string());
                Err(e)
            }
        }
    }

    /// -> Starting -> Running: attach the monitor under the tier's limits
    async fn step_start(&self, record: &mut ModuleRecord) -> Result<(), ModuleError> {
        let name = record.manifest.name.clone();
        record.transition(ModuleState::Starting, TransitionOutcome::Completed)?;
        emit_transition(&self.events, record);

        let handle = record.instance.clone().ok_or_else(|| {
            ModuleError::OperationError(format!("module {} has no instance to start", name))
        })?;
        let limits = self.tier_limits.for_tier(record.tier);
        record.monitor = Some(self.monitor.spawn(name.clone(), handle, limits));

        record.transition(ModuleState::Running, TransitionOutcome::Completed)?;
        emit_transition(&self.events, record);
        info!("Module {} running", name);
        Ok(())
    }

    /// Stop under the graceful deadline; force past it.
    async fn stop_locked(&self, record: &mut ModuleRecord) -> Result<(), ModuleError> {
        let name = record.manifest.name.clone();
        record.transition(ModuleState::Stopping, TransitionOutcome::Completed)?;
        emit_transition(&self.events, record);

        if let Some(monitor) = record.monitor.take() {
            monitor.shutdown();
        }

        let deadline = self.config.lifecycle.stop_deadline();
        let result = match record.instance.clone() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                timeout(deadline, guard.stop()).await
            }
            None => Ok(Ok(())),
        };

        match result {
            Ok(Ok(())) => {
                record.transition(ModuleState::Stopped, TransitionOutcome::Completed)?;
                emit_transition(&self.events, record);
                info!("Module {} stopped gracefully", name);
            }
            Ok(Err(e)) => {
                warn!("Module {} stop hook failed ({}); forcing stop", name, e);
                record.transition(ModuleState::Stopped, TransitionOutcome::Forced)?;
                emit_transition(&self.events, record);
            }
            Err(_) => {
                warn!(
                    "Module {} did not acknowledge stop within {:?}; forcing stop",
                    name, deadline
                );
                record.transition(ModuleState::Stopped, TransitionOutcome::Forced)?;
                emit_transition(&self.events, record);
            }
        }
        Ok(())
    }

    /// Resolve a cancelled load to a defined terminal outcome
    async fn cancel_load(&self, name: &str) -> Result<(), ModuleError> {
        warn!("Load of module {} cancelled", name);
        if let Some(entry) = self.registry.entry(name).await {
            let mut record = entry.record.lock().await;
            if !record.state.is_terminal() && record.state != ModuleState::Running {
                fail_record(&self.events, &mut record, "load cancelled".to_string());
            }
        }
        Err(ModuleError::Cancelled(name.to_string()))
    }

    /// Dependents of `names` that are still in a non-terminal state
    async fn live_dependents(&self, dependents: &[String]) -> Vec<String> {
        let mut live = Vec::new();
        for name in dependents {
            if let Some(entry) = self.registry.entry(name).await {
                let state = entry.record.lock().await.state;
                if !state.is_terminal() {
                    live.push(name.clone());
                }
            }
        }
        live
    }

    /// Unload order for an explicit cascade: transitive live dependents
    /// first (deepest first), the module itself last.
    async fn cascade_order(&self, name: &str) -> Result<Vec<String>, ModuleError> {
        if self.registry.entry(name).await.is_none() {
            return Err(ModuleError::ModuleNotFound(name.to_string()));
        }

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(name.to_string(), false)];

        while let Some((module, expanded)) = stack.pop() {
            if expanded {
                order.push(module);
                continue;
            }
            if !visited.insert(module.clone()) {
                continue;
            }
            let dependents = match self.registry.snapshot(&module).await {
                Some(snapshot) => self.live_dependents(&snapshot.dependents).await,
                None => continue,
            };
            stack.push((module, true));
            for dependent in dependents {
                stack.push((dependent, false));
            }
        }

        Ok(order)
    }

    fn module_data_dir(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.config.discovery.data_dir).join(name)
    }

    /// Exponential backoff with jitter, capped by configuration
    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.lifecycle.backoff_base_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.config.lifecycle.backoff_cap_ms.max(base));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        std::time::Duration::from_millis(capped + jitter)
    }
}

/// Drive a record to `Failed`: detach the monitor, release the instance,
/// record the final error.
fn fail_record(events: &EventBus, record: &mut ModuleRecord, reason: String) {
    if let Some(monitor) = record.monitor.take() {
        monitor.shutdown();
    }
    record.instance = None;
    record.instance_id = None;
    record.last_error = Some(reason.clone());
    if record
        .transition(ModuleState::Failed, TransitionOutcome::Failed(reason))
        .is_ok()
    {
        emit_transition(events, record);
    }
}

/// Publish the record's most recent transition on the event bus
fn emit_transition(events: &EventBus, record: &ModuleRecord) {
    if let Some(last) = record.history.last() {
        events.publish(RuntimeEvent::StateChanged {
            module: record.manifest.name.clone(),
            from: last.from,
            to: last.to,
            outcome: last.outcome.clone(),
        });
    }
}
