//! Test utilities for module runtime testing
//!
//! Provides a temp-directory runtime fixture, a manifest writer, and a
//! scriptable mock module for exercising lifecycle behavior without real
//! module code.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use modhost::{
    HealthStatus, Module, ModuleContext, ModuleError, ModuleManager, ModuleManifest,
    ResourceUsage, RuntimeConfig, StateSnapshot,
};

/// Scripted behavior for a mock module instance
#[derive(Clone, Default)]
pub struct MockBehavior {
    /// Fail the init hook
    pub fail_init: bool,
    /// Sleep this long inside init (for deadline tests)
    pub init_delay: Option<Duration>,
    /// Sleep this long inside stop (for forced-stop tests)
    pub stop_delay: Option<Duration>,
    /// State payload returned by snapshot_state; None declines snapshots
    pub snapshot: Option<serde_json::Value>,
    /// Memory figure reported by health_check, if any
    pub reported_memory: Option<u64>,
}

/// Shared counters observing what mock instances actually did
#[derive(Clone, Default)]
pub struct MockProbe {
    pub constructions: Arc<AtomicUsize>,
    pub inits: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    /// The preserved snapshot the most recent init received
    pub preserved: Arc<Mutex<Option<StateSnapshot>>>,
}

impl MockProbe {
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_preserved(&self) -> Option<StateSnapshot> {
        self.preserved.lock().unwrap().clone()
    }
}

/// Mock module driven by a `MockBehavior` script
pub struct MockModule {
    behavior: MockBehavior,
    probe: MockProbe,
}

impl MockModule {
    pub fn new(behavior: MockBehavior, probe: MockProbe) -> Self {
        probe.constructions.fetch_add(1, Ordering::SeqCst);
        Self { behavior, probe }
    }
}

#[async_trait]
impl Module for MockModule {
    async fn init(
        &mut self,
        _context: ModuleContext,
        _manifest: &ModuleManifest,
        preserved: Option<StateSnapshot>,
    ) -> Result<(), ModuleError> {
        if let Some(delay) = self.behavior.init_delay {
            tokio::time::sleep(delay).await;
        }
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        *self.probe.preserved.lock().unwrap() = preserved;
        if self.behavior.fail_init {
            return Err(ModuleError::OperationError("mock init failure".to_string()));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ModuleError> {
        if let Some(delay) = self.behavior.stop_delay {
            tokio::time::sleep(delay).await;
        }
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot_state(&self) -> Option<StateSnapshot> {
        self.behavior
            .snapshot
            .clone()
            .map(|data| StateSnapshot { data })
    }

    async fn health_check(&self) -> HealthStatus {
        match self.behavior.reported_memory {
            Some(memory_bytes) => HealthStatus::healthy().with_usage(ResourceUsage {
                memory_bytes,
                busy_ms: 1,
            }),
            None => HealthStatus::healthy(),
        }
    }
}

/// Test fixture: a module manager over isolated temp directories
pub struct RuntimeFixture {
    pub temp_dir: TempDir,
    pub manager: Arc<ModuleManager>,
}

impl RuntimeFixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build a fixture with test-friendly deadlines, then apply `tweak`
    pub fn with_config(tweak: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        let mut config = RuntimeConfig::default();
        config.discovery.roots = vec![temp_dir
            .path()
            .join("modules")
            .to_string_lossy()
            .to_string()];
        config.discovery.data_dir = temp_dir.path().join("data").to_string_lossy().to_string();
        config.lifecycle.init_deadline_ms = 1_000;
        config.lifecycle.stop_deadline_ms = 300;
        config.lifecycle.snapshot_deadline_ms = 300;
        config.lifecycle.backoff_base_ms = 10;
        config.lifecycle.backoff_cap_ms = 50;
        tweak(&mut config);

        let manager = ModuleManager::new(config);
        Self { temp_dir, manager }
    }

    /// Path of the modules root
    pub fn modules_dir(&self) -> PathBuf {
        self.temp_dir.path().join("modules")
    }

    /// Write a module.toml; `extra` is appended verbatim (permissions,
    /// dependency tables, origin).
    pub fn write_manifest(&self, name: &str, version: &str, extra: &str) -> PathBuf {
        let module_dir = self.modules_dir().join(name);
        std::fs::create_dir_all(&module_dir).expect("failed to create module dir");

        let manifest = format!(
            "name = \"{}\"\nversion = \"{}\"\nentry = \"factory:{}\"\n{}",
            name, version, name, extra
        );
        let manifest_path = module_dir.join("module.toml");
        std::fs::write(&manifest_path, manifest).expect("failed to write manifest");
        manifest_path
    }

    /// Register a mock factory for `name` and return its probe
    pub fn register_mock(&self, name: &str, behavior: MockBehavior) -> MockProbe {
        let probe = MockProbe::default();
        let factory_probe = probe.clone();
        self.manager.register_factory(name, move || {
            Box::new(MockModule::new(behavior.clone(), factory_probe.clone()))
        });
        probe
    }

    /// Shorthand: manifest plus default mock factory
    pub fn add_module(&self, name: &str, version: &str, extra: &str) -> MockProbe {
        self.write_manifest(name, version, extra);
        self.register_mock(name, MockBehavior::default())
    }
}

/// Dependency table snippet for a manifest
pub fn dep_entry(name: &str, version: &str, optional: bool) -> String {
    format!(
        "\n[[dependencies]]\nname = \"{}\"\nversion = \"{}\"\noptional = {}\n",
        name, version, optional
    )
}
