//! Configuration management for the module runtime
//!
//! Handles configuration loading and validation: discovery roots,
//! lifecycle deadlines and retry policy, monitor cadence, per-tier
//! resource limits, and the security policy lists.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::monitor::limits::{ResourceLimits, TierLimits};
use crate::security::gate::SecurityPolicy;
use crate::traits::ModuleError;

/// Module discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Directories scanned for module manifests
    #[serde(default = "default_module_roots")]
    pub roots: Vec<String>,

    /// Directory for per-module data (state, working files)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_module_roots() -> Vec<String> {
    vec!["modules".to_string()]
}

fn default_data_dir() -> String {
    "data/modules".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            roots: default_module_roots(),
            data_dir: default_data_dir(),
        }
    }
}

/// Lifecycle deadlines and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Maximum instance-construction attempts for transient failures
    #[serde(default = "default_max_load_attempts")]
    pub max_load_attempts: u32,

    /// Base backoff delay between attempts (milliseconds); doubles per
    /// attempt with jitter
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Ceiling on a single backoff delay (milliseconds)
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Deadline for a module's init hook (milliseconds)
    #[serde(default = "default_init_deadline_ms")]
    pub init_deadline_ms: u64,

    /// Graceful-shutdown deadline for a module's stop hook (milliseconds)
    #[serde(default = "default_stop_deadline_ms")]
    pub stop_deadline_ms: u64,

    /// Deadline for a hot-swap state snapshot request (milliseconds)
    #[serde(default = "default_snapshot_deadline_ms")]
    pub snapshot_deadline_ms: u64,
}

fn default_max_load_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_cap_ms() -> u64 {
    5_000
}

fn default_init_deadline_ms() -> u64 {
    10_000
}

fn default_stop_deadline_ms() -> u64 {
    5_000
}

fn default_snapshot_deadline_ms() -> u64 {
    2_000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_load_attempts: default_max_load_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            init_deadline_ms: default_init_deadline_ms(),
            stop_deadline_ms: default_stop_deadline_ms(),
            snapshot_deadline_ms: default_snapshot_deadline_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn init_deadline(&self) -> Duration {
        Duration::from_millis(self.init_deadline_ms)
    }

    pub fn stop_deadline(&self) -> Duration {
        Duration::from_millis(self.stop_deadline_ms)
    }

    pub fn snapshot_deadline(&self) -> Duration {
        Duration::from_millis(self.snapshot_deadline_ms)
    }
}

/// Runtime monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sampling cadence (milliseconds)
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Deadline for one health probe (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive unanswered probes tolerated before a violation
    #[serde(default = "default_max_missed_probes")]
    pub max_missed_probes: u32,
}

fn default_sample_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_max_missed_probes() -> u32 {
    3
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_missed_probes: default_max_missed_probes(),
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Resource ceilings for one trust tier (serializable form)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierLimitConfig {
    /// Maximum memory usage (bytes); absent disables the check
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
    /// Maximum wall-clock running time (seconds); absent disables the check
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
}

impl TierLimitConfig {
    fn to_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_memory_bytes: self.max_memory_bytes,
            max_runtime: self.max_runtime_secs.map(Duration::from_secs),
        }
    }
}

/// Per-tier resource limit table (serializable form)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimitsConfig {
    #[serde(default)]
    pub trusted: TierLimitConfig,
    #[serde(default = "default_moderate_limits")]
    pub moderate: TierLimitConfig,
    #[serde(default = "default_strict_limits")]
    pub strict: TierLimitConfig,
}

fn default_moderate_limits() -> TierLimitConfig {
    TierLimitConfig {
        max_memory_bytes: Some(512 * 1024 * 1024),
        max_runtime_secs: None,
    }
}

fn default_strict_limits() -> TierLimitConfig {
    TierLimitConfig {
        max_memory_bytes: Some(128 * 1024 * 1024),
        max_runtime_secs: Some(3600),
    }
}

impl Default for TierLimitsConfig {
    fn default() -> Self {
        Self {
            trusted: TierLimitConfig::default(),
            moderate: default_moderate_limits(),
            strict: default_strict_limits(),
        }
    }
}

impl TierLimitsConfig {
    pub fn to_tier_limits(&self) -> TierLimits {
        TierLimits {
            trusted: self.trusted.to_limits(),
            moderate: self.moderate.to_limits(),
            strict: self.strict.to_limits(),
        }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Module discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Lifecycle deadlines and retry policy
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Runtime monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Per-tier resource limits
    #[serde(default)]
    pub limits: TierLimitsConfig,

    /// Security policy lists
    #[serde(default)]
    pub security: SecurityPolicy,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::OperationError(format!("failed to read config file: {}", e))
        })?;
        toml::from_str(&contents)
            .map_err(|e| ModuleError::OperationError(format!("failed to parse config TOML: {}", e)))
    }
}
