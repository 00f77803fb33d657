//! Module runtime monitoring
//!
//! One sampler task per running module, checking the tier's memory and
//! wall-clock ceilings on a configurable cadence. Memory is read from the
//! module's own health report; the host cannot meter a trait object's
//! allocations from outside, so a module that reports nothing is checked
//! for running time and probe responsiveness only.
//!
//! On a breach the monitor emits a `SecurityViolation` and stops sampling.
//! It never touches the registry: the lifecycle manager is the sole
//! mutator, and decides the resulting transition.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::monitor::limits::ResourceLimits;
use crate::registry::store::{ModuleHandle, SecurityViolation, ViolationKind};

/// Handle to a spawned monitor task.
///
/// Aborting is idempotent and guaranteed: either an explicit `shutdown`
/// when the module leaves `Running`, or `Drop`, stops the sampler. A
/// running timer never outlives its record.
pub struct MonitorHandle {
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Stop sampling
    pub fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle").finish_non_exhaustive()
    }
}

/// Per-module resource sampler
pub struct RuntimeMonitor {
    /// Sampling cadence
    interval: Duration,
    /// Deadline for a single health probe
    probe_timeout: Duration,
    /// Consecutive unanswered probes tolerated before an unresponsiveness
    /// violation
    max_missed_probes: u32,
    /// Violation channel into the lifecycle manager
    violation_tx: mpsc::UnboundedSender<SecurityViolation>,
}

impl RuntimeMonitor {
    pub fn new(violation_tx: mpsc::UnboundedSender<SecurityViolation>) -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            max_missed_probes: 3,
            violation_tx,
        }
    }

    /// Set sampling cadence
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-probe deadline
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Set the missed-probe allowance
    pub fn with_max_missed_probes(mut self, max_missed_probes: u32) -> Self {
        self.max_missed_probes = max_missed_probes;
        self
    }

    /// Start sampling a running module under the given limits
    pub fn spawn(
        &self,
        module_name: String,
        handle: ModuleHandle,
        limits: ResourceLimits,
    ) -> MonitorHandle {
        info!("Starting runtime monitoring for module: {}", module_name);

        let interval = self.interval;
        let probe_timeout = self.probe_timeout;
        let max_missed = self.max_missed_probes;
        let violation_tx = self.violation_tx.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            // First sample lands one full period after start.
            let mut ticker = tokio::time::interval_at(started + interval, interval);
            let mut missed: u32 = 0;

            loop {
                ticker.tick().await;

                if limits.runtime_exceeded(started.elapsed()) {
                    let detail = format!(
                        "wall-clock running time exceeded ceiling of {:?}",
                        limits.max_runtime.unwrap_or_default()
                    );
                    warn!("Module {} violation: {}", module_name, detail);
                    let _ = violation_tx.send(SecurityViolation::new(
                        module_name.clone(),
                        ViolationKind::TimeCeiling,
                        detail,
                    ));
                    return;
                }

                // Probe the instance. The lock is held only for the probe;
                // a probe stuck past its deadline counts as missed.
                let probe = {
                    let guard = handle.lock().await;
                    timeout(probe_timeout, guard.health_check()).await
                };

                match probe {
                    Err(_) => {
                        missed += 1;
                        warn!(
                            "Module {} health probe timeout ({}/{})",
                            module_name, missed, max_missed
                        );
                        if missed >= max_missed {
                            let detail = format!(
                                "{} consecutive health probes unanswered",
                                missed
                            );
                            let _ = violation_tx.send(SecurityViolation::new(
                                module_name.clone(),
                                ViolationKind::Unresponsive,
                                detail,
                            ));
                            return;
                        }
                    }
                    Ok(status) => {
                        missed = 0;
                        if !status.healthy {
                            warn!(
                                "Module {} reports unhealthy: {}",
                                module_name,
                                status.detail.as_deref().unwrap_or("no detail")
                            );
                        }
                        if let Some(usage) = status.usage {
                            if limits.memory_exceeded(&usage) {
                                let detail = format!(
                                    "memory usage {} bytes exceeded ceiling of {} bytes",
                                    usage.memory_bytes,
                                    limits.max_memory_bytes.unwrap_or_default()
                                );
                                warn!("Module {} violation: {}", module_name, detail);
                                let _ = violation_tx.send(SecurityViolation::new(
                                    module_name.clone(),
                                    ViolationKind::MemoryCeiling,
                                    detail,
                                ));
                                return;
                            }
                            debug!(
                                "Module {} usage: {} bytes, {} ms busy",
                                module_name, usage.memory_bytes, usage.busy_ms
                            );
                        }
                    }
                }
            }
        });

        MonitorHandle::new(task)
    }
}
