//! Runtime monitoring for modules
//!
//! Per-running-module resource sampling against trust-tier limits, with
//! violations reported back to the lifecycle manager.

pub mod limits;
pub mod monitor;

pub use limits::{ResourceLimits, TierLimits};
pub use monitor::{MonitorHandle, RuntimeMonitor};
