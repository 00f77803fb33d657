//! Resource limits applied per trust tier

use std::time::Duration;

use crate::security::gate::TrustTier;
use crate::traits::ResourceUsage;

/// Bounded resource ceilings for a running module
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    /// Maximum memory usage (bytes); `None` disables the check
    pub max_memory_bytes: Option<u64>,
    /// Maximum cumulative wall-clock time in `Running`; `None` disables
    /// the check
    pub max_runtime: Option<Duration>,
}

impl ResourceLimits {
    /// No ceilings at all
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Whether reported memory usage breaches the ceiling
    pub fn memory_exceeded(&self, usage: &ResourceUsage) -> bool {
        match self.max_memory_bytes {
            Some(max) => usage.memory_bytes > max,
            None => false,
        }
    }

    /// Whether elapsed running time breaches the ceiling
    pub fn runtime_exceeded(&self, elapsed: Duration) -> bool {
        match self.max_runtime {
            Some(max) => elapsed > max,
            None => false,
        }
    }
}

/// Limits table keyed by trust tier.
///
/// Strictness rises with the tier: `Strict` gets the tightest ceilings.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub trusted: ResourceLimits,
    pub moderate: ResourceLimits,
    pub strict: ResourceLimits,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            trusted: ResourceLimits::unrestricted(),
            moderate: ResourceLimits {
                max_memory_bytes: Some(512 * 1024 * 1024),
                max_runtime: None,
            },
            strict: ResourceLimits {
                max_memory_bytes: Some(128 * 1024 * 1024),
                max_runtime: Some(Duration::from_secs(3600)),
            },
        }
    }
}

impl TierLimits {
    /// Limits applied to a module at the given tier
    pub fn for_tier(&self, tier: TrustTier) -> ResourceLimits {
        match tier {
            TrustTier::Trusted => self.trusted,
            TrustTier::Moderate => self.moderate,
            TrustTier::Strict => self.strict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_tier_is_tightest() {
        let limits = TierLimits::default();
        let strict = limits.for_tier(TrustTier::Strict);
        let moderate = limits.for_tier(TrustTier::Moderate);
        assert!(strict.max_memory_bytes.unwrap() < moderate.max_memory_bytes.unwrap());
        assert!(strict.max_runtime.is_some());
        assert!(limits.for_tier(TrustTier::Trusted).max_memory_bytes.is_none());
    }

    #[test]
    fn ceiling_checks() {
        let limits = ResourceLimits {
            max_memory_bytes: Some(1024),
            max_runtime: Some(Duration::from_secs(10)),
        };
        let usage = ResourceUsage {
            memory_bytes: 2048,
            busy_ms: 0,
        };
        assert!(limits.memory_exceeded(&usage));
        assert!(!limits.runtime_exceeded(Duration::from_secs(5)));
        assert!(limits.runtime_exceeded(Duration::from_secs(11)));
    }
}
