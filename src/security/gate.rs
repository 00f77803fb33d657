//! Security gate for module admission
//!
//! Evaluates a validated manifest (and optionally its source code and
//! artifact bytes) against policy: ban list, origin trust, a static
//! dangerous-pattern scan, an artifact digest check, and permission
//! granting with trust-tier derivation.
//!
//! The static scan is a deny-list heuristic and the digest check is an
//! integrity check, not code signing. Neither is a sandbox; containment of
//! a running module comes from the permission grant and the runtime
//! monitor, and a determined adversary is out of scope for this layer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::registry::manifest::ModuleManifest;
use crate::security::permissions::PermissionSet;
use crate::traits::ModuleError;

/// Dangerous source constructs rejected by the static scan.
///
/// Fixed, ordered deny-list: evaluation order is part of the gate's
/// deterministic contract.
pub const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("eval(", "dynamic code evaluation"),
    ("new Function", "dynamic code evaluation"),
    ("process::exit", "raw process termination"),
    ("process.exit(", "raw process termination"),
    ("libc::_exit", "raw process termination"),
    ("current_exe", "access to the host execution directory"),
    ("/proc/self/exe", "access to the host execution directory"),
];

/// Trust tier, ascending strictness.
///
/// Derived by the gate, never directly settable. Determines the resource
/// limits the runtime monitor applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    /// Identifier pre-listed as trusted; loosest limits
    Trusted,
    /// Default tier for modules without dangerous permissions
    Moderate,
    /// Modules holding any dangerous permission; tightest limits
    Strict,
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustTier::Trusted => f.write_str("trusted"),
            TrustTier::Moderate => f.write_str("moderate"),
            TrustTier::Strict => f.write_str("strict"),
        }
    }
}

/// Security policy: trust and ban lists plus enforcement switches.
///
/// Read-mostly. The lifecycle manager snapshots it per top-level load so a
/// ban takes effect on the next load without a stale-cache bypass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Module names rejected unconditionally
    #[serde(default)]
    pub banned_modules: HashSet<String>,
    /// Origins a manifest may declare; a declared origin outside this set
    /// is a rejection
    #[serde(default)]
    pub trusted_origins: HashSet<String>,
    /// Module names granted the `Trusted` tier
    #[serde(default)]
    pub trusted_modules: HashSet<String>,
    /// Require a declared artifact digest for every module
    #[serde(default)]
    pub require_digest: bool,
}

/// Gate decision for an approved module
#[derive(Debug, Clone)]
pub struct Decision {
    /// Permissions granted (the declared set; grants never escalate later)
    pub granted: PermissionSet,
    /// Derived trust tier
    pub tier: TrustTier,
}

/// Security gate, bound to one policy snapshot.
///
/// Pure over its inputs: the same manifest, source, and policy always
/// yield the same decision.
pub struct SecurityGate {
    policy: SecurityPolicy,
}

impl SecurityGate {
    /// Create a gate over a policy snapshot
    pub fn new(policy: SecurityPolicy) -> Self {
        Self { policy }
    }

    /// Assess a validated manifest, optionally with source code and the
    /// artifact bytes backing its declared digest.
    pub fn assess(
        &self,
        manifest: &ModuleManifest,
        source: Option<&str>,
        artifact: Option<&[u8]>,
    ) -> Result<Decision, ModuleError> {
        // (a) Ban list trumps everything.
        if self.policy.banned_modules.contains(&manifest.name) {
            warn!("Module {} rejected: on the ban list", manifest.name);
            return Err(ModuleError::SecurityRejection(format!(
                "module {} is on the ban list",
                manifest.name
            )));
        }

        // (b) Origin check. Local modules declare no origin; a declared
        // origin must be trusted.
        if let Some(origin) = &manifest.origin {
            if !self.policy.trusted_origins.contains(origin) {
                warn!(
                    "Module {} rejected: origin {} is not trusted",
                    manifest.name, origin
                );
                return Err(ModuleError::SecurityRejection(format!(
                    "origin {} is not in the trusted-origin set",
                    origin
                )));
            }
        }

        // (c) Static pattern scan, when source is available.
        if let Some(source) = source {
            for (pattern, description) in DANGEROUS_PATTERNS {
                if source.contains(pattern) {
                    warn!(
                        "Module {} rejected: source matches dangerous pattern {:?} ({})",
                        manifest.name, pattern, description
                    );
                    return Err(ModuleError::SecurityRejection(format!(
                        "source contains {} ({:?})",
                        description, pattern
                    )));
                }
            }
        }

        // (d) Artifact digest check.
        match (&manifest.sha256, artifact) {
            (Some(declared), Some(bytes)) => {
                let actual = hex::encode(Sha256::digest(bytes));
                if !actual.eq_ignore_ascii_case(declared) {
                    warn!("Module {} rejected: artifact digest mismatch", manifest.name);
                    return Err(ModuleError::SecurityRejection(format!(
                        "artifact digest mismatch for module {}",
                        manifest.name
                    )));
                }
            }
            (None, _) if self.policy.require_digest => {
                return Err(ModuleError::SecurityRejection(format!(
                    "module {} declares no artifact digest and policy requires one",
                    manifest.name
                )));
            }
            _ => {}
        }

        // (e) Grant and tier. The granted set is exactly the declared set;
        // the tier follows from trust listing and the dangerous subset.
        let granted = PermissionSet::from_vec(manifest.permissions.clone());
        let tier = if self.policy.trusted_modules.contains(&manifest.name) {
            TrustTier::Trusted
        } else if granted.any_dangerous() {
            TrustTier::Strict
        } else {
            TrustTier::Moderate
        };

        debug!(
            "Module {} approved at tier {} with {} permission(s)",
            manifest.name,
            tier,
            granted.len()
        );

        Ok(Decision { granted, tier })
    }
}
