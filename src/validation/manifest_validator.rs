//! Manifest validation framework
//!
//! Validates raw manifests for structure, grammar, and permission
//! membership, producing the immutable `ModuleManifest` the rest of the
//! runtime trusts. Pure: no I/O, no clock, no hidden state — the same
//! input always yields the same result.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::loader::EntryKind;
use crate::registry::manifest::{ModuleDependency, ModuleManifest, RawManifest};
use crate::security::permissions::{parse_permission_string, Permission};
use crate::traits::ModuleError;
use crate::validation::version::{Version, VersionReq};

/// Manifest validator
///
/// Checks run in a fixed order and short-circuit on the first failure:
/// required fields, name grammar, version grammar, dependency grammar,
/// permission membership, entry resolution.
pub struct ManifestValidator {
    /// Maximum accepted module/dependency name length
    max_name_len: usize,
}

impl ManifestValidator {
    /// Create a new manifest validator
    pub fn new() -> Self {
        Self { max_name_len: 64 }
    }

    /// Validate a raw manifest into an immutable `ModuleManifest`
    pub fn validate(&self, raw: &RawManifest) -> Result<ModuleManifest, ModuleError> {
        // Required fields. TOML deserialization already rejects absent
        // fields; present-but-empty ones are rejected here.
        if raw.name.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "missing required field: name".to_string(),
            ));
        }
        if raw.version.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "missing required field: version".to_string(),
            ));
        }
        if raw.entry.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "missing required field: entry".to_string(),
            ));
        }

        if !self.is_valid_name(&raw.name) {
            return Err(ModuleError::InvalidManifest(format!(
                "invalid module name: {} (must be alphanumeric with dashes/underscores)",
                raw.name
            )));
        }

        let version: Version = raw.version.parse()?;

        let mut dependencies = Vec::with_capacity(raw.dependencies.len());
        let mut seen_deps = HashSet::new();
        for dep in &raw.dependencies {
            if !self.is_valid_name(&dep.name) {
                return Err(ModuleError::InvalidManifest(format!(
                    "invalid dependency name: {}",
                    dep.name
                )));
            }
            if dep.name == raw.name {
                return Err(ModuleError::InvalidManifest(format!(
                    "module {} declares itself as a dependency",
                    raw.name
                )));
            }
            if !seen_deps.insert(dep.name.clone()) {
                return Err(ModuleError::InvalidManifest(format!(
                    "duplicate dependency: {}",
                    dep.name
                )));
            }
            let req: VersionReq = dep.version.parse().map_err(|_| {
                ModuleError::InvalidVersion(format!(
                    "{} (for dependency: {})",
                    dep.version, dep.name
                ))
            })?;
            dependencies.push(ModuleDependency {
                name: dep.name.clone(),
                req,
                optional: dep.optional,
            });
        }

        // Unknown permissions are a hard error, never silently dropped:
        // dropping one would let a policy reader understate what the
        // module can do.
        let mut permissions: Vec<Permission> = Vec::with_capacity(raw.permissions.len());
        let mut seen_perms = HashSet::new();
        for perm_str in &raw.permissions {
            let Some(permission) = parse_permission_string(perm_str) else {
                warn!(
                    "Manifest for {} requests unknown permission: {}",
                    raw.name, perm_str
                );
                return Err(ModuleError::UnknownPermission(perm_str.clone()));
            };
            if seen_perms.insert(permission) {
                permissions.push(permission);
            }
        }

        let entry = EntryKind::parse(&raw.entry)?;

        if let Some(digest) = &raw.sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ModuleError::InvalidManifest(format!(
                    "invalid sha256 digest for module {}: expected 64 hex characters",
                    raw.name
                )));
            }
        }

        debug!("Manifest validation passed for module: {}", raw.name);

        Ok(ModuleManifest {
            name: raw.name.clone(),
            version,
            description: raw.description.clone(),
            author: raw.author.clone(),
            entry,
            permissions,
            dependencies,
            origin: raw.origin.clone(),
            sha256: raw.sha256.clone(),
        })
    }

    /// Validate module name format
    #[inline]
    fn is_valid_name(&self, name: &str) -> bool {
        if name.is_empty() || name.len() > self.max_name_len {
            return false;
        }

        // Must start with alphanumeric
        if !name.chars().next().map_or(false, |c| c.is_alphanumeric()) {
            return false;
        }

        name.chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::new()
    }
}
