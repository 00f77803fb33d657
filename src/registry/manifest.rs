//! Module manifest parsing
//!
//! Handles parsing `module.toml` manifests into their raw form and defines
//! the validated, immutable manifest consumed by the rest of the runtime.
//! Validation itself lives in `crate::validation`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::loader::EntryKind;
use crate::security::permissions::Permission;
use crate::traits::ModuleError;
use crate::validation::version::{Version, VersionReq};

/// Raw module manifest (module.toml structure), exactly as declared.
///
/// Field absence fails deserialization for required fields; everything else
/// defaults. Declaration order of dependencies and permissions is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawManifest {
    /// Module name
    pub name: String,
    /// Module version (strict semantic versioning)
    pub version: String,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Module author
    #[serde(default)]
    pub author: Option<String>,
    /// Entry reference (`factory:<name>` or `preloaded`)
    pub entry: String,
    /// Permissions this module requests
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Declared dependencies, in declaration order
    #[serde(default)]
    pub dependencies: Vec<RawDependency>,
    /// Source origin (registry URL, marketplace id); checked against the
    /// trusted-origin set when present
    #[serde(default)]
    pub origin: Option<String>,
    /// Hex SHA-256 digest of the module artifact, when published with one
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Raw dependency declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDependency {
    /// Dependency module name
    pub name: String,
    /// Version constraint
    #[serde(default = "default_any_version")]
    pub version: String,
    /// Optional dependencies are skipped with a warning when unresolvable
    #[serde(default)]
    pub optional: bool,
}

fn default_any_version() -> String {
    ">=0.0.0".to_string()
}

impl RawManifest {
    /// Parse a raw manifest from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ModuleError> {
        toml::from_str(contents).map_err(|e| {
            ModuleError::InvalidManifest(format!("failed to parse manifest TOML: {}", e))
        })
    }

    /// Load a raw manifest from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::InvalidManifest(format!("failed to read manifest file: {}", e))
        })?;
        Self::from_toml_str(&contents)
    }
}

/// Validated module manifest — immutable, parsed once per module version.
///
/// Produced only by `ManifestValidator::validate`; holding one implies the
/// name/version/entry/permission grammars all checked out.
#[derive(Debug, Clone)]
pub struct ModuleManifest {
    /// Module name (unique identifier within a registry)
    pub name: String,
    /// Module version
    pub version: Version,
    /// Human-readable description
    pub description: Option<String>,
    /// Module author
    pub author: Option<String>,
    /// Resolved instantiation strategy
    pub entry: EntryKind,
    /// Requested permissions, deduplicated, in declaration order
    pub permissions: Vec<Permission>,
    /// Declared dependencies, in declaration order
    pub dependencies: Vec<ModuleDependency>,
    /// Declared source origin, if any
    pub origin: Option<String>,
    /// Declared artifact digest, if any
    pub sha256: Option<String>,
}

/// Validated dependency declaration
#[derive(Debug, Clone)]
pub struct ModuleDependency {
    pub name: String,
    pub req: VersionReq,
    pub optional: bool,
}

impl ModuleManifest {
    /// Canonical `name@version` identifier
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl std::fmt::Display for ModuleManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_with_ordered_dependencies() {
        let manifest = RawManifest::from_toml_str(
            r#"
            name = "indexer"
            version = "1.2.0"
            entry = "factory:indexer"
            permissions = ["network"]

            [[dependencies]]
            name = "store"
            version = "^1.0.0"

            [[dependencies]]
            name = "metrics"
            optional = true
            "#,
        )
        .unwrap();

        assert_eq!(manifest.name, "indexer");
        let names: Vec<&str> = manifest.dependencies.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["store", "metrics"]);
        assert!(manifest.dependencies[1].optional);
        assert_eq!(manifest.dependencies[1].version, ">=0.0.0");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = RawManifest::from_toml_str(
            r#"
            name = "indexer"
            version = "1.0.0"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidManifest(_)));
    }
}
