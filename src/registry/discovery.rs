//! Module discovery
//!
//! Scans configured root directories for module manifests and yields
//! validated candidates. The rest of the runtime treats the scanner purely
//! as an iterator of candidates and stays agnostic to the storage medium.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::registry::manifest::{ModuleManifest, RawManifest};
use crate::traits::ModuleError;
use crate::validation::ManifestValidator;

/// Discovered module candidate
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    /// Module directory path
    pub directory: PathBuf,
    /// Validated module manifest
    pub manifest: ModuleManifest,
    /// Optional per-module configuration file
    pub config_path: Option<PathBuf>,
}

/// Module discovery scanner
pub struct DiscoveryScanner {
    /// Root directories to scan for modules
    roots: Vec<PathBuf>,
}

impl DiscoveryScanner {
    /// Create a scanner over the given root directories
    pub fn new<P: AsRef<Path>>(roots: impl IntoIterator<Item = P>) -> Self {
        Self {
            roots: roots.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }

    /// Discover all module candidates under the configured roots.
    ///
    /// A subdirectory qualifies when it holds a `module.toml` that parses
    /// and validates; anything else is skipped with a warning. Invalid
    /// manifests never become candidates.
    pub fn scan(&self) -> Result<Vec<DiscoveredModule>, ModuleError> {
        let validator = ManifestValidator::new();
        let mut modules = Vec::new();

        for root in &self.roots {
            if !root.exists() {
                debug!("Module root does not exist, skipping: {:?}", root);
                continue;
            }

            let entries = fs::read_dir(root).map_err(|e| {
                ModuleError::OperationError(format!(
                    "failed to read module root {:?}: {}",
                    root, e
                ))
            })?;

            for entry in entries {
                let entry = entry.map_err(|e| {
                    ModuleError::OperationError(format!("failed to read directory entry: {}", e))
                })?;

                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }

                let manifest_path = path.join("module.toml");
                if !manifest_path.exists() {
                    debug!("No module.toml found in {:?}, skipping", path);
                    continue;
                }

                let raw = match RawManifest::from_file(&manifest_path) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Failed to parse manifest in {:?}: {}", path, e);
                        continue;
                    }
                };

                let manifest = match validator.validate(&raw) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        warn!("Manifest validation failed in {:?}: {}", path, e);
                        continue;
                    }
                };

                let config_path = path.join("config.toml");
                let config_path = config_path.exists().then_some(config_path);

                debug!("Discovered module candidate: {}", manifest.id());
                modules.push(DiscoveredModule {
                    directory: path,
                    manifest,
                    config_path,
                });
            }
        }

        info!("Discovered {} module candidate(s)", modules.len());
        Ok(modules)
    }

    /// Discover a specific module by name.
    ///
    /// Looks for a `<root>/<name>/module.toml` under each root in order;
    /// unlike `scan`, a broken manifest here is a hard error, since the
    /// caller asked for this module by name.
    pub fn discover_named(&self, module_name: &str) -> Result<DiscoveredModule, ModuleError> {
        for root in &self.roots {
            let module_dir = root.join(module_name);
            let manifest_path = module_dir.join("module.toml");
            if !manifest_path.exists() {
                continue;
            }

            let raw = RawManifest::from_file(&manifest_path)?;
            let manifest = ManifestValidator::new().validate(&raw)?;
            if manifest.name != module_name {
                return Err(ModuleError::InvalidManifest(format!(
                    "manifest in {:?} declares name {}, expected {}",
                    module_dir, manifest.name, module_name
                )));
            }

            let config_path = module_dir.join("config.toml");
            let config_path = config_path.exists().then_some(config_path);

            return Ok(DiscoveredModule {
                directory: module_dir,
                manifest,
                config_path,
            });
        }

        Err(ModuleError::ModuleNotFound(format!(
            "module {} not found under any configured root",
            module_name
        )))
    }

    /// Load a module's configuration file into string key/values.
    ///
    /// Nested tables flatten into dot-notation keys; arrays join with
    /// commas. A missing file yields the empty configuration.
    pub fn load_module_config<P: AsRef<Path>>(
        config_path: Option<P>,
    ) -> Result<HashMap<String, String>, ModuleError> {
        let Some(path) = config_path else {
            return Ok(HashMap::new());
        };
        let path = path.as_ref();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            ModuleError::OperationError(format!("failed to read config file: {}", e))
        })?;

        let parsed: HashMap<String, toml::Value> = toml::from_str(&contents).map_err(|e| {
            ModuleError::OperationError(format!("failed to parse config TOML: {}", e))
        })?;

        let mut config = HashMap::new();
        for (key, value) in parsed {
            Self::flatten_toml_value(key, &value, &mut config);
        }
        Ok(config)
    }

    /// Flatten a TOML value into the string map
    fn flatten_toml_value(prefix: String, value: &toml::Value, result: &mut HashMap<String, String>) {
        use toml::Value;

        match value {
            Value::String(s) => {
                result.insert(prefix, s.clone());
            }
            Value::Integer(i) => {
                result.insert(prefix, i.to_string());
            }
            Value::Float(f) => {
                result.insert(prefix, f.to_string());
            }
            Value::Boolean(b) => {
                result.insert(prefix, b.to_string());
            }
            Value::Datetime(dt) => {
                result.insert(prefix, dt.to_string());
            }
            Value::Array(arr) => {
                let values: Vec<String> = arr
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        _ => v.to_string(),
                    })
                    .collect();
                result.insert(prefix, values.join(","));
            }
            Value::Table(table) => {
                for (key, val) in table {
                    Self::flatten_toml_value(format!("{}.{}", prefix, key), val, result);
                }
            }
        }
    }
}
