//! Module dependency resolution
//!
//! Computes a safe load order (and, reversed, a safe unload order) over
//! declared-dependency edges via depth-first traversal. Cycles are a hard
//! failure reported with the full offending path. Sibling ordering follows
//! manifest declaration order, so the resulting plan is deterministic.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::registry::manifest::ModuleManifest;
use crate::traits::ModuleError;

/// Dependency resolution result
#[derive(Debug, Clone)]
pub struct LoadPlan {
    /// Modules in load order (dependencies before dependents)
    pub sequence: Vec<String>,
    /// Optional dependencies that could not be resolved and were skipped
    pub skipped_optional: Vec<String>,
}

impl LoadPlan {
    /// Unload order: the exact reverse of the load order
    pub fn unload_order(&self) -> Vec<String> {
        self.sequence.iter().rev().cloned().collect()
    }
}

/// Dependency resolver
pub struct ModuleDependencies;

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    OnStack,
    Done,
}

impl ModuleDependencies {
    /// Compute the load order for `requested` against the known graph.
    ///
    /// `known` maps every available module name (already registered or
    /// discovered as a candidate) to its manifest. A required dependency
    /// absent from `known` is a `DependencyMissing` error; an optional one
    /// is skipped and recorded in the plan.
    pub fn order(
        requested: &[String],
        known: &HashMap<String, &ModuleManifest>,
    ) -> Result<LoadPlan, ModuleError> {
        let mut visited: HashMap<String, Visit> = HashMap::new();
        let mut stack_path: Vec<String> = Vec::new();
        let mut sequence: Vec<String> = Vec::new();
        let mut skipped_optional: Vec<String> = Vec::new();

        for name in requested {
            if !known.contains_key(name) {
                return Err(ModuleError::DependencyMissing(name.clone()));
            }
            Self::visit(
                name,
                known,
                &mut visited,
                &mut stack_path,
                &mut sequence,
                &mut skipped_optional,
            )?;
        }

        debug!("Dependency resolution complete: {:?}", sequence);

        Ok(LoadPlan {
            sequence,
            skipped_optional,
        })
    }

    fn visit(
        name: &str,
        known: &HashMap<String, &ModuleManifest>,
        visited: &mut HashMap<String, Visit>,
        stack_path: &mut Vec<String>,
        sequence: &mut Vec<String>,
        skipped_optional: &mut Vec<String>,
    ) -> Result<(), ModuleError> {
        match visited.get(name) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::OnStack) => {
                // Revisiting a node on the stack: report the whole cycle,
                // from the node's first appearance back around to it.
                let start = stack_path
                    .iter()
                    .position(|n| n == name)
                    .unwrap_or_default();
                let mut path: Vec<String> = stack_path[start..].to_vec();
                path.push(name.to_string());
                return Err(ModuleError::DependencyCycle { path });
            }
            None => {}
        }

        let manifest = known
            .get(name)
            .ok_or_else(|| ModuleError::DependencyMissing(name.to_string()))?;

        visited.insert(name.to_string(), Visit::OnStack);
        stack_path.push(name.to_string());

        // Declaration order drives sibling order; ties in any other valid
        // topological order are broken the way the author wrote them down.
        for dep in &manifest.dependencies {
            match known.get(dep.name.as_str()) {
                None if dep.optional => {
                    warn!(
                        "Optional dependency {} of module {} is unresolved, skipping",
                        dep.name, name
                    );
                    skipped_optional.push(dep.name.clone());
                    continue;
                }
                None => {
                    return Err(ModuleError::DependencyMissing(format!(
                        "{} (required by {})",
                        dep.name, name
                    )));
                }
                Some(dep_manifest) => {
                    if !dep.req.matches(&dep_manifest.version) {
                        return Err(ModuleError::VersionIncompatible(format!(
                            "{} requires {} {}, found {}",
                            name, dep.name, dep.req, dep_manifest.version
                        )));
                    }
                    Self::visit(
                        &dep.name,
                        known,
                        visited,
                        stack_path,
                        sequence,
                        skipped_optional,
                    )?;
                }
            }
        }

        stack_path.pop();
        visited.insert(name.to_string(), Visit::Done);
        sequence.push(name.to_string());
        Ok(())
    }
}
