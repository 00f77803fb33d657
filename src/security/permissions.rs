//! Permission model for module capability access
//!
//! Implements whitelist-only access control: a module holds exactly the
//! permissions granted at validation time, and grants never escalate at
//! runtime without re-validation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Helper function to convert a permission string to a Permission enum.
///
/// Unknown strings yield `None`; callers must treat that as a hard error,
/// never a silent drop.
pub fn parse_permission_string(perm_str: &str) -> Option<Permission> {
    match perm_str {
        "filesystem" | "Filesystem" => Some(Permission::Filesystem),
        "network" | "Network" => Some(Permission::Network),
        "process_control" | "ProcessControl" => Some(Permission::ProcessControl),
        "cryptography" | "Cryptography" => Some(Permission::Cryptography),
        "environment" | "Environment" => Some(Permission::Environment),
        "load_modules" | "LoadModules" => Some(Permission::LoadModules),
        _ => None,
    }
}

/// Permission types that modules can request
///
/// This enumeration is closed: a manifest naming anything outside it is
/// rejected at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Access the filesystem outside the module's own data directory
    Filesystem,
    /// Open network connections
    Network,
    /// Control host-side processes
    ProcessControl,
    /// Use host cryptographic primitives
    Cryptography,
    /// Read host environment variables
    Environment,
    /// Request loading of further modules
    LoadModules,
}

impl Permission {
    /// All members of the enumeration, in a fixed order
    pub const ALL: [Permission; 6] = [
        Permission::Filesystem,
        Permission::Network,
        Permission::ProcessControl,
        Permission::Cryptography,
        Permission::Environment,
        Permission::LoadModules,
    ];

    /// Whether this permission belongs to the dangerous subset.
    ///
    /// Requesting any dangerous permission places a module in the strictest
    /// trust tier.
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Permission::Filesystem | Permission::ProcessControl)
    }

    /// Canonical string form, matching the manifest grammar
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Filesystem => "filesystem",
            Permission::Network => "network",
            Permission::ProcessControl => "process_control",
            Permission::Cryptography => "cryptography",
            Permission::Environment => "environment",
            Permission::LoadModules => "load_modules",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of permissions granted to a module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    permissions: HashSet<Permission>,
}

impl PermissionSet {
    /// Create a new empty permission set
    pub fn new() -> Self {
        Self {
            permissions: HashSet::new(),
        }
    }

    /// Create a permission set from a vector
    pub fn from_vec(permissions: Vec<Permission>) -> Self {
        Self {
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Add a permission
    pub fn add(&mut self, permission: Permission) {
        self.permissions.insert(permission);
    }

    /// Check if a permission is granted
    pub fn has(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Check if all required permissions are granted
    pub fn has_all(&self, required: &[Permission]) -> bool {
        required.iter().all(|p| self.permissions.contains(p))
    }

    /// Check if every permission in this set is also in `other`
    pub fn is_subset_of(&self, other: &PermissionSet) -> bool {
        self.permissions.is_subset(&other.permissions)
    }

    /// Whether any granted permission is in the dangerous subset
    pub fn any_dangerous(&self) -> bool {
        self.permissions.iter().any(Permission::is_dangerous)
    }

    /// Get all permissions as a vector, in the fixed enumeration order
    pub fn to_vec(&self) -> Vec<Permission> {
        Permission::ALL
            .iter()
            .filter(|p| self.permissions.contains(p))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_permissions() {
        for perm in Permission::ALL {
            assert_eq!(parse_permission_string(perm.as_str()), Some(perm));
        }
    }

    #[test]
    fn parse_unknown_permission_is_none() {
        assert_eq!(parse_permission_string("consensus_write"), None);
        assert_eq!(parse_permission_string(""), None);
    }

    #[test]
    fn dangerous_subset() {
        assert!(Permission::Filesystem.is_dangerous());
        assert!(Permission::ProcessControl.is_dangerous());
        assert!(!Permission::Network.is_dangerous());
        assert!(!Permission::Cryptography.is_dangerous());
    }

    #[test]
    fn to_vec_order_is_fixed() {
        let mut set = PermissionSet::new();
        set.add(Permission::LoadModules);
        set.add(Permission::Filesystem);
        assert_eq!(
            set.to_vec(),
            vec![Permission::Filesystem, Permission::LoadModules]
        );
    }
}
