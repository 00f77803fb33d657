//! Module security: permission model and the admission gate

pub mod gate;
pub mod permissions;

pub use gate::{Decision, SecurityGate, SecurityPolicy, TrustTier, DANGEROUS_PATTERNS};
pub use permissions::{parse_permission_string, Permission, PermissionSet};
