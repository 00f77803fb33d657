//! Strict semantic version grammar for module identities
//!
//! Accepts exactly `major.minor.patch` with an optional `-prerelease`
//! suffix. Build metadata and two-part versions are rejected: module
//! identity must be unambiguous within a registry.

use crate::traits::ModuleError;
use std::cmp::Ordering;
use std::str::FromStr;

/// Parsed semantic version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Pre-release identifiers (dot-separated), empty for a release version
    pub pre: Vec<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    fn core(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModuleError::InvalidVersion(s.to_string());

        if s.is_empty() || s.contains('+') {
            return Err(invalid());
        }

        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (s, None),
        };

        let nums: Vec<&str> = core.split('.').collect();
        if nums.len() != 3 {
            return Err(invalid());
        }

        let mut parts = [0u64; 3];
        for (i, n) in nums.iter().enumerate() {
            // Leading zeros are tolerated; non-numeric parts are not.
            if n.is_empty() || !n.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[i] = n.parse().map_err(|_| invalid())?;
        }

        let pre = match pre {
            Some(p) => {
                let idents: Vec<String> = p.split('.').map(str::to_string).collect();
                if idents.iter().any(|i| {
                    i.is_empty() || !i.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                }) {
                    return Err(invalid());
                }
                idents
            }
            None => Vec::new(),
        };

        Ok(Version {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            pre,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre.join("."))?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.core().cmp(&other.core()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // A pre-release sorts before the corresponding release.
        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => cmp_prerelease(&self.pre, &other.pre),
        }
    }
}

/// Semver precedence for pre-release identifier lists: numeric identifiers
/// compare numerically and sort below alphanumeric ones; a shorter list
/// sorts first when all shared identifiers are equal.
fn cmp_prerelease(a: &[String], b: &[String]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(xn), Ok(yn)) => xn.cmp(&yn),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Version constraint as declared in a manifest dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReq {
    /// Exactly this version (`=1.2.3` or a bare `1.2.3`)
    Exact(Version),
    /// Compatible within the leftmost non-zero component (`^1.2.3`)
    Caret(Version),
    /// Compatible within the same minor line (`~1.2.3`)
    Tilde(Version),
    /// This version or newer (`>=1.2.3`)
    AtLeast(Version),
}

impl FromStr for VersionReq {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix(">=") {
            return Ok(VersionReq::AtLeast(rest.trim().parse()?));
        }
        if let Some(rest) = s.strip_prefix('^') {
            return Ok(VersionReq::Caret(rest.trim().parse()?));
        }
        if let Some(rest) = s.strip_prefix('~') {
            return Ok(VersionReq::Tilde(rest.trim().parse()?));
        }
        if let Some(rest) = s.strip_prefix('=') {
            return Ok(VersionReq::Exact(rest.trim().parse()?));
        }
        Ok(VersionReq::Exact(s.parse()?))
    }
}

impl std::fmt::Display for VersionReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionReq::Exact(v) => write!(f, "={}", v),
            VersionReq::Caret(v) => write!(f, "^{}", v),
            VersionReq::Tilde(v) => write!(f, "~{}", v),
            VersionReq::AtLeast(v) => write!(f, ">={}", v),
        }
    }
}

impl VersionReq {
    /// Whether `version` satisfies this constraint
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionReq::Exact(base) => version == base,
            VersionReq::AtLeast(base) => version >= base,
            VersionReq::Tilde(base) => {
                version.major == base.major && version.minor == base.minor && version >= base
            }
            VersionReq::Caret(base) => {
                if base.major > 0 {
                    version.major == base.major && version >= base
                } else {
                    version.major == 0 && version.minor == base.minor && version >= base
                }
            }
        }
    }
}
