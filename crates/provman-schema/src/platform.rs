//! Target platform (OS and architecture) of a provider package.
//!
//! Platforms use the registry naming convention (`linux_amd64`,
//! `darwin_arm64`, `windows_386`) rather than Rust target names.
//!
//! # Example
//!
//! ```
//! use provman_schema::Platform;
//!
//! let current = Platform::current();
//! println!("Running on: {}", current);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// An `{os, arch}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
    os: String,
    arch: String,
}

impl Platform {
    /// Build a platform from registry-style OS and architecture names.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Platform`] if either part is empty or contains
    /// characters other than lowercase letters and digits.
    pub fn new(os: &str, arch: &str) -> Result<Self, ParseError> {
        let os = os.to_ascii_lowercase();
        let arch = arch.to_ascii_lowercase();
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        };
        if !valid(&os) || !valid(&arch) {
            return Err(ParseError::Platform(format!("{os}_{arch}")));
        }
        Ok(Self { os, arch })
    }

    /// Platform of the running process.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }

    /// Operating system, e.g. `linux`.
    pub fn os(&self) -> &str {
        &self.os
    }

    /// Architecture, e.g. `amd64`.
    pub fn arch(&self) -> &str {
        &self.arch
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .split_once('_')
            .ok_or_else(|| ParseError::Platform(s.to_string()))?;
        Self::new(os, arch).map_err(|_| ParseError::Platform(s.to_string()))
    }
}

impl TryFrom<String> for Platform {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let p: Platform = "linux_amd64".parse().unwrap();
        assert_eq!(p.os(), "linux");
        assert_eq!(p.arch(), "amd64");
        assert_eq!(p.to_string(), "linux_amd64");
    }

    #[test]
    fn current_uses_registry_names() {
        let p = Platform::current();
        assert_ne!(p.os(), "macos");
        assert_ne!(p.arch(), "x86_64");
        assert_ne!(p.arch(), "aarch64");
        assert_eq!(p.to_string().parse::<Platform>().unwrap(), p);
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["linux", "_amd64", "linux_", "linux_amd_64", "li nux_amd64"] {
            assert!(bad.parse::<Platform>().is_err(), "{bad} should fail");
        }
    }
}
