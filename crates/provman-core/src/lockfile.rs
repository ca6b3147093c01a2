//! Dependency lock file (`provman.lock`).
//!
//! The lock file records, per provider, the version selected by a previous
//! run, the constraints it was selected under, and every hash known to be
//! valid for that version. It is committed to version control, so the
//! rendering is deterministic: loading and re-saving an unmodified file
//! produces identical bytes.
//!
//! A lock entry's hash set only grows while the version stays the same;
//! installing the same version on another platform adds that platform's
//! hashes instead of replacing the set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use provman_schema::{ConstraintSet, Hash, ProviderAddress, Version};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};
use crate::io::blocking;

/// Format version written to and accepted from lock files.
pub const LOCK_FORMAT_VERSION: u32 = 1;

const HEADER: &str = "# This file is maintained automatically by \"provman init\".\n\
                      # Manual edits may be lost in future updates.\n";

/// The recorded selection for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    provider: ProviderAddress,
    version: Version,
    constraints: Option<ConstraintSet>,
    hashes: BTreeSet<Hash>,
}

impl LockEntry {
    pub fn new(
        provider: ProviderAddress,
        version: Version,
        constraints: Option<ConstraintSet>,
        hashes: impl IntoIterator<Item = Hash>,
    ) -> Self {
        Self {
            provider,
            version,
            constraints: constraints.filter(|c| !c.is_empty()),
            hashes: hashes.into_iter().collect(),
        }
    }

    pub fn provider(&self) -> &ProviderAddress {
        &self.provider
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Constraints in effect when the version was selected.
    pub fn constraints(&self) -> Option<&ConstraintSet> {
        self.constraints.as_ref()
    }

    pub fn hashes(&self) -> &BTreeSet<Hash> {
        &self.hashes
    }

    /// Whether `hash` is one of the recorded hashes.
    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }
}

/// How a lock file changed between two passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockChange {
    Added {
        provider: ProviderAddress,
        version: Version,
    },
    Removed {
        provider: ProviderAddress,
        version: Version,
    },
    Changed {
        provider: ProviderAddress,
        from: Version,
        to: Version,
    },
    /// Same version, different hash set (usually a new platform's hashes).
    HashesUpdated {
        provider: ProviderAddress,
        version: Version,
    },
}

impl fmt::Display for LockChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added { provider, version } => write!(f, "added {provider} {version}"),
            Self::Removed { provider, version } => write!(f, "removed {provider} {version}"),
            Self::Changed { provider, from, to } => {
                write!(f, "changed {provider} from {from} to {to}")
            }
            Self::HashesUpdated { provider, version } => {
                write!(f, "updated hashes for {provider} {version}")
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLockFile {
    version: u32,
    #[serde(default)]
    provider: Vec<RawProvider>,
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    source: String,
    version: String,
    #[serde(default)]
    constraints: Option<String>,
    #[serde(default)]
    hashes: Vec<String>,
}

/// All lock entries, keyed by provider address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locks {
    providers: BTreeMap<ProviderAddress, LockEntry>,
}

impl Locks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the lock file at `path`.
    ///
    /// A missing, empty or whitespace-only file is an empty lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if the content cannot be understood and
    /// [`Error::Io`] if the file cannot be read.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no lock file, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content, path)
    }

    /// Parse lock file text; `path` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] for invalid TOML, an unknown format version,
    /// duplicate providers, or invalid addresses, versions, constraints or hashes.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let corrupt = |detail: String| Error::Corrupt {
            path: path.to_path_buf(),
            detail,
        };

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: RawLockFile = toml::from_str(content).map_err(|e| corrupt(e.to_string()))?;
        if raw.version != LOCK_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported lock file version {}, expected {LOCK_FORMAT_VERSION}",
                raw.version
            )));
        }

        let mut locks = Self::default();
        for entry in raw.provider {
            let provider: ProviderAddress =
                entry.source.parse().map_err(|e| corrupt(format!("{e}")))?;
            if locks.providers.contains_key(&provider) {
                return Err(corrupt(format!("duplicate entry for provider {provider}")));
            }
            let version = Version::parse(&entry.version)
                .map_err(|e| corrupt(format!("provider {provider}: {e}")))?;
            let constraints = entry
                .constraints
                .as_deref()
                .map(ConstraintSet::parse)
                .transpose()
                .map_err(|e| corrupt(format!("provider {provider}: {e}")))?;
            let hashes = entry
                .hashes
                .iter()
                .map(|h| Hash::parse(h))
                .collect::<std::result::Result<BTreeSet<_>, _>>()
                .map_err(|e| corrupt(format!("provider {provider}: {e}")))?;

            locks.providers.insert(
                provider.clone(),
                LockEntry::new(provider, version, constraints, hashes),
            );
        }
        Ok(locks)
    }

    /// Render the lock file deterministically.
    pub fn to_toml_string(&self) -> String {
        let mut out = String::from(HEADER);
        out.push_str(&format!("\nversion = {LOCK_FORMAT_VERSION}\n"));

        for entry in self.providers.values() {
            out.push_str("\n[[provider]]\n");
            out.push_str(&format!("source = {}\n", quote(&entry.provider.to_string())));
            out.push_str(&format!("version = {}\n", quote(&entry.version.to_string())));
            if let Some(constraints) = &entry.constraints {
                out.push_str(&format!("constraints = {}\n", quote(&constraints.to_string())));
            }
            if entry.hashes.is_empty() {
                out.push_str("hashes = []\n");
            } else {
                out.push_str("hashes = [\n");
                for hash in &entry.hashes {
                    out.push_str(&format!("  {},\n", quote(hash.as_str())));
                }
                out.push_str("]\n");
            }
        }
        out
    }

    /// Write the lock file atomically.
    ///
    /// The content goes to a uniquely named temporary file in the same
    /// directory, which is then renamed over `path`. Concurrent saves each
    /// use their own temporary file; the last rename wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml_string();
        let target = path.to_path_buf();
        blocking(move || write_replacing(&target, content.as_bytes())).await?;
        debug!(path = %path.display(), providers = self.providers.len(), "saved lock file");
        Ok(())
    }

    pub fn provider(&self, provider: &ProviderAddress) -> Option<&LockEntry> {
        self.providers.get(provider)
    }

    pub fn all_providers(&self) -> &BTreeMap<ProviderAddress, LockEntry> {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Record that `version` was selected for `provider`.
    ///
    /// With the same version already locked, `hashes` are added to the
    /// existing set. A different version replaces the entry.
    pub fn record_selection(
        &mut self,
        provider: &ProviderAddress,
        version: &Version,
        constraints: Option<ConstraintSet>,
        hashes: impl IntoIterator<Item = Hash>,
    ) {
        match self.providers.get_mut(provider) {
            Some(entry) if entry.version == *version => {
                entry.hashes.extend(hashes);
                entry.constraints = constraints.filter(|c| !c.is_empty());
            }
            _ => {
                self.providers.insert(
                    provider.clone(),
                    LockEntry::new(provider.clone(), version.clone(), constraints, hashes),
                );
            }
        }
    }

    /// Insert or replace an entry wholesale.
    pub fn set_provider(&mut self, entry: LockEntry) {
        self.providers.insert(entry.provider.clone(), entry);
    }

    pub fn remove_provider(&mut self, provider: &ProviderAddress) -> Option<LockEntry> {
        self.providers.remove(provider)
    }

    /// Check that the locked version of `provider` satisfies `constraints`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoVersionSelected`] if there is no entry
    /// - [`Error::ConstraintMismatch`] if the locked version is not allowed
    pub fn check_against_constraints(
        &self,
        provider: &ProviderAddress,
        constraints: &ConstraintSet,
    ) -> Result<&LockEntry> {
        let entry = self
            .providers
            .get(provider)
            .ok_or_else(|| Error::NoVersionSelected {
                provider: provider.clone(),
            })?;
        if constraints.allows(&entry.version) {
            Ok(entry)
        } else {
            Err(Error::ConstraintMismatch {
                provider: provider.clone(),
                locked: entry.version.clone(),
                constraints: constraints.clone(),
            })
        }
    }

    /// Drop entries for providers not in `still_referenced`, returning them.
    pub fn prune(&mut self, still_referenced: &[ProviderAddress]) -> Vec<LockEntry> {
        let keep: BTreeSet<&ProviderAddress> = still_referenced.iter().collect();
        let gone: Vec<ProviderAddress> = self
            .providers
            .keys()
            .filter(|p| !keep.contains(p))
            .cloned()
            .collect();
        gone.iter()
            .filter_map(|p| self.providers.remove(p))
            .collect()
    }

    /// Same providers, versions, constraints and hashes.
    pub fn equal(&self, other: &Locks) -> bool {
        self == other
    }

    /// Same set of provider addresses, ignoring what is recorded for them.
    pub fn equal_provider_addresses(&self, other: &Locks) -> bool {
        self.providers.keys().eq(other.providers.keys())
    }

    /// What changed going from `previous` to `self`.
    pub fn changes_since(&self, previous: &Locks) -> Vec<LockChange> {
        let mut changes = Vec::new();
        for (provider, entry) in &self.providers {
            match previous.providers.get(provider) {
                None => changes.push(LockChange::Added {
                    provider: provider.clone(),
                    version: entry.version.clone(),
                }),
                Some(old) if old.version != entry.version => changes.push(LockChange::Changed {
                    provider: provider.clone(),
                    from: old.version.clone(),
                    to: entry.version.clone(),
                }),
                Some(old) if old.hashes != entry.hashes => {
                    changes.push(LockChange::HashesUpdated {
                        provider: provider.clone(),
                        version: entry.version.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        for (provider, old) in &previous.providers {
            if !self.providers.contains_key(provider) {
                changes.push(LockChange::Removed {
                    provider: provider.clone(),
                    version: old.version.clone(),
                });
            }
        }
        changes
    }
}

fn quote(s: &str) -> String {
    toml_edit::Value::from(s).to_string().trim().to_string()
}

fn write_replacing(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
