//! Reporter trait for dependency injection
//!
//! Installer progress is reported through this trait so the library is not
//! coupled to any particular terminal output. Nothing in the library depends
//! on what a reporter does with the events.

use std::path::Path;

use provman_schema::{Platform, ProviderAddress, Version};
use tracing::{info, warn};

use crate::lockfile::LockChange;
use crate::migrate::MigrationNote;

pub trait Reporter: Send + Sync {
    /// Available versions are being listed for a provider.
    fn querying(&self, provider: &ProviderAddress);

    /// A package is being fetched from a source.
    fn fetching(&self, provider: &ProviderAddress, version: &Version, platform: &Platform);

    /// A package was placed in the cache.
    fn installed(&self, provider: &ProviderAddress, version: &Version, dir: &Path);

    /// A package was already cached and matched the lock file.
    fn cache_hit(&self, provider: &ProviderAddress, version: &Version);

    /// The lock file content changed.
    fn lock_updated(&self, changes: &[LockChange]);

    /// A predecessor-registry lock entry was migrated, kept or dropped.
    fn migration(&self, note: &MigrationNote);

    /// Something worth telling the operator that is not an error.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn querying(&self, provider: &ProviderAddress) {
        (**self).querying(provider);
    }
    fn fetching(&self, provider: &ProviderAddress, version: &Version, platform: &Platform) {
        (**self).fetching(provider, version, platform);
    }
    fn installed(&self, provider: &ProviderAddress, version: &Version, dir: &Path) {
        (**self).installed(provider, version, dir);
    }
    fn cache_hit(&self, provider: &ProviderAddress, version: &Version) {
        (**self).cache_hit(provider, version);
    }
    fn lock_updated(&self, changes: &[LockChange]) {
        (**self).lock_updated(changes);
    }
    fn migration(&self, note: &MigrationNote) {
        (**self).migration(note);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn querying(&self, _: &ProviderAddress) {}
    fn fetching(&self, _: &ProviderAddress, _: &Version, _: &Platform) {}
    fn installed(&self, _: &ProviderAddress, _: &Version, _: &Path) {}
    fn cache_hit(&self, _: &ProviderAddress, _: &Version) {}
    fn lock_updated(&self, _: &[LockChange]) {}
    fn migration(&self, _: &MigrationNote) {}
    fn warning(&self, _: &str) {}
}

/// Forwards every event to `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn querying(&self, provider: &ProviderAddress) {
        info!(%provider, "finding available versions");
    }
    fn fetching(&self, provider: &ProviderAddress, version: &Version, platform: &Platform) {
        info!(%provider, %version, %platform, "fetching package");
    }
    fn installed(&self, provider: &ProviderAddress, version: &Version, dir: &Path) {
        info!(%provider, %version, dir = %dir.display(), "installed");
    }
    fn cache_hit(&self, provider: &ProviderAddress, version: &Version) {
        info!(%provider, %version, "using cached package");
    }
    fn lock_updated(&self, changes: &[LockChange]) {
        for change in changes {
            info!(%change, "dependency lock file updated");
        }
    }
    fn migration(&self, note: &MigrationNote) {
        info!(%note, "lock file migration");
    }
    fn warning(&self, msg: &str) {
        warn!("{msg}");
    }
}
