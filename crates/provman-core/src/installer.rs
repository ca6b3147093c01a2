//! Installation pass orchestration.
//!
//! [`Installer::ensure_provider_versions`] takes the previous lock file and
//! the merged requirements and produces the next lock file:
//!
//! - Predecessor-registry entries are migrated first
//! - Each provider gets a version: the locked one if it still satisfies the
//!   constraints, otherwise the best available release
//! - Packages already cached with a matching hash are reused without any
//!   network request
//! - Everything else is fetched, checked against declared and locked hashes,
//!   and installed
//! - Entries for providers no longer required are pruned
//!
//! Providers are resolved concurrently. Nothing is written to the lock file
//! here; the caller saves [`InstallOutcome::locks`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use provman_schema::hash::{hash_v1_dir, hash_v1_zip};
use provman_schema::{ConstraintSet, Hash, HashError, HashScheme, Platform, ProviderAddress, Version, select_best};
use tracing::{debug, info};

use crate::cache::{CacheDir, CachedPackage};
use crate::error::{Error, Result};
use crate::io::blocking;
use crate::io::download::{FetchedPackage, fetch_package};
use crate::lockfile::{LockChange, LockEntry, Locks};
use crate::manifest::Requirements;
use crate::migrate::{MigrationNote, PredecessorMigrator};
use crate::reporter::{NullReporter, Reporter};
use crate::sources::Source;
use crate::verify::package_matches;

/// Whether locked versions are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// Keep locked versions; a locked version outside the constraints is an error.
    #[default]
    Normal,
    /// Select the newest allowed version for every provider.
    Upgrade,
}

/// Result of a successful installation pass.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    /// The lock file to persist.
    pub locks: Locks,
    /// Difference from the lock file passed in.
    pub changes: Vec<LockChange>,
    pub notes: Vec<MigrationNote>,
    /// Installed packages, in requirement order.
    pub packages: Vec<CachedPackage>,
    /// How many packages had to be fetched from a source.
    pub fetched: usize,
}

/// # Implementation Note: per-provider plan
///
/// Deciding *what* to do for a provider is separate from doing it:
/// 1. `Cached`: the working-directory cache already holds the locked version
///    and it hashes to a locked hash. No network.
/// 2. `Link`: the global cache holds it and it verifies. Copy it over. No network.
/// 3. `Fetch`: ask the source for the package.
enum Plan<'c> {
    Cached(CachedPackage, Hash),
    Link(&'c CacheDir, Hash),
    Fetch,
}

/// What was decided for one provider.
struct Selection {
    provider: ProviderAddress,
    version: Version,
    constraints: ConstraintSet,
    hashes: BTreeSet<Hash>,
    package: CachedPackage,
    fetched: bool,
}

/// Installs providers into a working-directory cache.
pub struct Installer<S> {
    source: S,
    cache: CacheDir,
    global_cache: Option<CacheDir>,
    deadline: Option<Duration>,
    reporter: Arc<dyn Reporter>,
}

impl<S> std::fmt::Debug for Installer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("cache", &self.cache)
            .field("global_cache", &self.global_cache)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<S: Source> Installer<S> {
    /// Install into `cache`, for the cache's platform.
    pub fn new(source: S, cache: CacheDir) -> Self {
        Self {
            source,
            cache,
            global_cache: None,
            deadline: None,
            reporter: Arc::new(NullReporter),
        }
    }

    /// Install through a shared cache, then copy into the local one.
    pub fn with_global_cache(mut self, global: CacheDir) -> Self {
        self.global_cache = Some(global);
        self
    }

    /// Bound the whole pass.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    pub fn platform(&self) -> &Platform {
        self.cache.platform()
    }

    /// Make sure every required provider is installed and locked.
    ///
    /// `explicit` lists addresses the configuration names with a hostname;
    /// predecessor-registry entries among them are not migrated.
    ///
    /// # Errors
    ///
    /// - [`Error::ConstraintMismatch`] if a locked version no longer fits (normal mode)
    /// - [`Error::UnsatisfiableConstraints`] if no available version fits
    /// - [`Error::TamperedPackage`] if a fetched package contradicts a declared or locked hash
    /// - [`Error::DeadlineExceeded`] if the pass takes longer than the deadline
    /// - Source errors once every configured source is exhausted
    pub async fn ensure_provider_versions(
        &self,
        locks: &Locks,
        reqs: &Requirements,
        explicit: &BTreeSet<ProviderAddress>,
        mode: InstallMode,
    ) -> Result<InstallOutcome> {
        let pass = self.run(locks, reqs, explicit, mode);
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, pass)
                .await
                .map_err(|_| Error::DeadlineExceeded(deadline))?,
            None => pass.await,
        }
    }

    async fn run(
        &self,
        previous: &Locks,
        reqs: &Requirements,
        explicit: &BTreeSet<ProviderAddress>,
        mode: InstallMode,
    ) -> Result<InstallOutcome> {
        let mut locks = previous.clone();
        let notes = PredecessorMigrator::new(&self.source, self.platform())
            .migrate(&mut locks, explicit)
            .await?;
        for note in &notes {
            self.reporter.migration(note);
        }

        let selections = try_join_all(
            reqs.iter()
                .map(|(provider, constraints)| self.ensure_one(&locks, provider, constraints, mode)),
        )
        .await?;

        let mut fetched = 0;
        let mut packages = Vec::with_capacity(selections.len());
        for sel in selections {
            if sel.fetched {
                fetched += 1;
            }
            let constraints = (!sel.constraints.is_empty()).then_some(sel.constraints);
            locks.record_selection(&sel.provider, &sel.version, constraints, sel.hashes);
            packages.push(sel.package);
        }

        let required: Vec<ProviderAddress> = reqs.keys().cloned().collect();
        for gone in locks.prune(&required) {
            debug!(provider = %gone.provider(), "pruned lock entry no longer required");
        }

        let changes = locks.changes_since(previous);
        if !changes.is_empty() {
            self.reporter.lock_updated(&changes);
        }
        info!(providers = packages.len(), fetched, changes = changes.len(), "installation pass complete");

        Ok(InstallOutcome {
            locks,
            changes,
            notes,
            packages,
            fetched,
        })
    }

    async fn ensure_one(
        &self,
        locks: &Locks,
        provider: &ProviderAddress,
        constraints: &ConstraintSet,
        mode: InstallMode,
    ) -> Result<Selection> {
        let locked = locks.provider(provider);
        let version = match (locked, mode) {
            (Some(entry), InstallMode::Normal) => {
                locks.check_against_constraints(provider, constraints)?;
                entry.version().clone()
            }
            _ => self.select_version(provider, constraints).await?,
        };
        let pinned = locked.filter(|e| *e.version() == version);

        let (package, hashes, fetched) = match self.plan(provider, &version, pinned).await? {
            Plan::Cached(pkg, h1) => {
                self.reporter.cache_hit(provider, &version);
                (pkg, BTreeSet::from([h1]), false)
            }
            Plan::Link(global, h1) => {
                let pkg = self.cache.link_from(global, provider, &version).await?;
                self.reporter.cache_hit(provider, &version);
                (pkg, BTreeSet::from([h1]), false)
            }
            Plan::Fetch => {
                let (pkg, hashes) = self.fetch_and_install(provider, &version, pinned).await?;
                (pkg, hashes, true)
            }
        };

        Ok(Selection {
            provider: provider.clone(),
            version,
            constraints: constraints.clone(),
            hashes,
            package,
            fetched,
        })
    }

    async fn select_version(
        &self,
        provider: &ProviderAddress,
        constraints: &ConstraintSet,
    ) -> Result<Version> {
        self.reporter.querying(provider);
        let available = self.source.list_versions(provider).await?;
        let version = select_best(&available, constraints).ok_or_else(|| {
            Error::UnsatisfiableConstraints {
                provider: provider.clone(),
                constraints: constraints.clone(),
            }
        })?;
        debug!(%provider, %version, available = available.len(), "selected version");
        Ok(version)
    }

    async fn plan(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        pinned: Option<&LockEntry>,
    ) -> Result<Plan<'_>> {
        let Some(entry) = pinned else {
            return Ok(Plan::Fetch);
        };

        if let Some((pkg, h1)) = verified_copy(&self.cache, provider, version, entry).await? {
            return Ok(Plan::Cached(pkg, h1));
        }
        if let Some(global) = &self.global_cache {
            if let Some((_, h1)) = verified_copy(global, provider, version, entry).await? {
                return Ok(Plan::Link(global, h1));
            }
        }
        Ok(Plan::Fetch)
    }

    async fn fetch_and_install(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        pinned: Option<&LockEntry>,
    ) -> Result<(CachedPackage, BTreeSet<Hash>)> {
        let platform = self.platform();
        self.reporter.fetching(provider, version, platform);
        let meta = self.source.package_meta(provider, version, platform).await?;

        let staging = tempfile::TempDir::new()?;
        let fetched = fetch_package(&meta, staging.path()).await?;
        let tampered = |detail: String| Error::TamperedPackage {
            provider: provider.clone(),
            version: version.clone(),
            path: self.cache.package_dir(provider, version),
            detail,
        };

        if let Some(zh) = fetched.zip_hash() {
            let declared_zh: Vec<&Hash> = meta
                .declared_hashes
                .iter()
                .filter(|h| h.scheme() == HashScheme::Zip)
                .collect();
            if !declared_zh.is_empty() && !declared_zh.contains(&zh) {
                return Err(tampered(format!(
                    "downloaded archive has hash {zh}, which {} does not declare",
                    meta.location.describe()
                )));
            }
        }

        let h1 = content_hash(&fetched).await?;
        if let Some(entry) = pinned.filter(|e| !e.hashes().is_empty()) {
            let known = entry.contains_hash(&h1)
                || fetched.zip_hash().is_some_and(|zh| entry.contains_hash(zh));
            if !known {
                return Err(tampered(format!(
                    "package hashes to {h1}, which does not match any hash in the dependency lock file"
                )));
            }
        }

        let target = self.global_cache.as_ref().unwrap_or(&self.cache);
        let mut package = install(target, provider, version, &fetched).await?;
        if let Some(global) = &self.global_cache {
            package = self.cache.link_from(global, provider, version).await?;
        }
        self.reporter.installed(provider, version, &package.package_dir);

        let mut hashes = meta.declared_hashes;
        hashes.insert(h1);
        if let Some(zh) = fetched.zip_hash() {
            hashes.insert(zh.clone());
        }
        Ok((package, hashes))
    }
}

/// A copy in `cache` whose `h1:` hash is accepted by `entry`.
async fn verified_copy(
    cache: &CacheDir,
    provider: &ProviderAddress,
    version: &Version,
    entry: &LockEntry,
) -> Result<Option<(CachedPackage, Hash)>> {
    let Some(pkg) = cache.provider_version(provider, version) else {
        return Ok(None);
    };
    let target = pkg.clone();
    let h1 = blocking(move || target.hash()).await?;
    match package_matches(entry, &h1) {
        Ok(()) => Ok(Some((pkg, h1))),
        Err(detail) => {
            debug!(%provider, %version, cache = %cache.base_dir().display(), %detail, "cached copy not usable");
            Ok(None)
        }
    }
}

async fn content_hash(fetched: &FetchedPackage) -> Result<Hash> {
    let fetched = fetched.clone();
    blocking(move || match &fetched {
        FetchedPackage::Archive { path, .. } => hash_v1_zip(path).map_err(|e| hash_error(path, e)),
        FetchedPackage::Directory(dir) => hash_v1_dir(dir).map_err(|e| hash_error(dir, e)),
    })
    .await
}

fn hash_error(path: &Path, e: HashError) -> Error {
    match e {
        HashError::Io(e) => Error::Io(e),
        other => Error::malformed(path.display(), other),
    }
}

async fn install(
    cache: &CacheDir,
    provider: &ProviderAddress,
    version: &Version,
    fetched: &FetchedPackage,
) -> Result<CachedPackage> {
    match fetched {
        FetchedPackage::Archive { path, .. } => cache.install_archive(provider, version, path).await,
        FetchedPackage::Directory(dir) => cache.install_dir(provider, version, dir).await,
    }
}
