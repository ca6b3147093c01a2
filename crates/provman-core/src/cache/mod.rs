//! Local package cache.
//!
//! Packages live unpacked at
//! `<base>/<hostname>/<namespace>/<type>/<version>/<os>_<arch>/`. The layout
//! is read by external tooling, so the path derivation must not change.
//!
//! A package directory only ever appears through a rename from a sibling
//! staging directory (`.<os>_<arch>.tmp-<random>`), so readers never see a
//! partial package. Shared caches additionally serialize installs of the same
//! key with a [`CacheLock`].

pub mod lock;

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use provman_schema::hash::{hash_v1_dir, hash_v1_zip};
use provman_schema::{Hash, Platform, ProviderAddress, Version};
use rand::Rng;
use tracing::{debug, info, trace, warn};

pub use lock::CacheLock;

use crate::error::{Error, Result};
use crate::io::blocking;
use crate::io::extract::{copy_dir, unpack_zip};

/// How long a shared-cache install waits for another holder of its key.
pub const LOCK_WAIT: Duration = Duration::from_secs(60);

/// A package present in a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPackage {
    pub provider: ProviderAddress,
    pub version: Version,
    pub platform: Platform,
    pub package_dir: PathBuf,
    /// The provider executable, if one was found in the package root.
    pub executable: Option<PathBuf>,
}

impl CachedPackage {
    /// True when the package holds an executable entry point.
    pub fn has_entry_point(&self) -> bool {
        self.executable.is_some()
    }

    /// `h1:` hash of the package contents as they are on disk now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the package cannot be read.
    pub fn hash(&self) -> Result<Hash> {
        dir_hash(&self.package_dir)
    }
}

/// A cache directory for one target platform.
#[derive(Debug, Clone)]
pub struct CacheDir {
    base: PathBuf,
    platform: Platform,
    shared: bool,
    lock_wait: Duration,
}

impl CacheDir {
    /// Cache private to one working directory.
    pub fn new(base: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            base: base.into(),
            platform,
            shared: false,
            lock_wait: LOCK_WAIT,
        }
    }

    /// Cache shared between processes; installs take a per-key lock.
    pub fn shared(base: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            shared: true,
            ..Self::new(base, platform)
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Where a package for this cache's platform lives.
    pub fn package_dir(&self, provider: &ProviderAddress, version: &Version) -> PathBuf {
        package_dir_in(&self.base, provider, version, &self.platform)
    }

    /// Lock file guarding one key.
    pub fn lock_path(&self, provider: &ProviderAddress, version: &Version) -> PathBuf {
        version_dir(&self.base, provider, version).join(format!("{}.lock", self.platform))
    }

    /// The cached package for one provider version, if present.
    pub fn provider_version(
        &self,
        provider: &ProviderAddress,
        version: &Version,
    ) -> Option<CachedPackage> {
        let dir = self.package_dir(provider, version);
        dir.is_dir().then(|| {
            read_package(
                provider.clone(),
                version.clone(),
                self.platform.clone(),
                dir,
            )
        })
    }

    /// Everything cached for this cache's platform, newest version first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a directory cannot be listed.
    pub fn all_available_packages(&self) -> Result<BTreeMap<ProviderAddress, Vec<CachedPackage>>> {
        scan_packages(&self.base, Some(&self.platform))
    }

    /// Install a zip archive as the package for `provider` `version`.
    ///
    /// # Errors
    ///
    /// - [`Error::Malformed`] if the archive cannot be read
    /// - [`Error::TamperedPackage`] if the unpacked files do not hash like the archive
    /// - [`Error::Io`] on filesystem failures or lock timeout
    pub async fn install_archive(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        archive: &Path,
    ) -> Result<CachedPackage> {
        let src = archive.to_path_buf();
        let expected = blocking(move || {
            hash_v1_zip(&src).map_err(|e| Error::malformed(src.display(), e))
        })
        .await?;
        let src = archive.to_path_buf();
        self.install_with(provider, version, expected, move |staging| {
            unpack_zip(&src, staging)?;
            Ok(())
        })
        .await
    }

    /// Install an unpacked package directory by copying it.
    ///
    /// # Errors
    ///
    /// Same as [`CacheDir::install_archive`].
    pub async fn install_dir(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        src: &Path,
    ) -> Result<CachedPackage> {
        let dir = src.to_path_buf();
        let expected = blocking(move || dir_hash(&dir)).await?;
        let dir = src.to_path_buf();
        self.install_with(provider, version, expected, move |staging| {
            copy_dir(&dir, staging)?;
            Ok(())
        })
        .await
    }

    /// Copy a package from another cache into this one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCached`] if `other` does not hold the package.
    pub async fn link_from(
        &self,
        other: &CacheDir,
        provider: &ProviderAddress,
        version: &Version,
    ) -> Result<CachedPackage> {
        let Some(pkg) = other.provider_version(provider, version) else {
            return Err(Error::NotCached {
                provider: provider.clone(),
                version: version.clone(),
                platform: other.platform.clone(),
                path: other.package_dir(provider, version),
            });
        };
        self.install_dir(provider, version, &pkg.package_dir).await
    }

    /// Delete one package. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be removed.
    pub fn remove_package(&self, provider: &ProviderAddress, version: &Version) -> Result<bool> {
        let dir = self.package_dir(provider, version);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        info!(%provider, %version, dir = %dir.display(), "removed cached package");
        Ok(true)
    }

    /// Delete the whole cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.base) {
            Ok(()) => {
                info!(dir = %self.base.display(), "cleared cache");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn install_with<F>(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        expected: Hash,
        populate: F,
    ) -> Result<CachedPackage>
    where
        F: FnOnce(&Path) -> Result<()> + Send + 'static,
    {
        let final_dir = self.package_dir(provider, version);
        let parent = version_dir(&self.base, provider, version);
        tokio::fs::create_dir_all(&parent).await?;

        let _guard = if self.shared {
            Some(CacheLock::acquire(&self.lock_path(provider, version), self.lock_wait).await?)
        } else {
            None
        };

        let staging = parent.join(format!(
            ".{}.tmp-{:08x}",
            self.platform,
            rand::rng().random::<u32>()
        ));
        let (p, v) = (provider.clone(), version.clone());
        let target = final_dir.clone();
        blocking(move || place_package(&p, &v, &target, &staging, &expected, populate)).await?;

        Ok(read_package(
            provider.clone(),
            version.clone(),
            self.platform.clone(),
            final_dir,
        ))
    }
}

/// Populate `staging`, check its hash and rename it to `final_dir`.
fn place_package<F>(
    provider: &ProviderAddress,
    version: &Version,
    final_dir: &Path,
    staging: &Path,
    expected: &Hash,
    populate: F,
) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    if final_dir.is_dir() && dir_hash(final_dir)? == *expected {
        debug!(%provider, %version, dir = %final_dir.display(), "package already installed");
        return Ok(());
    }

    let result = populate(staging).and_then(|()| {
        let got = dir_hash(staging)?;
        if got != *expected {
            return Err(Error::TamperedPackage {
                provider: provider.clone(),
                version: version.clone(),
                path: final_dir.to_path_buf(),
                detail: format!("unpacked files hash to {got}, expected {expected}"),
            });
        }
        swap_into_place(staging, final_dir)
    });

    if let Err(e) = result {
        let _ = fs::remove_dir_all(staging);
        // Lost a rename race in an unlocked cache: the winner's copy is fine.
        if final_dir.is_dir() && dir_hash(final_dir).is_ok_and(|h| h == *expected) {
            return Ok(());
        }
        return Err(e);
    }

    info!(%provider, %version, dir = %final_dir.display(), "installed package");
    Ok(())
}

/// Rename `staging` to `final_dir`.
///
/// A previous package is first renamed aside and only deleted once the new
/// one is in place, so readers never see a half-deleted package.
fn swap_into_place(staging: &Path, final_dir: &Path) -> Result<()> {
    let mut aside_name = staging.file_name().map(OsStr::to_os_string).unwrap_or_default();
    aside_name.push(".old");
    let aside = staging.with_file_name(aside_name);

    let replaced = match fs::rename(final_dir, &aside) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = fs::rename(staging, final_dir) {
        if replaced {
            let _ = fs::rename(&aside, final_dir);
        }
        return Err(e.into());
    }
    if replaced {
        debug!(dir = %final_dir.display(), "replaced package with different contents");
        if let Err(e) = fs::remove_dir_all(&aside) {
            warn!(dir = %aside.display(), error = %e, "failed to remove replaced package");
        }
    }
    Ok(())
}

fn version_dir(base: &Path, provider: &ProviderAddress, version: &Version) -> PathBuf {
    base.join(provider.hostname())
        .join(provider.namespace())
        .join(provider.type_name())
        .join(version.to_string())
}

/// Deterministic package directory for a key.
pub fn package_dir_in(
    base: &Path,
    provider: &ProviderAddress,
    version: &Version,
    platform: &Platform,
) -> PathBuf {
    version_dir(base, provider, version).join(platform.to_string())
}

fn dir_hash(dir: &Path) -> Result<Hash> {
    hash_v1_dir(dir).map_err(|e| match e {
        provman_schema::HashError::Io(e) => Error::Io(e),
        other => Error::malformed(dir.display(), other),
    })
}

fn read_package(
    provider: ProviderAddress,
    version: Version,
    platform: Platform,
    package_dir: PathBuf,
) -> CachedPackage {
    let prefix = provider.executable_prefix();
    let mut names: Vec<(String, PathBuf)> = fs::read_dir(&package_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    names.sort();
    let executable = names
        .into_iter()
        .find(|(name, _)| name.starts_with(&prefix))
        .map(|(_, path)| path);

    CachedPackage {
        provider,
        version,
        platform,
        package_dir,
        executable,
    }
}

/// Visible subdirectories of `dir`, sorted by name. A missing `dir` is empty.
fn subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if fs::metadata(&path).is_ok_and(|m| m.is_dir()) {
            out.push((name, path));
        }
    }
    out.sort();
    Ok(out)
}

/// Enumerate an unpacked package tree.
///
/// Staging directories, lock files and unparsable path segments are skipped.
/// With `platform` set, only packages for that platform are returned.
///
/// # Errors
///
/// Returns [`Error::Io`] if a directory cannot be listed.
pub fn scan_packages(
    base: &Path,
    platform: Option<&Platform>,
) -> Result<BTreeMap<ProviderAddress, Vec<CachedPackage>>> {
    let mut found: BTreeMap<ProviderAddress, Vec<CachedPackage>> = BTreeMap::new();

    for (host, host_dir) in subdirs(base)? {
        for (namespace, ns_dir) in subdirs(&host_dir)? {
            for (type_name, type_dir) in subdirs(&ns_dir)? {
                let Ok(provider) = ProviderAddress::new(&host, &namespace, &type_name) else {
                    trace!(dir = %type_dir.display(), "skipping directory that is not a provider");
                    continue;
                };
                for (raw_version, version_dir) in subdirs(&type_dir)? {
                    let Ok(version) = Version::parse(&raw_version) else {
                        trace!(dir = %version_dir.display(), "skipping directory that is not a version");
                        continue;
                    };
                    for (raw_platform, package_dir) in subdirs(&version_dir)? {
                        let Ok(pkg_platform) = raw_platform.parse::<Platform>() else {
                            continue;
                        };
                        if platform.is_some_and(|p| *p != pkg_platform) {
                            continue;
                        }
                        found.entry(provider.clone()).or_default().push(read_package(
                            provider.clone(),
                            version.clone(),
                            pkg_platform,
                            package_dir,
                        ));
                    }
                }
            }
        }
    }

    for packages in found.values_mut() {
        packages.sort_by(|a, b| b.version.cmp(&a.version));
    }
    Ok(found)
}
