//! Local directory mirror.
//!
//! Two layouts are recognised under the mirror root:
//!
//! - packed: `<hostname>/<namespace>/<type>/terraform-provider-<type>_<version>_<os>_<arch>.zip`
//! - unpacked: `<hostname>/<namespace>/<type>/<version>/<os>_<arch>/`, the cache layout
//!
//! The mirror is rescanned on every query; it is local and cheap to read.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use provman_schema::{Platform, ProviderAddress, Version};
use tracing::{debug, warn};

use super::{PackageLocation, PackageMeta, Source};
use crate::cache::scan_packages;
use crate::error::{Error, Result};
use crate::io::blocking;

#[derive(Debug, Clone)]
pub struct FilesystemMirrorSource {
    root: PathBuf,
}

/// A package found in the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MirrorEntry {
    version: Version,
    platform: Platform,
    location: MirrorLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MirrorLocation {
    Packed(PathBuf),
    Unpacked(PathBuf),
}

impl FilesystemMirrorSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn entries(&self, provider: &ProviderAddress) -> Result<Vec<MirrorEntry>> {
        let root = self.root.clone();
        let provider = provider.clone();
        blocking(move || scan_provider(&root, &provider)).await
    }
}

fn scan_provider(root: &Path, provider: &ProviderAddress) -> Result<Vec<MirrorEntry>> {
    let mut entries = Vec::new();

    let unpacked = scan_packages(root, None)?;
    if let Some(packages) = unpacked.get(provider) {
        entries.extend(packages.iter().map(|pkg| MirrorEntry {
            version: pkg.version.clone(),
            platform: pkg.platform.clone(),
            location: MirrorLocation::Unpacked(pkg.package_dir.clone()),
        }));
    }

    let type_dir = root
        .join(provider.hostname())
        .join(provider.namespace())
        .join(provider.type_name());
    let listing = match fs::read_dir(&type_dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    let prefix = format!("{}_", provider.executable_prefix());
    for entry in listing {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        let Some(rest) = name
            .strip_prefix(&prefix)
            .and_then(|r| r.strip_suffix(".zip"))
        else {
            continue;
        };
        match parse_packed_name(rest) {
            Some((version, platform)) => entries.push(MirrorEntry {
                version,
                platform,
                location: MirrorLocation::Packed(entry.path()),
            }),
            None => warn!(file = %entry.path().display(), "ignoring archive with unparsable name"),
        }
    }

    Ok(entries)
}

/// Split `<version>_<os>_<arch>`.
fn parse_packed_name(rest: &str) -> Option<(Version, Platform)> {
    let mut parts = rest.rsplitn(3, '_');
    let arch = parts.next()?;
    let os = parts.next()?;
    let version = parts.next()?;
    Some((Version::parse(version).ok()?, Platform::new(os, arch).ok()?))
}

#[async_trait]
impl Source for FilesystemMirrorSource {
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
        let versions: BTreeSet<Version> = self
            .entries(provider)
            .await?
            .into_iter()
            .map(|e| e.version)
            .collect();
        if versions.is_empty() {
            return Err(Error::not_found(
                provider,
                format!("no packages in filesystem mirror {}", self.root.display()),
            ));
        }
        debug!(%provider, count = versions.len(), root = %self.root.display(), "listed mirror versions");
        Ok(versions.into_iter().collect())
    }

    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta> {
        // Unpacked entries win over archives for the same key.
        let mut matching: BTreeMap<bool, MirrorEntry> = BTreeMap::new();
        for entry in self.entries(provider).await? {
            if entry.version == *version && entry.platform == *platform {
                let packed = matches!(entry.location, MirrorLocation::Packed(_));
                matching.entry(packed).or_insert(entry);
            }
        }
        let Some((_, entry)) = matching.into_iter().next() else {
            return Err(Error::not_found(
                provider,
                format!(
                    "no package for {version} on {platform} in filesystem mirror {}",
                    self.root.display()
                ),
            ));
        };

        let (location, filename) = match entry.location {
            MirrorLocation::Packed(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (PackageLocation::LocalArchive(path), name)
            }
            MirrorLocation::Unpacked(path) => (PackageLocation::LocalDir(path), String::new()),
        };

        Ok(PackageMeta {
            provider: provider.clone(),
            version: version.clone(),
            platform: platform.clone(),
            filename,
            location,
            declared_hashes: BTreeSet::new(),
        })
    }

    fn describe(&self) -> String {
        format!("filesystem mirror {}", self.root.display())
    }
}
