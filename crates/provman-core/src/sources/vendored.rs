//! A single package checked into the working tree.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use provman_schema::{Platform, ProviderAddress, Version};

use super::{PackageLocation, PackageMeta, Source};
use crate::error::{Error, Result};

/// One provider at one declared version, from a directory or zip archive.
///
/// There is no version resolution: the configured version is the only one
/// listed, and the package is assumed to be built for the current platform.
#[derive(Debug, Clone)]
pub struct VendoredSource {
    provider: ProviderAddress,
    version: Version,
    path: PathBuf,
}

impl VendoredSource {
    pub fn new(provider: ProviderAddress, version: Version, path: PathBuf) -> Self {
        Self {
            provider,
            version,
            path,
        }
    }

    fn check_provider(&self, provider: &ProviderAddress) -> Result<()> {
        if *provider == self.provider {
            Ok(())
        } else {
            Err(Error::not_found(
                provider,
                format!("vendored directory {} only provides {}", self.path.display(), self.provider),
            ))
        }
    }
}

#[async_trait]
impl Source for VendoredSource {
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
        self.check_provider(provider)?;
        Ok(vec![self.version.clone()])
    }

    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta> {
        self.check_provider(provider)?;
        if *version != self.version {
            return Err(Error::not_found(
                provider,
                format!("vendored directory {} only provides version {}", self.path.display(), self.version),
            ));
        }

        let is_archive = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        let (location, filename) = if is_archive {
            let name = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (PackageLocation::LocalArchive(self.path.clone()), name)
        } else {
            (PackageLocation::LocalDir(self.path.clone()), String::new())
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
        format!("vendored {} {} at {}", self.provider, self.version, self.path.display())
    }
}
