//! Provider sources.
//!
//! A source answers two questions: which versions of a provider exist, and
//! where the package for one version and platform can be fetched from. Five
//! kinds exist (the origin registry, network mirrors, filesystem mirrors, OCI
//! mirrors and vendored directories) and a [`MultiSource`] composes them with
//! include/exclude patterns.
//!
//! The set of kinds is closed, so dispatch goes through [`ProviderSource`]
//! rather than trait objects.

pub mod filesystem_mirror;
pub mod multi;
pub mod network_mirror;
pub mod oci_mirror;
pub mod registry;
pub mod vendored;

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use provman_schema::{Hash, Platform, ProviderAddress, Version};
use reqwest::Url;

pub use filesystem_mirror::FilesystemMirrorSource;
pub use multi::{MultiSource, MultiSourceSelector};
pub use network_mirror::NetworkMirrorSource;
pub use oci_mirror::OciMirrorSource;
pub use registry::RegistrySource;
pub use vendored::VendoredSource;

use crate::config::{Settings, SourceKind};
use crate::error::{Error, Result};
use crate::http::{HttpClient, RetryPolicy};

/// Where a package's bytes live.
#[derive(Debug, Clone)]
pub enum PackageLocation {
    /// Zip archive behind an HTTP URL, fetched with the source's client.
    Http { url: Url, client: HttpClient },
    /// OCI blob whose content must hash to `digest`.
    OciBlob {
        url: Url,
        digest: Hash,
        client: HttpClient,
    },
    /// Zip archive on the local filesystem.
    LocalArchive(PathBuf),
    /// Unpacked package directory on the local filesystem.
    LocalDir(PathBuf),
}

impl PackageLocation {
    /// Human-readable form for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Http { url, .. } | Self::OciBlob { url, .. } => url.to_string(),
            Self::LocalArchive(p) | Self::LocalDir(p) => p.display().to_string(),
        }
    }
}

/// Everything needed to fetch and check one package.
#[derive(Debug, Clone)]
pub struct PackageMeta {
    pub provider: ProviderAddress,
    pub version: Version,
    pub platform: Platform,
    /// Archive file name as published.
    pub filename: String,
    pub location: PackageLocation,
    /// Hashes the source vouches for (checksums documents, OCI digests).
    pub declared_hashes: BTreeSet<Hash>,
}

/// The two questions every source answers.
#[async_trait]
pub trait Source: Send + Sync {
    /// Versions of `provider` this source can supply, in no particular order.
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>>;

    /// Location and declared hashes of one package.
    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// A configured source of any kind.
#[derive(Debug)]
pub enum ProviderSource {
    Registry(RegistrySource),
    NetworkMirror(NetworkMirrorSource),
    FilesystemMirror(FilesystemMirrorSource),
    OciMirror(OciMirrorSource),
    Vendored(VendoredSource),
    Multi(MultiSource),
}

impl ProviderSource {
    /// Build the composite source described by resolved settings.
    ///
    /// Every configured entry becomes one [`MultiSourceSelector`], tried in
    /// configuration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid URLs, patterns or addresses.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api = HttpClient::new(
            settings.request_timeout,
            RetryPolicy::from_retries(settings.discovery_retries),
        )?;

        let mut selectors = Vec::with_capacity(settings.sources.len());
        for resolved in &settings.sources {
            let downloads = HttpClient::for_downloads(
                settings.request_timeout,
                RetryPolicy::from_retries(resolved.download_retries),
            )?;
            let config = &resolved.config;
            let source = match &config.kind {
                SourceKind::Direct => Self::Registry(RegistrySource::new(api.clone(), downloads)),
                SourceKind::NetworkMirror { url } => {
                    let api = api.with_policy(RetryPolicy::from_retries(resolved.download_retries));
                    Self::NetworkMirror(NetworkMirrorSource::new(
                        parse_base_url(url)?,
                        api,
                        downloads,
                    ))
                }
                SourceKind::FilesystemMirror { path } => {
                    Self::FilesystemMirror(FilesystemMirrorSource::new(path.clone()))
                }
                SourceKind::OciMirror {
                    registry,
                    repository_template,
                } => {
                    let api = api.with_policy(RetryPolicy::from_retries(resolved.download_retries));
                    let mut source = OciMirrorSource::new(parse_base_url(registry)?, api, downloads);
                    if let Some(template) = repository_template {
                        source = source.with_repository_template(template);
                    }
                    Self::OciMirror(source)
                }
                SourceKind::Vendored {
                    provider,
                    version,
                    path,
                } => {
                    let provider = provider
                        .parse::<ProviderAddress>()
                        .map_err(|e| Error::Config(e.to_string()))?;
                    let version =
                        Version::parse(version).map_err(|e| Error::Config(e.to_string()))?;
                    Self::Vendored(VendoredSource::new(provider, version, path.clone()))
                }
            };
            selectors.push(MultiSourceSelector::new(
                source,
                &config.include,
                &config.exclude,
            )?);
        }

        Ok(Self::Multi(MultiSource::new(selectors)))
    }
}

#[async_trait]
impl Source for ProviderSource {
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
        match self {
            Self::Registry(s) => s.list_versions(provider).await,
            Self::NetworkMirror(s) => s.list_versions(provider).await,
            Self::FilesystemMirror(s) => s.list_versions(provider).await,
            Self::OciMirror(s) => s.list_versions(provider).await,
            Self::Vendored(s) => s.list_versions(provider).await,
            Self::Multi(s) => s.list_versions(provider).await,
        }
    }

    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta> {
        match self {
            Self::Registry(s) => s.package_meta(provider, version, platform).await,
            Self::NetworkMirror(s) => s.package_meta(provider, version, platform).await,
            Self::FilesystemMirror(s) => s.package_meta(provider, version, platform).await,
            Self::OciMirror(s) => s.package_meta(provider, version, platform).await,
            Self::Vendored(s) => s.package_meta(provider, version, platform).await,
            Self::Multi(s) => s.package_meta(provider, version, platform).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Registry(s) => s.describe(),
            Self::NetworkMirror(s) => s.describe(),
            Self::FilesystemMirror(s) => s.describe(),
            Self::OciMirror(s) => s.describe(),
            Self::Vendored(s) => s.describe(),
            Self::Multi(s) => s.describe(),
        }
    }
}

/// Parse a base URL, making sure relative joins land under it.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&with_slash).map_err(|e| Error::Config(format!("invalid URL {raw:?}: {e}")))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(Error::Config(format!(
            "invalid URL {raw:?}: only http and https are supported"
        )));
    }
    Ok(url)
}

/// Join a path onto a base URL, reporting failures as malformed.
pub(crate) fn join_url(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::malformed(base, format!("cannot resolve {path:?}: {e}")))
}
