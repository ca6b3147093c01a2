//! HTTP network mirror.
//!
//! `GET <base><hostname>/<namespace>/<type>/index.json` lists versions and
//! `GET <base><hostname>/<namespace>/<type>/<version>.json` lists one
//! archive per platform. Archive URLs are relative to the document that
//! names them.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use provman_schema::{Hash, Platform, ProviderAddress, Version};
use reqwest::Url;
use serde::Deserialize;
use tracing::warn;

use super::{PackageLocation, PackageMeta, Source, join_url};
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpError};

#[derive(Debug, Deserialize)]
struct VersionIndex {
    versions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ArchiveIndex {
    archives: BTreeMap<String, ArchiveEntry>,
}

#[derive(Debug, Deserialize)]
struct ArchiveEntry {
    url: String,
    #[serde(default)]
    hashes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkMirrorSource {
    base: Url,
    api: HttpClient,
    downloads: HttpClient,
}

impl NetworkMirrorSource {
    /// `base` must end in `/`; see [`super::parse_base_url`].
    pub fn new(base: Url, api: HttpClient, downloads: HttpClient) -> Self {
        Self {
            base,
            api,
            downloads,
        }
    }

    fn provider_url(&self, provider: &ProviderAddress, file: &str) -> Result<Url> {
        join_url(
            &self.base,
            &format!(
                "{}/{}/{}/{file}",
                provider.hostname(),
                provider.namespace(),
                provider.type_name()
            ),
        )
    }
}

#[async_trait]
impl Source for NetworkMirrorSource {
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
        let url = self.provider_url(provider, "index.json")?;
        let (index, _): (VersionIndex, Url) = self.api.fetch_json(&url).await.map_err(|e| match e {
            HttpError::NotFound { .. } => {
                Error::not_found(provider, format!("not available from network mirror {}", self.base))
            }
            other => other.for_provider(provider),
        })?;

        let mut versions = Vec::with_capacity(index.versions.len());
        for raw in index.versions.keys() {
            match Version::parse(raw) {
                Ok(v) => versions.push(v),
                Err(e) => warn!(%provider, mirror = %self.base, error = %e, "ignoring invalid version"),
            }
        }
        Ok(versions)
    }

    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta> {
        let url = self.provider_url(provider, &format!("{version}.json"))?;
        let (index, final_url): (ArchiveIndex, Url) =
            self.api.fetch_json(&url).await.map_err(|e| match e {
                HttpError::NotFound { .. } => Error::not_found(
                    provider,
                    format!("version {version} not available from network mirror {}", self.base),
                ),
                other => other.for_provider(provider),
            })?;

        let Some(entry) = index.archives.get(&platform.to_string()) else {
            return Err(Error::not_found(
                provider,
                format!("version {version} has no package for platform {platform} in network mirror {}", self.base),
            ));
        };

        let archive = join_url(&final_url, &entry.url)?;
        if archive.scheme() != "http" && archive.scheme() != "https" {
            return Err(Error::malformed(
                &url,
                format!("archive URL {archive} must use http or https"),
            ));
        }

        let declared = entry
            .hashes
            .iter()
            .map(|h| Hash::parse(h).map_err(|e| Error::malformed(&url, e)))
            .collect::<Result<BTreeSet<Hash>>>()?;

        let filename = archive
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map_or_else(
                || format!("{}_{version}_{platform}.zip", provider.executable_prefix()),
                ToString::to_string,
            );

        Ok(PackageMeta {
            provider: provider.clone(),
            version: version.clone(),
            platform: platform.clone(),
            filename,
            location: PackageLocation::Http {
                url: archive,
                client: self.downloads.clone(),
            },
            declared_hashes: declared,
        })
    }

    fn describe(&self) -> String {
        format!("network mirror {}", self.base)
    }
}
