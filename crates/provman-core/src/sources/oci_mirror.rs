//! OCI Distribution registry mirror.
//!
//! Each provider is one repository; each version is a tag pointing at an
//! image index whose entries are per-platform image manifests. The package
//! itself is the single zip layer of the selected manifest, and its blob
//! digest is the package's `zh:` hash.
//!
//! Only the read verbs of the Distribution API are used: tag listing with
//! `n`/`last` pagination, manifest GET by tag or digest, and blob GET.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use provman_schema::{Hash, Platform, ProviderAddress, Version};
use reqwest::Url;
use reqwest::header::LINK;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::{PackageLocation, PackageMeta, Source, join_url};
use crate::error::{Error, Result};
use crate::http::{Fetched, HttpClient, HttpError};

pub const INDEX_ARTIFACT_TYPE: &str = "application/vnd.opentofu.provider";
pub const TARGET_ARTIFACT_TYPE: &str = "application/vnd.opentofu.provider-target";
pub const PACKAGE_ARTIFACT_TYPE: &str = "application/vnd.opentofu.providerpkg";
pub const PACKAGE_MEDIA_TYPE: &str = "archive/zip";
pub const IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Default repository name for a provider.
pub const DEFAULT_REPOSITORY_TEMPLATE: &str = "${namespace}/opentofu-provider-${type}";

const MANIFEST_SIZE_LIMIT: u64 = 4 * 1024 * 1024;
const DEFAULT_PAGE_SIZE: usize = 100;
const DIGEST_HEADER: &str = "docker-content-digest";

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: String,
    digest: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    platform: Option<OciPlatform>,
}

#[derive(Debug, Clone, Deserialize)]
struct OciPlatform {
    os: String,
    architecture: String,
    #[serde(rename = "os.version", default)]
    os_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OciMirrorSource {
    registry: Url,
    template: String,
    api: HttpClient,
    downloads: HttpClient,
    page_size: usize,
}

impl OciMirrorSource {
    /// `registry` is the registry base URL, ending in `/`.
    pub fn new(registry: Url, api: HttpClient, downloads: HttpClient) -> Self {
        Self {
            registry,
            template: DEFAULT_REPOSITORY_TEMPLATE.to_string(),
            api,
            downloads,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Repository template using `${hostname}`, `${namespace}` and `${type}`.
    pub fn with_repository_template(mut self, template: &str) -> Self {
        self.template = template.to_string();
        self
    }

    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n.max(1);
        self
    }

    /// Repository name for `provider`.
    pub fn repository(&self, provider: &ProviderAddress) -> String {
        self.template
            .replace("${hostname}", provider.hostname())
            .replace("${namespace}", provider.namespace())
            .replace("${type}", provider.type_name())
    }

    fn repo_url(&self, provider: &ProviderAddress, rest: &str) -> Result<Url> {
        join_url(
            &self.registry,
            &format!("v2/{}/{rest}", self.repository(provider)),
        )
    }

    async fn tags(&self, provider: &ProviderAddress) -> Result<Vec<String>> {
        let mut all = Vec::new();
        let mut seen = HashSet::new();
        let mut last: Option<String> = None;

        loop {
            let mut url = self.repo_url(provider, "tags/list")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("n", &self.page_size.to_string());
                if let Some(last) = &last {
                    query.append_pair("last", last);
                }
            }
            let fetched = self
                .api
                .fetch(&url, Some("application/json"), None)
                .await
                .map_err(|e| match e {
                    HttpError::NotFound { .. } => Error::not_found(
                        provider,
                        format!("repository {} does not exist", self.repository(provider)),
                    ),
                    other => other.for_provider(provider),
                })?;
            let page: TagList = decode(&url, &fetched.body)?;
            let tags = page.tags.unwrap_or_default();
            trace!(%url, count = tags.len(), "listed tags page");

            let mut fresh = 0;
            for tag in &tags {
                if seen.insert(tag.clone()) {
                    all.push(tag.clone());
                    fresh += 1;
                }
            }
            let more = fetched.headers.contains_key(LINK) || tags.len() >= self.page_size;
            if fresh == 0 || !more {
                break;
            }
            last = tags.last().cloned();
        }

        Ok(all)
    }

    /// GET a manifest and check its bytes against `expected` (or the
    /// registry's digest header when fetching by tag).
    async fn manifest(
        &self,
        provider: &ProviderAddress,
        reference: &str,
        expected: Option<&str>,
    ) -> Result<(Manifest, Url)> {
        let url = self.repo_url(provider, &format!("manifests/{reference}"))?;
        let accept = format!("{IMAGE_INDEX_MEDIA_TYPE}, {IMAGE_MANIFEST_MEDIA_TYPE}");
        let fetched: Fetched = self
            .api
            .fetch(&url, Some(&accept), Some(MANIFEST_SIZE_LIMIT))
            .await
            .map_err(|e| match e {
                HttpError::NotFound { .. } => Error::not_found(
                    provider,
                    format!("{reference} is not published in {}", self.repository(provider)),
                ),
                other => other.for_provider(provider),
            })?;

        let header = fetched
            .headers
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(want) = expected.map(str::to_string).or(header) {
            if let Some(want_hex) = want.strip_prefix("sha256:") {
                let got = hex::encode(Sha256::digest(&fetched.body));
                if !got.eq_ignore_ascii_case(want_hex) {
                    return Err(Error::malformed(
                        &url,
                        format!("manifest content does not match digest {want}"),
                    ));
                }
            }
        }

        let manifest = decode(&url, &fetched.body)?;
        Ok((manifest, url))
    }
}

fn decode<T: DeserializeOwned>(url: &Url, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::malformed(url, e))
}

/// Pick the one image manifest for `platform` out of an index.
fn select_image_manifest<'a>(
    provider: &ProviderAddress,
    version: &Version,
    platform: &Platform,
    descs: &'a [Descriptor],
    location: &Url,
) -> Result<&'a Descriptor> {
    let mut selected = Vec::new();
    let mut wrong_artifact = None;
    let mut wrong_platform = 0;

    for desc in descs {
        match desc.artifact_type.as_deref() {
            Some(TARGET_ARTIFACT_TYPE) => {}
            Some(other) => {
                wrong_artifact = Some(other.to_string());
                continue;
            }
            None => continue,
        }
        if desc.media_type != IMAGE_MANIFEST_MEDIA_TYPE {
            return Err(Error::malformed(
                location,
                format!("provider image manifest has unsupported media type {:?}", desc.media_type),
            ));
        }
        let Some(p) = &desc.platform else {
            return Err(Error::malformed(
                location,
                "provider image manifest lacks the required platform constraints",
            ));
        };
        let os_version_set = p.os_version.as_deref().is_some_and(|v| !v.is_empty());
        if os_version_set || p.os != platform.os() || p.architecture != platform.arch() {
            wrong_platform += 1;
            continue;
        }
        selected.push(desc);
    }

    match selected.as_slice() {
        [one] => Ok(*one),
        [] if wrong_platform > 0 => Err(Error::not_found(
            provider,
            format!("version {version} has no package for platform {platform}"),
        )),
        [] => Err(Error::malformed(
            location,
            match wrong_artifact {
                Some(t) => format!("provider image manifest has unsupported artifact type {t:?}"),
                None => "index has no provider manifests; is this a container image rather than a provider?".to_string(),
            },
        )),
        _ => Err(Error::malformed(
            location,
            format!("ambiguous index has multiple manifests for platform {platform}"),
        )),
    }
}

/// Pick the one provider package layer out of an image manifest.
fn select_package_layer<'a>(layers: &'a [Descriptor], location: &Url) -> Result<&'a Descriptor> {
    let candidates: Vec<&Descriptor> = layers
        .iter()
        .filter(|d| d.artifact_type.as_deref() == Some(PACKAGE_ARTIFACT_TYPE))
        .collect();
    let zips: Vec<&Descriptor> = candidates
        .iter()
        .copied()
        .filter(|d| d.media_type == PACKAGE_MEDIA_TYPE)
        .collect();

    match zips.as_slice() {
        [one] => Ok(*one),
        [] if !candidates.is_empty() => Err(Error::malformed(
            location,
            format!("image manifest has no {PACKAGE_MEDIA_TYPE} package layer, only other formats"),
        )),
        [] => Err(Error::malformed(
            location,
            format!("image manifest has no {PACKAGE_ARTIFACT_TYPE:?} layer"),
        )),
        _ => Err(Error::malformed(
            location,
            "ambiguous manifest declares multiple provider packages",
        )),
    }
}

#[async_trait]
impl Source for OciMirrorSource {
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
        let tags = self.tags(provider).await?;
        let versions: BTreeSet<Version> = tags
            .iter()
            .filter_map(|tag| Version::parse(&tag.replace('_', "+")).ok())
            .collect();
        debug!(%provider, repository = %self.repository(provider), count = versions.len(), "listed OCI versions");
        Ok(versions.into_iter().collect())
    }

    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta> {
        let tag = version.to_string().replace('+', "_");
        let (index, index_url) = self.manifest(provider, &tag, None).await?;

        if index.artifact_type.as_deref() != Some(INDEX_ARTIFACT_TYPE) {
            return Err(Error::malformed(
                &index_url,
                format!(
                    "unsupported artifact type {:?}, expected {INDEX_ARTIFACT_TYPE:?}",
                    index.artifact_type.unwrap_or_default()
                ),
            ));
        }
        if index.media_type.as_deref() != Some(IMAGE_INDEX_MEDIA_TYPE) {
            return Err(Error::malformed(
                &index_url,
                format!(
                    "unsupported media type {:?} for an index manifest",
                    index.media_type.unwrap_or_default()
                ),
            ));
        }

        let target = select_image_manifest(provider, version, platform, &index.manifests, &index_url)?;
        if target.size > MANIFEST_SIZE_LIMIT {
            return Err(Error::malformed(
                &index_url,
                format!("manifest of {} bytes exceeds the 4 MiB limit", target.size),
            ));
        }
        let (image, image_url) = self
            .manifest(provider, &target.digest, Some(&target.digest))
            .await?;
        if image.media_type.as_deref() != Some(IMAGE_MANIFEST_MEDIA_TYPE)
            || image.artifact_type.as_deref() != Some(TARGET_ARTIFACT_TYPE)
        {
            return Err(Error::malformed(
                &image_url,
                "image manifest type does not match its index entry",
            ));
        }

        let layer = select_package_layer(&image.layers, &image_url)?;
        let digest = Hash::from_oci_digest(&layer.digest).map_err(|e| Error::malformed(&image_url, e))?;
        let blob_url = self.repo_url(provider, &format!("blobs/{}", layer.digest))?;

        Ok(PackageMeta {
            provider: provider.clone(),
            version: version.clone(),
            platform: platform.clone(),
            filename: format!("{}_{version}_{platform}.zip", provider.executable_prefix()),
            location: PackageLocation::OciBlob {
                url: blob_url,
                digest: digest.clone(),
                client: self.downloads.clone(),
            },
            declared_hashes: BTreeSet::from([digest]),
        })
    }

    fn describe(&self) -> String {
        format!("OCI mirror {}", self.registry)
    }
}
