//! Origin registry client.
//!
//! Each provider hostname is asked where its provider registry API lives
//! (`/.well-known/terraform.json`, key `providers.v1`). Discovery results
//! and version lists are memoized on the source value, so one run queries
//! each host and provider at most once and separate runs share nothing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use provman_schema::hash::zip_hash_from_hex;
use provman_schema::{Hash, Platform, ProviderAddress, Version};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{PackageLocation, PackageMeta, Source, join_url};
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpError};

/// Plugin protocol major versions this program can run.
const SUPPORTED_PROTOCOL_MAJORS: [u64; 2] = [5, 6];

/// Upper bound on a checksums document.
const SHASUMS_LIMIT: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    #[serde(rename = "providers.v1")]
    providers_v1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    #[serde(default)]
    versions: Vec<VersionEntry>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VersionEntry {
    version: String,
    #[serde(default)]
    protocols: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    #[serde(default)]
    protocols: Vec<String>,
    os: String,
    arch: String,
    filename: String,
    download_url: String,
    shasum: String,
    #[serde(default)]
    shasums_url: Option<String>,
}

#[derive(Debug, Clone)]
struct RegistryVersion {
    version: Version,
    protocols: Vec<String>,
}

/// Client for each provider's origin registry.
#[derive(Debug)]
pub struct RegistrySource {
    api: HttpClient,
    downloads: HttpClient,
    scheme: &'static str,
    services: Mutex<HashMap<String, Url>>,
    versions: Mutex<HashMap<ProviderAddress, Arc<Vec<RegistryVersion>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RegistrySource {
    /// `api` serves discovery and metadata requests, `downloads` package archives.
    pub fn new(api: HttpClient, downloads: HttpClient) -> Self {
        Self {
            api,
            downloads,
            scheme: "https",
            services: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Run service discovery over plain HTTP. Only for local test registries.
    pub fn with_insecure_discovery(mut self) -> Self {
        self.scheme = "http";
        self
    }

    /// Skip discovery for `hostname` and use `base` as its provider API.
    pub fn with_service_override(self, hostname: &str, base: Url) -> Self {
        lock(&self.services).insert(hostname.to_ascii_lowercase(), base);
        self
    }

    async fn providers_base(&self, provider: &ProviderAddress) -> Result<Url> {
        let host = provider.hostname();
        let known = lock(&self.services).get(host).cloned();
        if let Some(base) = known {
            return Ok(base);
        }

        let discovery = Url::parse(&format!("{}://{host}/.well-known/terraform.json", self.scheme))
            .map_err(|e| Error::Config(format!("invalid registry host {host:?}: {e}")))?;
        debug!(%host, "discovering provider registry");
        let (doc, final_url): (DiscoveryDocument, Url) = self
            .api
            .fetch_json(&discovery)
            .await
            .map_err(|e| e.for_provider(provider))?;
        let raw = doc.providers_v1.ok_or_else(|| {
            Error::not_found(provider, format!("host {host} does not offer a provider registry"))
        })?;
        let raw = if raw.ends_with('/') { raw } else { format!("{raw}/") };
        let base = join_url(&final_url, &raw)?;

        lock(&self.services).insert(host.to_string(), base.clone());
        Ok(base)
    }

    async fn versions(&self, provider: &ProviderAddress) -> Result<Arc<Vec<RegistryVersion>>> {
        let known = lock(&self.versions).get(provider).cloned();
        if let Some(found) = known {
            return Ok(found);
        }

        let base = self.providers_base(provider).await?;
        let url = join_url(
            &base,
            &format!("{}/{}/versions", provider.namespace(), provider.type_name()),
        )?;
        let (resp, _): (VersionsResponse, Url) = self.api.fetch_json(&url).await.map_err(|e| match e {
            HttpError::NotFound { .. } => Error::not_found(provider, "provider is not known to its registry"),
            other => other.for_provider(provider),
        })?;

        for warning in &resp.warnings {
            warn!(%provider, "registry warning: {warning}");
        }

        let mut versions = Vec::with_capacity(resp.versions.len());
        for entry in resp.versions {
            match Version::parse(&entry.version) {
                Ok(version) => versions.push(RegistryVersion {
                    version,
                    protocols: entry.protocols,
                }),
                Err(e) => warn!(%provider, error = %e, "ignoring invalid version from registry"),
            }
        }

        let versions = Arc::new(versions);
        lock(&self.versions).insert(provider.clone(), Arc::clone(&versions));
        Ok(versions)
    }

    async fn checksums(&self, provider: &ProviderAddress, url: &Url) -> Result<HashMap<String, String>> {
        let fetched = self
            .api
            .fetch(url, None, Some(SHASUMS_LIMIT))
            .await
            .map_err(|e| e.for_provider(provider))?;
        let text = String::from_utf8(fetched.body)
            .map_err(|_| Error::malformed(url, "checksums document is not UTF-8"))?;
        parse_shasums(&text).map_err(|detail| Error::malformed(url, detail))
    }
}

/// True when a release can be run by this program. Releases that list no
/// protocols predate the field and are accepted.
fn protocols_supported(protocols: &[String]) -> bool {
    protocols.is_empty()
        || protocols.iter().any(|p| {
            p.split('.')
                .next()
                .and_then(|major| major.trim().parse::<u64>().ok())
                .is_some_and(|major| SUPPORTED_PROTOCOL_MAJORS.contains(&major))
        })
}

/// Parse `<sha256-hex>  <filename>` lines.
fn parse_shasums(text: &str) -> std::result::Result<HashMap<String, String>, String> {
    let mut sums = HashMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(sum), Some(name), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(format!("invalid checksums line {line:?}"));
        };
        if !is_sha256_hex(sum) {
            return Err(format!("invalid checksum {sum:?} for {name}"));
        }
        sums.insert(name.to_string(), sum.to_ascii_lowercase());
    }
    Ok(sums)
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn http_url(base: &Url, raw: &str, what: &str) -> Result<Url> {
    let url = join_url(base, raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::malformed(
            base,
            format!("{what} {url} must use http or https"),
        ));
    }
    Ok(url)
}

#[async_trait]
impl Source for RegistrySource {
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
        let versions = self.versions(provider).await?;
        Ok(versions
            .iter()
            .filter(|v| {
                let ok = protocols_supported(&v.protocols);
                if !ok {
                    debug!(%provider, version = %v.version, protocols = ?v.protocols, "skipping release with unsupported protocols");
                }
                ok
            })
            .map(|v| v.version.clone())
            .collect())
    }

    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta> {
        let base = self.providers_base(provider).await?;
        let url = join_url(
            &base,
            &format!(
                "{}/{}/{version}/download/{}/{}",
                provider.namespace(),
                provider.type_name(),
                platform.os(),
                platform.arch()
            ),
        )?;
        let (resp, final_url): (DownloadResponse, Url) =
            self.api.fetch_json(&url).await.map_err(|e| match e {
                HttpError::NotFound { .. } => Error::not_found(
                    provider,
                    format!("version {version} has no package for platform {platform}"),
                ),
                other => other.for_provider(provider),
            })?;

        if !protocols_supported(&resp.protocols) {
            return Err(Error::not_found(
                provider,
                format!(
                    "version {version} implements plugin protocol(s) {} but only major versions 5 and 6 are supported",
                    resp.protocols.join(", ")
                ),
            ));
        }
        if resp.os != platform.os() || resp.arch != platform.arch() {
            return Err(Error::malformed(
                &url,
                format!(
                    "response for {platform} describes a package for {}_{}",
                    resp.os, resp.arch
                ),
            ));
        }
        if !is_sha256_hex(&resp.shasum) {
            return Err(Error::malformed(
                &url,
                format!("invalid SHA-256 checksum {:?}", resp.shasum),
            ));
        }
        let shasum = resp.shasum.to_ascii_lowercase();
        let download = http_url(&final_url, &resp.download_url, "download URL")?;

        let mut declared: BTreeSet<Hash> = BTreeSet::new();
        declared.insert(zip_hash_from_hex(&shasum));
        if let Some(raw) = resp.shasums_url.as_deref().filter(|s| !s.is_empty()) {
            let shasums_url = http_url(&final_url, raw, "checksums URL")?;
            let sums = self.checksums(provider, &shasums_url).await?;
            match sums.get(&resp.filename) {
                Some(listed) if *listed == shasum => {}
                Some(listed) => {
                    return Err(Error::malformed(
                        &shasums_url,
                        format!(
                            "checksum {listed} for {} disagrees with the registry's {shasum}",
                            resp.filename
                        ),
                    ));
                }
                None => {
                    return Err(Error::malformed(
                        &shasums_url,
                        format!("no checksum listed for {}", resp.filename),
                    ));
                }
            }
            declared.extend(
                sums.iter()
                    .filter(|(name, _)| name.ends_with(".zip"))
                    .map(|(_, sum)| zip_hash_from_hex(sum)),
            );
        }

        Ok(PackageMeta {
            provider: provider.clone(),
            version: version.clone(),
            platform: platform.clone(),
            filename: resp.filename,
            location: PackageLocation::Http {
                url: download,
                client: self.downloads.clone(),
            },
            declared_hashes: declared,
        })
    }

    fn describe(&self) -> String {
        "provider registries".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RetryPolicy;
    use mockito::{Server, ServerGuard};
    use std::time::Duration;

    const SUM_LINUX: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const SUM_DARWIN: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    fn client(retries: u32) -> HttpClient {
        HttpClient::new(
            Duration::from_secs(5),
            RetryPolicy::from_retries(retries).without_delay(),
        )
        .unwrap()
    }

    fn source() -> RegistrySource {
        RegistrySource::new(client(0), client(0)).with_insecure_discovery()
    }

    /// Provider address served by the mock registry.
    fn addr(server: &ServerGuard, name: &str) -> ProviderAddress {
        format!("{}/hashicorp/{name}", server.host_with_port())
            .parse()
            .unwrap()
    }

    async fn discovery(server: &mut ServerGuard) -> mockito::Mock {
        server
            .mock("GET", "/.well-known/terraform.json")
            .with_status(200)
            .with_body(r#"{"providers.v1": "/v1/providers/"}"#)
            .expect(1)
            .create_async()
            .await
    }

    #[test]
    fn protocol_support() {
        assert!(protocols_supported(&[]));
        assert!(protocols_supported(&["5.0".into()]));
        assert!(protocols_supported(&["4.0".into(), "6.1".into()]));
        assert!(!protocols_supported(&["4.0".into()]));
    }

    #[test]
    fn shasums_parse() {
        let text = format!("{SUM_LINUX}  a_linux_amd64.zip\n{SUM_DARWIN}  a_darwin_arm64.zip\n");
        let sums = parse_shasums(&text).unwrap();
        assert_eq!(sums["a_linux_amd64.zip"], SUM_LINUX);
        assert!(parse_shasums("nothex  a.zip").is_err());
    }

    #[tokio::test]
    async fn discovery_and_versions_are_memoized() {
        let mut server = Server::new_async().await;
        let disco = discovery(&mut server).await;
        let versions = server
            .mock("GET", "/v1/providers/hashicorp/null/versions")
            .with_status(200)
            .with_body(
                r#"{"versions": [
                    {"version": "3.1.0", "protocols": ["5.0"]},
                    {"version": "3.2.0", "protocols": ["5.0", "6.0"]},
                    {"version": "0.1.0", "protocols": ["4.0"]},
                    {"version": "garbage"}
                ]}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let source = source();
        let null = addr(&server, "null");
        let first = source.list_versions(&null).await.unwrap();
        let second = source.list_versions(&null).await.unwrap();

        disco.assert_async().await;
        versions.assert_async().await;
        assert_eq!(first, second);
        let listed: Vec<String> = first.iter().map(ToString::to_string).collect();
        assert_eq!(listed, vec!["3.1.0", "3.2.0"]);
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let mut server = Server::new_async().await;
        discovery(&mut server).await;
        server
            .mock("GET", "/v1/providers/hashicorp/nope/versions")
            .with_status(404)
            .create_async()
            .await;

        let err = source()
            .list_versions(&addr(&server, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn package_meta_collects_declared_hashes() {
        let mut server = Server::new_async().await;
        discovery(&mut server).await;
        server
            .mock("GET", "/v1/providers/hashicorp/null/3.2.0/download/linux/amd64")
            .with_status(200)
            .with_body(format!(
                r#"{{"protocols": ["5.0"], "os": "linux", "arch": "amd64",
                    "filename": "null_3.2.0_linux_amd64.zip",
                    "download_url": "/files/null_3.2.0_linux_amd64.zip",
                    "shasum": "{SUM_LINUX}",
                    "shasums_url": "/files/null_3.2.0_SHA256SUMS"}}"#
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/files/null_3.2.0_SHA256SUMS")
            .with_status(200)
            .with_body(format!(
                "{SUM_LINUX}  null_3.2.0_linux_amd64.zip\n{SUM_DARWIN}  null_3.2.0_darwin_arm64.zip\n"
            ))
            .create_async()
            .await;

        let meta = source()
            .package_meta(
                &addr(&server, "null"),
                &"3.2.0".parse().unwrap(),
                &"linux_amd64".parse().unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(meta.filename, "null_3.2.0_linux_amd64.zip");
        assert!(meta.declared_hashes.contains(&zip_hash_from_hex(SUM_LINUX)));
        assert!(meta.declared_hashes.contains(&zip_hash_from_hex(SUM_DARWIN)));
        let PackageLocation::Http { url, .. } = &meta.location else {
            panic!("expected an HTTP location");
        };
        assert!(url.as_str().ends_with("/files/null_3.2.0_linux_amd64.zip"));
    }

    #[tokio::test]
    async fn checksum_disagreement_is_malformed() {
        let mut server = Server::new_async().await;
        discovery(&mut server).await;
        server
            .mock("GET", "/v1/providers/hashicorp/null/3.2.0/download/linux/amd64")
            .with_status(200)
            .with_body(format!(
                r#"{{"os": "linux", "arch": "amd64", "filename": "n.zip",
                    "download_url": "/n.zip", "shasum": "{SUM_LINUX}",
                    "shasums_url": "/sums"}}"#
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/sums")
            .with_status(200)
            .with_body(format!("{SUM_DARWIN}  n.zip\n"))
            .create_async()
            .await;

        let err = source()
            .package_meta(
                &addr(&server, "null"),
                &"3.2.0".parse().unwrap(),
                &"linux_amd64".parse().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[tokio::test]
    async fn unsupported_protocol_is_not_found() {
        let mut server = Server::new_async().await;
        discovery(&mut server).await;
        server
            .mock("GET", "/v1/providers/hashicorp/old/1.0.0/download/linux/amd64")
            .with_status(200)
            .with_body(format!(
                r#"{{"protocols": ["4.0"], "os": "linux", "arch": "amd64", "filename": "o.zip",
                    "download_url": "/o.zip", "shasum": "{SUM_LINUX}"}}"#
            ))
            .create_async()
            .await;

        let err = source()
            .package_meta(
                &addr(&server, "old"),
                &"1.0.0".parse().unwrap(),
                &"linux_amd64".parse().unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(err.to_string().contains("plugin protocol"));
    }

    #[tokio::test]
    async fn service_override_skips_discovery() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/hashicorp/null/versions")
            .with_status(200)
            .with_body(r#"{"versions": [{"version": "3.2.0"}]}"#)
            .create_async()
            .await;

        let base = Url::parse(&format!("{}/api/", server.url())).unwrap();
        let source = RegistrySource::new(client(0), client(0))
            .with_service_override("registry.opentofu.org", base);
        let versions = source
            .list_versions(&"hashicorp/null".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(versions, vec![Version::parse("3.2.0").unwrap()]);
    }

    #[tokio::test]
    async fn discovery_retries_are_bounded() {
        let mut server = Server::new_async().await;
        let disco = server
            .mock("GET", "/.well-known/terraform.json")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let source = RegistrySource::new(client(1), client(0)).with_insecure_discovery();
        let err = source
            .list_versions(&addr(&server, "null"))
            .await
            .unwrap_err();

        disco.assert_async().await;
        assert!(err.to_string().contains("giving up after 2 attempt(s)"));
    }
}
