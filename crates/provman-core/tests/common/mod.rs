//! Read-only stub registry shared by the integration tests.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::time::Duration;

use mockito::{Mock, Server, ServerGuard};
use provman_core::cache::CacheDir;
use provman_core::http::{HttpClient, RetryPolicy};
use provman_core::sources::RegistrySource;
use provman_schema::{Platform, ProviderAddress};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const PLATFORM: &str = "linux_amd64";

pub fn platform() -> Platform {
    PLATFORM.parse().unwrap()
}

pub fn null() -> ProviderAddress {
    "hashicorp/null".parse().unwrap()
}

/// A provider package: the executable plus a README.
pub fn provider_zip(type_name: &str, version: &str) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(
        format!("terraform-provider-{type_name}_v{version}"),
        SimpleFileOptions::default().unix_permissions(0o755),
    )
    .unwrap();
    zip.write_all(format!("#!/bin/sh\necho {type_name} {version}\n").as_bytes())
        .unwrap();
    zip.start_file("README.md", SimpleFileOptions::default())
        .unwrap();
    zip.write_all(b"stub provider\n").unwrap();
    zip.finish().unwrap().into_inner()
}

/// Server path of the `hashicorp/null` archive for `version`.
pub fn archive_path(version: &str) -> String {
    format!("/files/terraform-provider-null_{version}_{PLATFORM}.zip")
}

/// Mocks for one published release.
pub struct Release {
    pub versions: Mock,
    pub download: Mock,
    pub archive: Mock,
    pub shasum: String,
}

/// A mockito server speaking the registry protocol for `hashicorp/null`.
pub struct StubRegistry {
    pub server: ServerGuard,
}

impl StubRegistry {
    pub async fn start() -> Self {
        Self {
            server: Server::new_async().await,
        }
    }

    /// Publish `hashicorp/null` `version` for linux_amd64.
    ///
    /// Every mock expects exactly one request unless the test says otherwise.
    pub async fn publish(&mut self, version: &str) -> Release {
        let archive_bytes = provider_zip("null", version);
        let (versions, download, shasum) = self.publish_metadata(version, &archive_bytes).await;
        let archive = self
            .server
            .mock("GET", archive_path(version).as_str())
            .with_status(200)
            .with_body(archive_bytes)
            .create_async()
            .await;

        Release {
            versions,
            download,
            archive,
            shasum,
        }
    }

    /// Registry metadata for a release whose archive the test serves itself.
    pub async fn publish_metadata(&mut self, version: &str, archive_bytes: &[u8]) -> (Mock, Mock, String) {
        let shasum = hex::encode(Sha256::digest(archive_bytes));
        let filename = format!("terraform-provider-null_{version}_{PLATFORM}.zip");

        let versions = self
            .server
            .mock("GET", "/v1/providers/hashicorp/null/versions")
            .with_status(200)
            .with_body(format!(
                r#"{{"versions": [{{"version": "{version}", "protocols": ["5.0"],
                    "platforms": [{{"os": "linux", "arch": "amd64"}}]}}]}}"#
            ))
            .create_async()
            .await;
        let download = self
            .server
            .mock(
                "GET",
                format!("/v1/providers/hashicorp/null/{version}/download/linux/amd64").as_str(),
            )
            .with_status(200)
            .with_body(format!(
                r#"{{"protocols": ["5.0"], "os": "linux", "arch": "amd64",
                    "filename": "{filename}",
                    "download_url": "/files/{filename}",
                    "shasum": "{shasum}"}}"#
            ))
            .create_async()
            .await;
        (versions, download, shasum)
    }

    /// A fresh source for one run, as a new process would build it.
    pub fn source(&self, download_retries: u32) -> RegistrySource {
        let timeout = Duration::from_secs(5);
        let api = HttpClient::new(timeout, RetryPolicy::no_retry()).unwrap();
        let downloads = HttpClient::for_downloads(
            timeout,
            RetryPolicy::from_retries(download_retries).without_delay(),
        )
        .unwrap();
        let base = Url::parse(&format!("{}/v1/providers/", self.server.url())).unwrap();
        RegistrySource::new(api, downloads).with_service_override("registry.opentofu.org", base)
    }
}

/// A throwaway working directory.
pub struct Workdir {
    pub temp: TempDir,
}

impl Workdir {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.temp.path().to_path_buf()
    }

    pub fn lock_path(&self) -> PathBuf {
        provman_core::lock_file_path(self.temp.path())
    }

    pub fn cache(&self) -> CacheDir {
        CacheDir::new(provman_core::local_cache_dir(self.temp.path()), platform())
    }
}
