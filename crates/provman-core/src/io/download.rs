//! Package retrieval into a staging directory.
//!
//! Remote archives are streamed to disk while their SHA-256 is computed, so
//! the `zh:` hash is known without reading the file a second time. Local
//! packages are used in place.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use provman_schema::Hash;
use provman_schema::hash::{hash_zip_file, zip_hash_from_hex};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::blocking;
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpError};
use crate::sources::{PackageLocation, PackageMeta};

/// A package ready to be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedPackage {
    /// A zip archive and its `zh:` hash.
    Archive { path: PathBuf, zip_hash: Hash },
    /// An already unpacked package directory.
    Directory(PathBuf),
}

impl FetchedPackage {
    /// `zh:` hash, for archives.
    pub fn zip_hash(&self) -> Option<&Hash> {
        match self {
            Self::Archive { zip_hash, .. } => Some(zip_hash),
            Self::Directory(_) => None,
        }
    }
}

/// Stream `url` into `dest`, returning the archive's `zh:` hash.
///
/// Each retry truncates `dest` and starts over.
///
/// # Errors
///
/// See [`HttpClient::retrying`].
pub async fn download_archive(
    client: &HttpClient,
    url: &Url,
    dest: &Path,
) -> std::result::Result<Hash, HttpError> {
    client
        .retrying(url, move || async move {
            let resp = client.send_once(url, None).await?;
            let mut file = tokio::fs::File::create(dest).await?;
            let mut hasher = Sha256::new();
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| HttpError::Unreachable {
                    url: url.to_string(),
                    detail: format!("reading response body: {e}"),
                })?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(zip_hash_from_hex(&hex::encode(hasher.finalize())))
        })
        .await
}

/// Retrieve the package described by `meta` into `staging`.
///
/// # Errors
///
/// - Network failures as reported by the package's client
/// - [`Error::TamperedPackage`] if an OCI blob does not match its digest
/// - [`Error::NotFound`] if a local package path does not exist
pub async fn fetch_package(meta: &PackageMeta, staging: &Path) -> Result<FetchedPackage> {
    match &meta.location {
        PackageLocation::Http { url, client } => {
            let dest = staging.join(archive_file_name(&meta.filename));
            debug!(%url, dest = %dest.display(), "downloading package");
            let zip_hash = download_archive(client, url, &dest)
                .await
                .map_err(|e| e.for_provider(&meta.provider))?;
            Ok(FetchedPackage::Archive {
                path: dest,
                zip_hash,
            })
        }
        PackageLocation::OciBlob {
            url,
            digest,
            client,
        } => {
            let dest = staging.join(archive_file_name(&meta.filename));
            debug!(%url, %digest, "downloading blob");
            let zip_hash = download_archive(client, url, &dest)
                .await
                .map_err(|e| e.for_provider(&meta.provider))?;
            if zip_hash != *digest {
                return Err(Error::TamperedPackage {
                    provider: meta.provider.clone(),
                    version: meta.version.clone(),
                    path: dest,
                    detail: format!("blob has digest {zip_hash}, manifest declared {digest}"),
                });
            }
            Ok(FetchedPackage::Archive {
                path: dest,
                zip_hash,
            })
        }
        PackageLocation::LocalArchive(path) => {
            if !path.is_file() {
                return Err(Error::not_found(
                    &meta.provider,
                    format!("package archive {} does not exist", path.display()),
                ));
            }
            let archive = path.clone();
            let zip_hash = blocking(move || Ok(hash_zip_file(&archive)?)).await?;
            Ok(FetchedPackage::Archive {
                path: path.clone(),
                zip_hash,
            })
        }
        PackageLocation::LocalDir(path) => {
            if !path.is_dir() {
                return Err(Error::not_found(
                    &meta.provider,
                    format!("package directory {} does not exist", path.display()),
                ));
            }
            Ok(FetchedPackage::Directory(path.clone()))
        }
    }
}

/// Final path component of a server-supplied file name.
fn archive_file_name(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("package.zip")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RetryPolicy;
    use mockito::Server;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn client(retries: u32) -> HttpClient {
        HttpClient::for_downloads(
            Duration::from_secs(5),
            RetryPolicy::from_retries(retries).without_delay(),
        )
        .unwrap()
    }

    fn meta(location: PackageLocation) -> PackageMeta {
        PackageMeta {
            provider: "hashicorp/null".parse().unwrap(),
            version: "3.2.0".parse().unwrap(),
            platform: "linux_amd64".parse().unwrap(),
            filename: "terraform-provider-null_3.2.0_linux_amd64.zip".into(),
            location,
            declared_hashes: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn download_hashes_while_streaming() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/pkg.zip")
            .with_status(200)
            .with_body("archive bytes")
            .create_async()
            .await;
        let tmp = TempDir::new().unwrap();
        let url = Url::parse(&format!("{}/pkg.zip", server.url())).unwrap();

        let fetched = fetch_package(
            &meta(PackageLocation::Http {
                url,
                client: client(0),
            }),
            tmp.path(),
        )
        .await
        .unwrap();

        let expected = zip_hash_from_hex(&hex::encode(Sha256::digest(b"archive bytes")));
        let FetchedPackage::Archive { path, zip_hash } = fetched else {
            panic!("expected an archive");
        };
        assert_eq!(zip_hash, expected);
        assert_eq!(std::fs::read(path).unwrap(), b"archive bytes");
    }

    #[tokio::test]
    async fn download_retries_server_errors() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/pkg.zip")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;
        let tmp = TempDir::new().unwrap();
        let url = Url::parse(&format!("{}/pkg.zip", server.url())).unwrap();

        let err = fetch_package(
            &meta(PackageLocation::Http {
                url,
                client: client(2),
            }),
            tmp.path(),
        )
        .await
        .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, Error::ExhaustedRetries { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn oci_blob_digest_is_checked() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/blob")
            .with_status(200)
            .with_body("tampered")
            .create_async()
            .await;
        let tmp = TempDir::new().unwrap();
        let url = Url::parse(&format!("{}/v2/blob", server.url())).unwrap();
        let digest = zip_hash_from_hex(&hex::encode(Sha256::digest(b"original")));

        let err = fetch_package(
            &meta(PackageLocation::OciBlob {
                url,
                digest,
                client: client(0),
            }),
            tmp.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TamperedPackage { .. }));
    }

    #[tokio::test]
    async fn missing_local_package_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = fetch_package(
            &meta(PackageLocation::LocalDir(tmp.path().join("nope"))),
            tmp.path(),
        )
        .await
        .unwrap_err();
        assert!(err.falls_through());
    }

    #[test]
    fn server_file_names_cannot_escape_staging() {
        assert_eq!(archive_file_name("../../etc/passwd"), "passwd");
        assert_eq!(archive_file_name("pkg.zip"), "pkg.zip");
        assert_eq!(archive_file_name(".."), "package.zip");
    }
}
