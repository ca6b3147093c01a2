//! Package hashes and the schemes that compute them.
//!
//! A hash string is self-describing: `scheme:value`. Two schemes are
//! understood:
//!
//! - `h1:` covers the *contents* of a package. Every regular file is hashed
//!   with SHA-256, the lines `"<hex>  <path>\n"` are concatenated in path
//!   order, and the result is SHA-256 hashed again and base64 encoded. It can
//!   be computed from an unpacked directory or straight from a zip archive
//!   and gives the same answer for both.
//! - `zh:` is the lowercase hex SHA-256 of the whole zip archive.
//!
//! Hashes with any other scheme parse fine, so newer lock files still load,
//! but they never match anything.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{HashError, ParseError};

/// Hash algorithm named by a hash string's prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashScheme {
    /// `h1:` content hash over the unpacked files.
    H1,
    /// `zh:` SHA-256 of the zip archive.
    Zip,
    /// Any prefix this version does not understand.
    Unknown(String),
}

impl HashScheme {
    /// Prefix including the trailing colon.
    pub fn prefix(&self) -> &str {
        match self {
            Self::H1 => "h1:",
            Self::Zip => "zh:",
            Self::Unknown(p) => p,
        }
    }

    /// Build a hash of this scheme from its value part.
    pub fn make(&self, value: &str) -> Hash {
        Hash(format!("{}{value}", self.prefix()))
    }
}

/// A `scheme:value` hash string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash(String);

impl Hash {
    /// Validate a hash string.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Hash`] if there is no `scheme:` prefix or the
    /// value after it is empty.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        match s.split_once(':') {
            Some((scheme, value))
                if !scheme.is_empty()
                    && !value.is_empty()
                    && scheme.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                Ok(Self(s.to_string()))
            }
            _ => Err(ParseError::Hash(s.to_string())),
        }
    }

    /// `zh:` hash from an OCI `sha256:<hex>` digest.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Hash`] if the digest is not `sha256:` followed
    /// by exactly 64 hex characters.
    pub fn from_oci_digest(digest: &str) -> Result<Self, ParseError> {
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| ParseError::Hash(digest.to_string()))?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::Hash(digest.to_string()));
        }
        Ok(HashScheme::Zip.make(&hex.to_ascii_lowercase()))
    }

    /// The scheme named by the prefix.
    pub fn scheme(&self) -> HashScheme {
        match self.0.split_once(':') {
            Some(("h1", _)) => HashScheme::H1,
            Some(("zh", _)) => HashScheme::Zip,
            Some((other, _)) => HashScheme::Unknown(format!("{other}:")),
            None => HashScheme::Unknown(String::new()),
        }
    }

    /// The part after the scheme prefix.
    pub fn value(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, v)| v)
    }

    /// Full `scheme:value` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Hash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Hash {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Hash> for String {
    fn from(h: Hash) -> Self {
        h.0
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn sha256_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Combine `(path, sha256-hex)` pairs into an `h1:` hash.
fn hash1(mut files: Vec<(String, String)>) -> Result<Hash, HashError> {
    files.sort();
    let mut summary = Sha256::new();
    for (path, digest) in &files {
        if path.contains('\n') {
            return Err(HashError::FileName(path.clone()));
        }
        summary.update(format!("{digest}  {path}\n").as_bytes());
    }
    Ok(HashScheme::H1.make(&BASE64.encode(summary.finalize())))
}

/// `h1:` hash of an unpacked package directory.
///
/// Symlinks are followed and hashed as their targets, so a package hashes
/// the same before and after it is copied into a cache. Directories
/// themselves do not count.
///
/// # Errors
///
/// Returns [`HashError`] if the directory cannot be walked or a file read.
pub fn hash_v1_dir(dir: &Path) -> Result<Hash, HashError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| HashError::FileName(entry.path().display().to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let digest = sha256_reader(File::open(entry.path())?)?;
        files.push((rel, digest));
    }
    hash1(files)
}

/// `h1:` hash of a zip archive's contents, without unpacking it.
///
/// # Errors
///
/// Returns [`HashError`] if the archive cannot be opened or read.
pub fn hash_v1_zip(archive: &Path) -> Result<Hash, HashError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut files = Vec::new();
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let digest = sha256_reader(entry)?;
        files.push((name, digest));
    }
    hash1(files)
}

/// `zh:` hash of a zip archive file.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn hash_zip_file(archive: &Path) -> io::Result<Hash> {
    let digest = sha256_reader(File::open(archive)?)?;
    Ok(HashScheme::Zip.make(&digest))
}

/// `zh:` hash from a SHA-256 hex digest computed elsewhere (e.g. while streaming a download).
pub fn zip_hash_from_hex(digest_hex: &str) -> Hash {
    HashScheme::Zip.make(&digest_hex.to_ascii_lowercase())
}
