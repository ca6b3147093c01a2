//! Parse and hashing errors for the schema types.

use thiserror::Error;

/// Failure to parse one of the schema value types from its string form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A provider source address was not `[hostname/][namespace/]type`.
    #[error("invalid provider address {input:?}: {reason}")]
    Address {
        /// The rejected input.
        input: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A platform string was not `os_arch`.
    #[error("invalid platform {0:?}: expected os_arch, e.g. linux_amd64")]
    Platform(String),

    /// A version string was not a semantic version.
    #[error("invalid version {input:?}: {reason}")]
    Version {
        /// The rejected input.
        input: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A version constraint expression could not be parsed.
    #[error("invalid version constraint {input:?}: {reason}")]
    Constraint {
        /// The rejected input.
        input: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A hash string had no `scheme:` prefix or an empty value.
    #[error("invalid hash {0:?}: expected scheme:value")]
    Hash(String),
}

/// Failure while computing a hash over local files.
#[derive(Debug, Error)]
pub enum HashError {
    /// Reading the package failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The zip archive could not be read.
    #[error("archive error: {0}")]
    Archive(String),

    /// A file name cannot be represented in the hash input.
    #[error("unsupported file name {0:?} in package")]
    FileName(String),
}

impl From<zip::result::ZipError> for HashError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}

impl From<walkdir::Error> for HashError {
    fn from(e: walkdir::Error) -> Self {
        Self::Io(e.into())
    }
}
