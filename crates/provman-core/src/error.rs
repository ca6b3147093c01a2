//! Error taxonomy for provider installation and verification.
//!
//! Resolution-layer errors ([`Error::NotFound`], [`Error::Unreachable`],
//! [`Error::ExhaustedRetries`], [`Error::Malformed`]) let a multi-source
//! fall through to the next configured source. Lock and cache errors are
//! trust-boundary violations: they always stop the run and carry a
//! [`Remediation`] naming the command to run.

use std::path::PathBuf;
use std::time::Duration;

use provman_schema::{ConstraintSet, Platform, ProviderAddress, Version};
use serde::Serialize;
use thiserror::Error;

/// Command that re-selects providers within the current lock.
pub const INIT_COMMAND: &str = "provman init";

/// Command that re-selects providers ignoring locked versions.
pub const UPGRADE_COMMAND: &str = "provman init --upgrade";

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("provider {provider}: no available release matches the given constraints {constraints}")]
    UnsatisfiableConstraints {
        provider: ProviderAddress,
        constraints: ConstraintSet,
    },

    #[error("provider {provider}: {detail}")]
    NotFound {
        provider: ProviderAddress,
        detail: String,
    },

    #[error("could not reach {url}: {detail}")]
    Unreachable { url: String, detail: String },

    #[error("request to {url} failed: {detail}; giving up after {attempts} attempt(s)")]
    ExhaustedRetries {
        url: String,
        attempts: u32,
        detail: String,
    },

    #[error("invalid response from {location}: {detail}")]
    Malformed { location: String, detail: String },

    #[error("failed to read dependency lock file {}: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error(
        "locked provider {provider} {locked} does not match configured version constraint {constraints}; must use {} to allow selection of new versions",
        UPGRADE_COMMAND
    )]
    ConstraintMismatch {
        provider: ProviderAddress,
        locked: Version,
        constraints: ConstraintSet,
    },

    #[error("there is no package for {provider} {version} cached in {}", path.display())]
    NotCached {
        provider: ProviderAddress,
        version: Version,
        platform: Platform,
        path: PathBuf,
    },

    #[error("the package for {provider} {version} in {} failed integrity verification: {detail}", path.display())]
    TamperedPackage {
        provider: ProviderAddress,
        version: Version,
        path: PathBuf,
        detail: String,
    },

    #[error("provider {provider}: required by this configuration but no version is selected")]
    NoVersionSelected { provider: ProviderAddress },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("installation did not finish within {}s", .0.as_secs())]
    DeadlineExceeded(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Stable, machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsatisfiableConstraints,
    NotFound,
    Unreachable,
    ExhaustedRetries,
    Malformed,
    Corrupt,
    ConstraintMismatch,
    NotCached,
    TamperedPackage,
    NoVersionSelected,
    Io,
    DeadlineExceeded,
    Config,
}

impl ErrorKind {
    /// Tag used in structured output. These strings never change.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsatisfiableConstraints => "unsatisfiable_constraints",
            Self::NotFound => "not_found",
            Self::Unreachable => "unreachable",
            Self::ExhaustedRetries => "exhausted_retries",
            Self::Malformed => "malformed",
            Self::Corrupt => "corrupt",
            Self::ConstraintMismatch => "constraint_mismatch",
            Self::NotCached => "not_cached",
            Self::TamperedPackage => "tampered_package",
            Self::NoVersionSelected => "no_version_selected",
            Self::Io => "io",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command the operator should run to recover, as structured data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remediation {
    /// Exact command line.
    pub command: &'static str,
    /// One-line explanation of what running it does.
    pub reason: &'static str,
}

impl std::fmt::Display for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run \"{}\" to {}", self.command, self.reason)
    }
}

/// Serializable rendering of an [`Error`] for `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

impl Error {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsatisfiableConstraints { .. } => ErrorKind::UnsatisfiableConstraints,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            Self::Malformed { .. } => ErrorKind::Malformed,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::ConstraintMismatch { .. } => ErrorKind::ConstraintMismatch,
            Self::NotCached { .. } => ErrorKind::NotCached,
            Self::TamperedPackage { .. } => ErrorKind::TamperedPackage,
            Self::NoVersionSelected { .. } => ErrorKind::NoVersionSelected,
            Self::Io(_) => ErrorKind::Io,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Provider the error is about, if any.
    pub fn provider(&self) -> Option<&ProviderAddress> {
        match self {
            Self::UnsatisfiableConstraints { provider, .. }
            | Self::NotFound { provider, .. }
            | Self::ConstraintMismatch { provider, .. }
            | Self::NotCached { provider, .. }
            | Self::TamperedPackage { provider, .. }
            | Self::NoVersionSelected { provider } => Some(provider),
            _ => None,
        }
    }

    /// Command that recovers from this error, if one exists.
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::ConstraintMismatch { .. } => Some(Remediation {
                command: UPGRADE_COMMAND,
                reason: "select a version that matches the configured constraints",
            }),
            Self::NotCached { .. } | Self::NoVersionSelected { .. } => Some(Remediation {
                command: INIT_COMMAND,
                reason: "install the providers recorded in the dependency lock file",
            }),
            Self::TamperedPackage { .. } => Some(Remediation {
                command: INIT_COMMAND,
                reason: "reinstall the package from its source and verify it again",
            }),
            Self::Corrupt { .. } => Some(Remediation {
                command: INIT_COMMAND,
                reason: "rewrite the dependency lock file after fixing or removing it",
            }),
            _ => None,
        }
    }

    /// Structured form for machine-readable output.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().as_str(),
            message: self.to_string(),
            provider: self.provider().map(ToString::to_string),
            remediation: self.remediation(),
        }
    }

    /// True only for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// True for resolution-layer errors that let the next source be tried.
    pub fn falls_through(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Unreachable { .. }
                | Self::ExhaustedRetries { .. }
                | Self::Malformed { .. }
        )
    }

    pub(crate) fn malformed(location: impl ToString, detail: impl ToString) -> Self {
        Self::Malformed {
            location: location.to_string(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn not_found(provider: &ProviderAddress, detail: impl ToString) -> Self {
        Self::NotFound {
            provider: provider.clone(),
            detail: detail.to_string(),
        }
    }
}
