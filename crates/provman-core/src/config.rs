//! CLI configuration file and environment settings.
//!
//! The configuration file is TOML:
//!
//! ```toml
//! plugin_cache_dir = "/var/cache/provman"
//! download_retries = 4
//! request_timeout_secs = 30
//! install_deadline_secs = 600
//!
//! [[source]]
//! kind = "network_mirror"
//! url = "https://mirror.example.com/providers/"
//! retries = 5
//! include = ["registry.opentofu.org/hashicorp/*"]
//!
//! [[source]]
//! kind = "direct"
//! exclude = ["registry.opentofu.org/hashicorp/*"]
//! ```
//!
//! Retry counts are resolved per source with [`resolve_retries`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Package download retries when nothing else is configured (three attempts).
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 2;

/// Registry API retries when nothing else is configured.
pub const DEFAULT_DISCOVERY_RETRIES: u32 = 1;

/// Per-request timeout when nothing else is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable overriding [`DEFAULT_DOWNLOAD_RETRIES`].
pub const ENV_DOWNLOAD_RETRY: &str = "PROVMAN_DOWNLOAD_RETRY";
/// Environment variable overriding [`DEFAULT_DISCOVERY_RETRIES`].
pub const ENV_DISCOVERY_RETRY: &str = "PROVMAN_REGISTRY_DISCOVERY_RETRY";
/// Environment variable overriding [`DEFAULT_REQUEST_TIMEOUT`], in seconds.
pub const ENV_CLIENT_TIMEOUT: &str = "PROVMAN_REGISTRY_CLIENT_TIMEOUT";
/// Environment variable naming the shared plugin cache directory.
pub const ENV_PLUGIN_CACHE_DIR: &str = "PROVMAN_PLUGIN_CACHE_DIR";

/// Contents of the CLI configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shared cache used by every working directory.
    #[serde(default)]
    pub plugin_cache_dir: Option<PathBuf>,
    /// Download retries for sources without their own `retries`, unless
    /// `--retries` is given.
    #[serde(default)]
    pub download_retries: Option<u32>,
    /// Per-request timeout.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Upper bound on a whole installation pass.
    #[serde(default)]
    pub install_deadline_secs: Option<u64>,
    /// Ordered installation sources. Empty means "direct only".
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
}

/// One `[[source]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Which kind of source, plus its kind-specific fields.
    #[serde(flatten)]
    pub kind: SourceKind,
    /// Explicit retry count; wins over every other setting.
    #[serde(default)]
    pub retries: Option<u32>,
    /// Address patterns this source may serve. Empty means all.
    #[serde(default)]
    pub include: Vec<String>,
    /// Address patterns this source must not serve.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Source kinds and their settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Each provider's origin registry.
    Direct,
    /// An HTTP mirror implementing the network mirror protocol.
    NetworkMirror {
        /// Base URL, ending in `/`.
        url: String,
    },
    /// A local directory in packed or unpacked layout.
    FilesystemMirror {
        /// Mirror root.
        path: PathBuf,
    },
    /// An OCI Distribution registry.
    OciMirror {
        /// Registry base URL, e.g. `https://ghcr.io/`.
        registry: String,
        /// Repository name template using `${hostname}`, `${namespace}` and `${type}`.
        #[serde(default)]
        repository_template: Option<String>,
    },
    /// A single unpacked package pinned to one version.
    Vendored {
        /// Provider address the package provides.
        provider: String,
        /// Version the package is declared to be.
        version: String,
        /// Package directory or zip archive.
        path: PathBuf,
    },
}

impl SourceKind {
    /// Name used in config files and messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::NetworkMirror { .. } => "network_mirror",
            Self::FilesystemMirror { .. } => "filesystem_mirror",
            Self::OciMirror { .. } => "oci_mirror",
            Self::Vendored { .. } => "vendored",
        }
    }
}

impl Config {
    /// Load the configuration file, returning defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML deserialization error.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Configured sources, or a single direct source when none are listed.
    pub fn effective_sources(&self) -> Vec<SourceConfig> {
        if self.sources.is_empty() {
            vec![SourceConfig {
                kind: SourceKind::Direct,
                retries: None,
                include: Vec::new(),
                exclude: Vec::new(),
            }]
        } else {
            self.sources.clone()
        }
    }
}

/// Settings read from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSettings {
    /// `PROVMAN_DOWNLOAD_RETRY`
    pub download_retries: Option<u32>,
    /// `PROVMAN_REGISTRY_DISCOVERY_RETRY`
    pub discovery_retries: Option<u32>,
    /// `PROVMAN_REGISTRY_CLIENT_TIMEOUT`
    pub client_timeout: Option<Duration>,
    /// `PROVMAN_PLUGIN_CACHE_DIR`
    pub plugin_cache_dir: Option<PathBuf>,
}

impl EnvSettings {
    /// Read from the real process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup function.
    ///
    /// Unparsable values are ignored with a warning rather than failing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            download_retries: parse_count(ENV_DOWNLOAD_RETRY, lookup(ENV_DOWNLOAD_RETRY)),
            discovery_retries: parse_count(ENV_DISCOVERY_RETRY, lookup(ENV_DISCOVERY_RETRY)),
            client_timeout: parse_count(ENV_CLIENT_TIMEOUT, lookup(ENV_CLIENT_TIMEOUT))
                .map(|secs| Duration::from_secs(u64::from(secs))),
            plugin_cache_dir: lookup(ENV_PLUGIN_CACHE_DIR)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

fn parse_count(name: &str, raw: Option<String>) -> Option<u32> {
    let raw = raw?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<u32>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring invalid value, expected a non-negative integer");
            None
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    /// `--retries`
    pub download_retries: Option<u32>,
    /// `--plugin-cache-dir`
    pub plugin_cache_dir: Option<PathBuf>,
}

/// Pick a retry count.
///
/// Precedence: the source's own `retries`, then the command line, then the
/// environment, then `default`.
pub fn resolve_retries(
    explicit: Option<u32>,
    cli: Option<u32>,
    env: Option<u32>,
    default: u32,
) -> u32 {
    explicit.or(cli).or(env).unwrap_or(default)
}

/// Fully-resolved settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Sources in the order they are tried.
    pub sources: Vec<ResolvedSource>,
    /// Retries for registry API requests.
    pub discovery_retries: u32,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Upper bound on an installation pass.
    pub install_deadline: Option<Duration>,
    /// Shared cache directory, if any.
    pub plugin_cache_dir: Option<PathBuf>,
}

/// A source with its retry count settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    /// The configured source.
    pub config: SourceConfig,
    /// Retries for package downloads (and mirror API calls) through this source.
    pub download_retries: u32,
}

impl Settings {
    /// Combine the configuration file, environment and command line.
    pub fn resolve(config: &Config, env: &EnvSettings, cli: &CliOverrides) -> Self {
        let sources = config
            .effective_sources()
            .into_iter()
            .map(|source| {
                // The config-wide count only fills in for a missing `--retries`.
                let requested = cli.download_retries.or(config.download_retries);
                ResolvedSource {
                    download_retries: resolve_retries(
                        source.retries,
                        requested,
                        env.download_retries,
                        DEFAULT_DOWNLOAD_RETRIES,
                    ),
                    config: source,
                }
            })
            .collect();

        Self {
            sources,
            discovery_retries: env.discovery_retries.unwrap_or(DEFAULT_DISCOVERY_RETRIES),
            request_timeout: config
                .request_timeout_secs
                .map(Duration::from_secs)
                .or(env.client_timeout)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            install_deadline: config.install_deadline_secs.map(Duration::from_secs),
            plugin_cache_dir: cli
                .plugin_cache_dir
                .clone()
                .or_else(|| config.plugin_cache_dir.clone())
                .or_else(|| env.plugin_cache_dir.clone()),
        }
    }
}
