//! Per-invocation context
//!
//! Resolves the working directory and merges the configuration file, the
//! environment and command-line flags into [`Settings`].

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use provman_core::cache::CacheDir;
use provman_core::config::{CliOverrides, Config, EnvSettings, Settings};
use provman_core::{config_file_path, local_cache_dir, lock_file_path, requirements_path};
use provman_schema::Platform;
use tracing::debug;

/// Everything a command needs to know about where it runs.
#[derive(Debug, Clone)]
pub struct Context {
    pub workdir: PathBuf,
    pub platform: Platform,
    pub settings: Settings,
    pub json: bool,
}

impl Context {
    /// Build the context for one command.
    pub async fn load(chdir: Option<&Path>, cli: &CliOverrides, json: bool) -> Result<Self> {
        let workdir = match chdir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        if !workdir.is_dir() {
            anyhow::bail!("{} is not a directory", workdir.display());
        }

        let config = match config_file_path() {
            Some(path) => {
                debug!(path = %path.display(), "loading configuration");
                Config::load(&path).await?
            }
            None => Config::default(),
        };
        let settings = Settings::resolve(&config, &EnvSettings::from_env(), cli);

        Ok(Self {
            workdir,
            platform: Platform::current(),
            settings,
            json,
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        lock_file_path(&self.workdir)
    }

    pub fn requirements_path(&self) -> PathBuf {
        requirements_path(&self.workdir)
    }

    /// The working directory's package cache.
    pub fn local_cache(&self) -> CacheDir {
        CacheDir::new(local_cache_dir(&self.workdir), self.platform.clone())
    }

    /// The shared package cache, when one is configured.
    pub fn global_cache(&self) -> Option<CacheDir> {
        self.settings
            .plugin_cache_dir
            .as_ref()
            .map(|dir| CacheDir::shared(dir.clone(), self.platform.clone()))
    }
}
