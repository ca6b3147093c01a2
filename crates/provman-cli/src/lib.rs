#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
//! provman command line interface
//!
//! Installs the providers a working directory requires, records them in
//! `provman.lock`, and verifies cached packages before they are used.

pub mod cmd;
pub mod context;
pub mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use context::Context;

#[derive(Parser, Debug)]
#[command(name = "provman")]
#[command(author, version, about = "Install, lock and verify infrastructure providers", long_about = None)]
pub struct Cli {
    /// Run as if started in DIR
    #[arg(short = 'C', long = "chdir", global = true, value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install required providers and update the lock file
    Init {
        /// Select the newest allowed versions, ignoring locked selections
        #[arg(long)]
        upgrade: bool,

        /// Download retries for sources without an explicit setting
        #[arg(long, value_name = "N")]
        retries: Option<u32>,

        /// Shared package cache directory
        #[arg(long, value_name = "DIR")]
        plugin_cache_dir: Option<PathBuf>,
    },
    /// Check cached packages against the lock file
    Verify,
    /// Inspect or clear the package cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cached packages for the current platform
    List {
        /// List the shared cache instead of the working directory's
        #[arg(long)]
        global: bool,
    },
    /// Delete every cached package
    Clear {
        /// Clear the shared cache instead of the working directory's
        #[arg(long)]
        global: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::parse_from(["provman", "init", "--upgrade", "--json", "-C", "/work"]);
        assert!(cli.json);
        assert_eq!(cli.chdir, Some(PathBuf::from("/work")));
        assert!(matches!(cli.command, Commands::Init { upgrade: true, retries: None, .. }));
    }

    #[test]
    fn cache_subcommands_parse() {
        let cli = Cli::parse_from(["provman", "cache", "clear", "--global"]);
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommands::Clear { global: true }
            }
        ));
    }
}
