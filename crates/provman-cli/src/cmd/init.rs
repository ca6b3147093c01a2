//! Init command

use std::sync::Arc;

use anyhow::Result;
use crossterm::style::Stylize;
use provman_core::installer::{InstallMode, Installer};
use provman_core::lockfile::Locks;
use provman_core::manifest::ProjectManifest;
use provman_core::sources::{ProviderSource, Source};
use serde::Serialize;
use tracing::info;

use crate::context::Context;
use crate::ui::{TerminalReporter, print_json};

#[derive(Serialize)]
struct InstalledRow {
    provider: String,
    version: String,
    platform: String,
    path: String,
}

#[derive(Serialize)]
struct InitSummary {
    lock_file: String,
    lock_written: bool,
    fetched: usize,
    providers: Vec<InstalledRow>,
    changes: Vec<String>,
    notes: Vec<String>,
}

/// Install every required provider and write the lock file if it changed.
pub async fn init(ctx: &Context, mode: InstallMode) -> Result<()> {
    let manifest = ProjectManifest::load(&ctx.requirements_path()).await?;
    let reqs = manifest.requirements()?;
    let lock_path = ctx.lock_path();
    let previous = Locks::load(&lock_path).await?;

    let source = ProviderSource::from_settings(&ctx.settings)?;
    info!(source = %source.describe(), providers = reqs.len(), ?mode, "installing providers");

    let mut installer = Installer::new(source, ctx.local_cache())
        .with_deadline(ctx.settings.install_deadline)
        .with_reporter(Arc::new(TerminalReporter::new(ctx.json)));
    if let Some(global) = ctx.global_cache() {
        installer = installer.with_global_cache(global);
    }

    let outcome = installer
        .ensure_provider_versions(&previous, &reqs, &manifest.explicit_references(), mode)
        .await?;

    let lock_written = !outcome.locks.equal(&previous) || !lock_path.exists();
    if lock_written {
        outcome.locks.save(&lock_path).await?;
    }

    if ctx.json {
        return print_json(&InitSummary {
            lock_file: lock_path.display().to_string(),
            lock_written,
            fetched: outcome.fetched,
            providers: outcome
                .packages
                .iter()
                .map(|pkg| InstalledRow {
                    provider: pkg.provider.to_string(),
                    version: pkg.version.to_string(),
                    platform: pkg.platform.to_string(),
                    path: pkg.package_dir.display().to_string(),
                })
                .collect(),
            changes: outcome.changes.iter().map(ToString::to_string).collect(),
            notes: outcome.notes.iter().map(ToString::to_string).collect(),
        });
    }

    println!();
    if outcome.packages.is_empty() {
        println!("  No providers required.");
    } else {
        println!(
            "  {} {} provider(s), {} fetched",
            "Installed".green().bold(),
            outcome.packages.len(),
            outcome.fetched
        );
    }
    if lock_written {
        println!("  Wrote {}", lock_path.display());
    } else {
        println!("  {} is up to date", lock_path.display());
    }
    Ok(())
}
