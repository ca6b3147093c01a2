//! Verify command

use anyhow::Result;
use crossterm::style::Stylize;
use provman_core::lockfile::Locks;
use provman_core::manifest::ProjectManifest;
use provman_core::verify::IntegrityVerifier;
use provman_core::{Error, ErrorReport};
use serde::Serialize;

use crate::context::Context;
use crate::ui::print_json;

#[derive(Serialize)]
struct VerifyRow {
    provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
}

/// Check every required provider's cached package against the lock file.
///
/// Every provider is checked and reported; the first failure becomes the
/// command's error.
pub async fn verify(ctx: &Context) -> Result<()> {
    let manifest = ProjectManifest::load(&ctx.requirements_path()).await?;
    let reqs = manifest.requirements()?;
    let locks = Locks::load(&ctx.lock_path()).await?;
    let cache = ctx.local_cache();

    let outcomes = IntegrityVerifier::new(&locks, &cache).verify_each(&reqs).await;

    let mut first_failure: Option<Error> = None;
    let mut rows = Vec::with_capacity(outcomes.len());
    for (provider, outcome) in outcomes {
        match outcome {
            Ok(pkg) => {
                if !ctx.json {
                    println!(
                        "  {} {} {}",
                        "ok".green(),
                        provider.for_display(),
                        pkg.version.to_string().dark_cyan()
                    );
                }
                rows.push(VerifyRow {
                    provider: provider.to_string(),
                    version: Some(pkg.version.to_string()),
                    path: Some(pkg.package_dir.display().to_string()),
                    error: None,
                });
            }
            Err(e) => {
                if !ctx.json {
                    println!("  {} {}", "fail".red(), provider.for_display());
                }
                rows.push(VerifyRow {
                    provider: provider.to_string(),
                    version: None,
                    path: None,
                    error: Some(e.report()),
                });
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_failure {
        return Err(e.into());
    }
    if ctx.json {
        print_json(&rows)?;
    }
    Ok(())
}
