//! Cache command

use anyhow::{Result, bail};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::{ContentArrangement, Table};
use provman_core::cache::CacheDir;
use serde::Serialize;

use crate::context::Context;
use crate::ui::print_json;

#[derive(Serialize)]
struct CacheRow {
    provider: String,
    version: String,
    platform: String,
    path: String,
}

fn select(ctx: &Context, global: bool) -> Result<CacheDir> {
    if !global {
        return Ok(ctx.local_cache());
    }
    match ctx.global_cache() {
        Some(cache) => Ok(cache),
        None => bail!("no shared cache configured; set plugin_cache_dir or PROVMAN_PLUGIN_CACHE_DIR"),
    }
}

/// List cached packages for the current platform.
pub fn list(ctx: &Context, global: bool) -> Result<()> {
    let cache = select(ctx, global)?;
    let rows: Vec<CacheRow> = cache
        .all_available_packages()?
        .into_values()
        .flatten()
        .map(|pkg| CacheRow {
            provider: pkg.provider.to_string(),
            version: pkg.version.to_string(),
            platform: pkg.platform.to_string(),
            path: pkg.package_dir.display().to_string(),
        })
        .collect();

    if ctx.json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("  No packages cached in {}", cache.base_dir().display());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["provider", "version", "platform", "path"]);
    for row in &rows {
        table.add_row([&row.provider, &row.version, &row.platform, &row.path]);
    }
    println!("{table}");
    Ok(())
}

/// Remove every cached package.
pub fn clear(ctx: &Context, global: bool) -> Result<()> {
    let cache = select(ctx, global)?;
    cache.clear()?;
    if ctx.json {
        #[derive(Serialize)]
        struct Cleared {
            cleared: String,
        }
        return print_json(&Cleared {
            cleared: cache.base_dir().display().to_string(),
        });
    }
    println!("  Cleared {}", cache.base_dir().display());
    Ok(())
}
