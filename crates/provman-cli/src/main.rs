//! provman binary entry point

use std::process::ExitCode;

use clap::Parser;
use provman_cli::cmd;
use provman_cli::ui::print_error;
use provman_cli::{CacheCommands, Cli, Commands, Context};
use provman_core::config::CliOverrides;
use provman_core::installer::InstallMode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Log to stderr; stdout is reserved for command output. Set RUST_LOG=debug for detail.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e, json);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = match &cli.command {
        Commands::Init {
            retries,
            plugin_cache_dir,
            ..
        } => CliOverrides {
            download_retries: *retries,
            plugin_cache_dir: plugin_cache_dir.clone(),
        },
        _ => CliOverrides::default(),
    };
    let ctx = Context::load(cli.chdir.as_deref(), &overrides, cli.json).await?;

    match cli.command {
        Commands::Init { upgrade, .. } => {
            let mode = if upgrade {
                InstallMode::Upgrade
            } else {
                InstallMode::Normal
            };
            cmd::init::init(&ctx, mode).await
        }
        Commands::Verify => cmd::verify::verify(&ctx).await,
        Commands::Cache { command } => match command {
            CacheCommands::List { global } => cmd::cache::list(&ctx, global),
            CacheCommands::Clear { global } => cmd::cache::clear(&ctx, global),
        },
    }
}
