//! Human-readable installation progress on stderr.

use std::path::Path;

use crossterm::style::Stylize;
use provman_core::Reporter;
use provman_core::lockfile::LockChange;
use provman_core::migrate::MigrationNote;
use provman_schema::{Platform, ProviderAddress, Version};

/// Writes one line per event to stderr, keeping stdout for results.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalReporter {
    quiet: bool,
}

impl TerminalReporter {
    /// A reporter that only prints warnings when `quiet` is set.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    fn line(&self, text: String) {
        if !self.quiet {
            eprintln!("  {text}");
        }
    }
}

impl Reporter for TerminalReporter {
    fn querying(&self, provider: &ProviderAddress) {
        self.line(format!("{} versions of {}", "query".dark_grey(), provider.for_display()));
    }

    fn fetching(&self, provider: &ProviderAddress, version: &Version, platform: &Platform) {
        self.line(format!(
            "{} {} {} ({platform})",
            "fetch".cyan(),
            provider.for_display(),
            version.to_string().dark_cyan()
        ));
    }

    fn installed(&self, provider: &ProviderAddress, version: &Version, dir: &Path) {
        self.line(format!(
            "{} {} {} {}",
            "done".green(),
            provider.for_display(),
            version.to_string().dark_cyan(),
            dir.display().to_string().dark_grey()
        ));
    }

    fn cache_hit(&self, provider: &ProviderAddress, version: &Version) {
        self.line(format!(
            "{} {} {}",
            "cached".green(),
            provider.for_display(),
            version.to_string().dark_cyan()
        ));
    }

    fn lock_updated(&self, changes: &[LockChange]) {
        for change in changes {
            self.line(format!("{} {change}", "lock".yellow()));
        }
    }

    fn migration(&self, note: &MigrationNote) {
        self.line(format!("{} {note}", "migrate".magenta()));
    }

    fn warning(&self, msg: &str) {
        eprintln!("  {} {msg}", "warning".yellow().bold());
    }
}
