//! Result and error rendering.

use std::io::Write;

use crossterm::style::Stylize;
use provman_core::{Error, ErrorReport};
use serde::Serialize;

/// Pretty-print `value` as JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

/// Structured form of any command failure.
///
/// Installation and verification errors keep their kind, provider and
/// remediation; everything else is reported as `kind = "error"`.
pub fn report(err: &anyhow::Error) -> ErrorReport {
    match err.downcast_ref::<Error>() {
        Some(e) => e.report(),
        None => ErrorReport {
            kind: "error",
            message: format!("{err:#}"),
            provider: None,
            remediation: None,
        },
    }
}

/// Print a failure: JSON on stdout with `--json`, otherwise text on stderr.
pub fn print_error(err: &anyhow::Error, json: bool) {
    let report = report(err);
    if json {
        #[derive(Serialize)]
        struct Envelope<'a> {
            error: &'a ErrorReport,
        }
        if print_json(&Envelope { error: &report }).is_ok() {
            return;
        }
    }

    eprintln!("{} {}", "error:".red().bold(), report.message);
    if let Some(remedy) = &report.remediation {
        eprintln!("  {} {remedy}", "hint:".dark_grey());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_keep_their_kind() {
        let err = anyhow::Error::new(Error::NoVersionSelected {
            provider: "hashicorp/aws".parse().unwrap(),
        });
        let report = report(&err);
        assert_eq!(report.kind, "no_version_selected");
        assert_eq!(report.provider.as_deref(), Some("registry.opentofu.org/hashicorp/aws"));
        assert!(report.remediation.is_some());
    }

    #[test]
    fn other_errors_are_generic() {
        let report = report(&anyhow::anyhow!("boom"));
        assert_eq!(report.kind, "error");
        assert_eq!(report.message, "boom");
        assert!(report.remediation.is_none());
    }
}
