//! Terminal output

pub mod output;
pub mod reporter;

pub use output::{print_error, print_json};
pub use reporter::TerminalReporter;
