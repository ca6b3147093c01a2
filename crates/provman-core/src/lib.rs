pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod installer;
pub mod io;
pub mod lockfile;
pub mod manifest;
pub mod migrate;
pub mod paths;
pub mod sources;
pub mod verify;

pub mod reporter;

pub use error::{Error, ErrorKind, ErrorReport, Remediation, Result};
pub use paths::*;
pub use reporter::{LogReporter, NullReporter, Reporter};

/// User Agent string for every HTTP request
pub const USER_AGENT: &str = concat!("provman/", env!("CARGO_PKG_VERSION"));
