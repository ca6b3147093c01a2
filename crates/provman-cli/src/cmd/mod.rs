//! Subcommand implementations

pub mod cache;
pub mod init;
pub mod verify;
