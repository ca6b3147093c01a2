//! Value types shared by every provman crate: provider addresses, target
//! platforms, versions and constraints, and package hash schemes.
//!
//! Nothing in here touches the network. The hash schemes read local files
//! only.

pub mod address;
pub mod error;
pub mod hash;
pub mod platform;
pub mod version;

// Re-exports
pub use address::*;
pub use error::{HashError, ParseError};
pub use hash::{Hash, HashScheme};
pub use platform::Platform;
pub use version::{Constraint, ConstraintSet, Operator, Unsatisfiable, Version, select_best};
