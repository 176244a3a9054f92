//! Small shared helpers for the ukinstall crates. Only add things here
//! that depend on nothing beyond the standard library and "core" crates.

mod command;
pub use command::*;
mod tracing_util;
pub use tracing_util::*;
