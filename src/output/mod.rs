//! Output formatting module
//!
//! Renders runs, listings and metrics for the command line.

mod formatter;

pub use formatter::{OutputFormat, RunFormatter};
