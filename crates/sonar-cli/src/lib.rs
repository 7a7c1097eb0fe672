//! The `sonar` command line tool
//!
//! Reads, sweeps and exports event stores from the shell.

pub mod cli;
pub mod commands;

pub use cli::{Cli, Command};
pub use commands::run;
