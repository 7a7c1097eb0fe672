use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sonar_core::{Level, SessionId};

#[derive(Debug, Parser)]
#[command(name = "sonar", about = "Inspect, sweep and export Sonar event stores")]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print counts, sizes and provenance as JSON
    Info {
        /// Store package or archive
        path: PathBuf,
    },
    /// Write a filtered copy of a store
    Export {
        /// Store package or archive
        path: PathBuf,
        /// Output path, must not exist
        target: PathBuf,
        /// Write a read-only archive instead of a package
        #[arg(long)]
        archive: bool,
        /// Keep only these sessions
        #[arg(long = "session")]
        sessions: Vec<SessionId>,
        /// Keep only messages at or above this level
        #[arg(long)]
        min_level: Option<Level>,
    },
    /// Enforce the age and size budgets now
    Sweep {
        /// Store package
        path: PathBuf,
    },
    /// List the newest messages
    Messages {
        /// Store package or archive
        path: PathBuf,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Only messages at or above this level
        #[arg(long)]
        level: Option<Level>,
    },
    /// List the newest network tasks
    Tasks {
        /// Store package or archive
        path: PathBuf,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}
