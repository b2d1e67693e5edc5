//! CLI module for aerodb-changefeed
//!
//! Provides command-line interface for:
//! - watch: Print a table's change feed while writing to it
//! - check-config: Validate a configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, WatchArgs};
pub use commands::{check_config, run, run_command, watch};
pub use errors::{CliError, CliErrorCode, CliResult};
