//! CLI argument definitions using clap
//!
//! Commands:
//! - aerodb-changefeed watch --config <path> --table <name> --writes <n>
//! - aerodb-changefeed check-config --config <path>

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Live change feeds over an in-memory AeroDB table
#[derive(Parser, Debug)]
#[command(name = "aerodb-changefeed")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch a table while issuing writes, printing each change as JSON
    Watch(WatchArgs),

    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./changefeed.json")]
        config: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Path to configuration file; defaults apply when absent
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Table to create and watch
    #[arg(long, default_value = "posts")]
    pub table: String,

    /// Writes to issue (cycles insert, update, delete)
    #[arg(long, default_value_t = 9)]
    pub writes: u32,

    /// Emit initializing/ready state markers
    #[arg(long)]
    pub include_states: bool,

    /// Emit existing documents before live changes
    #[arg(long)]
    pub include_initial: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch() {
        let cli = Cli::try_parse_from([
            "aerodb-changefeed",
            "watch",
            "--table",
            "events",
            "--writes",
            "3",
            "--include-states",
        ])
        .unwrap();

        match cli.command {
            Command::Watch(args) => {
                assert_eq!(args.table, "events");
                assert_eq!(args.writes, 3);
                assert!(args.include_states);
                assert!(!args.include_initial);
                assert!(args.config.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_config_default_path() {
        let cli = Cli::try_parse_from(["aerodb-changefeed", "check-config"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::CheckConfig { ref config } if config == &PathBuf::from("./changefeed.json")
        ));
    }
}
