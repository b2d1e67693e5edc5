//! CLI command implementations
//!
//! `watch` boots an in-memory server, subscribes to a table, drives a cycle
//! of writes against it and prints every change record. Dropping the table
//! at the end closes the feed with its single terminal error.

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::info;

use crate::changefeed::{FeedError, FeedResult};
use crate::config::ChangefeedConfig;
use crate::memory::MemoryServer;
use crate::observability::{self, LogFormat};
use crate::query::{FeedOptions, Table};
use crate::transport::Session;

use super::args::{Command, WatchArgs};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_line, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Watch(args) => watch(&args),
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Validate a configuration file and echo the effective settings
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = ChangefeedConfig::load(config_path)?;
    write_response(json!({
        "valid": true,
        "config": serde_json::to_value(&config)?,
    }))
}

fn load_config(path: Option<&Path>) -> CliResult<ChangefeedConfig> {
    match path {
        Some(path) => Ok(ChangefeedConfig::load(path)?),
        None => Ok(ChangefeedConfig::default()),
    }
}

/// Run the watch demo
pub fn watch(args: &WatchArgs) -> CliResult<()> {
    let config = load_config(args.config.as_deref())?;
    let format: LogFormat = config.log_format.parse().map_err(CliError::config_error)?;
    observability::init(&config.log_level, format);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(run_watch(config, args.clone()))
}

async fn run_watch(config: ChangefeedConfig, args: WatchArgs) -> CliResult<()> {
    let server = MemoryServer::new();
    let session = Session::connect(config, Arc::new(server)).await?;

    session.table_create(&args.table).await?;
    let table = session.table(args.table.as_str());
    if args.include_initial {
        table.insert(json!({ "id": "seed", "value": 0 })).await?;
    }

    let options = FeedOptions {
        include_states: args.include_states,
        include_initial: args.include_initial,
    };
    let feed = session.subscribe_with_retry(&table.subscription().with_options(options)).await?;

    // Print on a separate task so writes and delivery overlap
    let printer = tokio::spawn(async move {
        let mut printed = 0u64;
        let mut records = Box::pin(feed.into_stream());
        while let Some(item) = records.next().await {
            match item {
                Ok(record) => {
                    write_line(&record)?;
                    printed += 1;
                }
                Err(e) => {
                    write_error(e.code(), &e.to_string())?;
                    break;
                }
            }
        }
        Ok::<u64, CliError>(printed)
    });

    for step in 1..=u64::from(args.writes) {
        apply_write(&table, step).await?;
    }
    session.table_drop(&args.table).await?;

    let printed = printer
        .await
        .map_err(|e| CliError::boot_failed(format!("printer task failed: {}", e)))??;

    let snapshot = session.metrics().snapshot();
    info!(
        printed,
        delivered = snapshot.records_delivered,
        discarded = snapshot.records_discarded,
        "watch finished"
    );

    session.close().await?;
    Ok(())
}

/// Step `n` of the write cycle: insert, update, then delete the same key
async fn apply_write(table: &Table, step: u64) -> FeedResult<()> {
    let key = Value::from((step - 1) / 3 + 1);
    let result = match (step - 1) % 3 {
        0 => table.insert(json!({ "id": key, "value": step })).await?,
        1 => table.update(key, json!({ "value": step })).await?,
        _ => table.delete(key).await?,
    };

    match result.first_error {
        Some(message) => Err(FeedError::Query(message)),
        None => Ok(()),
    }
}
