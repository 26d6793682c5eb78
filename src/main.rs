//! db-helper - Main entry point.
//!
//! Runs one command against SQL Server, Oracle or PostgreSQL through the
//! vendor-neutral facade and prints the result as JSON.

use clap::Parser;
use db_helper::config::{Config, ExecuteMode};
use db_helper::db::DataReader;
use db_helper::models::Command;
use db_helper::reader::RowCursor;
use db_helper::DbHelper;
use serde_json::{Map, Value as JsonValue, json};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .init();
    }
}

/// Print every row of the first result set as one JSON object per line.
fn print_rows(reader: &mut DataReader) {
    let columns = reader.column_names();
    while reader.read() {
        let row: Map<String, JsonValue> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = reader.value(i).map(|v| v.to_json()).unwrap_or(JsonValue::Null);
                (name.clone(), value)
            })
            .collect();
        println!("{}", JsonValue::Object(row));
    }
}

async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let helper = DbHelper::from_config(&config.helper_config());

    let mut command = Command::new(config.command_type(), config.command_text.clone());
    for p in &config.params {
        command = command.param(helper.create_parameter_with_value(&p.name, p.value.clone()));
    }

    info!(
        vendor = %helper.vendor(),
        mode = %config.mode,
        params = command.parameters.len(),
        timeout_secs = helper.default_timeout(),
        "Running command"
    );

    let conn_str = &config.connection_string;
    match config.mode {
        ExecuteMode::NonQuery => {
            let rows = helper.execute_non_query(conn_str, &mut command).await?;
            println!("{}", json!({ "rows_affected": rows }));
        }
        ExecuteMode::Scalar => {
            let value = helper.execute_scalar(conn_str, &mut command).await?;
            println!("{}", value.to_json());
        }
        ExecuteMode::Dataset => {
            let data = helper.execute_dataset(conn_str, &mut command).await?;
            println!("{}", serde_json::to_string_pretty(&data.to_json())?);
        }
        ExecuteMode::Reader => {
            let mut reader = helper.execute_reader(conn_str, &mut command).await?;
            print_rows(&mut reader);
            reader.close().await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    if let Err(e) = run(&config).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
