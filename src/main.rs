//! agp-dal admin binary.
//!
//! Inspects, dumps and restores a database through the public
//! [`Connection`] contract.

use agp_dal::Connection;
use agp_dal::config::{Command, Config, OutputFormat};
use agp_dal::format::{format_db_info, format_table_info, format_tables};
use serde::Serialize;
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
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print<T: Serialize>(format: OutputFormat, value: &T, table: impl FnOnce(&T) -> String) {
    match format {
        OutputFormat::Table => print!("{}", table(value)),
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "Failed to serialize output"),
        },
    }
}

async fn run(config: &Config, conn: &mut Connection) -> agp_dal::DbResult<()> {
    match &config.command {
        Command::Info => {
            let info = conn.db_info().await?;
            print(config.format, &info, format_db_info);
        }
        Command::Tables { prefix } => {
            let tables = conn.get_tables(prefix.as_deref()).await?;
            print(config.format, &tables, |t| format_tables(t));
        }
        Command::Describe { table } => {
            let table = conn.get_table_information(table).await?;
            print(config.format, &table, format_table_info);
        }
        Command::Dump { file, tables } => {
            conn.dump(file, tables).await?;
            info!(file = %file.display(), "Dump written");
        }
        Command::Restore { file } => {
            conn.restore(file).await?;
            info!(file = %file.display(), "Restore complete");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    let params = config.connection_parameters()?;
    info!(
        url = %params.masked_url(),
        "Starting agp-dal v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut conn = Connection::new(params)?;
    let result = run(&config, &mut conn).await;
    if let Err(e) = conn.close().await {
        error!(error = %e, "Failed to close connection");
    }

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {suggestion}");
        }
        return Err(e.into());
    }
    Ok(())
}
