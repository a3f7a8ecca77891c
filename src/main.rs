use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use order_cache::cli::{Cli, Command};
use order_cache::commands;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let is_serve = matches!(cli.command, Command::Serve(_));
    let default_level = if is_serve { "info" } else { "warn" };

    // Logs go to stderr so stdout stays clean for command output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Serve(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::cmd_serve(args.to_config(cli.db)))
        }
        Command::Publish {
            bus_addr,
            count,
            interval_ms,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::cmd_publish(
                &bus_addr,
                count,
                Duration::from_millis(interval_ms),
                cli.json,
            ))
        }
        Command::Show { order_uid } => commands::cmd_show(&cli.db, &order_uid, cli.json),
        Command::Stats => commands::cmd_stats(&cli.db, cli.json),
    }
}
