//! Command-line front end for the Toolgate invocation gateway.
//!
//! Usage:
//! ```bash
//! toolgate list                                   # List registered tools
//! toolgate describe <tool>                        # Show a tool's schema
//! toolgate classify "<command>"                   # Read/write verdict for a shell command
//! toolgate call <tool> '<json>'                   # Invoke a tool and wait
//! toolgate call <tool> @args.json --async         # Start, then poll to completion
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "toolgate", author, version, about)]
struct Cli {
    /// Path to `toolgate.toml`. Defaults to the standard resolution order.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List available tools
    List(commands::list::ListArgs),

    /// Describe a specific tool
    Describe(commands::describe::DescribeArgs),

    /// Classify a shell command as read or write
    Classify(commands::classify::ClassifyArgs),

    /// Invoke a tool
    Call(commands::call::CallArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().context("failed to parse log directive")?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match &cli.command {
        Command::List(args) => commands::list::run(args, config),
        Command::Describe(args) => commands::describe::run(args, config),
        Command::Classify(args) => {
            commands::classify::run(args);
            Ok(())
        }
        Command::Call(args) => commands::call::run(args, config).await,
    }
}
