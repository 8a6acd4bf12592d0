//! `toolgate classify` command implementation.

use clap::Args;
use console::style;
use toolgate_core::classify_command;

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    /// Full shell command line, quoted as one argument
    pub command: String,

    /// Treat the command as a dependency installation
    #[arg(long)]
    pub installing_dependencies: bool,
}

/// `write` when the command may mutate state, `read` otherwise.
pub fn verdict(args: &ClassifyArgs) -> &'static str {
    if classify_command(&args.command, args.installing_dependencies) {
        "write"
    } else {
        "read"
    }
}

pub fn run(args: &ClassifyArgs) {
    let verdict = verdict(args);
    let styled = if verdict == "write" {
        style(verdict).yellow().bold()
    } else {
        style(verdict).green().bold()
    };
    println!("{styled}");
}
