//! `toolgate call` command implementation.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Args;
use console::style;
use serde_json::Value as JsonValue;
use toolgate_core::Arguments;
use toolgate_runtime::{Executor, InvocationRequest};
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Args)]
pub struct CallArgs {
    /// Tool name (e.g. "terminal_command").
    pub tool: String,

    /// Arguments as a JSON object, inline or @file.json. Defaults to `{}`.
    pub input: Option<String>,

    /// Attempt limit for this call, clamped to the configured ceiling.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Cancel the invocation after this many milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Start the invocation in the background and poll until it finishes.
    #[arg(long = "async")]
    pub background: bool,
}

pub async fn run(args: &CallArgs, config: Option<&Path>) -> Result<()> {
    let executor = super::gateway(config)?;

    eprintln!("{} Calling tool: {}", style("→").cyan(), style(&args.tool).bold());

    let (output, succeeded) = execute(&executor, args).await?;
    executor.drain().await;

    println!("{}", serde_json::to_string_pretty(&output)?);
    if succeeded {
        eprintln!("{} Done", style("✓").green().bold());
        Ok(())
    } else {
        bail!("invocation of `{}` did not succeed", args.tool)
    }
}

/// Runs the call and returns the printed document plus whether it succeeded.
async fn execute(executor: &Executor, args: &CallArgs) -> Result<(JsonValue, bool)> {
    let request = build_request(args)?;

    if !args.background {
        let response = executor.invoke(request).await;
        let succeeded = response.is_success();
        return Ok((serde_json::to_value(&response)?, succeeded));
    }

    let accepted = match executor.start(request) {
        Ok(accepted) => accepted,
        Err(error) => return Ok((error.to_json(), false)),
    };
    info!(invocation_id = %accepted.invocation_id, "Invocation accepted");

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                executor.cancel(&accepted.invocation_id)?;
            }
        }

        let snapshot = executor.poll(&accepted.invocation_id)?;
        if snapshot.status.is_terminal() {
            let succeeded = snapshot.status_code == Some(toolgate_core::SUCCESS_STATUS_CODE);
            return Ok((serde_json::to_value(&snapshot)?, succeeded));
        }
    }
}

fn build_request(args: &CallArgs) -> Result<InvocationRequest> {
    let arguments = match &args.input {
        Some(input) => parse_arguments(input)?,
        None => Arguments::new(),
    };

    let mut request = InvocationRequest::new(&args.tool, arguments);
    if let Some(max_attempts) = args.max_attempts {
        request = request.with_max_attempts(max_attempts);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(timeout_ms));
    }
    Ok(request)
}

fn parse_arguments(input: &str) -> Result<Arguments> {
    let raw = match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read input file: {path}"))?,
        None => input.to_string(),
    };

    match serde_json::from_str(&raw).context("invalid input JSON")? {
        JsonValue::Object(map) => Ok(map),
        _ => bail!("input must be a JSON object"),
    }
}
