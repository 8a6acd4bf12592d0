//! CLI command implementations for `toolgate`.
//!
//! Each subcommand lives in its own module and exports an `*Args` struct
//! implementing `clap::Args` plus a `run` function.
//!
//! - **`list`**: Display every registered tool
//! - **`describe`**: Show one tool's parameters and classification
//! - **`classify`**: Print the read/write verdict for a shell command
//! - **`call`**: Invoke a tool synchronously or through the task lifecycle

use std::path::Path;

use anyhow::{Context, Result};
use toolgate_core::GatewayConfig;
use toolgate_runtime::{Executor, GatewayBuilder};
use toolgate_tools::builtin_tools;

pub mod call;
pub mod classify;
pub mod describe;
pub mod list;

/// Builds an executor with the built-in tools.
///
/// An explicit `config` path must exist; otherwise the standard resolution
/// order applies.
pub fn gateway(config: Option<&Path>) -> Result<Executor> {
    let config = match config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => GatewayConfig::load_resolved()
            .context("failed to resolve config")?
            .0,
    };

    let tools = builtin_tools(&config);
    GatewayBuilder::new()
        .with_config(config)
        .with_tools(tools)
        .build()
        .context("failed to build gateway")
}
