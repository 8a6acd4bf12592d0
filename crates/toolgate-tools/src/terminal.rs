//! `terminal_command`: runs a shell command and captures its output.

use std::{io, process::Stdio};

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use toolgate_core::{
    Arguments, CallContext, ParamKind, ParamSchema, ParamSpec, StructuredError, Tool, ToolHandler,
    shell_command_classifier,
};
use tracing::debug;

pub const TOOL_NAME: &str = "terminal_command";

/// Bytes kept from each of stdout and stderr unless overridden.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Runs `sh -c <command>`.
///
/// A non-zero exit status is a normal result, not an error. The child is
/// killed if the invocation is cancelled. Each stream is cut at
/// `max_output_bytes`; the rest is read and discarded so the child never
/// blocks on a full pipe.
#[derive(Debug, Clone, Copy)]
pub struct TerminalCommand {
    max_output_bytes: usize,
}

impl Default for TerminalCommand {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl TerminalCommand {
    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

#[async_trait]
impl ToolHandler for TerminalCommand {
    async fn call(&self, ctx: CallContext, args: Arguments) -> anyhow::Result<JsonValue> {
        let command = args
            .get("command")
            .and_then(JsonValue::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                StructuredError::validation("invalid_argument", "`command` must be a non-empty string")
            })?;
        let cwd = match args.get("cwd") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(cwd)) => Some(cwd.as_str()),
            Some(_) => {
                return Err(StructuredError::validation("invalid_argument", "`cwd` must be a string").into());
            }
        };

        ctx.checkpoint()?;
        debug!(command, cwd, attempt = ctx.attempt(), "Running shell command");

        let mut child = Command::new("sh");
        child
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            child.current_dir(cwd);
        }

        let mut child = child
            .spawn()
            .with_context(|| format!("failed to run `{command}`"))?;
        let stdout = child.stdout.take().context("child stdout was not piped")?;
        let stderr = child.stderr.take().context("child stderr was not piped")?;

        let (stdout, stderr, status) = tokio::try_join!(
            read_capped(stdout, self.max_output_bytes),
            read_capped(stderr, self.max_output_bytes),
            child.wait(),
        )
        .with_context(|| format!("failed to collect output of `{command}`"))?;

        if stdout.truncated || stderr.truncated {
            debug!(command, limit = self.max_output_bytes, "Truncated command output");
        }

        Ok(json!({
            "exit_code": status.code(),
            "stdout": String::from_utf8_lossy(&stdout.bytes),
            "stderr": String::from_utf8_lossy(&stderr.bytes),
            "stdout_truncated": stdout.truncated,
            "stderr_truncated": stderr.truncated,
        }))
    }
}

struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

async fn read_capped<R: AsyncRead + Unpin>(mut stream: R, limit: usize) -> io::Result<Captured> {
    let mut bytes = Vec::new();
    (&mut stream)
        .take(u64::try_from(limit).unwrap_or(u64::MAX))
        .read_to_end(&mut bytes)
        .await?;
    let discarded = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
    Ok(Captured {
        bytes,
        truncated: discarded > 0,
    })
}

/// Registration record for `terminal_command`.
pub fn terminal_command_tool() -> Tool {
    Tool::builder(TOOL_NAME, std::sync::Arc::new(TerminalCommand::default()))
        .description("Run a shell command and return its exit code, stdout and stderr")
        .params(ParamSchema::new(vec![
            ParamSpec::required("command", ParamKind::String)
                .with_description("Command line passed to `sh -c`"),
            ParamSpec::optional("cwd", ParamKind::String).with_description("Working directory"),
            ParamSpec::optional("installing_dependencies", ParamKind::Boolean)
                .with_description("Set when the command installs packages"),
        ]))
        .classification(shell_command_classifier())
        .build()
}
