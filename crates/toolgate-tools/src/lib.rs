//! Built-in tools shipped with the Toolgate gateway.
//!
//! - [`terminal_command`](terminal::TOOL_NAME): runs a shell command,
//!   classified per command line
//! - [`fetch_url`](fetch::TOOL_NAME): outbound HTTP through a
//!   [`ClientSlot`](toolgate_runtime::ClientSlot), classified per method

use std::sync::Arc;

use toolgate_core::{GatewayConfig, Tool};
use toolgate_runtime::{ContextGeneration, ContextSource};

pub mod fetch;
pub mod terminal;

pub use fetch::{FetchUrl, HttpClient, HttpClientFactory, HttpSettings, fetch_url_tool};
pub use terminal::{TerminalCommand, terminal_command_tool};

/// Every built-in tool, configured from `config`.
///
/// Returned tools are not yet filtered by `[[tools]]`; the gateway builder
/// does that when registering them.
pub fn builtin_tools(config: &GatewayConfig) -> Vec<Tool> {
    builtin_tools_with_context(config, Arc::new(ContextGeneration::new()))
}

/// Like [`builtin_tools`], with an explicit execution-context source for
/// outbound clients.
pub fn builtin_tools_with_context(config: &GatewayConfig, context: Arc<dyn ContextSource>) -> Vec<Tool> {
    vec![
        terminal_command_tool(),
        fetch_url_tool(HttpSettings::new(config.http.clone()), context),
    ]
}
