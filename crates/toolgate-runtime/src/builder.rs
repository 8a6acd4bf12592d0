//! Builder for assembling a gateway [`Executor`].
//!
//! [`GatewayBuilder`] handles:
//!
//! - **Config Loading**: an explicit [`GatewayConfig`], an explicit
//!   `toolgate.toml` path, or the resolution algorithm
//! - **Tool Registration**: registering tools, skipping those disabled in
//!   the config
//! - **Retry Policy**: deriving the policy from `[retry]`, optionally
//!   overridden
//!
//! # Usage
//!
//! ```no_run
//! use toolgate_core::{Classification, Tool, handler_fn};
//! use toolgate_runtime::GatewayBuilder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = GatewayBuilder::new()
//!     .with_config_path("toolgate.toml")
//!     .with_tool(
//!         Tool::builder("echo", handler_fn(|_ctx, args| async move {
//!             Ok(serde_json::Value::Object(args))
//!         }))
//!         .classification(Classification::READ)
//!         .build(),
//!     )
//!     .build()?;
//! # let _ = executor;
//! # Ok(())
//! # }
//! ```

use std::{fmt, path::PathBuf, sync::Arc};

use toolgate_core::{ConfigError, GatewayConfig, RegistryError, Tool, ToolRegistry};
use tracing::{info, warn};

use crate::{executor::Executor, retry::RetryPolicy};

/// Errors that can occur while assembling a gateway.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    /// Failed to load or parse the config file.
    #[error("failed to load config: {0}")]
    Config(#[from] ConfigError),

    /// Two tools share a name, or a name is empty.
    #[error("failed to register tool: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
enum ConfigSource {
    Resolved,
    Path(PathBuf),
    Explicit(Box<GatewayConfig>),
}

/// Fluent builder for [`Executor`] instances.
///
/// # Default Configuration
///
/// - Config: resolved from the environment and filesystem
/// - Tools: none
/// - Retry policy: derived from the config's `[retry]` section
#[derive(Default)]
pub struct GatewayBuilder {
    config: Option<ConfigSource>,
    tools: Vec<Tool>,
    retry_policy: Option<RetryPolicy>,
}

impl fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("config", &self.config)
            .field("tools", &self.tools.len())
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl GatewayBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an already loaded config.
    #[must_use]
    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(ConfigSource::Explicit(Box::new(config)));
        self
    }

    /// Loads the config from an explicit path instead of resolving it.
    ///
    /// A missing file falls back to defaults with a warning.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(ConfigSource::Path(path.into()));
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Overrides the retry policy derived from config.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Loads config, registers enabled tools and builds the executor.
    ///
    /// # Errors
    ///
    /// - [`BuildError::Config`] if a config file exists but cannot be loaded
    /// - [`BuildError::Registry`] on duplicate or empty tool names
    pub fn build(self) -> Result<Executor, BuildError> {
        let config = load_config(self.config.unwrap_or(ConfigSource::Resolved))?;

        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            if !config.is_tool_enabled(tool.name()) {
                info!(tool = %tool.name(), "Tool disabled by config, skipping");
                continue;
            }
            registry.register(tool)?;
        }

        for entry in &config.tools {
            if registry.get(&entry.name).is_none() && entry.enabled {
                warn!(tool = %entry.name, "Config names a tool that is not available");
            }
        }

        info!(tool_count = registry.len(), "Tool registry initialized");

        let policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from_config(&config.retry));
        Ok(Executor::with_retry_policy(Arc::new(registry), &config, policy))
    }
}

fn load_config(source: ConfigSource) -> Result<GatewayConfig, ConfigError> {
    match source {
        ConfigSource::Explicit(config) => {
            config.validate()?;
            Ok(*config)
        }
        ConfigSource::Path(path) if path.exists() => {
            info!(path = %path.display(), "Loading config");
            GatewayConfig::load(&path)
        }
        ConfigSource::Path(path) => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(GatewayConfig::default())
        }
        ConfigSource::Resolved => {
            let (config, path) = GatewayConfig::load_resolved()?;
            match path {
                Some(path) => info!(path = %path.display(), "Loaded config"),
                None => info!("No config file found, using defaults"),
            }
            Ok(config)
        }
    }
}
