//! Gateway configuration.
//!
//! Configuration lives in a single `toolgate.toml` file. Every section and
//! every field is optional; a missing file yields [`GatewayConfig::default`].
//!
//! # Resolution Algorithm
//!
//! 1. Environment variable override (`TOOLGATE_CONFIG_PATH`)
//! 2. Current directory
//! 3. Parent directories (walk up to filesystem root)
//! 4. XDG config directory (`~/.config/toolgate/toolgate.toml`)
//!
//! # Example
//!
//! ```toml
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 200
//!
//! [tasks]
//! max_concurrency = 8
//! retention_secs = 600
//!
//! [http]
//! user_agent = "my-agent/1.0"
//!
//! [[tools]]
//! name = "terminal_command"
//! enabled = false
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// File name searched for during resolution.
pub const CONFIG_FILE_NAME: &str = "toolgate.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "TOOLGATE_CONFIG_PATH";

/// Environment variable forcing jitter-free retries when set to `1`/`true`.
pub const DETERMINISTIC_ENV: &str = "TOOLGATE_DETERMINISTIC";

/// Errors that can occur during configuration resolution or loading.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error when reading a config file.
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error when a config file is malformed.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of `toolgate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub retry: RetryConfig,
    pub tasks: TaskConfig,
    /// Per-tool switches; tools not listed are enabled.
    pub tools: Vec<ToolConfig>,
    pub http: HttpConfig,
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts made when a request does not say otherwise.
    pub max_attempts: u32,
    /// Upper bound applied to per-request overrides.
    pub max_attempts_ceiling: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Spread added on top of an upstream-mandated minimum delay.
    pub max_jitter_ms: u64,
    /// Disables jitter so retry timing is reproducible.
    pub deterministic: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_attempts_ceiling: 10,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            max_jitter_ms: 1_000,
            deterministic: false,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }
}

/// `[tasks]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Handlers allowed to run concurrently on the asynchronous path.
    pub max_concurrency: usize,
    /// Maximum number of invocation records held at once.
    pub max_records: usize,
    /// Age after which terminal records are evicted.
    pub retention_secs: u64,
    /// Timeout applied when a request carries none.
    pub default_timeout_ms: Option<u64>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            max_records: 1_024,
            retention_secs: 3_600,
            default_timeout_ms: None,
        }
    }
}

impl TaskConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// One `[[tools]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// `[http]` section, shared by HTTP-backed tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// Response bodies longer than this are truncated.
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("toolgate/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_ms: 30_000,
            bearer_token: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl GatewayConfig {
    /// Loads and validates a config file from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if the file cannot be read, cannot be
    /// parsed, or holds out-of-range values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parses and validates config text.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` for malformed TOML or out-of-range values.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads config using the resolution algorithm, then applies
    /// environment overrides.
    ///
    /// Returns the path the config came from, or `None` with defaults when
    /// no file was found.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if a found file cannot be loaded.
    pub fn load_resolved() -> Result<(Self, Option<PathBuf>), ConfigError> {
        let current = std::env::current_dir().map_err(|source| ConfigError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        let locator = ConfigLocator {
            env_override: std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from),
            start_dir: current,
            xdg_path: dirs::config_dir().map(|dir| dir.join("toolgate").join(CONFIG_FILE_NAME)),
        };

        let (mut config, path) = match locator.locate() {
            Some(path) => (Self::load(&path)?, Some(path)),
            None => (Self::default(), None),
        };
        if std::env::var(DETERMINISTIC_ENV).is_ok_and(|v| parse_flag(&v)) {
            config.retry.deterministic = true;
        }
        Ok((config, path))
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.max_attempts_ceiling < self.retry.max_attempts {
            return Err(ConfigError::Invalid(
                "retry.max_attempts_ceiling must not be below retry.max_attempts".into(),
            ));
        }
        if self.tasks.max_concurrency == 0 {
            return Err(ConfigError::Invalid("tasks.max_concurrency must be at least 1".into()));
        }
        if self.tasks.max_records == 0 {
            return Err(ConfigError::Invalid("tasks.max_records must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether a tool may be registered. Unlisted tools are enabled.
    pub fn is_tool_enabled(&self, name: &str) -> bool {
        self.tools
            .iter()
            .find(|t| t.name == name)
            .is_none_or(|t| t.enabled)
    }
}

/// Inputs of the resolution algorithm.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    pub env_override: Option<PathBuf>,
    pub start_dir: PathBuf,
    pub xdg_path: Option<PathBuf>,
}

impl ConfigLocator {
    /// Returns the first existing candidate path.
    ///
    /// A set but missing environment override is logged and skipped.
    pub fn locate(&self) -> Option<PathBuf> {
        // Step 1: Environment variable override
        if let Some(path) = &self.env_override {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(
                path = %path.display(),
                env = CONFIG_PATH_ENV,
                "Config override does not exist, falling back to directory search"
            );
        }

        // Steps 2 and 3: current directory, then its ancestors
        for dir in self.start_dir.ancestors() {
            let path = dir.join(CONFIG_FILE_NAME);
            if path.is_file() {
                return Some(path);
            }
        }

        // Step 4: XDG config directory
        self.xdg_path.clone().filter(|path| path.is_file())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
