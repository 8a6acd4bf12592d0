//! Tool registry and tool registration records.
//!
//! This module provides the core infrastructure for declaring tools,
//! resolving requested names, and describing the registered catalog.
//!
//! # Architecture
//!
//! The tool system is built around three main types:
//!
//! - [`ToolRegistry`]: Central registry holding every registered tool
//! - [`Tool`]: Immutable registration record (metadata, parameter schema,
//!   write classification and handler)
//! - [`ToolDescriptor`]: Serializable catalog entry describing a tool
//!
//! # Thread Safety
//!
//! ## Registration Phase (Not Thread-Safe)
//!
//! [`ToolRegistry::register`] takes `&mut self`. Register every tool before
//! wrapping the registry in [`Arc`].
//!
//! ## Execution Phase (Thread-Safe)
//!
//! Once wrapped in [`Arc`]:
//! - [`ToolRegistry::resolve`], [`ToolRegistry::list`] and
//!   [`ToolRegistry::catalog`] can be called concurrently
//! - Tools are shared as `Arc<Tool>` and may be invoked concurrently
//! - The in-flight request counter uses atomic operations
//!
//! # Unknown Names
//!
//! A failed [`ToolRegistry::resolve`] returns a [`ToolNotFound`] carrying
//! similarity-ranked suggestions computed over the registered names.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use tracing::info;

use crate::{
    classify::Classification,
    context::CallContext,
    error::StructuredError,
    suggest::{Suggestions, suggest},
};

/// Arguments of one invocation, keyed by parameter name.
pub type Arguments = Map<String, JsonValue>;

/// Errors that can occur during tool registration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Attempted to register a tool whose name already exists.
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),

    /// Attempted to register a tool with an empty name.
    #[error("tool name must not be empty")]
    EmptyName,
}

/// A requested tool name that is not registered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("tool not found: {requested}")]
pub struct ToolNotFound {
    pub requested: String,
    pub suggestions: Suggestions,
}

impl ToolNotFound {
    /// Converts the miss into a `not_found` envelope with suggestions.
    pub fn to_structured(&self) -> StructuredError {
        let mut error =
            StructuredError::not_found("tool_not_found", format!("unknown tool: {}", self.requested))
                .with_detail("requested_tool", self.requested.clone())
                .with_detail("candidates", self.suggestions.candidates.clone());

        if let Some(suggested) = &self.suggestions.suggested {
            error = error
                .with_detail("suggested_tool", suggested.clone())
                .with_hint(format!("did you mean `{suggested}`?"));
        } else if !self.suggestions.candidates.is_empty() {
            error = error.with_hint(format!(
                "close matches: {}",
                self.suggestions.candidates.join(", ")
            ));
        }
        error
    }
}

impl From<ToolNotFound> for StructuredError {
    fn from(value: ToolNotFound) -> Self {
        value.to_structured()
    }
}

/// JSON type of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ParamKind {
    fn json_type(self) -> Option<&'static str> {
        match self {
            Self::String => Some("string"),
            Self::Integer => Some("integer"),
            Self::Number => Some("number"),
            Self::Boolean => Some("boolean"),
            Self::Object => Some("object"),
            Self::Array => Some("array"),
            Self::Any => None,
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            required: true,
            kind,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            required: false,
            kind,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Declared parameter schema of a handler.
///
/// Used for argument diagnostics and catalog rendering only; handlers
/// receive the raw argument map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
    accepts_extra: bool,
}

impl ParamSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self {
            params,
            accepts_extra: false,
        }
    }

    /// Allows arguments that are not declared (variadic handlers).
    #[must_use]
    pub fn with_extra(mut self, accepts_extra: bool) -> Self {
        self.accepts_extra = accepts_extra;
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn accepts_extra(&self) -> bool {
        self.accepts_extra
    }

    /// Names of required parameters, in declaration order.
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
    }

    /// Names of optional parameters, in declaration order.
    pub fn optional(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|p| !p.required)
            .map(|p| p.name.as_str())
    }

    /// Renders the schema as a JSON Schema object.
    pub fn to_json_schema(&self) -> JsonValue {
        let properties: Map<String, JsonValue> = self
            .params
            .iter()
            .map(|p| {
                let mut property = Map::new();
                if let Some(ty) = p.kind.json_type() {
                    property.insert("type".to_string(), json!(ty));
                }
                if let Some(description) = &p.description {
                    property.insert("description".to_string(), json!(description));
                }
                (p.name.clone(), JsonValue::Object(property))
            })
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": self.required().collect::<Vec<_>>(),
            "additionalProperties": self.accepts_extra,
        })
    }
}

/// Calling convention for tool handlers.
///
/// Handlers either return a JSON value or raise a fault. A returned value
/// that is error-shaped (see [`crate::error::normalize_result`]) is treated
/// as a failure, exactly like a raised fault.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, args: Arguments) -> anyhow::Result<JsonValue>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(CallContext, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Arguments) -> anyhow::Result<JsonValue> {
        (self.0)(ctx, args).await
    }
}

/// Wraps an async closure as a handler.
///
/// ```
/// use toolgate_core::handler_fn;
///
/// let handler = handler_fn(|_ctx, args| async move { Ok(serde_json::Value::Object(args)) });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(CallContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Immutable tool registration record.
pub struct Tool {
    name: String,
    description: String,
    params: ParamSchema,
    classification: Classification,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("classification", &self.classification)
            .finish_non_exhaustive()
    }
}

impl Tool {
    /// Starts building a tool with the given name and handler.
    ///
    /// Tools default to no parameters and a static write classification.
    pub fn builder(name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> ToolBuilder {
        ToolBuilder {
            name: name.into(),
            description: String::new(),
            params: ParamSchema::default(),
            classification: Classification::default(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn params(&self) -> &ParamSchema {
        &self.params
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn handler(&self) -> &Arc<dyn ToolHandler> {
        &self.handler
    }

    /// Evaluates whether a call with these arguments is a write.
    pub fn is_write_action(&self, arguments: &Arguments) -> bool {
        self.classification.evaluate(arguments)
    }

    /// Catalog entry for this tool.
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.params.to_json_schema(),
            write_action: self.classification.label().to_string(),
        }
    }
}

/// Fluent builder for [`Tool`].
pub struct ToolBuilder {
    name: String,
    description: String,
    params: ParamSchema,
    classification: Classification,
    handler: Arc<dyn ToolHandler>,
}

impl ToolBuilder {
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn params(mut self, params: ParamSchema) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    /// Shorthand for a static classification.
    #[must_use]
    pub fn write_action(self, write: bool) -> Self {
        self.classification(Classification::Static(write))
    }

    pub fn build(self) -> Tool {
        Tool {
            name: self.name,
            description: self.description,
            params: self.params,
            classification: self.classification,
            handler: self.handler,
        }
    }
}

/// Serializable catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the declared parameters.
    pub parameters: JsonValue,
    /// `read`, `write` or `dynamic`.
    pub write_action: String,
}

/// Central registry of tools.
///
/// The `ToolRegistry` is responsible for:
///
/// - Holding every registered tool under its unique name
/// - Resolving requested names, with suggestions on a miss
/// - Describing the registered catalog
/// - Tracking in-flight requests for graceful shutdown
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use toolgate_core::{Tool, ToolRegistry, handler_fn};
/// let mut registry = ToolRegistry::new();
/// registry
///     .register(
///         Tool::builder("echo", handler_fn(|_ctx, args| async move {
///             Ok(serde_json::Value::Object(args))
///         }))
///         .write_action(false)
///         .build(),
///     )
///     .unwrap();
///
/// let registry = Arc::new(registry);
/// assert!(registry.resolve("echo").is_ok());
/// assert!(registry.resolve("ecko").is_err());
/// ```
#[derive(Debug, Default)]
pub struct ToolRegistry {
    /// Map from tool name to registration record
    tools: HashMap<String, Arc<Tool>>,
    /// Counter for tracking in-flight requests
    inflight: AtomicU64,
}

/// RAII guard for tracking in-flight tool requests.
///
/// When created, this guard increments the registry's in-flight counter.
/// When dropped, it automatically decrements the counter.
#[must_use = "if unused, the in-flight request will be immediately ended"]
pub struct InflightRequestGuard<'a> {
    registry: &'a ToolRegistry,
}

impl Drop for InflightRequestGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_request();
    }
}

impl ToolRegistry {
    /// Creates a new, empty tool registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if a tool with the same name
    /// is already registered, or [`RegistryError::EmptyName`] for an empty
    /// name.
    pub fn register(&mut self, tool: Tool) -> Result<(), RegistryError> {
        if tool.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.tools.contains_key(&tool.name) {
            return Err(RegistryError::DuplicateName(tool.name));
        }

        info!(tool = %tool.name, write_action = tool.classification.label(), "Registered tool");
        self.tools.insert(tool.name.clone(), Arc::new(tool));
        Ok(())
    }

    /// Gets a tool by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    /// Resolves a requested tool name.
    ///
    /// # Errors
    ///
    /// Returns [`ToolNotFound`] with similarity-ranked suggestions when no
    /// tool has exactly this name.
    pub fn resolve(&self, name: &str) -> Result<Arc<Tool>, ToolNotFound> {
        self.get(name).ok_or_else(|| ToolNotFound {
            requested: name.to_string(),
            suggestions: suggest(name, self.names()),
        })
    }

    /// Iterates over registered names in unspecified order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Iterates over registered tools in unspecified order.
    pub fn list(&self) -> impl Iterator<Item = &Arc<Tool>> {
        self.tools.values()
    }

    /// Catalog of every registered tool, sorted by name.
    #[must_use]
    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        let mut catalog: Vec<ToolDescriptor> = self.tools.values().map(|t| t.descriptor()).collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Increments the in-flight request counter.
    pub fn start_request(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Creates a guard that tracks an in-flight request.
    #[must_use = "dropping the guard immediately will end the request"]
    pub fn start_request_guard(&self) -> InflightRequestGuard<'_> {
        self.start_request();
        InflightRequestGuard { registry: self }
    }

    /// Decrements the in-flight request counter, saturating at zero.
    pub fn end_request(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    /// Returns the current number of in-flight requests.
    #[must_use]
    pub fn inflight_count(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Waits for all in-flight requests to complete.
    ///
    /// Polls the in-flight counter every 10ms until it reaches zero.
    pub async fn drain(&self) {
        while self.inflight_count() > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classify::shell_command_classifier, error::ErrorCategory};

    fn echo_tool(name: &str) -> Tool {
        Tool::builder(
            name,
            handler_fn(|_ctx, args| async move { Ok(JsonValue::Object(args)) }),
        )
        .description("Echoes its arguments")
        .params(ParamSchema::new(vec![
            ParamSpec::required("message", ParamKind::String).with_description("Text to echo"),
            ParamSpec::optional("count", ParamKind::Integer),
        ]))
        .write_action(false)
        .build()
    }

    fn registry_with(names: &[&str]) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in names {
            registry.register(echo_tool(name)).unwrap();
        }
        registry
    }

    #[test]
    fn test_empty_registry() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.catalog().is_empty());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = registry_with(&["echo"]);
        let err = registry.register(echo_tool("echo")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref name) if name == "echo"));
        assert_eq!(err.to_string(), "duplicate tool name: echo");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let mut registry = ToolRegistry::new();
        assert!(matches!(
            registry.register(echo_tool("  ")),
            Err(RegistryError::EmptyName)
        ));
    }

    #[test]
    fn test_resolve_returns_registered_tool() {
        let registry = registry_with(&["echo", "fetch_url"]);
        let tool = registry.resolve("fetch_url").unwrap();
        assert_eq!(tool.name(), "fetch_url");
    }

    #[test]
    fn test_resolve_miss_with_ambiguous_candidates() {
        let registry = registry_with(&["terminal_command", "terminal_commands"]);
        let miss = registry.resolve("terminal_comand").unwrap_err();

        assert_eq!(miss.suggestions.suggested, None);
        assert_eq!(miss.suggestions.candidates.len(), 2);

        let structured = miss.to_structured();
        assert_eq!(structured.category, ErrorCategory::NotFound);
        assert_eq!(structured.code, "tool_not_found");
        assert!(!structured.details.contains_key("suggested_tool"));
        assert_eq!(
            structured.details["candidates"],
            json!(["terminal_command", "terminal_commands"])
        );
    }

    #[test]
    fn test_resolve_miss_with_single_suggestion() {
        let registry = registry_with(&["terminal_command"]);
        let structured: StructuredError = registry.resolve("terminal_comand").unwrap_err().into();

        assert_eq!(structured.details["suggested_tool"], json!("terminal_command"));
        assert_eq!(
            structured.hint.as_deref(),
            Some("did you mean `terminal_command`?")
        );
        assert_eq!(structured.status_code(), 404);
    }

    #[test]
    fn test_catalog_is_sorted_and_renders_schema() {
        let mut registry = registry_with(&["zeta", "alpha"]);
        registry
            .register(
                Tool::builder(
                    "terminal_command",
                    handler_fn(|_ctx, _args| async move { Ok(JsonValue::Null) }),
                )
                .classification(shell_command_classifier())
                .build(),
            )
            .unwrap();

        let catalog = registry.catalog();
        let names: Vec<&str> = catalog.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "terminal_command", "zeta"]);

        let alpha = &catalog[0];
        assert_eq!(alpha.write_action, "read");
        assert_eq!(alpha.parameters["required"], json!(["message"]));
        assert_eq!(
            alpha.parameters["properties"]["message"],
            json!({"type": "string", "description": "Text to echo"})
        );
        assert_eq!(alpha.parameters["additionalProperties"], json!(false));
        assert_eq!(catalog[1].write_action, "dynamic");
    }

    #[test]
    fn test_builder_defaults_to_write() {
        let tool = Tool::builder(
            "mystery",
            handler_fn(|_ctx, _args| async move { Ok(JsonValue::Null) }),
        )
        .build();
        assert!(tool.is_write_action(&Arguments::new()));
        assert!(tool.params().params().is_empty());
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let tool = echo_tool("echo");
        let mut args = Arguments::new();
        args.insert("message".to_string(), json!("hi"));

        let result = tool
            .handler()
            .call(CallContext::new("echo"), args)
            .await
            .unwrap();
        assert_eq!(result, json!({"message": "hi"}));
    }

    #[test]
    fn test_inflight_counter_basic() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.inflight_count(), 0);

        registry.start_request();
        registry.start_request();
        assert_eq!(registry.inflight_count(), 2);

        registry.end_request();
        registry.end_request();
        assert_eq!(registry.inflight_count(), 0);
    }

    #[test]
    fn test_end_request_saturates_at_zero() {
        let registry = ToolRegistry::new();
        registry.end_request();
        assert_eq!(registry.inflight_count(), 0);
    }

    #[test]
    fn test_inflight_request_guard_decrements_on_drop() {
        let registry = ToolRegistry::new();
        {
            let _guard = registry.start_request_guard();
            assert_eq!(registry.inflight_count(), 1);
        }
        assert_eq!(registry.inflight_count(), 0);
    }

    #[test]
    fn test_inflight_counter_concurrent_inc_dec() {
        use std::thread;

        let registry = Arc::new(ToolRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let _guard = registry.start_request_guard();
                        thread::yield_now();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(registry.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_inflight_requests_to_complete() {
        let registry = Arc::new(ToolRegistry::new());
        registry.start_request();

        let cloned = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(25)).await;
            cloned.end_request();
        });

        let result =
            tokio::time::timeout(tokio::time::Duration::from_secs(1), registry.drain()).await;
        assert!(result.is_ok());
        assert_eq!(registry.inflight_count(), 0);
    }
}
