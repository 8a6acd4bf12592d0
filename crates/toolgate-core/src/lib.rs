//! Core types for the Toolgate invocation gateway.
//!
//! This crate provides the pieces of the gateway that do not depend on a
//! running executor: tool registration and resolution, write
//! classification, the structured error taxonomy, and configuration.
//!
//! # Key Components
//!
//! - **Tool Registry**: [`ToolRegistry`] resolves requested names and
//!   suggests close matches on a miss
//! - **Classification**: [`Classification`] decides per call whether an
//!   invocation mutates state
//! - **Errors**: [`StructuredError`] is the single failure envelope, with
//!   [`normalize_fault`] and [`normalize_result`] producing it
//! - **Configuration**: [`GatewayConfig`] loaded from `toolgate.toml`
//!
//! # Example
//!
//! ```
//! use toolgate_core::{Classification, Tool, ToolRegistry, handler_fn};
//!
//! let mut registry = ToolRegistry::new();
//! registry
//!     .register(
//!         Tool::builder("echo", handler_fn(|_ctx, args| async move {
//!             Ok(serde_json::Value::Object(args))
//!         }))
//!         .classification(Classification::READ)
//!         .build(),
//!     )
//!     .unwrap();
//!
//! let miss = registry.resolve("ech0").unwrap_err();
//! assert_eq!(miss.to_structured().status_code(), 404);
//! ```
//!
//! # Thread Safety
//!
//! [`ToolRegistry::register`] requires `&mut self`. Register all tools before
//! wrapping the registry in `Arc`; afterwards it is read-only and safe to
//! share.

pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod suggest;
mod tool;

pub use classify::{Classification, classify_command, is_write_command, shell_command_classifier};
pub use config::{ConfigError, GatewayConfig, HttpConfig, RetryConfig, TaskConfig, ToolConfig};
pub use context::{CallContext, Cancelled};
pub use error::{
    ACCEPTED_STATUS_CODE, CANCELLED_ERROR_CODE, CANCELLED_STATUS_CODE, ErrorCategory,
    SUCCESS_STATUS_CODE, StructuredError, normalize_fault, normalize_result,
};
pub use suggest::{ArgumentDiagnostics, Suggestions, diagnose_arguments, suggest};
pub use tool::{
    Arguments, FnHandler, InflightRequestGuard, ParamKind, ParamSchema, ParamSpec, RegistryError,
    Tool, ToolBuilder, ToolDescriptor, ToolHandler, ToolNotFound, ToolRegistry, handler_fn,
};
