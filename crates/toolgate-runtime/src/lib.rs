//! Execution layer of the Toolgate invocation gateway.
//!
//! This crate runs invocations against a [`toolgate_core::ToolRegistry`]:
//!
//! - [`Executor`]: synchronous invoke plus the asynchronous
//!   start/poll/cancel lifecycle
//! - [`TaskStore`]: in-memory invocation records and their state machine
//! - [`RetryController`]: bounded, mutation-aware retries with jittered
//!   exponential backoff
//! - [`ClientSlot`]: self-healing outbound clients that rebuild across
//!   context changes
//! - [`GatewayBuilder`]: assembles config, registry and executor
//!
//! # Example
//!
//! ```no_run
//! use toolgate_core::{Classification, Tool, handler_fn};
//! use toolgate_runtime::{GatewayBuilder, InvocationRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = GatewayBuilder::new()
//!     .with_tool(
//!         Tool::builder("echo", handler_fn(|_ctx, args| async move {
//!             Ok(serde_json::Value::Object(args))
//!         }))
//!         .classification(Classification::READ)
//!         .build(),
//!     )
//!     .build()?;
//!
//! let response = executor
//!     .invoke(InvocationRequest::new("echo", serde_json::Map::new()))
//!     .await;
//! assert_eq!(response.status_code, 200);
//! # Ok(())
//! # }
//! ```

mod builder;
pub mod executor;
pub mod lifecycle;
pub mod retry;
pub mod tasks;

pub use builder::{BuildError, GatewayBuilder};
pub use executor::{Accepted, Executor, InvocationOutcome, InvocationRequest, InvokeResponse};
pub use lifecycle::{
    ClientError, ClientFactory, ClientSlot, ContextGeneration, ContextId, ContextSource,
    ManagedClient, fingerprint,
};
pub use retry::{RetryController, RetryOutcome, RetryPolicy, jittered_backoff};
pub use tasks::{
    CancelAck, CancelReason, InvocationId, InvocationSnapshot, InvocationStatus, TaskStore,
    TaskStoreError,
};
