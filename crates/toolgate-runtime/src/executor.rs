//! Invocation executor.
//!
//! [`Executor`] is the library surface of the gateway. It resolves tools,
//! checks arguments against the declared schema, classifies each call, and
//! runs the handler under the retry controller either inline
//! ([`Executor::invoke`]) or as a tracked background task
//! ([`Executor::start`], [`Executor::poll`], [`Executor::cancel`]).
//!
//! Every failure leaving the executor is a [`StructuredError`]; the
//! envelope and its status code are the same on both paths.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use toolgate_core::{
    ACCEPTED_STATUS_CODE, Arguments, CANCELLED_STATUS_CODE, CallContext, GatewayConfig,
    SUCCESS_STATUS_CODE, StructuredError, Tool, ToolDescriptor, ToolRegistry, diagnose_arguments,
    normalize_fault, normalize_result,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    retry::{RetryController, RetryOutcome, RetryPolicy},
    tasks::{CancelAck, CancelReason, InvocationId, InvocationSnapshot, TaskStore},
};

/// A request to invoke one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Arguments,
    /// Per-request attempt budget; clamped to the configured ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl InvocationRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            max_attempts: None,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Terminal outcome of a synchronous invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded { result: JsonValue },
    Failed { error: StructuredError },
    Cancelled { reason: CancelReason },
}

impl InvocationOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Succeeded { .. } => SUCCESS_STATUS_CODE,
            Self::Failed { error } => error.status_code(),
            Self::Cancelled { .. } => CANCELLED_STATUS_CODE,
        }
    }

    /// The payload a transport would return: the handler value, the error
    /// envelope, or the cancellation marker.
    pub fn payload(&self) -> JsonValue {
        match self {
            Self::Succeeded { result } => result.clone(),
            Self::Failed { error } => error.to_json(),
            Self::Cancelled { reason } => reason.payload(),
        }
    }
}

/// Response of [`Executor::invoke`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvokeResponse {
    pub status_code: u16,
    #[serde(flatten)]
    pub outcome: InvocationOutcome,
    pub attempts: u32,
    pub write_action: bool,
}

impl InvokeResponse {
    fn new(outcome: InvocationOutcome, attempts: u32, write_action: bool) -> Self {
        Self {
            status_code: outcome.status_code(),
            outcome,
            attempts,
            write_action,
        }
    }

    fn rejected(error: StructuredError) -> Self {
        Self::new(InvocationOutcome::Failed { error }, 0, false)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Succeeded { .. })
    }
}

/// Response of [`Executor::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub invocation_id: InvocationId,
    pub status: &'static str,
    pub status_code: u16,
}

impl Accepted {
    fn new(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            status: "accepted",
            status_code: ACCEPTED_STATUS_CODE,
        }
    }
}

/// Everything decided before the first attempt.
struct Prepared {
    tool: Arc<Tool>,
    arguments: Arguments,
    write_action: bool,
    max_attempts: u32,
    timeout: Option<Duration>,
}

struct Inner {
    registry: Arc<ToolRegistry>,
    store: TaskStore,
    retry: RetryController,
    pool: Arc<Semaphore>,
    default_timeout: Option<Duration>,
}

/// Runs tool invocations synchronously or as tracked background tasks.
///
/// Cloning is cheap; clones share the registry, the task store and the
/// worker pool.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("tools", &self.inner.registry.len())
            .field("records", &self.inner.store.len())
            .field("retry", self.inner.retry.policy())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor over a fully populated registry.
    pub fn new(registry: Arc<ToolRegistry>, config: &GatewayConfig) -> Self {
        Self::with_retry_policy(registry, config, RetryPolicy::from_config(&config.retry))
    }

    /// Creates an executor with an explicit retry policy.
    pub fn with_retry_policy(
        registry: Arc<ToolRegistry>,
        config: &GatewayConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store: TaskStore::new(config.tasks.max_records, config.tasks.retention()),
                retry: RetryController::new(policy),
                pool: Arc::new(Semaphore::new(config.tasks.max_concurrency.max(1))),
                default_timeout: config.tasks.default_timeout(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.inner.retry.policy()
    }

    /// Catalog of registered tools, sorted by name.
    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.inner.registry.catalog()
    }

    /// Runs an invocation to completion and returns its outcome.
    ///
    /// Unknown tools and mismatched arguments are reported without running
    /// the handler.
    #[instrument(skip_all, fields(tool = %request.tool_name))]
    pub async fn invoke(&self, request: InvocationRequest) -> InvokeResponse {
        let _guard = self.inner.registry.start_request_guard();

        let prepared = match self.inner.prepare(request) {
            Ok(prepared) => prepared,
            Err(error) => return InvokeResponse::rejected(error),
        };
        info!(
            write_action = prepared.write_action,
            max_attempts = prepared.max_attempts,
            "Invoking tool"
        );

        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let write_action = prepared.write_action;
        let timeout = prepared.timeout;
        let run = self
            .inner
            .run_attempts(&prepared, None, &token, |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
            });

        let outcome = match with_deadline(timeout, run).await {
            Some(outcome) => outcome,
            None => {
                token.cancel();
                warn!(timeout_ms = ?timeout.map(|t| t.as_millis()), "Invocation timed out");
                return InvokeResponse::new(
                    InvocationOutcome::Cancelled {
                        reason: CancelReason::Timeout,
                    },
                    attempts.load(Ordering::Relaxed),
                    write_action,
                );
            }
        };

        let response = match outcome.result {
            Ok(result) => InvokeResponse::new(
                InvocationOutcome::Succeeded { result },
                outcome.attempts,
                write_action,
            ),
            Err(error) if error.is_cancellation() => InvokeResponse::new(
                InvocationOutcome::Cancelled {
                    reason: CancelReason::Caller,
                },
                outcome.attempts,
                write_action,
            ),
            Err(error) => InvokeResponse::new(
                InvocationOutcome::Failed { error },
                outcome.attempts,
                write_action,
            ),
        };
        info!(
            status_code = response.status_code,
            attempts = response.attempts,
            "Invocation finished"
        );
        response
    }

    /// Starts an invocation in the background and returns its id at once.
    ///
    /// The tool is resolved and the arguments diagnosed eagerly, so those
    /// failures are returned here and create no record.
    ///
    /// # Errors
    ///
    /// Returns a `not_found` or `validation` error for a bad request, a
    /// retryable `rate_limited` error when the task store is full of live
    /// invocations, or an `internal` `no_runtime` error when called outside
    /// a Tokio runtime.
    #[instrument(skip_all, fields(tool = %request.tool_name))]
    pub fn start(&self, request: InvocationRequest) -> Result<Accepted, StructuredError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            StructuredError::internal("no_runtime", format!("cannot start invocation: {e}"))
        })?;
        let prepared = self.inner.prepare(request)?;
        let (id, token) = self
            .inner
            .store
            .insert(prepared.tool.name(), prepared.write_action)?;

        info!(
            invocation_id = %id,
            write_action = prepared.write_action,
            "Accepted invocation"
        );

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            inner.run_background(id, prepared, token).await;
        });

        Ok(Accepted::new(id))
    }

    /// Returns a snapshot of an invocation record. Never blocks on the
    /// handler and never mutates the record.
    ///
    /// # Errors
    ///
    /// Returns a `not_found` error for an unknown id.
    pub fn poll(&self, id: &InvocationId) -> Result<InvocationSnapshot, StructuredError> {
        Ok(self.inner.store.snapshot(*id)?)
    }

    /// Cancels a pending or running invocation.
    ///
    /// Cancelling a terminal invocation is a no-op that reports its status.
    ///
    /// # Errors
    ///
    /// Returns a `not_found` error for an unknown id.
    #[instrument(skip(self), fields(invocation_id = %id))]
    pub fn cancel(&self, id: &InvocationId) -> Result<CancelAck, StructuredError> {
        let ack = self.inner.store.cancel(*id, CancelReason::Caller)?;
        if ack.cancelled {
            info!("Cancelled invocation");
        }
        Ok(ack)
    }

    /// Waits until no invocation is in flight and no record is live.
    pub async fn drain(&self) {
        loop {
            self.inner.registry.drain().await;
            if self.inner.store.live_count() == 0 && self.inner.registry.inflight_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Inner {
    fn prepare(&self, request: InvocationRequest) -> Result<Prepared, StructuredError> {
        let timeout = request.timeout().or(self.default_timeout);
        let tool = self
            .registry
            .resolve(&request.tool_name)
            .map_err(|miss| miss.to_structured())?;

        if let Some(diagnostics) = diagnose_arguments(tool.params(), &request.arguments) {
            let details = serde_json::to_value(&diagnostics).unwrap_or(JsonValue::Null);
            let mut error = StructuredError::validation(
                "invalid_arguments",
                format!("{}: {}", tool.name(), diagnostics.summary()),
            );
            if let JsonValue::Object(details) = details {
                error.details = details;
            }
            return Err(error);
        }

        let write_action = tool.is_write_action(&request.arguments);
        Ok(Prepared {
            max_attempts: self.retry.policy().clamp_attempts(request.max_attempts),
            tool,
            arguments: request.arguments,
            write_action,
            timeout,
        })
    }

    /// Runs the retry-wrapped attempt chain. `on_attempt` sees each attempt
    /// number before the handler is called.
    fn run_attempts<'a>(
        &'a self,
        prepared: &'a Prepared,
        invocation_id: Option<InvocationId>,
        token: &'a CancellationToken,
        on_attempt: impl Fn(u32) + 'a,
    ) -> impl Future<Output = RetryOutcome<JsonValue>> + 'a {
        self.retry
            .run(prepared.max_attempts, prepared.write_action, move |attempt| {
                on_attempt(attempt);
                let mut ctx = CallContext::new(prepared.tool.name())
                    .with_attempt(attempt)
                    .with_write_action(prepared.write_action)
                    .with_cancellation(token.clone());
                if let Some(id) = invocation_id {
                    ctx = ctx.with_invocation_id(id.to_string());
                }
                call_handler(Arc::clone(&prepared.tool), ctx, prepared.arguments.clone())
            })
    }

    async fn run_background(&self, id: InvocationId, prepared: Prepared, token: CancellationToken) {
        let _guard = self.registry.start_request_guard();

        let permit = tokio::select! {
            biased;
            () = token.cancelled() => return,
            permit = Arc::clone(&self.pool).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            error!(invocation_id = %id, "Worker pool closed");
            return;
        };

        match self.store.mark_running(id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(invocation_id = %id, error = %e, "Failed to start invocation");
                return;
            }
        }

        let run = self.run_attempts(&prepared, Some(id), &token, |attempt| {
            if let Err(e) = self.store.record_attempt(id, attempt) {
                warn!(invocation_id = %id, error = %e, "Failed to record attempt");
            }
        });

        tokio::select! {
            biased;
            () = token.cancelled() => {}
            () = sleep_or_pending(prepared.timeout) => {
                warn!(invocation_id = %id, "Invocation timed out");
                if let Err(e) = self.store.cancel(id, CancelReason::Timeout) {
                    error!(invocation_id = %id, error = %e, "Failed to record timeout");
                }
            }
            outcome = run => {
                match self.store.complete(id, outcome.result, outcome.attempts) {
                    Ok(true) => info!(invocation_id = %id, attempts = outcome.attempts, "Invocation finished"),
                    Ok(false) => {}
                    Err(e) => error!(invocation_id = %id, error = %e, "Failed to record outcome"),
                }
            }
        }
    }
}

/// Calls a handler once, isolating panics and normalizing failures.
async fn call_handler(
    tool: Arc<Tool>,
    ctx: CallContext,
    arguments: Arguments,
) -> Result<JsonValue, StructuredError> {
    let attempt = ctx.attempt();
    let result = AssertUnwindSafe(tool.handler().call(ctx, arguments))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(value)) => match normalize_result(&value) {
            Some(error) => Err(error),
            None => Ok(value),
        },
        Ok(Err(fault)) => {
            let error = normalize_fault(&fault);
            if error.is_cancellation() {
                debug!(tool = %tool.name(), attempt, "Tool stopped at a cancellation checkpoint");
                return Err(error);
            }
            warn!(
                tool = %tool.name(),
                attempt,
                category = %error.category,
                code = %error.code,
                "Tool invocation failed"
            );
            Err(error)
        }
        Err(_) => {
            let error = StructuredError::internal("handler_panicked", "tool handler panicked");
            error!(
                tool = %tool.name(),
                incident_id = error.incident_id.as_deref().unwrap_or_default(),
                "Tool handler panicked"
            );
            Err(error)
        }
    }
}

/// Runs `future` to completion, or returns `None` once `timeout` elapses.
async fn with_deadline<T>(timeout: Option<Duration>, future: impl Future<Output = T>) -> Option<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future).await.ok(),
        None => Some(future.await),
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use toolgate_core::{
        Classification, ErrorCategory, ParamKind, ParamSchema, ParamSpec, handler_fn,
        shell_command_classifier,
    };

    use super::*;
    use crate::tasks::InvocationStatus;

    fn args(value: JsonValue) -> Arguments {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.retry.max_attempts = 3;
        config.tasks.max_concurrency = 4;
        config
    }

    fn executor_with(tools: Vec<Tool>) -> Executor {
        executor_with_config(tools, &config())
    }

    fn executor_with_config(tools: Vec<Tool>, config: &GatewayConfig) -> Executor {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        Executor::with_retry_policy(
            Arc::new(registry),
            config,
            RetryPolicy {
                max_attempts_ceiling: 10,
                ..RetryPolicy::deterministic(Duration::from_millis(1))
            },
        )
    }

    fn echo() -> Tool {
        Tool::builder(
            "echo",
            handler_fn(|_ctx, args| async move { Ok(JsonValue::Object(args)) }),
        )
        .params(ParamSchema::new(vec![ParamSpec::required("message", ParamKind::String)]))
        .classification(Classification::READ)
        .build()
    }

    fn flaky(name: &str, calls: Arc<AtomicUsize>, classification: Classification) -> Tool {
        Tool::builder(
            name,
            handler_fn(move |_ctx, _args| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StructuredError::upstream("flaky", "upstream unavailable").into())
                }
            }),
        )
        .params(ParamSchema::default().with_extra(true))
        .classification(classification)
        .build()
    }

    fn sleeper(name: &str) -> Tool {
        Tool::builder(
            name,
            handler_fn(|_ctx, _args| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("woke up"))
            }),
        )
        .classification(Classification::READ)
        .build()
    }

    async fn wait_terminal(executor: &Executor, id: &InvocationId) -> InvocationSnapshot {
        for _ in 0..500 {
            let snapshot = executor.poll(id).unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("invocation {id} did not finish");
    }

    async fn wait_status(executor: &Executor, id: &InvocationId, status: InvocationStatus) {
        for _ in 0..500 {
            if executor.poll(id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("invocation {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let executor = executor_with(vec![echo()]);
        let response = executor
            .invoke(InvocationRequest::new("echo", args(json!({"message": "hi"}))))
            .await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.attempts, 1);
        assert!(!response.write_action);
        assert_eq!(
            response.outcome,
            InvocationOutcome::Succeeded {
                result: json!({"message": "hi"})
            }
        );
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool_suggests() {
        let executor = executor_with(vec![echo()]);
        let response = executor.invoke(InvocationRequest::new("ecoh", Arguments::new())).await;

        assert_eq!(response.status_code, 404);
        assert_eq!(response.attempts, 0);
        let InvocationOutcome::Failed { error } = response.outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.code, "tool_not_found");
        assert_eq!(error.details["candidates"], json!(["echo"]));
    }

    #[tokio::test]
    async fn test_invoke_argument_mismatch_is_validation() {
        let executor = executor_with(vec![echo()]);
        let response = executor
            .invoke(InvocationRequest::new("echo", args(json!({"mesage": "hi"}))))
            .await;

        assert_eq!(response.status_code, 400);
        let InvocationOutcome::Failed { error } = response.outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.category, ErrorCategory::Validation);
        assert_eq!(error.details["missing_arguments"], json!(["message"]));
        assert_eq!(
            error.details["unknown_arguments"][0]["suggestions"],
            json!(["message"])
        );
    }

    #[tokio::test]
    async fn test_read_invocation_retried_exactly_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(vec![flaky("lookup", Arc::clone(&calls), Classification::READ)]);

        let response = executor
            .invoke(InvocationRequest::new("lookup", Arguments::new()).with_max_attempts(4))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(response.attempts, 4);
        assert_eq!(response.status_code, 500);
    }

    #[tokio::test]
    async fn test_write_invocation_attempted_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(vec![flaky("mutate", Arc::clone(&calls), Classification::WRITE)]);

        let response = executor
            .invoke(InvocationRequest::new("mutate", Arguments::new()).with_max_attempts(4))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.attempts, 1);
        assert!(response.write_action);
    }

    #[tokio::test]
    async fn test_async_write_invocation_attempted_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(vec![flaky("mutate", Arc::clone(&calls), Classification::WRITE)]);

        let accepted = executor
            .start(InvocationRequest::new("mutate", Arguments::new()).with_max_attempts(4))
            .unwrap();
        let snapshot = wait_terminal(&executor, &accepted.invocation_id).await;

        assert_eq!(snapshot.status, InvocationStatus::Failed);
        assert_eq!(snapshot.status_code, Some(500));
        assert_eq!(snapshot.attempts, 1);
        assert!(snapshot.write_action);
        assert_eq!(snapshot.result.unwrap()["retryable"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_outside_runtime_is_structured_error() {
        let executor = executor_with(vec![echo()]);

        let error = executor
            .start(InvocationRequest::new("echo", args(json!({"message": "hi"}))))
            .unwrap_err();

        assert_eq!(error.category, ErrorCategory::Internal);
        assert_eq!(error.code, "no_runtime");
        assert!(executor.inner.store.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_cancellation_is_cancelled_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let stops = Tool::builder(
            "stops",
            handler_fn(move |ctx, _args| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.cancellation().cancel();
                    ctx.checkpoint()?;
                    Ok(json!("unreachable"))
                }
            }),
        )
        .classification(Classification::READ)
        .build();
        let executor = executor_with(vec![stops]);

        let response = executor
            .invoke(InvocationRequest::new("stops", Arguments::new()).with_max_attempts(3))
            .await;

        assert_eq!(response.status_code, CANCELLED_STATUS_CODE);
        assert_eq!(
            response.outcome,
            InvocationOutcome::Cancelled {
                reason: CancelReason::Caller
            }
        );
        assert_eq!(response.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dynamic_classification_decides_retry_per_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(vec![flaky("shell", Arc::clone(&calls), shell_command_classifier())]);

        let read = executor
            .invoke(InvocationRequest::new("shell", args(json!({"command": "ls -la"}))).with_max_attempts(2))
            .await;
        assert!(!read.write_action);
        assert_eq!(read.attempts, 2);

        let write = executor
            .invoke(InvocationRequest::new("shell", args(json!({"command": "rm -rf build"}))).with_max_attempts(2))
            .await;
        assert!(write.write_action);
        assert_eq!(write.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_shaped_result_is_failure() {
        let tool = Tool::builder(
            "soft_fail",
            handler_fn(|_ctx, _args| async move {
                Ok(json!({"error": {"category": "auth", "code": "expired", "message": "token expired"}}))
            }),
        )
        .classification(Classification::READ)
        .build();
        let executor = executor_with(vec![tool]);

        let response = executor.invoke(InvocationRequest::new("soft_fail", Arguments::new())).await;
        assert_eq!(response.status_code, 401);
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let tool = Tool::builder(
            "boom",
            handler_fn(|_ctx, _args| async move {
                if true {
                    panic!("handler bug");
                }
                Ok(JsonValue::Null)
            }),
        )
        .classification(Classification::READ)
        .build();
        let executor = executor_with(vec![tool]);

        let response = executor.invoke(InvocationRequest::new("boom", Arguments::new())).await;
        let InvocationOutcome::Failed { error } = response.outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.category, ErrorCategory::Internal);
        assert_eq!(error.code, "handler_panicked");
        assert!(error.incident_id.is_some());
        assert_eq!(executor.registry().inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_timeout_is_cancellation() {
        let executor = executor_with(vec![sleeper("slow")]);
        let response = executor
            .invoke(InvocationRequest::new("slow", Arguments::new()).with_timeout(Duration::from_millis(20)))
            .await;

        assert_eq!(response.status_code, CANCELLED_STATUS_CODE);
        assert_eq!(
            response.outcome,
            InvocationOutcome::Cancelled {
                reason: CancelReason::Timeout
            }
        );
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_async_lifecycle_reaches_succeeded() {
        let executor = executor_with(vec![echo()]);
        let accepted = executor
            .start(InvocationRequest::new("echo", args(json!({"message": "later"}))))
            .unwrap();
        assert_eq!(accepted.status, "accepted");
        assert_eq!(accepted.status_code, 202);

        let snapshot = wait_terminal(&executor, &accepted.invocation_id).await;
        assert_eq!(snapshot.status, InvocationStatus::Succeeded);
        assert_eq!(snapshot.status_code, Some(200));
        assert_eq!(snapshot.result, Some(json!({"message": "later"})));
        assert_eq!(snapshot.attempts, 1);
    }

    #[tokio::test]
    async fn test_async_failure_uses_same_envelope_as_sync() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(vec![flaky("lookup", Arc::clone(&calls), Classification::READ)]);
        let request = InvocationRequest::new("lookup", Arguments::new()).with_max_attempts(2);

        let sync = executor.invoke(request.clone()).await;
        let accepted = executor.start(request).unwrap();
        let snapshot = wait_terminal(&executor, &accepted.invocation_id).await;

        assert_eq!(snapshot.status, InvocationStatus::Failed);
        assert_eq!(snapshot.status_code, Some(sync.status_code));
        assert_eq!(snapshot.attempts, 2);
        let polled = snapshot.result.unwrap();
        assert_eq!(polled["category"], sync.outcome.payload()["category"]);
        assert_eq!(polled["code"], "flaky");
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_tool_without_record() {
        let executor = executor_with(vec![echo()]);
        let err = executor
            .start(InvocationRequest::new("missing", Arguments::new()))
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::NotFound);
        assert!(executor.inner.store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_invocation_leaves_others_untouched() {
        let executor = executor_with(vec![sleeper("slow"), echo()]);
        let slow = executor.start(InvocationRequest::new("slow", Arguments::new())).unwrap();
        let other = executor.start(InvocationRequest::new("slow", Arguments::new())).unwrap();
        wait_status(&executor, &slow.invocation_id, InvocationStatus::Running).await;

        let ack = executor.cancel(&slow.invocation_id).unwrap();
        assert!(ack.cancelled);
        assert_eq!(ack.status_code, Some(499));

        let snapshot = executor.poll(&slow.invocation_id).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Cancelled);
        assert_eq!(snapshot.result, Some(json!({"cancelled": true, "reason": "caller"})));

        let untouched = executor.poll(&other.invocation_id).unwrap();
        assert!(!untouched.status.is_terminal());

        executor.cancel(&other.invocation_id).unwrap();
    }

    #[tokio::test]
    async fn test_cancel_terminal_invocation_is_noop() {
        let executor = executor_with(vec![echo()]);
        let accepted = executor
            .start(InvocationRequest::new("echo", args(json!({"message": "x"}))))
            .unwrap();
        wait_terminal(&executor, &accepted.invocation_id).await;

        let ack = executor.cancel(&accepted.invocation_id).unwrap();
        assert!(!ack.cancelled);
        assert_eq!(ack.status, InvocationStatus::Succeeded);
        assert_eq!(ack.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_not_found() {
        let executor = executor_with(vec![echo()]);
        let err = executor.cancel(&InvocationId::new()).unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(executor.poll(&InvocationId::new()).is_err());
    }

    #[tokio::test]
    async fn test_async_timeout_records_cancellation() {
        let executor = executor_with(vec![sleeper("slow")]);
        let accepted = executor
            .start(InvocationRequest::new("slow", Arguments::new()).with_timeout(Duration::from_millis(20)))
            .unwrap();

        let snapshot = wait_terminal(&executor, &accepted.invocation_id).await;
        assert_eq!(snapshot.status, InvocationStatus::Cancelled);
        assert_eq!(snapshot.status_code, Some(499));
        assert_eq!(snapshot.result, Some(json!({"cancelled": true, "reason": "timeout"})));
    }

    #[tokio::test]
    async fn test_pool_keeps_excess_invocations_pending() {
        let mut config = config();
        config.tasks.max_concurrency = 1;
        let executor = executor_with_config(vec![sleeper("slow")], &config);

        let first = executor.start(InvocationRequest::new("slow", Arguments::new())).unwrap();
        let second = executor.start(InvocationRequest::new("slow", Arguments::new())).unwrap();
        wait_status(&executor, &first.invocation_id, InvocationStatus::Running).await;

        assert_eq!(
            executor.poll(&second.invocation_id).unwrap().status,
            InvocationStatus::Pending
        );

        executor.cancel(&second.invocation_id).unwrap();
        executor.cancel(&first.invocation_id).unwrap();
        let snapshot = executor.poll(&second.invocation_id).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Cancelled);
        assert!(snapshot.started_at.is_none());
    }

    #[tokio::test]
    async fn test_full_store_rejects_start_with_rate_limited() {
        let mut config = config();
        config.tasks.max_records = 1;
        let executor = executor_with_config(vec![sleeper("slow")], &config);

        let first = executor.start(InvocationRequest::new("slow", Arguments::new())).unwrap();
        let err = executor
            .start(InvocationRequest::new("slow", Arguments::new()))
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimited);
        assert!(err.retryable);

        executor.cancel(&first.invocation_id).unwrap();
    }

    #[tokio::test]
    async fn test_handler_sees_invocation_context() {
        let tool = Tool::builder(
            "whoami",
            handler_fn(|ctx, _args| async move {
                Ok(json!({
                    "tool": ctx.tool_name(),
                    "attempt": ctx.attempt(),
                    "has_id": ctx.invocation_id().is_some(),
                }))
            }),
        )
        .classification(Classification::READ)
        .build();
        let executor = executor_with(vec![tool]);

        let sync = executor.invoke(InvocationRequest::new("whoami", Arguments::new())).await;
        assert_eq!(
            sync.outcome.payload(),
            json!({"tool": "whoami", "attempt": 1, "has_id": false})
        );

        let accepted = executor.start(InvocationRequest::new("whoami", Arguments::new())).unwrap();
        let snapshot = wait_terminal(&executor, &accepted.invocation_id).await;
        assert_eq!(snapshot.result.unwrap()["has_id"], json!(true));
    }

    #[tokio::test]
    async fn test_drain_waits_for_background_invocations() {
        let tool = Tool::builder(
            "brief",
            handler_fn(|_ctx, _args| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!("done"))
            }),
        )
        .classification(Classification::READ)
        .build();
        let executor = executor_with(vec![tool]);
        let accepted = executor.start(InvocationRequest::new("brief", Arguments::new())).unwrap();

        tokio::time::timeout(Duration::from_secs(2), executor.drain())
            .await
            .unwrap();
        assert_eq!(
            executor.poll(&accepted.invocation_id).unwrap().status,
            InvocationStatus::Succeeded
        );
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: InvocationRequest =
            serde_json::from_value(json!({"tool_name": "echo", "timeout_ms": 250})).unwrap();
        assert!(request.arguments.is_empty());
        assert_eq!(request.max_attempts, None);
        assert_eq!(request.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invoke_response_serializes_flat() {
        let response = InvokeResponse::new(
            InvocationOutcome::Cancelled {
                reason: CancelReason::Caller,
            },
            1,
            false,
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "cancelled");
        assert_eq!(value["reason"], "caller");
        assert_eq!(value["status_code"], 499);
    }
}
