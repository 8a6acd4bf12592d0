//! Context for tool invocations.

use tokio_util::sync::CancellationToken;

/// Returned by [`CallContext::checkpoint`] once the invocation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invocation cancelled")]
pub struct Cancelled;

/// Per-call metadata handed to every handler invocation.
///
/// Cancellation is cooperative. The executor drops the handler future at its
/// next suspension point once the token fires; handlers doing long CPU-bound
/// stretches should call [`CallContext::checkpoint`] between steps.
#[derive(Debug, Clone)]
pub struct CallContext {
    tool_name: String,
    invocation_id: Option<String>,
    attempt: u32,
    write_action: bool,
    cancellation: CancellationToken,
}

impl CallContext {
    /// Creates a context for a first attempt with a fresh cancellation token.
    #[must_use]
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            invocation_id: None,
            attempt: 1,
            write_action: false,
            cancellation: CancellationToken::new(),
        }
    }

    /// Creates an empty context useful for testing.
    #[must_use]
    pub fn empty() -> Self {
        Self::new("")
    }

    #[must_use]
    pub fn with_invocation_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    #[must_use]
    pub fn with_write_action(mut self, write_action: bool) -> Self {
        self.write_action = write_action;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Name of the tool being invoked.
    #[must_use]
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Invocation id for asynchronous invocations; `None` on the sync path.
    #[must_use]
    pub fn invocation_id(&self) -> Option<&str> {
        self.invocation_id.as_deref()
    }

    /// One-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether this invocation was classified as a write.
    #[must_use]
    pub fn is_write_action(&self) -> bool {
        self.write_action
    }

    /// The invocation's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the invocation is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Returns `Err(Cancelled)` if the invocation has been cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] once the cancellation token has fired.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
