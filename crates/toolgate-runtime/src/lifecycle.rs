//! Lifecycle management for long-lived outbound clients.
//!
//! A pooled client built under one execution context can become invalid
//! once the host swaps contexts, and credentials or endpoints may change
//! underneath a cached client. [`ClientSlot`] hides this from handlers:
//! every [`ClientSlot::get`] checks whether the cached client is still
//! usable and transparently rebuilds it when it is not.
//!
//! A client is rebuilt when:
//!
//! - no client has been built yet
//! - the current [`ContextId`] differs from the one the client was built
//!   under
//! - the client reports [`ManagedClient::is_closed`]
//! - the factory [fingerprint](ClientFactory::fingerprint) changed
//!
//! Replaced clients are closed in the background. The caller never waits
//! on a close and never sees a close failure; failures are logged at warn
//! level.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use toolgate_core::StructuredError;
use tracing::{debug, warn};

/// Identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Reports the execution context currently in effect.
pub trait ContextSource: Send + Sync {
    fn current(&self) -> ContextId;
}

/// Generation counter used as a [`ContextSource`].
///
/// A host calls [`ContextGeneration::advance`] whenever it swaps execution
/// contexts (for example after rebuilding its runtime). Clones share the
/// counter.
#[derive(Debug, Clone, Default)]
pub struct ContextGeneration {
    generation: Arc<AtomicU64>,
}

impl ContextGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new context and returns its id.
    pub fn advance(&self) -> ContextId {
        ContextId(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

impl ContextSource for ContextGeneration {
    fn current(&self) -> ContextId {
        ContextId(self.generation.load(Ordering::Acquire))
    }
}

/// Errors raised while building or closing a client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("failed to build client: {0}")]
    Build(String),

    #[error("failed to close client: {0}")]
    Close(String),

    #[error("client slot lock poisoned")]
    LockPoisoned,
}

impl From<ClientError> for StructuredError {
    fn from(value: ClientError) -> Self {
        match value {
            ClientError::Build(_) => StructuredError::internal("client_build_failed", value.to_string()),
            ClientError::Close(_) => StructuredError::internal("client_close_failed", value.to_string()),
            ClientError::LockPoisoned => {
                StructuredError::internal("client_slot_poisoned", value.to_string())
            }
        }
    }
}

/// An outbound client whose lifetime is managed by a [`ClientSlot`].
#[async_trait]
pub trait ManagedClient: Send + Sync + 'static {
    /// Whether the client can no longer be used.
    fn is_closed(&self) -> bool {
        false
    }

    /// Releases the client's resources.
    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Builds clients and describes the state they are built from.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: ManagedClient;

    /// Digest of everything the client is built from (endpoint,
    /// credentials, timeouts). A change forces a rebuild.
    fn fingerprint(&self) -> String;

    /// Builds a fresh client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Build`] when construction fails.
    fn build(&self) -> Result<Self::Client, ClientError>;
}

/// SHA-256 digest over an ordered list of parts.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut material = String::new();
    for part in parts {
        let part = part.as_ref();
        material.push_str(&part.len().to_string());
        material.push(':');
        material.push_str(part);
    }
    sha256::digest(material)
}

struct CachedClient<C> {
    client: Arc<C>,
    context: ContextId,
    fingerprint: String,
}

/// Lazily built, self-healing handle to one outbound client.
pub struct ClientSlot<F: ClientFactory> {
    factory: F,
    context: Arc<dyn ContextSource>,
    cached: Mutex<Option<CachedClient<F::Client>>>,
}

impl<F: ClientFactory> fmt::Debug for ClientSlot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let built = self.cached.lock().is_ok_and(|cached| cached.is_some());
        f.debug_struct("ClientSlot")
            .field("built", &built)
            .finish_non_exhaustive()
    }
}

impl<F: ClientFactory> ClientSlot<F> {
    pub fn new(factory: F, context: Arc<dyn ContextSource>) -> Self {
        Self {
            factory,
            context,
            cached: Mutex::new(None),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns a usable client, rebuilding it if the cached one is stale.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Build`] if a rebuild was needed and failed, or
    /// [`ClientError::LockPoisoned`] if the slot lock is poisoned.
    pub fn get(&self) -> Result<Arc<F::Client>, ClientError> {
        let context = self.context.current();
        let fingerprint = self.factory.fingerprint();

        let (client, old) = {
            let mut cached = self.cached.lock().map_err(|_| ClientError::LockPoisoned)?;

            if let Some(current) = cached.as_ref() {
                let reason = if current.context != context {
                    Some("context changed")
                } else if current.client.is_closed() {
                    Some("client closed")
                } else if current.fingerprint != fingerprint {
                    Some("factory configuration changed")
                } else {
                    None
                };
                match reason {
                    None => return Ok(Arc::clone(&current.client)),
                    Some(reason) => debug!(%context, reason, "Rebuilding outbound client"),
                }
            }

            let client = Arc::new(self.factory.build()?);
            let old = cached
                .replace(CachedClient {
                    client: Arc::clone(&client),
                    context,
                    fingerprint,
                })
                .map(|old| old.client);
            (client, old)
        };

        if let Some(old) = old {
            close_in_background(old);
        }
        Ok(client)
    }

    /// Discards the cached client; the next [`get`](Self::get) rebuilds.
    pub fn invalidate(&self) {
        let old = self
            .cached
            .lock()
            .ok()
            .and_then(|mut cached| cached.take());
        if let Some(old) = old {
            close_in_background(old.client);
        }
    }
}

/// Closes a discarded client without blocking the caller.
///
/// With no runtime available the client is simply dropped.
fn close_in_background<C: ManagedClient>(client: Arc<C>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = client.close().await {
                    warn!(error = %e, "Failed to close discarded client");
                }
            });
        }
        Err(_) => debug!("No runtime available, dropping discarded client"),
    }
}
