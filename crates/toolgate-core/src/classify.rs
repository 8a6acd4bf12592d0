//! Write (mutation) classification for tool invocations.
//!
//! Every tool declares how its invocations are classified:
//!
//! - [`Classification::Static`] fixes the verdict at registration time.
//! - [`Classification::Dynamic`] evaluates a pure function over the call's
//!   arguments, fresh for every invocation, so the same tool may be a read
//!   on one call and a write on the next.
//!
//! A "write" verdict exempts the invocation from automatic retry. When in
//! doubt the classifiers in this module answer "write".

use std::{fmt, panic::AssertUnwindSafe, sync::Arc};

use serde_json::{Map, Value as JsonValue};
use tracing::warn;

pub mod shell;

pub use shell::{classify_command, is_write_command};

/// Signature of a dynamic classifier: `true` means the call mutates state.
pub type ClassifierFn = dyn Fn(&Map<String, JsonValue>) -> bool + Send + Sync;

/// How a tool's invocations are classified as read or write.
#[derive(Clone)]
pub enum Classification {
    /// Verdict fixed at registration.
    Static(bool),
    /// Verdict computed from the call's arguments.
    Dynamic(Arc<ClassifierFn>),
}

impl Classification {
    /// Every invocation is a read.
    pub const READ: Self = Self::Static(false);

    /// Every invocation is a write.
    pub const WRITE: Self = Self::Static(true);

    /// Wraps a classifier closure.
    pub fn dynamic<F>(classifier: F) -> Self
    where
        F: Fn(&Map<String, JsonValue>) -> bool + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(classifier))
    }

    /// Evaluates the verdict for one invocation.
    ///
    /// A panicking dynamic classifier is treated as a write.
    pub fn evaluate(&self, arguments: &Map<String, JsonValue>) -> bool {
        match self {
            Self::Static(write) => *write,
            Self::Dynamic(classifier) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| classifier(arguments)))
                    .unwrap_or_else(|_| {
                        warn!("Write classifier panicked; treating invocation as a write");
                        true
                    })
            }
        }
    }

    /// Catalog label: `read`, `write` or `dynamic`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Static(false) => "read",
            Self::Static(true) => "write",
            Self::Dynamic(_) => "dynamic",
        }
    }
}

impl Default for Classification {
    /// Unclassified tools are treated as writes.
    fn default() -> Self {
        Self::WRITE
    }
}

impl fmt::Debug for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(write) => f.debug_tuple("Static").field(write).finish(),
            Self::Dynamic(_) => f.debug_tuple("Dynamic").field(&"<fn>").finish(),
        }
    }
}

/// Classifier for tools that run shell commands.
///
/// Reads the `command` string and the optional `installing_dependencies`
/// flag from the arguments. A missing or non-string command is a write.
pub fn shell_command_classifier() -> Classification {
    Classification::dynamic(|arguments| {
        let installing = arguments
            .get("installing_dependencies")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        match arguments.get("command").and_then(JsonValue::as_str) {
            Some(command) => classify_command(command, installing),
            None => true,
        }
    })
}
