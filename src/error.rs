//! Error types for the Tessera operator
//!
//! Errors carry enough context (object kind, key, operation) to be useful in
//! structured logs without a backtrace. Per-member failures during a sync are
//! collected into an [`AggregateError`] so one broken member never hides the
//! others.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for Tessera operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error from a live (uncached) call
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The object cache could not serve a read
    #[error("cache read failed for {kind} {key}: {message}")]
    Cache {
        /// Object kind (e.g. "PersistentVolume")
        kind: &'static str,
        /// Namespace-qualified key of the object
        key: String,
        /// Description of what failed
        message: String,
    },

    /// An object that must exist is missing from the cache
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind
        kind: &'static str,
        /// Namespace-qualified key of the object
        key: String,
    },

    /// A volume's node affinity cannot be evaluated
    #[error("cannot evaluate node affinity of volume {volume}: {message}")]
    Affinity {
        /// Name of the PersistentVolume
        volume: String,
        /// Description of the unsupported or malformed selector
        message: String,
    },

    /// Filesystem error
    #[error("{context}: {source}")]
    Io {
        /// What was being read
        context: String,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("{context}: {source}")]
    Serialization {
        /// What was being parsed
        context: String,
        /// The underlying serde error
        source: serde_json::Error,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The sync was cancelled while a live call was pending
    #[error("{operation} cancelled")]
    Cancelled {
        /// The live operation that was interrupted
        operation: String,
    },

    /// A live call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The live operation that timed out
        operation: String,
        /// The deadline that was exceeded
        after: Duration,
    },

    /// One or more per-member failures collected during a sync
    #[error(transparent)]
    Aggregate(AggregateError),
}

impl Error {
    /// Create a cache read error
    pub fn cache(kind: &'static str, key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cache {
            kind,
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Create a node affinity evaluation error
    pub fn affinity(volume: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Affinity {
            volume: volume.into(),
            message: msg.into(),
        }
    }

    /// Wrap an IO error with what was being read
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a serde error with what was being parsed
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a cancellation error for the given operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether retrying the same call can succeed without outside changes
    ///
    /// Malformed input and unreadable files are fatal for the call. Everything
    /// else (API failures, stale cache, timeouts) may clear up on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io { .. } | Error::Serialization { .. } | Error::Config(_) => false,
            Error::Aggregate(agg) => agg.errors().iter().any(Error::is_retryable),
            _ => true,
        }
    }
}

/// A non-empty list of errors reported as one
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    /// The individual errors, in the order they were collected
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Number of collected errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True if the aggregate holds no errors
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.errors.as_slice() {
            return write!(f, "{single}");
        }
        write!(f, "{} errors: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Collects errors across a fan-out and yields one combined result
///
/// ```ignore
/// let mut errs = ErrorCollector::default();
/// for member in members {
///     if let Err(e) = remediate(member).await {
///         errs.push(e);
///     }
/// }
/// errs.into_result(())?;
/// ```
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<Error>,
}

impl ErrorCollector {
    /// Record a failure
    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// True if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(value)` if nothing was recorded, otherwise the aggregate
    pub fn into_result<T>(self, value: T) -> Result<T, Error> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(Error::Aggregate(AggregateError {
                errors: self.errors,
            }))
        }
    }
}
