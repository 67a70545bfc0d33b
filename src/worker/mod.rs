//! The worker contract: what the dispatcher requires of a mirror server.
//!
//! A [`Worker`] consumes argument bundles and produces either a result entry
//! or a [`WorkerError`]. The worker, not the dispatcher, declares which error
//! kinds are transient ([`Worker::soft_kinds`]) and which are permanent
//! ([`Worker::hard_kinds`]); anything outside both sets is unhandled and
//! aborts the run.
//!
//! Default implementations of the three failure handlers cover the common
//! case: hard failures build a [`FailureEntry`], soft failures log and
//! re-queue the bundle, unhandled errors log at error level before the
//! dispatcher surfaces them to the caller.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, warn};

use crate::bundle::{ArgBundle, ArgValue};
use crate::stream::{ArgumentStream, FailureEntry, FailureStream, ResultEntry, ResultStream,
    StreamError};

pub mod http;
pub mod mock;

/// Failure label for a transient error that exhausted its retry budget.
pub const TOO_MANY_RETRIES: &str = "TooManyRetries";

/// Classification groups for unit-of-work errors.
///
/// Workers declare disjoint sets of these; the kind, not the concrete error
/// value, decides whether a failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Could not reach the server (DNS, refused, reset, TLS).
    Connection,
    /// The request timed out.
    Timeout,
    /// The server answered with a 5xx status.
    Server,
    /// The server answered with a non-retryable HTTP status.
    Http,
    /// A request argument was missing or malformed.
    InvalidValue,
    /// A local filesystem operation failed.
    Io,
    /// Internal bookkeeping failure; never in a worker's declared sets.
    Internal,
}

impl ErrorKind {
    /// The label used in failure entries.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Connection => "Connection",
            Self::Timeout => "Timeout",
            Self::Server => "Server",
            Self::Http => "Http",
            Self::InvalidValue => "InvalidValue",
            Self::Io => "Io",
            Self::Internal => "Internal",
        }
    }
}

/// Errors a unit of work can fail with.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Could not reach the server.
    #[error("connection to {server} failed: {message}")]
    Connection {
        /// Server the connection was aimed at.
        server: String,
        /// What went wrong.
        message: String,
    },

    /// The request timed out.
    #[error("request to {url} timed out")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// 5xx response, worth retrying elsewhere.
    #[error("HTTP {status} from {url}")]
    Server {
        /// The URL that answered.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Non-retryable HTTP response (4xx).
    #[error("HTTP {status} from {url}")]
    Http {
        /// The URL that answered.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Missing or malformed request argument.
    #[error("invalid value: {message}")]
    InvalidValue {
        /// What was wrong with the value.
        message: String,
    },

    /// Local filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Stream bookkeeping failed inside the unit of work.
    #[error("stream error: {source}")]
    Stream {
        /// The underlying stream error.
        #[source]
        source: StreamError,
    },
}

impl WorkerError {
    /// Creates a connection error.
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a retryable server-status error.
    pub fn server_status(url: impl Into<String>, status: u16) -> Self {
        Self::Server {
            url: url.into(),
            status,
        }
    }

    /// Creates a non-retryable HTTP-status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::Http {
            url: url.into(),
            status,
        }
    }

    /// Creates an invalid-value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The classification kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Server { .. } => ErrorKind::Server,
            Self::Http { .. } => ErrorKind::Http,
            Self::InvalidValue { .. } => ErrorKind::InvalidValue,
            Self::Io { .. } => ErrorKind::Io,
            Self::Stream { .. } => ErrorKind::Internal,
        }
    }
}

impl From<StreamError> for WorkerError {
    fn from(source: StreamError) -> Self {
        Self::Stream { source }
    }
}

/// How the dispatcher routes a failed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient: count the retry and re-queue or promote.
    Soft,
    /// Permanent: emit on the failure stream.
    Hard,
    /// Outside both declared sets: fatal for the run.
    Unhandled,
}

/// A member of the dispatch pool.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique name of this worker within the pool.
    fn name(&self) -> &str;

    /// Error kinds that are transient for this worker.
    fn soft_kinds(&self) -> &[ErrorKind];

    /// Error kinds that are permanent for this worker.
    fn hard_kinds(&self) -> &[ErrorKind];

    /// Suppress per-unit log lines.
    fn quiet(&self) -> bool {
        false
    }

    /// Optional pre-launch rate limiting; the default imposes no delay.
    async fn limiter(&self) {}

    /// Performs one unit of work.
    ///
    /// On success the implementation must put exactly one entry on
    /// `results` under its own name and `worker_count`.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerError`] the dispatcher classifies via
    /// [`Worker::soft_kinds`] and [`Worker::hard_kinds`].
    async fn fetch(
        &self,
        results: &ResultStream,
        worker_count: u64,
        bundle: &ArgBundle,
    ) -> Result<(), WorkerError>;

    /// Classifies an error kind against this worker's declared sets.
    fn classify(&self, kind: ErrorKind) -> Disposition {
        if self.soft_kinds().contains(&kind) {
            Disposition::Soft
        } else if self.hard_kinds().contains(&kind) {
            Disposition::Hard
        } else {
            Disposition::Unhandled
        }
    }

    /// Builds a result entry and retires it onto the result stream.
    ///
    /// # Errors
    ///
    /// Returns the stream's bookkeeping error, wrapped for classification.
    async fn put_result(
        &self,
        results: &ResultStream,
        worker_count: u64,
        idx: usize,
        bytes: u64,
        extras: BTreeMap<String, ArgValue>,
    ) -> Result<(), WorkerError> {
        let mut entry = ResultEntry::new(idx, self.name(), bytes);
        entry.extras = extras;
        results.put(entry, self.name(), worker_count).await?;
        Ok(())
    }

    /// Handles a permanent failure: builds and emits the failure entry.
    ///
    /// A soft-kind error arriving here has exhausted its retries; it is
    /// relabeled [`TOO_MANY_RETRIES`] and its message keeps the full debug
    /// form of the original error.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Untracked`] if the slot has no in-flight record.
    async fn on_hard_failure(
        &self,
        idx: usize,
        worker_count: u64,
        error: &WorkerError,
        failures: &FailureStream,
    ) -> Result<(), StreamError> {
        let (label, message) = if self.soft_kinds().contains(&error.kind()) {
            (TOO_MANY_RETRIES.to_string(), format!("{error:?}"))
        } else {
            (error.kind().name().to_string(), error.to_string())
        };
        if !self.quiet() {
            error!(worker = self.name(), idx, label = %label, message = %message, "unit failed");
        }
        let entry = FailureEntry {
            idx,
            worker: self.name().to_string(),
            error: label,
            message,
        };
        failures.put(entry, self.name(), worker_count).await
    }

    /// Handles a transient failure: logs and re-queues the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Untracked`] if the slot has no in-flight record.
    async fn on_soft_failure(
        &self,
        bundle: ArgBundle,
        worker_count: u64,
        error: &WorkerError,
        arguments: &ArgumentStream,
    ) -> Result<(), StreamError> {
        if !self.quiet() {
            warn!(
                worker = self.name(),
                idx = bundle.idx,
                error = %error,
                "transient failure, re-queueing"
            );
        }
        arguments.put(bundle, self.name(), worker_count).await
    }

    /// Handles an error outside both declared sets. The dispatcher aborts
    /// the run right after this returns.
    fn on_unhandled(&self, idx: usize, error: &WorkerError) {
        error!(
            worker = self.name(),
            idx,
            kind = error.kind().name(),
            error = %error,
            "unhandled worker error"
        );
    }
}
