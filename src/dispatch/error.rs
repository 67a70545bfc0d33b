//! Error types for the dispatcher core.

use thiserror::Error;

use crate::dispatch::RuntimeFlavor;
use crate::stats::StatsError;
use crate::stream::StreamError;
use crate::worker::WorkerError;

/// Errors that abort a dispatch run or its construction.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The pool was constructed with no workers.
    #[error("worker pool is empty")]
    EmptyPool,

    /// Two pool members share a name.
    #[error("duplicate worker name {name:?} in pool")]
    DuplicateWorker {
        /// The name that appeared more than once.
        name: String,
    },

    /// A unit of work failed with an error kind outside the worker's
    /// declared soft and hard sets.
    #[error("unhandled {kind} error from worker {worker} on request {idx}: {source}")]
    Unhandled {
        /// Worker that reported the error.
        worker: String,
        /// Request index being served.
        idx: usize,
        /// Kind label of the error.
        kind: &'static str,
        /// The unclassified error.
        #[source]
        source: WorkerError,
    },

    /// Stream bookkeeping broke; indicates a dispatcher bug.
    #[error("stream bookkeeping error: {0}")]
    Stream(#[from] StreamError),

    /// The statistics registry rejected an observation.
    #[error("statistics error: {0}")]
    Stats(#[from] StatsError),

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Building a worker from a server descriptor failed.
    #[error("worker construction failed: {0}")]
    Worker(#[from] WorkerError),

    /// The requested runtime could not be built.
    #[error("failed to build {flavor} runtime: {source}")]
    Runtime {
        /// The flavor that was requested.
        flavor: RuntimeFlavor,
        /// The underlying build error.
        #[source]
        source: std::io::Error,
    },

    /// The runtime selector string was not recognized.
    #[error("unknown runtime flavor {value:?} (expected \"production\" or \"testing\")")]
    UnknownFlavor {
        /// The unrecognized selector.
        value: String,
    },
}
