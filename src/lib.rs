//! Federated download core.
//!
//! This library downloads a list of logically-named resources by federating
//! the work across a pool of functionally-equivalent mirror servers. The
//! mirror set is treated as an elastic worker pool: each resource is served
//! by some mirror, retried on a different mirror after a transient failure,
//! and permanently failed only after a bounded number of retries. Per-request
//! and per-worker timing, volume, and rate statistics make the throughput
//! profile observable.
//!
//! # Architecture
//!
//! - [`bundle`] - Typed argument bundles and argument expansion
//! - [`stream`] - Instrumented argument / result / failure streams
//! - [`worker`] - The worker contract plus mock and HTTP flavors
//! - [`dispatch`] - The multi-worker dispatch engine
//! - [`stats`] - Per-worker and aggregate statistics registry
//! - [`report`] - TSV dumps of result and failure lists
//! - [`timer`] - Millisecond elapsed-time source

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bundle;
pub mod dispatch;
pub mod report;
pub mod stats;
pub mod stream;
pub mod timer;
pub mod worker;

// Re-export commonly used types
pub use bundle::{ArgBundle, ArgField, ArgValue, expand_args};
pub use dispatch::{
    DEFAULT_MAX_RETRIES, DispatchError, DispatchOutcome, DispatchSummary, MultiDispatcher,
    PoolOptions, RuntimeFlavor,
};
pub use report::{failures_to_tsv, results_to_tsv};
pub use stats::{ALL_WORKERS, QueueStats, Stat, StatKey, StatsError, WorkerStat};
pub use stream::{
    ArgumentStream, FailureEntry, FailureStream, InflightRecord, InstrumentedStreams, ResultEntry,
    ResultStream, StreamError,
};
pub use timer::{MillisecondTimer, TIME_EPSILON};
pub use worker::http::{HttpWorker, ServerDef, Transport};
pub use worker::mock::{MockSchedule, MockWorker, RANDOM_SEED, SimRng};
pub use worker::{Disposition, ErrorKind, TOO_MANY_RETRIES, Worker, WorkerError};
