//! Dispatcher core: binds a worker pool to the instrumented streams.
//!
//! The [`MultiDispatcher`] runs one concurrent task per worker. Each task
//! pulls argument bundles from the shared argument stream, rate-limits,
//! invokes the worker's unit of work, and routes the outcome: results were
//! already retired by the worker, transient failures are counted against a
//! cross-worker retry budget and re-queued (or promoted once the budget is
//! spent), permanent failures are retired onto the failure stream, and
//! anything unclassified aborts the run.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarmdl_core::dispatch::{MultiDispatcher, PoolOptions, RuntimeFlavor};
//! use swarmdl_core::worker::http::ServerDef;
//! use swarmdl_core::bundle::{expand_args, ArgField};
//! use std::collections::BTreeMap;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let defs = vec![
//!     ServerDef::new("aws", "s3.rcsb.org").with_dir("pub/pdb/data"),
//!     ServerDef::new("us", "files.rcsb.org").with_dir("pub/pdb/data"),
//! ];
//! let dispatcher = MultiDispatcher::from_server_defs(&defs, &PoolOptions::default())?
//!     .with_max_retries(2);
//!
//! let mut arg_map = BTreeMap::new();
//! arg_map.insert("code".to_string(), ArgField::per_request(["0000", "0001"]));
//! arg_map.insert("file_type".to_string(), ArgField::scalar("txt"));
//!
//! let outcome = dispatcher.main(expand_args(&arg_map), RuntimeFlavor::Production)?;
//! println!("finished {} of {}", outcome.summary.finished, outcome.summary.requests);
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;

pub use engine::{
    DEFAULT_MAX_RETRIES, DispatchOutcome, DispatchSummary, MultiDispatcher, PoolOptions,
    RuntimeFlavor,
};
pub use error::DispatchError;
