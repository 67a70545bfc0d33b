//! Instrumented argument, result, and failure streams.
//!
//! The three streams of a dispatch run share one piece of state: the
//! in-flight map, which records every bundle between its dequeue from the
//! argument stream and its retirement onto the result or failure stream.
//! A single mutex serializes the argument buffer, the in-flight map, and the
//! per-worker dequeue counters, so the emptiness test a worker uses to decide
//! whether to exit can never race a re-queue.
//!
//! Termination: [`ArgumentStream::get`] returns [`StreamError::Drained`] only
//! when the buffer is empty *and* nothing is in flight. While bundles are in
//! flight the getter parks on a [`Notify`] and is woken by any re-queue or
//! retirement, either of which can change its answer.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::bundle::{ArgBundle, ArgValue};
use crate::stats::{RATE_ROUNDING, round_to};
use crate::timer::{MillisecondTimer, TIME_EPSILON};

/// Errors from stream operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Terminal signal: the argument buffer is empty and nothing is in
    /// flight, so no re-queue can ever produce more work.
    #[error("argument stream drained")]
    Drained,

    /// Bookkeeping broke: no in-flight record exists for this slot.
    #[error("no in-flight record for worker {worker:?} count {count}")]
    Untracked {
        /// Worker name of the missing slot.
        worker: String,
        /// Dequeue ordinal of the missing slot.
        count: u64,
    },
}

/// Bookkeeping for one bundle between dequeue and retirement.
#[derive(Debug, Clone, PartialEq)]
pub struct InflightRecord {
    /// Request index of the bundle.
    pub idx: usize,
    /// Other in-flight units this worker held at launch.
    pub queue_depth: usize,
    /// Launch timestamp, milliseconds since run start.
    pub launch_ms: f64,
    /// Cumulative launch rate at launch time, requests per second.
    pub cum_launch_rate: f64,
}

/// One completed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEntry {
    /// Request index.
    pub idx: usize,
    /// Name of the worker that served the request.
    pub worker: String,
    /// Bytes downloaded.
    pub bytes: u64,
    /// Launch timestamp copied from the in-flight record at retirement.
    pub launch_ms: f64,
    /// Retirement timestamp, milliseconds since run start.
    pub retirement_ms: f64,
    /// Worker-supplied extras, such as the output filename.
    #[serde(flatten)]
    pub extras: BTreeMap<String, ArgValue>,
}

impl ResultEntry {
    /// Creates an entry for the worker to put on the result stream.
    ///
    /// The timestamps are filled in by [`ResultStream::put`].
    #[must_use]
    pub fn new(idx: usize, worker: impl Into<String>, bytes: u64) -> Self {
        Self {
            idx,
            worker: worker.into(),
            bytes,
            launch_ms: 0.0,
            retirement_ms: 0.0,
            extras: BTreeMap::new(),
        }
    }

    /// Adds an extra column, builder style.
    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.extras.insert(name.into(), value.into());
        self
    }
}

/// One permanently failed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    /// Request index.
    pub idx: usize,
    /// Name of the worker that reported the failure.
    pub worker: String,
    /// Error kind label, or `TooManyRetries` for an exhausted transient.
    pub error: String,
    /// Human-readable failure message.
    pub message: String,
}

/// State guarded by the shared dispatch mutex.
#[derive(Debug, Default)]
struct DispatchState {
    queue: VecDeque<ArgBundle>,
    inflight: HashMap<String, HashMap<u64, InflightRecord>>,
    worker_counter: HashMap<String, u64>,
    launch_rate: f64,
}

impl DispatchState {
    fn live_inflight(&self) -> usize {
        self.inflight.values().map(HashMap::len).sum()
    }

    fn take_inflight(&mut self, worker: &str, count: u64) -> Result<InflightRecord, StreamError> {
        self.inflight
            .get_mut(worker)
            .and_then(|slots| slots.remove(&count))
            .ok_or_else(|| StreamError::Untracked {
                worker: worker.to_string(),
                count,
            })
    }
}

/// State shared by the three streams of one run.
#[derive(Debug)]
struct StreamHub {
    state: Mutex<DispatchState>,
    notify: Notify,
    timer: MillisecondTimer,
}

/// The shared queue of argument bundles, prefilled at construction.
#[derive(Debug, Clone)]
pub struct ArgumentStream {
    hub: std::sync::Arc<StreamHub>,
    n_args: usize,
}

impl ArgumentStream {
    /// Atomically dequeues the next bundle for `worker`.
    ///
    /// Increments the worker's dequeue counter, creates the in-flight record
    /// stamped with the launch time, and updates the cumulative launch rate.
    /// Parks while the buffer is empty but bundles are still in flight.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Drained`] when no more work can ever appear.
    #[allow(clippy::cast_precision_loss)]
    pub async fn get(&self, worker: &str) -> Result<(ArgBundle, u64), StreamError> {
        loop {
            let notified = self.hub.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking state, so a retirement
            // that lands between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.hub.state.lock().await;
                if let Some(bundle) = state.queue.pop_front() {
                    let count = {
                        let counter = state.worker_counter.entry(worker.to_string()).or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    let launch_ms = self.hub.timer.now_ms();
                    let launch_rate = round_to(
                        bundle.idx as f64 * 1000.0 / (launch_ms + TIME_EPSILON),
                        RATE_ROUNDING,
                    );
                    state.launch_rate = launch_rate;
                    let slots = state.inflight.entry(worker.to_string()).or_default();
                    let record = InflightRecord {
                        idx: bundle.idx,
                        queue_depth: slots.len(),
                        launch_ms,
                        cum_launch_rate: launch_rate,
                    };
                    slots.insert(count, record);
                    trace!(worker, count, idx = bundle.idx, launch_ms, "dequeued bundle");
                    return Ok((bundle, count));
                }
                if state.live_inflight() == 0 {
                    return Err(StreamError::Drained);
                }
            }
            notified.as_mut().await;
        }
    }

    /// Re-queues a bundle after a transient failure.
    ///
    /// Deletes the worker's in-flight record for this slot and appends the
    /// bundle to the tail, waking any parked getter.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Untracked`] if the slot has no in-flight record.
    pub async fn put(
        &self,
        bundle: ArgBundle,
        worker: &str,
        worker_count: u64,
    ) -> Result<(), StreamError> {
        {
            let mut state = self.hub.state.lock().await;
            state.take_inflight(worker, worker_count)?;
            trace!(worker, worker_count, idx = bundle.idx, "re-queued bundle");
            state.queue.push_back(bundle);
        }
        self.hub.notify.notify_waiters();
        Ok(())
    }

    /// Number of bundles the stream was prefilled with.
    #[must_use]
    pub fn n_args(&self) -> usize {
        self.n_args
    }

    /// Cumulative launch rate after the most recent dequeue, requests/s.
    pub async fn launch_rate(&self) -> f64 {
        self.hub.state.lock().await.launch_rate
    }

    /// Total in-flight records across all workers.
    pub async fn live_inflight(&self) -> usize {
        self.hub.state.lock().await.live_inflight()
    }

    /// Number of workers that have dequeued at least one bundle.
    pub async fn active_workers(&self) -> usize {
        self.hub.state.lock().await.worker_counter.len()
    }

    /// A worker's in-flight record for one dequeue ordinal, if live.
    pub async fn inflight_record(&self, worker: &str, count: u64) -> Option<InflightRecord> {
        let state = self.hub.state.lock().await;
        state
            .inflight
            .get(worker)
            .and_then(|slots| slots.get(&count))
            .cloned()
    }
}

/// Buffer of completed units, drained in input order at the end of a run.
#[derive(Debug)]
pub struct ResultStream {
    hub: std::sync::Arc<StreamHub>,
    buffer: Mutex<Vec<ResultEntry>>,
}

impl ResultStream {
    /// Retires a completed unit.
    ///
    /// Copies the launch timestamp from the in-flight record into the entry,
    /// stamps the retirement time, deletes the record, and appends the entry.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Untracked`] if the slot has no in-flight record.
    pub async fn put(
        &self,
        mut entry: ResultEntry,
        worker: &str,
        worker_count: u64,
    ) -> Result<(), StreamError> {
        {
            let mut state = self.hub.state.lock().await;
            let record = state.take_inflight(worker, worker_count)?;
            entry.launch_ms = record.launch_ms;
        }
        entry.retirement_ms = self.hub.timer.now_ms();
        trace!(
            worker,
            worker_count,
            idx = entry.idx,
            bytes = entry.bytes,
            "retired result"
        );
        self.buffer.lock().await.push(entry);
        // A retirement can complete the drain condition for parked getters.
        self.hub.notify.notify_waiters();
        Ok(())
    }

    /// Drains the buffer, sorted ascending by request index.
    pub async fn get_all(&self) -> Vec<ResultEntry> {
        let mut entries = std::mem::take(&mut *self.buffer.lock().await);
        entries.sort_by_key(|entry| entry.idx);
        entries
    }
}

/// Buffer of permanently failed units, drained in input order.
#[derive(Debug)]
pub struct FailureStream {
    hub: std::sync::Arc<StreamHub>,
    buffer: Mutex<Vec<FailureEntry>>,
}

impl FailureStream {
    /// Retires a failed unit: deletes the in-flight record and appends.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Untracked`] if the slot has no in-flight record.
    pub async fn put(
        &self,
        entry: FailureEntry,
        worker: &str,
        worker_count: u64,
    ) -> Result<(), StreamError> {
        {
            let mut state = self.hub.state.lock().await;
            state.take_inflight(worker, worker_count)?;
        }
        trace!(
            worker,
            worker_count,
            idx = entry.idx,
            error = %entry.error,
            "retired failure"
        );
        self.buffer.lock().await.push(entry);
        self.hub.notify.notify_waiters();
        Ok(())
    }

    /// Drains the buffer, sorted ascending by request index.
    pub async fn get_all(&self) -> Vec<FailureEntry> {
        let mut entries = std::mem::take(&mut *self.buffer.lock().await);
        entries.sort_by_key(|entry| entry.idx);
        entries
    }
}

/// The three streams of one dispatch run, built over shared state.
#[derive(Debug)]
pub struct InstrumentedStreams {
    /// Prefilled argument stream.
    pub arguments: ArgumentStream,
    /// Completed units.
    pub results: ResultStream,
    /// Permanently failed units.
    pub failures: FailureStream,
}

impl InstrumentedStreams {
    /// Builds the streams, prefilling the argument stream from `bundles`
    /// and anchoring a fresh millisecond timer.
    #[must_use]
    pub fn new(bundles: Vec<ArgBundle>) -> Self {
        let n_args = bundles.len();
        let hub = std::sync::Arc::new(StreamHub {
            state: Mutex::new(DispatchState {
                queue: bundles.into(),
                ..DispatchState::default()
            }),
            notify: Notify::new(),
            timer: MillisecondTimer::new(),
        });
        Self {
            arguments: ArgumentStream {
                hub: std::sync::Arc::clone(&hub),
                n_args,
            },
            results: ResultStream {
                hub: std::sync::Arc::clone(&hub),
                buffer: Mutex::new(Vec::new()),
            },
            failures: FailureStream {
                hub,
                buffer: Mutex::new(Vec::new()),
            },
        }
    }

    /// Number of bundles the run started with.
    #[must_use]
    pub fn n_args(&self) -> usize {
        self.arguments.n_args()
    }
}
