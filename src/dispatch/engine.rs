//! The multi-worker dispatch engine.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use super::error::DispatchError;
use crate::bundle::ArgBundle;
use crate::stats::{QueueStats, StatKey};
use crate::stream::{FailureEntry, InstrumentedStreams, ResultEntry, StreamError};
use crate::worker::http::{HttpWorker, ServerDef};
use crate::worker::mock::{MockSchedule, MockWorker, RANDOM_SEED, SimRng};
use crate::worker::{Disposition, Worker};

/// Default retry budget: soft failures re-queue without limit.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Which runtime `MultiDispatcher::main` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFlavor {
    /// Multi-threaded runtime for real downloads.
    Production,
    /// Single-threaded runtime; preserves the cooperative logical model
    /// deterministically for tests.
    Testing,
}

impl RuntimeFlavor {
    fn build(self) -> std::io::Result<tokio::runtime::Runtime> {
        match self {
            Self::Production => tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build(),
            Self::Testing => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build(),
        }
    }
}

impl fmt::Display for RuntimeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

impl FromStr for RuntimeFlavor {
    type Err = DispatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "production" => Ok(Self::Production),
            "testing" => Ok(Self::Testing),
            _ => Err(DispatchError::UnknownFlavor {
                value: value.to_string(),
            }),
        }
    }
}

/// Options for building a pool from server descriptors.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Build mock workers instead of HTTP workers.
    pub mock: bool,
    /// Suppress per-unit log lines.
    pub quiet: bool,
    /// Directory fetched payloads are written under; `None` keeps payloads
    /// in memory (byte counts only).
    pub output_dir: Option<PathBuf>,
    /// Seed for the mock pool's shared random generator.
    pub seed: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            mock: false,
            quiet: false,
            output_dir: None,
            seed: RANDOM_SEED,
        }
    }
}

/// Aggregate numbers for one dispatch run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    /// Bundles the run started with.
    pub requests: usize,
    /// Units that retired onto the result stream.
    pub finished: usize,
    /// Units that retired onto the failure stream.
    pub failed: usize,
    /// Soft failures counted against the retry budget.
    pub retries: usize,
    /// Workers that dequeued at least one bundle.
    pub workers: usize,
    /// Per-worker headline numbers, aggregate under `all`.
    pub worker_reports: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

/// Everything a dispatch run produces.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Completed units, ascending by request index.
    pub results: Vec<ResultEntry>,
    /// Permanently failed units, ascending by request index.
    pub failures: Vec<FailureEntry>,
    /// Aggregate numbers for the run.
    pub summary: DispatchSummary,
    /// The full statistics registry, for per-file and diagnostic reports.
    pub stats: QueueStats,
}

/// Runs a pool of workers over a shared queue of argument bundles.
///
/// The retry counter is keyed by request index and shared across workers:
/// a transient failure re-queues the bundle for *any* idle worker, which is
/// the point of federating the download.
pub struct MultiDispatcher {
    workers: Vec<Arc<dyn Worker>>,
    max_retries: u32,
    history_len: usize,
}

impl MultiDispatcher {
    /// Creates a dispatcher over concrete worker instances.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::EmptyPool`] for an empty list and
    /// [`DispatchError::DuplicateWorker`] if two workers share a name.
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Result<Self, DispatchError> {
        if workers.is_empty() {
            return Err(DispatchError::EmptyPool);
        }
        let mut seen = HashSet::new();
        for worker in &workers {
            if !seen.insert(worker.name().to_string()) {
                return Err(DispatchError::DuplicateWorker {
                    name: worker.name().to_string(),
                });
            }
        }
        Ok(Self {
            workers,
            max_retries: DEFAULT_MAX_RETRIES,
            history_len: 0,
        })
    }

    /// Builds a pool from mirror descriptors: HTTP workers, or mock workers
    /// with the descriptors' names when `options.mock` is set.
    ///
    /// # Errors
    ///
    /// Returns pool-validation errors as [`MultiDispatcher::new`], or a
    /// [`DispatchError::Worker`] if an HTTP worker cannot be built.
    pub fn from_server_defs(
        defs: &[ServerDef],
        options: &PoolOptions,
    ) -> Result<Self, DispatchError> {
        let mut workers: Vec<Arc<dyn Worker>> = Vec::with_capacity(defs.len());
        if options.mock {
            let rng = Arc::new(SimRng::new(options.seed));
            let schedule = Arc::new(MockSchedule::standard());
            for (ident, def) in defs.iter().enumerate() {
                let mut worker = MockWorker::new(
                    ident,
                    Arc::clone(&rng),
                    Arc::clone(&schedule),
                    options.quiet,
                )
                .with_name(def.name.clone());
                if let Some(dir) = &options.output_dir {
                    worker = worker.with_output(dir.clone());
                }
                workers.push(Arc::new(worker));
            }
        } else {
            for def in defs {
                let mut worker = HttpWorker::new(def.clone())?.with_quiet(options.quiet);
                if let Some(dir) = &options.output_dir {
                    worker = worker.with_output(dir.clone());
                }
                workers.push(Arc::new(worker));
            }
        }
        Self::new(workers)
    }

    /// Sets the retry budget. `0` re-queues soft failures without limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the rolling-average window for the statistics registry.
    #[must_use]
    pub fn with_history_len(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }

    /// The configured retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Names of the pool members, in order.
    #[must_use]
    pub fn worker_names(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|worker| worker.name().to_string())
            .collect()
    }

    /// Runs the pool over `bundles` until every request has retired.
    ///
    /// Returns the ordered result list, the ordered failure list, and the
    /// run's statistics.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Unhandled`] if a worker fails with an error
    /// outside its declared sets; remaining tasks are aborted. Stream or
    /// statistics bookkeeping errors indicate dispatcher bugs and are
    /// likewise fatal.
    #[instrument(skip_all, fields(requests = bundles.len(), workers = self.workers.len()))]
    pub async fn run(&self, bundles: Vec<ArgBundle>) -> Result<DispatchOutcome, DispatchError> {
        let streams = Arc::new(InstrumentedStreams::new(bundles));
        let retry_counter: Arc<DashMap<usize, u32>> = Arc::new(DashMap::new());
        let soft_failures = Arc::new(AtomicUsize::new(0));

        info!(
            requests = streams.n_args(),
            workers = self.workers.len(),
            max_retries = self.max_retries,
            "starting dispatch"
        );

        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            tasks.spawn(worker_loop(
                Arc::clone(worker),
                Arc::clone(&streams),
                Arc::clone(&retry_counter),
                Arc::clone(&soft_failures),
                self.max_retries,
            ));
        }
        // An Err here drops the JoinSet, aborting the remaining tasks.
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let results = streams.results.get_all().await;
        let failures = streams.failures.get_all().await;

        let worker_names = self.worker_names();
        let mut stats = QueueStats::new(&worker_names, self.history_len);
        for entry in &results {
            #[allow(clippy::cast_precision_loss)]
            stats.update_stats(
                &[
                    (StatKey::RetirementT, entry.retirement_ms),
                    (StatKey::LaunchT, entry.launch_ms),
                    (StatKey::Bytes, entry.bytes as f64),
                ],
                &entry.worker,
            )?;
        }

        let summary = DispatchSummary {
            requests: streams.n_args(),
            finished: results.len(),
            failed: failures.len(),
            retries: soft_failures.load(Ordering::SeqCst),
            workers: streams.arguments.active_workers().await,
            worker_reports: stats.report_worker_stats(),
        };
        info!(
            finished = summary.finished,
            failed = summary.failed,
            retries = summary.retries,
            "dispatch complete"
        );

        Ok(DispatchOutcome {
            results,
            failures,
            summary,
            stats,
        })
    }

    /// Synchronous entry point: builds the selected runtime and runs.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Runtime`] if the runtime cannot be built,
    /// plus anything [`MultiDispatcher::run`] returns.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async runtime; use
    /// [`MultiDispatcher::run`] there instead.
    pub fn main(
        &self,
        bundles: Vec<ArgBundle>,
        flavor: RuntimeFlavor,
    ) -> Result<DispatchOutcome, DispatchError> {
        let runtime = flavor
            .build()
            .map_err(|source| DispatchError::Runtime { flavor, source })?;
        runtime.block_on(self.run(bundles))
    }
}

impl fmt::Debug for MultiDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDispatcher")
            .field("workers", &self.worker_names())
            .field("max_retries", &self.max_retries)
            .field("history_len", &self.history_len)
            .finish()
    }
}

/// One worker's dispatch loop: pull, rate-limit, work, classify, route.
async fn worker_loop(
    worker: Arc<dyn Worker>,
    streams: Arc<InstrumentedStreams>,
    retry_counter: Arc<DashMap<usize, u32>>,
    soft_failures: Arc<AtomicUsize>,
    max_retries: u32,
) -> Result<(), DispatchError> {
    loop {
        let (bundle, worker_count) = match streams.arguments.get(worker.name()).await {
            Ok(dequeued) => dequeued,
            Err(StreamError::Drained) => {
                debug!(worker = worker.name(), "argument stream drained, exiting");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };
        worker.limiter().await;

        let Err(error) = worker.fetch(&streams.results, worker_count, &bundle).await else {
            continue;
        };
        match worker.classify(error.kind()) {
            Disposition::Soft => {
                soft_failures.fetch_add(1, Ordering::SeqCst);
                let failures_so_far = {
                    let mut entry = retry_counter.entry(bundle.idx).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if max_retries > 0 && failures_so_far >= max_retries {
                    debug!(
                        worker = worker.name(),
                        idx = bundle.idx,
                        failures_so_far,
                        max_retries,
                        "retry budget spent, promoting to hard failure"
                    );
                    worker
                        .on_hard_failure(bundle.idx, worker_count, &error, &streams.failures)
                        .await?;
                } else {
                    worker
                        .on_soft_failure(bundle, worker_count, &error, &streams.arguments)
                        .await?;
                }
            }
            Disposition::Hard => {
                worker
                    .on_hard_failure(bundle.idx, worker_count, &error, &streams.failures)
                    .await?;
            }
            Disposition::Unhandled => {
                worker.on_unhandled(bundle.idx, &error);
                return Err(DispatchError::Unhandled {
                    worker: worker.name().to_string(),
                    idx: bundle.idx,
                    kind: error.kind().name(),
                    source: error,
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::worker::mock::{MockSchedule, MockWorker, SimRng};

    fn mock_pool(n: usize) -> Vec<Arc<dyn Worker>> {
        let rng = Arc::new(SimRng::default());
        let schedule = Arc::new(MockSchedule::new([], [], []));
        (0..n)
            .map(|ident| {
                Arc::new(MockWorker::new(
                    ident,
                    Arc::clone(&rng),
                    Arc::clone(&schedule),
                    true,
                )) as Arc<dyn Worker>
            })
            .collect()
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let result = MultiDispatcher::new(Vec::new());
        assert!(matches!(result, Err(DispatchError::EmptyPool)));
    }

    #[test]
    fn test_duplicate_worker_names_are_rejected() {
        let rng = Arc::new(SimRng::default());
        let schedule = Arc::new(MockSchedule::new([], [], []));
        let workers: Vec<Arc<dyn Worker>> = vec![
            Arc::new(MockWorker::new(0, Arc::clone(&rng), Arc::clone(&schedule), true)),
            Arc::new(MockWorker::new(0, rng, schedule, true)),
        ];
        let result = MultiDispatcher::new(workers);
        assert!(matches!(
            result,
            Err(DispatchError::DuplicateWorker { name }) if name == "W0"
        ));
    }

    #[test]
    fn test_builder_defaults() {
        let dispatcher = MultiDispatcher::new(mock_pool(2)).unwrap();
        assert_eq!(dispatcher.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(dispatcher.worker_names(), vec!["W0", "W1"]);
    }

    #[test]
    fn test_runtime_flavor_parsing() {
        assert_eq!(
            "production".parse::<RuntimeFlavor>().unwrap(),
            RuntimeFlavor::Production
        );
        assert_eq!(
            "testing".parse::<RuntimeFlavor>().unwrap(),
            RuntimeFlavor::Testing
        );
        let err = "trio".parse::<RuntimeFlavor>().unwrap_err();
        assert!(matches!(
            err,
            DispatchError::UnknownFlavor { value } if value == "trio"
        ));
    }

    #[test]
    fn test_from_server_defs_mock_pool_uses_descriptor_names() {
        let defs = vec![
            ServerDef::new("aws", "s3.example.org"),
            ServerDef::new("us", "files.example.org"),
        ];
        let options = PoolOptions {
            mock: true,
            quiet: true,
            ..PoolOptions::default()
        };
        let dispatcher = MultiDispatcher::from_server_defs(&defs, &options).unwrap();
        assert_eq!(dispatcher.worker_names(), vec!["aws", "us"]);
    }
}
