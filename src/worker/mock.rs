//! Deterministic mock worker for exercising the dispatcher without a network.
//!
//! The mock simulates a mirror server: request indices in the soft-fail
//! schedule raise a connection error, indices in the hard-fail schedule raise
//! an invalid-value error, and everything else "downloads" a Zipf-distributed
//! number of bytes after an exponential latency. The schedule is shared by
//! the whole pool, so a rescued index succeeds no matter which worker picks
//! up the retry.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp, Zeta};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::bundle::{ArgBundle, ArgValue};
use crate::worker::{ErrorKind, Worker, WorkerError};
use crate::stream::ResultStream;

/// Seed for reproducible simulated runs.
pub const RANDOM_SEED: u64 = 47;

/// Zipf exponent for simulated file sizes.
const ZIPF_EXPONENT: f64 = 1.4;
/// Scale applied to the Zipf variate, bytes.
const ZIPF_SCALE: u64 = 1000;
/// Smallest simulated file, bytes.
const ZIPF_MIN: u64 = 1024;
/// Simulated receive rate, chunks per second.
const DL_RATE: f64 = 10_000.0;
/// Simulated chunk (packet) size, bytes.
const DL_CHUNK_SIZE: u64 = 1500;
/// Fastest per-worker launch rate, requests per second.
const LAUNCH_RATE_MAX: f64 = 100.0;
/// Ratio of launch rate to retirement rate.
const LAUNCH_RETIREMENT_RATIO: f64 = 1.0;
/// Ceiling on any single simulated delay; keeps the heavy Zipf tail from
/// stalling a run on one enormous simulated file.
const MAX_SIM_DELAY_S: f64 = 0.25;

/// Seeded, reproducible random-value generation for simulated downloads.
///
/// One generator is shared by the whole mock pool so a run's sample sequence
/// depends only on the seed and the interleaving of requests.
#[derive(Debug)]
pub struct SimRng {
    rng: Mutex<StdRng>,
}

impl SimRng {
    /// Creates a generator from an explicit seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Draws a wait time in seconds from an exponential distribution with
    /// the given mean rate (events per second).
    #[must_use]
    pub fn wait_time(&self, rate: f64) -> f64 {
        let Ok(dist) = Exp::new(rate) else {
            return 0.0;
        };
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        dist.sample(&mut *rng)
    }

    /// Draws a Zipf's-law-distributed byte count with a floor.
    ///
    /// The zeta distribution approximates many natural file-size
    /// distributions; its first moment grows with sample size, so mean
    /// per-file rate drops as more files are drawn.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn zipf_with_min(&self, minimum: u64, scale: u64, exponent: f64) -> u64 {
        let Ok(dist) = Zeta::new(exponent) else {
            return minimum;
        };
        let variate = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            dist.sample(&mut *rng)
        };
        // The tail is unbounded; truncate it so simulated files stay
        // affordable to hold in memory and write out.
        let variate = variate.min(1e4) as u64;
        minimum + scale * variate
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(RANDOM_SEED)
    }
}

/// Failure schedule shared across a mock pool.
///
/// Soft-fail indices raise a connection error on each encounter; an index in
/// the rescue set removes itself after the first failure so its single retry
/// succeeds. Hard-fail indices raise an invalid-value error every time.
#[derive(Debug)]
pub struct MockSchedule {
    soft_fails: AsyncMutex<HashSet<usize>>,
    rescue_soft_fails: HashSet<usize>,
    hard_fails: HashSet<usize>,
    n_soft_fails: AtomicUsize,
    n_hard_fails: AtomicUsize,
}

impl MockSchedule {
    /// The standard schedule: soft fails {2, 4} with 4 rescued, hard
    /// fails {6, 9}.
    #[must_use]
    pub fn standard() -> Self {
        Self::new([2, 4], [4], [6, 9])
    }

    /// Builds a schedule from explicit index sets.
    #[must_use]
    pub fn new(
        soft_fails: impl IntoIterator<Item = usize>,
        rescue_soft_fails: impl IntoIterator<Item = usize>,
        hard_fails: impl IntoIterator<Item = usize>,
    ) -> Self {
        Self {
            soft_fails: AsyncMutex::new(soft_fails.into_iter().collect()),
            rescue_soft_fails: rescue_soft_fails.into_iter().collect(),
            hard_fails: hard_fails.into_iter().collect(),
            n_soft_fails: AtomicUsize::new(0),
            n_hard_fails: AtomicUsize::new(0),
        }
    }

    /// Number of soft failures raised so far.
    #[must_use]
    pub fn n_soft_fails(&self) -> usize {
        self.n_soft_fails.load(Ordering::SeqCst)
    }

    /// Number of hard failures raised so far.
    #[must_use]
    pub fn n_hard_fails(&self) -> usize {
        self.n_hard_fails.load(Ordering::SeqCst)
    }

    /// Checks the schedule for `idx`, recording and rescuing as configured.
    async fn check(&self, idx: usize, worker: &str) -> Result<(), WorkerError> {
        {
            let mut soft = self.soft_fails.lock().await;
            if soft.contains(&idx) {
                self.n_soft_fails.fetch_add(1, Ordering::SeqCst);
                if self.rescue_soft_fails.contains(&idx) {
                    soft.remove(&idx);
                }
                return Err(WorkerError::connection(
                    worker,
                    format!("{worker} aborted job {idx} (expected)"),
                ));
            }
        }
        if self.hard_fails.contains(&idx) {
            self.n_hard_fails.fetch_add(1, Ordering::SeqCst);
            return Err(WorkerError::invalid_value(format!(
                "job {idx} failed on {worker} (expected)"
            )));
        }
        Ok(())
    }
}

impl Default for MockSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

/// Simulated mirror worker with deterministic failures and random timing.
#[derive(Debug)]
pub struct MockWorker {
    name: String,
    quiet: bool,
    launch_rate: f64,
    retirement_rate: f64,
    output_dir: Option<PathBuf>,
    rng: std::sync::Arc<SimRng>,
    schedule: std::sync::Arc<MockSchedule>,
}

impl MockWorker {
    /// Creates worker `W{ident_no}`. Higher identifiers launch more slowly,
    /// giving the pool a heterogeneous rate profile.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(
        ident_no: usize,
        rng: std::sync::Arc<SimRng>,
        schedule: std::sync::Arc<MockSchedule>,
        quiet: bool,
    ) -> Self {
        let launch_rate = LAUNCH_RATE_MAX / (ident_no as f64 + 1.0);
        Self {
            name: format!("W{ident_no}"),
            quiet,
            launch_rate,
            retirement_rate: launch_rate / LAUNCH_RETIREMENT_RATIO,
            output_dir: None,
            rng,
            schedule,
        }
    }

    /// Enables writing the simulated payload as `{code}.{file_type}` under
    /// `dir`.
    #[must_use]
    pub fn with_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Replaces the generated `W{ident_no}` name, for pools built from
    /// mirror descriptors.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn filename(bundle: &ArgBundle) -> Option<String> {
        match (bundle.str_field("code"), bundle.str_field("file_type")) {
            (Some(code), Some(file_type)) => Some(format!("{code}.{file_type}")),
            _ => None,
        }
    }
}

#[async_trait]
impl Worker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn soft_kinds(&self) -> &[ErrorKind] {
        &[ErrorKind::Connection]
    }

    fn hard_kinds(&self) -> &[ErrorKind] {
        &[ErrorKind::InvalidValue]
    }

    fn quiet(&self) -> bool {
        self.quiet
    }

    /// Fake rate limiting: sleep an exponential time scaled to this
    /// worker's launch rate.
    async fn limiter(&self) {
        let delay = self.rng.wait_time(self.launch_rate).min(MAX_SIM_DELAY_S);
        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
    }

    #[allow(clippy::cast_precision_loss)]
    async fn fetch(
        &self,
        results: &ResultStream,
        worker_count: u64,
        bundle: &ArgBundle,
    ) -> Result<(), WorkerError> {
        let idx = bundle.idx;
        self.schedule.check(idx, &self.name).await?;
        if !self.quiet {
            info!(worker = %self.name, idx, "working on job");
        }

        let bytes = self.rng.zipf_with_min(ZIPF_MIN, ZIPF_SCALE, ZIPF_EXPONENT);
        let filename = Self::filename(bundle);
        if let (Some(dir), Some(name)) = (&self.output_dir, &filename) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| WorkerError::io(dir.clone(), e))?;
            let path = dir.join(name);
            let payload = vec![b'a'; usize::try_from(bytes).unwrap_or(usize::MAX)];
            tokio::fs::write(&path, payload)
                .await
                .map_err(|e| WorkerError::io(path, e))?;
        }

        // Simulate the download: exponential latency plus receive time.
        let latency = self.rng.wait_time(self.retirement_rate);
        let receive = (bytes / DL_CHUNK_SIZE) as f64 / DL_RATE;
        let delay = (latency + receive).min(MAX_SIM_DELAY_S);
        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;

        let mut extras = BTreeMap::new();
        if let Some(name) = filename {
            extras.insert("filename".to_string(), ArgValue::from(name));
        }
        self.put_result(results, worker_count, idx, bytes, extras)
            .await
    }
}
