//! Per-worker and aggregate download statistics.
//!
//! The registry tracks six quantities for a dispatch run. Three are primitive
//! observations fed in at retirement time (`retirement_t`, `launch_t`,
//! `bytes`); three are derived as new observations arrive (`service_t`,
//! `dl_rate`, `cum_rate`). Every quantity is kept per worker plus one
//! aggregate under the synthetic worker name [`ALL_WORKERS`].
//!
//! Each tracked series is a [`Stat`]: last value, count, sum, min, max,
//! average, and a rolling average over a bounded history window.
//!
//! # Example
//!
//! ```
//! use swarmdl_core::stats::{QueueStats, StatKey, ALL_WORKERS};
//!
//! let mut stats = QueueStats::new(&["w0".to_string()], 0);
//! stats
//!     .update_stats(
//!         &[
//!             (StatKey::RetirementT, 800.1),
//!             (StatKey::LaunchT, 0.1),
//!             (StatKey::Bytes, 2.0 * 1024.0 * 1024.0),
//!         ],
//!         "w0",
//!     )
//!     .unwrap();
//! let service = stats.stat(StatKey::ServiceT).stat("w0").unwrap();
//! assert_eq!(service.value(), Some(800.0));
//! let rate = stats.stat(StatKey::DlRate).all();
//! assert_eq!(rate.value(), Some(2.5));
//! ```

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tracing::trace;

/// Synthetic worker name for the cross-worker aggregate.
pub const ALL_WORKERS: &str = "all";

/// Default digits kept after the decimal point.
pub const DEFAULT_ROUNDING: i32 = 2;

/// Digits kept when rounding rates.
pub(crate) const RATE_ROUNDING: i32 = 1;

/// Conversion factor from bytes to megabits.
pub const BYTES_TO_MEGABITS: f64 = 8.0 / 1024.0 / 1024.0;

/// Rounds to the given number of decimal digits.
///
/// `digits = 0` yields a whole number.
#[must_use]
pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Applies an optional scale and re-rounding to a report value.
fn rescale(value: Option<f64>, scale: Option<f64>, rounding: Option<i32>) -> Option<f64> {
    let mut value = value?;
    if let Some(scale) = scale {
        value *= scale;
    }
    if let Some(digits) = rounding {
        value = round_to(value, digits);
    }
    Some(value)
}

/// Errors from the statistics registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    /// An observation was posted for a worker that was never registered.
    #[error("unknown worker {worker:?} for stat {label:?}")]
    UnknownWorker {
        /// Label of the stat the observation was posted to.
        label: String,
        /// The unregistered worker name.
        worker: String,
    },
}

/// Derived statistics over one numeric series.
///
/// All observations pass through a single rounding step before any derived
/// field is updated, so `sum`, `avg`, `min` and `max` are extremes and sums
/// of *rounded* observations.
#[derive(Debug, Clone, Serialize)]
pub struct Stat {
    value: Option<f64>,
    sum: Option<f64>,
    n_obs: u64,
    avg: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    r_avg: Option<f64>,
    #[serde(skip)]
    history: VecDeque<f64>,
    #[serde(skip)]
    history_len: usize,
    #[serde(skip)]
    rounding: i32,
}

impl Stat {
    /// Creates an empty series with the given rounding and history window.
    #[must_use]
    pub fn new(rounding: i32, history_len: usize) -> Self {
        Self {
            value: None,
            sum: None,
            n_obs: 0,
            avg: None,
            min: None,
            max: None,
            r_avg: None,
            history: VecDeque::with_capacity(history_len),
            history_len,
            rounding,
        }
    }

    /// Records one observation, updating all derived fields.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe(&mut self, value: f64) {
        let rounded = round_to(value, self.rounding);
        self.n_obs += 1;
        if self.value.is_none() {
            self.sum = Some(rounded);
            self.avg = Some(rounded);
            self.min = Some(rounded);
            self.max = Some(rounded);
        } else {
            let sum = round_to(self.sum.unwrap_or(0.0) + rounded, self.rounding);
            self.sum = Some(sum);
            self.avg = Some(round_to(sum / self.n_obs as f64, self.rounding));
            self.min = Some(self.min.unwrap_or(rounded).min(rounded));
            self.max = Some(self.max.unwrap_or(rounded).max(rounded));
        }
        self.value = Some(rounded);
        if self.history_len > 0 {
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(rounded);
            if self.history.len() == self.history_len {
                let window: f64 = self.history.iter().sum();
                self.r_avg = Some(round_to(window / self.history_len as f64, self.rounding));
            }
        }
    }

    /// The last observation, rounded.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Sum of rounded observations.
    #[must_use]
    pub fn sum(&self) -> Option<f64> {
        self.sum
    }

    /// Number of observations.
    #[must_use]
    pub fn n_obs(&self) -> u64 {
        self.n_obs
    }

    /// Mean of rounded observations.
    #[must_use]
    pub fn avg(&self) -> Option<f64> {
        self.avg
    }

    /// Smallest rounded observation.
    #[must_use]
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    /// Largest rounded observation.
    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// Rolling-window mean; defined only once the window has filled.
    #[must_use]
    pub fn r_avg(&self) -> Option<f64> {
        self.r_avg
    }

    /// The history window, once full; `None` before that.
    #[must_use]
    pub fn history(&self) -> Option<Vec<f64>> {
        if self.history_len > 0 && self.history.len() == self.history_len {
            Some(self.history.iter().copied().collect())
        } else {
            None
        }
    }
}

/// One tracked quantity, kept per worker plus the [`ALL_WORKERS`] aggregate.
#[derive(Debug, Clone)]
pub struct WorkerStat {
    label: String,
    rounding: i32,
    per_worker: BTreeMap<String, Stat>,
    all: Stat,
}

impl WorkerStat {
    /// Creates a per-worker stat for the given worker names.
    #[must_use]
    pub fn new(label: &str, workers: &[String], rounding: i32, history_len: usize) -> Self {
        let per_worker = workers
            .iter()
            .map(|name| (name.clone(), Stat::new(rounding, history_len)))
            .collect();
        Self {
            label: label.to_string(),
            rounding,
            per_worker,
            all: Stat::new(rounding, history_len),
        }
    }

    /// The human-readable label for this quantity.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Digits kept after the decimal point for this quantity.
    #[must_use]
    pub fn rounding(&self) -> i32 {
        self.rounding
    }

    /// Records an observation for `worker` and mirrors it into the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::UnknownWorker`] if `worker` was not registered.
    pub fn set(&mut self, value: f64, worker: &str) -> Result<(), StatsError> {
        if worker == ALL_WORKERS {
            self.all.observe(value);
            return Ok(());
        }
        self.worker_mut(worker)?.observe(value);
        self.all.observe(value);
        Ok(())
    }

    /// Records an observation for `worker` only, leaving the aggregate
    /// untouched so it can be set separately.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::UnknownWorker`] if `worker` was not registered.
    pub fn set_local(&mut self, value: f64, worker: &str) -> Result<(), StatsError> {
        self.worker_mut(worker)?.observe(value);
        Ok(())
    }

    /// Records an observation on the aggregate only.
    pub fn set_all(&mut self, value: f64) {
        self.all.observe(value);
    }

    /// The series for one worker.
    #[must_use]
    pub fn stat(&self, worker: &str) -> Option<&Stat> {
        if worker == ALL_WORKERS {
            Some(&self.all)
        } else {
            self.per_worker.get(worker)
        }
    }

    /// The aggregate series.
    #[must_use]
    pub fn all(&self) -> &Stat {
        &self.all
    }

    fn worker_mut(&mut self, worker: &str) -> Result<&mut Stat, StatsError> {
        let label = self.label.clone();
        self.per_worker
            .get_mut(worker)
            .ok_or_else(|| StatsError::UnknownWorker {
                label,
                worker: worker.to_string(),
            })
    }
}

/// The six tracked quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKey {
    /// Retirement time since run start, ms.
    RetirementT,
    /// Launch time since run start, ms.
    LaunchT,
    /// Retirement minus launch time, ms.
    ServiceT,
    /// Bytes downloaded.
    Bytes,
    /// Per-file download rate, MB/s.
    DlRate,
    /// Cumulative download rate, Mbit/s.
    CumRate,
}

impl StatKey {
    /// All keys, in registry order.
    pub const ALL: [Self; 6] = [
        Self::RetirementT,
        Self::LaunchT,
        Self::ServiceT,
        Self::Bytes,
        Self::DlRate,
        Self::CumRate,
    ];

    /// The snake_case name used in reports.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::RetirementT => "retirement_t",
            Self::LaunchT => "launch_t",
            Self::ServiceT => "service_t",
            Self::Bytes => "bytes",
            Self::DlRate => "dl_rate",
            Self::CumRate => "cum_rate",
        }
    }

    /// The human-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::RetirementT => "retirement time, ms",
            Self::LaunchT => "launch time, ms",
            Self::ServiceT => "service time, ms",
            Self::Bytes => "bytes downloaded",
            Self::DlRate => "per-file download rate, /s",
            Self::CumRate => "download rate, Mbit/s",
        }
    }

    /// Digits kept after the decimal point.
    #[must_use]
    pub fn rounding(self) -> i32 {
        match self {
            Self::RetirementT | Self::LaunchT | Self::ServiceT => 2,
            Self::Bytes | Self::CumRate => 0,
            Self::DlRate => 1,
        }
    }
}

/// Registry of per-worker queue statistics with derived-quantity updates.
#[derive(Debug, Clone)]
pub struct QueueStats {
    workers: Vec<String>,
    stats: [WorkerStat; 6],
}

impl QueueStats {
    /// Creates a registry for the given worker names.
    ///
    /// `history_len > 0` enables rolling averages over that window size.
    #[must_use]
    pub fn new(workers: &[String], history_len: usize) -> Self {
        let stats = StatKey::ALL
            .map(|key| WorkerStat::new(key.label(), workers, key.rounding(), history_len));
        Self {
            workers: workers.to_vec(),
            stats,
        }
    }

    /// The registered worker names, without the aggregate.
    #[must_use]
    pub fn workers(&self) -> &[String] {
        &self.workers
    }

    /// The per-worker stat for one quantity.
    #[must_use]
    pub fn stat(&self, key: StatKey) -> &WorkerStat {
        &self.stats[key as usize]
    }

    fn stat_mut(&mut self, key: StatKey) -> &mut WorkerStat {
        &mut self.stats[key as usize]
    }

    fn value(&self, key: StatKey, worker: &str) -> Option<f64> {
        self.stat(key).stat(worker).and_then(Stat::value)
    }

    fn sum(&self, key: StatKey, worker: &str) -> Option<f64> {
        self.stat(key).stat(worker).and_then(Stat::sum)
    }

    /// Posts primitive observations for `worker`, then recomputes the
    /// derived quantities. An empty observation slice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::UnknownWorker`] if `worker` was not registered.
    pub fn update_stats(
        &mut self,
        observations: &[(StatKey, f64)],
        worker: &str,
    ) -> Result<(), StatsError> {
        if observations.is_empty() {
            return Ok(());
        }
        for (key, value) in observations {
            trace!(stat = key.name(), value, worker, "posting observation");
            self.stat_mut(*key).set(*value, worker)?;
        }
        self.derive(worker)
    }

    /// Recomputes derived quantities for `worker` and the aggregate.
    ///
    /// A derivation with a missing operand is silently skipped.
    fn derive(&mut self, worker: &str) -> Result<(), StatsError> {
        // service_t = retirement_t - launch_t
        if let (Some(retirement), Some(launch)) = (
            self.value(StatKey::RetirementT, worker),
            self.value(StatKey::LaunchT, worker),
        ) {
            self.stat_mut(StatKey::ServiceT)
                .set(retirement - launch, worker)?;
        }
        // dl_rate = bytes / MiB / service seconds, per worker; the aggregate
        // is recomputed from the aggregate operands because the ratio is not
        // additive across workers.
        if worker != ALL_WORKERS {
            if let (Some(bytes), Some(service)) = (
                self.value(StatKey::Bytes, worker),
                self.value(StatKey::ServiceT, worker),
            ) {
                self.stat_mut(StatKey::DlRate)
                    .set_local(bytes * 1000.0 / 1024.0 / 1024.0 / service, worker)?;
            }
        }
        if let (Some(bytes), Some(service)) = (
            self.value(StatKey::Bytes, ALL_WORKERS),
            self.value(StatKey::ServiceT, ALL_WORKERS),
        ) {
            self.stat_mut(StatKey::DlRate)
                .set_all(bytes * 1000.0 / 1024.0 / 1024.0 / service);
        }
        // cum_rate = total megabits / elapsed seconds, same per-worker /
        // aggregate split.
        if worker != ALL_WORKERS {
            if let (Some(byte_sum), Some(retirement)) = (
                self.sum(StatKey::Bytes, worker),
                self.value(StatKey::RetirementT, worker),
            ) {
                self.stat_mut(StatKey::CumRate)
                    .set_local(byte_sum * BYTES_TO_MEGABITS * 1000.0 / retirement, worker)?;
            }
        }
        if let (Some(byte_sum), Some(retirement)) = (
            self.sum(StatKey::Bytes, ALL_WORKERS),
            self.value(StatKey::RetirementT, ALL_WORKERS),
        ) {
            self.stat_mut(StatKey::CumRate)
                .set_all(byte_sum * BYTES_TO_MEGABITS * 1000.0 / retirement);
        }
        Ok(())
    }

    /// Per-worker headline numbers: elapsed seconds, max per-file rate,
    /// total MB downloaded. Keyed by worker name, aggregate last.
    #[must_use]
    pub fn report_worker_stats(&self) -> BTreeMap<String, BTreeMap<String, Option<f64>>> {
        let mut report = BTreeMap::new();
        for worker in self.report_workers() {
            report.insert(worker.clone(), self.worker_row(&worker));
        }
        report
    }

    /// The headline numbers for one worker, with human-readable labels.
    #[must_use]
    pub fn report_summary_stats(&self, worker: &str) -> BTreeMap<String, Option<f64>> {
        let row = self.worker_row(worker);
        let mut labeled = BTreeMap::new();
        labeled.insert(
            "Elapsed time, s".to_string(),
            row.get("elapsed_t").copied().flatten(),
        );
        labeled.insert(
            "Max per-file download rate, /s".to_string(),
            row.get("dl_rate_max").copied().flatten(),
        );
        labeled.insert(
            "Total MB downloaded".to_string(),
            row.get("bytes_sum").copied().flatten(),
        );
        labeled
    }

    /// Last-file numbers for one worker; `diagnostics` adds the rolling
    /// per-file rate.
    #[must_use]
    pub fn report_file_stats(
        &self,
        worker: &str,
        diagnostics: bool,
    ) -> BTreeMap<String, Option<f64>> {
        let mut report = BTreeMap::new();
        for key in [
            StatKey::RetirementT,
            StatKey::LaunchT,
            StatKey::ServiceT,
            StatKey::Bytes,
        ] {
            report.insert(key.name().to_string(), self.value(key, worker));
        }
        if diagnostics {
            report.insert(
                "dl_rate_r_avg".to_string(),
                self.stat(StatKey::DlRate).stat(worker).and_then(Stat::r_avg),
            );
        }
        report
    }

    fn report_workers(&self) -> Vec<String> {
        let mut names = self.workers.clone();
        names.push(ALL_WORKERS.to_string());
        names
    }

    fn worker_row(&self, worker: &str) -> BTreeMap<String, Option<f64>> {
        let mut row = BTreeMap::new();
        row.insert(
            "elapsed_t".to_string(),
            rescale(
                self.value(StatKey::RetirementT, worker),
                Some(1.0 / 1000.0),
                Some(1),
            ),
        );
        row.insert(
            "dl_rate_max".to_string(),
            self.stat(StatKey::DlRate).stat(worker).and_then(Stat::max),
        );
        row.insert(
            "bytes_sum".to_string(),
            rescale(
                self.sum(StatKey::Bytes, worker),
                Some(1.0 / 1024.0 / 1024.0),
                Some(1),
            ),
        );
        row
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: f64 = 1024.0 * 1024.0;

    #[test]
    fn test_round_to_zero_digits_is_whole() {
        assert!((round_to(19.997, 0) - 20.0).abs() < f64::EPSILON);
        assert!((round_to(-2.6, 0) + 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stat_starts_empty() {
        let stat = Stat::new(3, 2);
        assert_eq!(stat.value(), None);
        assert_eq!(stat.sum(), None);
        assert_eq!(stat.n_obs(), 0);
        assert_eq!(stat.avg(), None);
        assert_eq!(stat.min(), None);
        assert_eq!(stat.max(), None);
        assert_eq!(stat.r_avg(), None);
        assert_eq!(stat.history(), None);
    }

    #[test]
    fn test_stat_first_observation_sets_all_fields() {
        let mut stat = Stat::new(3, 2);
        stat.observe(3.14159);
        assert_eq!(stat.value(), Some(3.142));
        assert_eq!(stat.min(), Some(3.142));
        assert_eq!(stat.max(), Some(3.142));
        assert_eq!(stat.sum(), Some(3.142));
        assert_eq!(stat.avg(), Some(3.142));
        assert_eq!(stat.n_obs(), 1);
        assert_eq!(stat.r_avg(), None);
        assert_eq!(stat.history(), None);
    }

    #[test]
    fn test_stat_rolling_window_sequence() {
        let mut stat = Stat::new(3, 2);
        stat.observe(3.14159);
        stat.observe(-3.14159);
        assert_eq!(stat.value(), Some(-3.142));
        assert_eq!(stat.min(), Some(-3.142));
        assert_eq!(stat.max(), Some(3.142));
        assert_eq!(stat.sum(), Some(0.0));
        assert_eq!(stat.avg(), Some(0.0));
        assert_eq!(stat.n_obs(), 2);
        assert_eq!(stat.r_avg(), Some(0.0));
        assert_eq!(stat.history(), Some(vec![3.142, -3.142]));

        stat.observe(6.0);
        assert_eq!(stat.value(), Some(6.0));
        assert_eq!(stat.min(), Some(-3.142));
        assert_eq!(stat.max(), Some(6.0));
        assert_eq!(stat.sum(), Some(6.0));
        assert_eq!(stat.avg(), Some(2.0));
        assert_eq!(stat.n_obs(), 3);
        assert_eq!(stat.history(), Some(vec![-3.142, 6.0]));
        assert_eq!(stat.r_avg(), Some(1.429));
    }

    #[test]
    fn test_stat_no_history_window_never_defines_rolling_avg() {
        let mut stat = Stat::new(2, 0);
        for i in 0..10 {
            stat.observe(f64::from(i));
        }
        assert_eq!(stat.r_avg(), None);
        assert_eq!(stat.history(), None);
    }

    #[test]
    fn test_worker_stat_aggregates_into_all() {
        let workers = vec!["worker0".to_string(), "worker1".to_string()];
        let mut stat = WorkerStat::new("bytes in", &workers, 0, 2);

        stat.set(100.0, "worker0").unwrap();
        let all = stat.all();
        assert_eq!(all.value(), Some(100.0));
        assert_eq!(all.sum(), Some(100.0));
        assert_eq!(all.n_obs(), 1);
        assert_eq!(all.r_avg(), None);

        stat.set(200.0, "worker1").unwrap();
        let all = stat.all();
        assert_eq!(all.value(), Some(200.0));
        assert_eq!(all.sum(), Some(300.0));
        assert_eq!(all.n_obs(), 2);
        assert_eq!(all.avg(), Some(150.0));
        assert_eq!(all.min(), Some(100.0));
        assert_eq!(all.max(), Some(200.0));
        assert_eq!(all.r_avg(), Some(150.0));
        assert_eq!(all.history(), Some(vec![100.0, 200.0]));

        let w0 = stat.stat("worker0").unwrap();
        assert_eq!(w0.min(), Some(100.0));
        assert_eq!(w0.max(), Some(100.0));
        assert_eq!(w0.sum(), Some(100.0));
        assert_eq!(w0.avg(), Some(100.0));
        assert_eq!(w0.n_obs(), 1);
        assert_eq!(w0.history(), None);
        assert_eq!(w0.r_avg(), None);
    }

    #[test]
    fn test_worker_stat_rejects_unknown_worker() {
        let workers = vec!["worker0".to_string()];
        let mut stat = WorkerStat::new("bytes in", &workers, 0, 0);
        let err = stat.set(100.0, "worker2").unwrap_err();
        assert_eq!(
            err,
            StatsError::UnknownWorker {
                label: "bytes in".to_string(),
                worker: "worker2".to_string(),
            }
        );
    }

    #[test]
    fn test_worker_stat_local_set_leaves_aggregate_untouched() {
        let workers = vec!["worker0".to_string()];
        let mut stat = WorkerStat::new("rate", &workers, 1, 0);
        stat.set_local(2.5, "worker0").unwrap();
        assert_eq!(stat.stat("worker0").unwrap().value(), Some(2.5));
        assert_eq!(stat.all().value(), None);
        stat.set_all(3.0);
        assert_eq!(stat.all().value(), Some(3.0));
        assert_eq!(stat.all().n_obs(), 1);
    }

    #[test]
    fn test_queue_stats_single_worker_derivations() {
        let workers = vec!["worker0".to_string(), "worker1".to_string()];
        let mut qs = QueueStats::new(&workers, 2);
        qs.update_stats(
            &[
                (StatKey::RetirementT, 800.1),
                (StatKey::LaunchT, 0.1),
                (StatKey::Bytes, 2.0 * MIB),
            ],
            "worker0",
        )
        .unwrap();

        let service = qs.stat(StatKey::ServiceT).stat("worker0").unwrap();
        assert_eq!(service.value(), Some(800.0));
        let rate = qs.stat(StatKey::DlRate).stat("worker0").unwrap();
        assert_eq!(rate.value(), Some(2.5));
        let cum = qs.stat(StatKey::CumRate).stat("worker0").unwrap();
        assert_eq!(cum.value(), Some(20.0));
        // aggregate mirrors a single worker
        assert_eq!(qs.stat(StatKey::DlRate).all().value(), Some(2.5));
        assert_eq!(qs.stat(StatKey::CumRate).all().value(), Some(20.0));
    }

    #[test]
    fn test_queue_stats_two_worker_aggregation() {
        let workers = vec!["worker0".to_string(), "worker1".to_string()];
        let mut qs = QueueStats::new(&workers, 2);
        qs.update_stats(
            &[
                (StatKey::RetirementT, 800.1),
                (StatKey::LaunchT, 0.1),
                (StatKey::Bytes, 2.0 * MIB),
            ],
            "worker0",
        )
        .unwrap();
        qs.update_stats(
            &[
                (StatKey::RetirementT, 988.2),
                (StatKey::LaunchT, 100.2),
                (StatKey::Bytes, 1.5 * MIB),
            ],
            "worker1",
        )
        .unwrap();

        assert_eq!(
            qs.stat(StatKey::DlRate).stat("worker1").unwrap().value(),
            Some(1.7)
        );
        assert_eq!(qs.stat(StatKey::DlRate).all().max(), Some(2.5));

        let report = qs.report_worker_stats();
        let expect_row = |worker: &str, elapsed: f64, rate_max: f64, mb: f64| {
            let row = &report[worker];
            assert_eq!(row["elapsed_t"], Some(elapsed), "elapsed for {worker}");
            assert_eq!(row["dl_rate_max"], Some(rate_max), "rate max for {worker}");
            assert_eq!(row["bytes_sum"], Some(mb), "MB for {worker}");
        };
        expect_row("worker0", 0.8, 2.5, 2.0);
        expect_row("worker1", 1.0, 1.7, 1.5);
        expect_row(ALL_WORKERS, 1.0, 2.5, 3.5);
    }

    #[test]
    fn test_queue_stats_file_report() {
        let workers = vec!["worker0".to_string()];
        let mut qs = QueueStats::new(&workers, 2);
        qs.update_stats(
            &[
                (StatKey::RetirementT, 800.1),
                (StatKey::LaunchT, 0.1),
                (StatKey::Bytes, 2.0 * MIB),
            ],
            "worker0",
        )
        .unwrap();

        let report = qs.report_file_stats("worker0", false);
        assert_eq!(report["retirement_t"], Some(800.1));
        assert_eq!(report["launch_t"], Some(0.1));
        assert_eq!(report["service_t"], Some(800.0));
        assert_eq!(report["bytes"], Some(2.0 * MIB));
        assert!(!report.contains_key("dl_rate_r_avg"));

        let report = qs.report_file_stats("worker0", true);
        assert_eq!(report["dl_rate_r_avg"], None);
    }

    #[test]
    fn test_queue_stats_summary_labels() {
        let workers = vec!["worker0".to_string()];
        let mut qs = QueueStats::new(&workers, 0);
        qs.update_stats(
            &[
                (StatKey::RetirementT, 800.1),
                (StatKey::LaunchT, 0.1),
                (StatKey::Bytes, 2.0 * MIB),
            ],
            "worker0",
        )
        .unwrap();

        let summary = qs.report_summary_stats("worker0");
        assert_eq!(summary["Elapsed time, s"], Some(0.8));
        assert_eq!(summary["Max per-file download rate, /s"], Some(2.5));
        assert_eq!(summary["Total MB downloaded"], Some(2.0));
    }

    #[test]
    fn test_update_with_no_observations_is_noop() {
        let workers = vec!["worker0".to_string()];
        let mut qs = QueueStats::new(&workers, 0);
        qs.update_stats(
            &[(StatKey::RetirementT, 800.1), (StatKey::LaunchT, 0.1)],
            "worker0",
        )
        .unwrap();
        let before = qs.stat(StatKey::ServiceT).stat("worker0").unwrap().n_obs();

        qs.update_stats(&[], "worker0").unwrap();

        let after = qs.stat(StatKey::ServiceT).stat("worker0").unwrap().n_obs();
        assert_eq!(before, after);
    }

    #[test]
    fn test_derivation_skipped_when_operand_missing() {
        let workers = vec!["worker0".to_string()];
        let mut qs = QueueStats::new(&workers, 0);
        // no launch_t yet, so service_t and the rates stay undefined
        qs.update_stats(&[(StatKey::RetirementT, 500.0)], "worker0")
            .unwrap();
        assert_eq!(qs.stat(StatKey::ServiceT).stat("worker0").unwrap().value(), None);
        assert_eq!(qs.stat(StatKey::DlRate).stat("worker0").unwrap().value(), None);
        // cum_rate needs a bytes sum too
        assert_eq!(qs.stat(StatKey::CumRate).stat("worker0").unwrap().value(), None);
    }

    #[test]
    fn test_aggregate_sum_equals_posted_observations() {
        let workers = vec!["w0".to_string(), "w1".to_string(), "w2".to_string()];
        let mut qs = QueueStats::new(&workers, 0);
        let posted = [(100.0, "w0"), (250.0, "w1"), (50.0, "w2"), (75.0, "w0")];
        for (bytes, worker) in posted {
            qs.update_stats(&[(StatKey::Bytes, bytes)], worker).unwrap();
        }
        let total: f64 = posted.iter().map(|(b, _)| b).sum();
        assert_eq!(qs.stat(StatKey::Bytes).all().sum(), Some(total));
        assert_eq!(qs.stat(StatKey::Bytes).all().n_obs(), 4);
    }
}
