//! Integration tests for the multi-worker dispatch engine with the mock
//! mirror pool: completeness, ordering, retry promotion, and statistics.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use swarmdl_core::{
    ArgBundle, ArgField, DispatchError, ErrorKind, MockSchedule, MockWorker, MultiDispatcher,
    PoolOptions, ResultStream, RuntimeFlavor, ServerDef, SimRng, StatKey, TOO_MANY_RETRIES,
    Worker, WorkerError, expand_args,
};

/// Builds the standard argument list: zero-padded codes plus a file type.
fn request_bundles(n: usize) -> Vec<ArgBundle> {
    let mut arg_map = BTreeMap::new();
    arg_map.insert(
        "code".to_string(),
        ArgField::per_request((0..n).map(|i| format!("{i:04}"))),
    );
    arg_map.insert("file_type".to_string(), ArgField::scalar("txt"));
    expand_args(&arg_map)
}

/// Builds a quiet mock pool sharing one schedule and generator.
fn mock_pool(n_workers: usize, schedule: MockSchedule) -> Vec<Arc<dyn Worker>> {
    let rng = Arc::new(SimRng::default());
    let schedule = Arc::new(schedule);
    (0..n_workers)
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

#[tokio::test]
async fn test_happy_path_hundred_requests_three_workers() {
    let n_items = 100;
    let dispatcher = MultiDispatcher::new(mock_pool(3, MockSchedule::standard()))
        .unwrap()
        .with_max_retries(2);

    let outcome = dispatcher.run(request_bundles(n_items)).await.unwrap();

    // soft fail at idx 4 is rescued after one retry; idx 2 exhausts the
    // budget; hard fails at 6 and 9 never retry
    assert_eq!(outcome.results.len(), 97);
    assert_eq!(outcome.failures.len(), 3);
    let failed_indices: Vec<usize> = outcome.failures.iter().map(|f| f.idx).collect();
    assert_eq!(failed_indices, vec![2, 6, 9]);

    for failure in &outcome.failures {
        match failure.idx {
            2 => {
                assert_eq!(failure.error, TOO_MANY_RETRIES);
                assert!(failure.message.contains("Connection"));
            }
            6 | 9 => {
                assert_eq!(failure.error, "InvalidValue");
                assert!(failure.message.contains("(expected)"));
            }
            other => panic!("unexpected failure at idx {other}"),
        }
    }

    assert_eq!(outcome.summary.requests, n_items);
    assert_eq!(outcome.summary.finished, 97);
    assert_eq!(outcome.summary.failed, 3);
    // two soft failures for idx 2 plus one for idx 4
    assert_eq!(outcome.summary.retries, 3);
    assert_eq!(outcome.summary.workers, 3);
}

#[tokio::test]
async fn test_every_index_appears_in_exactly_one_list() {
    let n_items = 100;
    let dispatcher = MultiDispatcher::new(mock_pool(3, MockSchedule::standard()))
        .unwrap()
        .with_max_retries(2);

    let outcome = dispatcher.run(request_bundles(n_items)).await.unwrap();

    let result_indices: HashSet<usize> = outcome.results.iter().map(|r| r.idx).collect();
    let failure_indices: HashSet<usize> = outcome.failures.iter().map(|f| f.idx).collect();
    assert_eq!(result_indices.len(), outcome.results.len(), "duplicate result idx");
    assert_eq!(failure_indices.len(), outcome.failures.len(), "duplicate failure idx");
    assert!(result_indices.is_disjoint(&failure_indices));
    assert_eq!(result_indices.len() + failure_indices.len(), n_items);
}

#[tokio::test]
async fn test_result_and_failure_lists_are_sorted_by_index() {
    let dispatcher = MultiDispatcher::new(mock_pool(3, MockSchedule::standard()))
        .unwrap()
        .with_max_retries(2);

    let outcome = dispatcher.run(request_bundles(50)).await.unwrap();

    let result_indices: Vec<usize> = outcome.results.iter().map(|r| r.idx).collect();
    let mut sorted = result_indices.clone();
    sorted.sort_unstable();
    assert_eq!(result_indices, sorted);

    let failure_indices: Vec<usize> = outcome.failures.iter().map(|f| f.idx).collect();
    let mut sorted = failure_indices.clone();
    sorted.sort_unstable();
    assert_eq!(failure_indices, sorted);
}

#[tokio::test]
async fn test_empty_argument_set() {
    let dispatcher = MultiDispatcher::new(mock_pool(3, MockSchedule::standard()))
        .unwrap()
        .with_max_retries(2);

    let outcome = dispatcher.run(Vec::new()).await.unwrap();

    assert!(outcome.results.is_empty());
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.summary.requests, 0);
    assert_eq!(outcome.summary.finished, 0);
    assert_eq!(outcome.summary.failed, 0);
    assert_eq!(outcome.summary.workers, 0);
}

#[tokio::test]
async fn test_zero_max_retries_requeues_indefinitely() {
    // With no retry budget a persistent soft failure is never promoted: the
    // bundle cycles between the argument stream and the failing unit, so the
    // run cannot terminate. Detected by timeout.
    let dispatcher = MultiDispatcher::new(mock_pool(1, MockSchedule::standard())).unwrap();

    let run = dispatcher.run(request_bundles(10));
    let outcome = tokio::time::timeout(Duration::from_secs(2), run).await;
    assert!(
        outcome.is_err(),
        "run should keep re-queueing idx 2 without a retry budget"
    );
}

#[tokio::test]
async fn test_clean_schedule_finishes_everything() {
    let dispatcher = MultiDispatcher::new(mock_pool(2, MockSchedule::new([], [], [])))
        .unwrap()
        .with_max_retries(2);

    let outcome = dispatcher.run(request_bundles(30)).await.unwrap();

    assert_eq!(outcome.results.len(), 30);
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.summary.retries, 0);
    // every result carries its timestamps and a worker from the pool
    for entry in &outcome.results {
        assert!(entry.retirement_ms >= entry.launch_ms);
        assert!(entry.worker == "W0" || entry.worker == "W1");
        assert!(entry.bytes > 0);
    }
}

#[tokio::test]
async fn test_run_statistics_cover_every_result() {
    let dispatcher = MultiDispatcher::new(mock_pool(3, MockSchedule::standard()))
        .unwrap()
        .with_max_retries(2)
        .with_history_len(4);

    let outcome = dispatcher.run(request_bundles(100)).await.unwrap();

    let bytes = outcome.stats.stat(StatKey::Bytes).all();
    assert_eq!(bytes.n_obs(), 97);
    let total: u64 = outcome.results.iter().map(|r| r.bytes).sum();
    #[allow(clippy::cast_precision_loss)]
    let expected = total as f64;
    assert_eq!(bytes.sum(), Some(expected));

    // aggregate count equals the sum of per-worker counts
    let per_worker: u64 = outcome
        .stats
        .workers()
        .iter()
        .filter_map(|name| outcome.stats.stat(StatKey::Bytes).stat(name))
        .map(swarmdl_core::Stat::n_obs)
        .sum();
    assert_eq!(per_worker, 97);

    // derived service time exists wherever both operands do
    let service = outcome.stats.stat(StatKey::ServiceT).all();
    assert_eq!(service.n_obs(), 97);
    assert!(service.min().unwrap_or(0.0) >= 0.0);
}

#[tokio::test]
async fn test_mock_pool_from_server_defs() {
    let defs = vec![
        ServerDef::new("aws", "s3.rcsb.org").with_dir("pub/pdb/data"),
        ServerDef::new("us", "files.rcsb.org").with_dir("pub/pdb/data"),
        ServerDef::new("br", "bmrb.io").with_dir("ftp/pub/pdb/data"),
    ];
    let options = PoolOptions {
        mock: true,
        quiet: true,
        ..PoolOptions::default()
    };
    let dispatcher = MultiDispatcher::from_server_defs(&defs, &options)
        .unwrap()
        .with_max_retries(2);

    let outcome = dispatcher.run(request_bundles(100)).await.unwrap();

    assert_eq!(outcome.failures.len(), 3);
    assert_eq!(outcome.results.len(), 97);
    let pool: HashSet<&str> = ["aws", "us", "br"].into();
    for entry in &outcome.results {
        assert!(pool.contains(entry.worker.as_str()));
    }
}

#[test]
fn test_main_entry_with_testing_runtime() {
    let dispatcher = MultiDispatcher::new(mock_pool(3, MockSchedule::standard()))
        .unwrap()
        .with_max_retries(2);

    let outcome = dispatcher
        .main(request_bundles(100), RuntimeFlavor::Testing)
        .unwrap();

    assert_eq!(outcome.results.len(), 97);
    assert_eq!(outcome.failures.len(), 3);
}

#[test]
fn test_main_entry_with_production_runtime() {
    let dispatcher = MultiDispatcher::new(mock_pool(2, MockSchedule::new([], [], [])))
        .unwrap()
        .with_max_retries(1);

    let outcome = dispatcher
        .main(request_bundles(20), RuntimeFlavor::Production)
        .unwrap();

    assert_eq!(outcome.results.len(), 20);
}

/// A worker that fails with a kind outside both of its declared sets.
struct MisdeclaredWorker;

#[async_trait]
impl Worker for MisdeclaredWorker {
    fn name(&self) -> &str {
        "broken"
    }

    fn soft_kinds(&self) -> &[ErrorKind] {
        &[ErrorKind::Connection]
    }

    fn hard_kinds(&self) -> &[ErrorKind] {
        &[ErrorKind::InvalidValue]
    }

    fn quiet(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        _results: &ResultStream,
        _worker_count: u64,
        bundle: &ArgBundle,
    ) -> Result<(), WorkerError> {
        Err(WorkerError::timeout(format!("job {}", bundle.idx)))
    }
}

#[tokio::test]
async fn test_unhandled_error_aborts_the_run() {
    let dispatcher = MultiDispatcher::new(vec![Arc::new(MisdeclaredWorker) as Arc<dyn Worker>])
        .unwrap()
        .with_max_retries(2);

    let error = dispatcher.run(request_bundles(5)).await.unwrap_err();

    match error {
        DispatchError::Unhandled { worker, idx, kind, .. } => {
            assert_eq!(worker, "broken");
            assert_eq!(idx, 0);
            assert_eq!(kind, "Timeout");
        }
        other => panic!("expected unhandled-error abort, got {other:?}"),
    }
}
