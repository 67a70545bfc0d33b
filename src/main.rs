//! CLI entry point for the swarmdl tool.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use swarmdl_core::{
    ArgField, MockSchedule, MockWorker, MultiDispatcher, PoolOptions, ServerDef, SimRng, Worker,
    expand_args, failures_to_tsv, results_to_tsv,
};
use tracing::{debug, info};

mod cli;

use cli::Args;

fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("swarmdl starting");

    // Build the worker pool: real mirrors from a definitions file, or a
    // simulated fleet.
    let dispatcher = match &args.servers {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading server definitions from {}", path.display()))?;
            let defs: Vec<ServerDef> =
                serde_json::from_str(&text).context("parsing server definitions")?;
            info!(mirrors = defs.len(), "building HTTP mirror pool");
            let options = PoolOptions {
                quiet: args.quiet,
                output_dir: args.output_dir.clone(),
                ..PoolOptions::default()
            };
            MultiDispatcher::from_server_defs(&defs, &options)?
        }
        None => {
            info!(workers = args.workers, "building simulated mirror pool");
            let rng = Arc::new(SimRng::default());
            let schedule = Arc::new(MockSchedule::standard());
            let workers: Vec<Arc<dyn Worker>> = (0..args.workers)
                .map(|ident| {
                    let mut worker = MockWorker::new(
                        ident,
                        Arc::clone(&rng),
                        Arc::clone(&schedule),
                        args.quiet,
                    );
                    if let Some(dir) = &args.output_dir {
                        worker = worker.with_output(dir.clone());
                    }
                    Arc::new(worker) as Arc<dyn Worker>
                })
                .collect();
            MultiDispatcher::new(workers)?
        }
    };
    let dispatcher = dispatcher
        .with_max_retries(args.max_retries)
        .with_history_len(args.history_len);

    // Generate the request list: zero-padded codes plus a shared file type.
    let mut arg_map = BTreeMap::new();
    arg_map.insert(
        "code".to_string(),
        ArgField::per_request((0..args.requests).map(|i| format!("{i:04}"))),
    );
    arg_map.insert("file_type".to_string(), ArgField::scalar(args.file_type.as_str()));
    let bundles = expand_args(&arg_map);

    let outcome = dispatcher.main(bundles, args.config.into())?;

    print!("{}", results_to_tsv(&outcome.results));
    if !outcome.failures.is_empty() {
        print!("{}", failures_to_tsv(&outcome.failures));
    }
    println!("{}", serde_json::to_string_pretty(&outcome.summary)?);

    info!(
        finished = outcome.summary.finished,
        failed = outcome.summary.failed,
        retries = outcome.summary.retries,
        "download complete"
    );

    Ok(())
}
