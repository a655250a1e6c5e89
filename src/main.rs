//! block-budget: replay a synthetic workload through the KV block allocator.
//!
//! Loads pool and batch settings, initializes the shared block pool, queues
//! the configured requests and runs scheduling passes until every request has
//! finished, logging admission results along the way.

use clap::Parser;
use tracing::{info, warn};

use block_budget::cache::PoolCell;
use block_budget::config::{Cli, Config};
use block_budget::scheduler::batch::Scheduler;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "block_budget=debug"
    } else {
        "block_budget=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("block-budget v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let max_passes = cli.passes.unwrap_or(config.workload.max_passes);

    info!(
        num_blocks = config.pool.num_blocks,
        block_size = config.pool.block_size,
        tokens_capacity = config.tokens_capacity(),
        max_num_seqs = config.scheduler.max_num_seqs,
        max_batched_tokens = config.scheduler.max_batched_tokens,
        "Configuration loaded"
    );

    if config.tokens_per_request() > config.tokens_capacity() {
        warn!(
            tokens_per_request = config.tokens_per_request(),
            tokens_capacity = config.tokens_capacity(),
            "Workload requests exceed pool capacity and will be rejected"
        );
    }

    // Initialize the block pool.
    let cell = PoolCell::new();
    let pool = cell.init(config.pool.num_blocks, config.pool.block_size)?;

    let mut scheduler = Scheduler::new(pool.clone(), config.scheduler.clone());
    for _ in 0..config.workload.num_requests {
        if let Err(e) =
            scheduler.add_request(config.workload.prompt_tokens, config.workload.max_tokens)
        {
            warn!(error = %e, "Request rejected");
        }
    }

    let mut passes = 0;
    let mut finished = 0;
    let mut aborted = 0;
    let mut preemptions = 0;
    let mut peak_running = 0;

    while scheduler.has_unfinished() && passes < max_passes {
        let (output, step) = scheduler.step()?;
        passes += 1;
        finished += step.finished.len();
        aborted += step.aborted.len();
        preemptions += output.preempted.len();
        peak_running = peak_running.max(output.scheduled.len());

        if output.is_empty() {
            warn!(pass = output.pass, "No request could be scheduled");
            break;
        }
    }

    let guard = pool.lock();
    info!(
        passes,
        finished,
        aborted,
        preemptions,
        peak_running,
        unfinished = scheduler.num_waiting() + scheduler.num_running(),
        free_blocks = guard.pool().num_free(),
        utilization = guard.pool().utilization(),
        "Workload complete"
    );

    Ok(())
}
