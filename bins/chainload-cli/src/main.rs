// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! chainload CLI
//!
//! Runs demo chains through the fallback scheduler and the synchronous
//! bridge, stresses per-owner ordering, and manages the runtime config.

// The CLI is expected to print to stdout.
#![allow(clippy::print_stdout)]

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chainload_config_fs::FsConfigStore;
use chainload_core::{
    ChainLoader, ConfigService, FallbackScheduler, InlineAffinity, LoadResult, Loader, LoaderId,
    RuntimeConfig, SchedulerConfig, SyncBridge,
};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod demo;

use demo::{Feed, Jitter, Stage};

/// Upper bound on waiting for any demo chain to finish.
const RUN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Chain loader demo and stress tool")]
struct Args {
    /// Directory holding `runtime.json`; defaults are used when omitted
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one L→D chain asynchronously, then through the blocking bridge
    Chain {
        /// First value the upstream feed delivers
        #[arg(long, default_value_t = 21)]
        value: u64,
        /// Multiplier applied while reprocessing
        #[arg(long, default_value_t = 2)]
        factor: u64,
        /// Partial deliveries before the complete one
        #[arg(long, default_value_t = 2)]
        partials: u64,
        /// Pause between upstream deliveries (ms)
        #[arg(long, default_value_t = 20)]
        gap_ms: u64,
    },
    /// Run many chains at once and check each kept its own order
    Stress {
        /// Number of independent chains
        #[arg(long, default_value_t = 10)]
        chains: u64,
        /// Deliveries per chain (the last one completes it)
        #[arg(long, default_value_t = 4)]
        steps: u64,
        /// Nominal reprocessing cost per delivery (ms)
        #[arg(long, default_value_t = 50)]
        work_ms: u64,
        /// Fixed worker count (overrides the configured pool)
        #[arg(long)]
        workers: Option<usize>,
        /// Seed for per-chain work jitter
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
    },
    /// Print the effective runtime configuration as JSON
    Config {
        /// Use the platform config directory instead of `--config-dir`
        #[arg(long)]
        user: bool,
        /// Write the effective configuration back to the store
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    match args.cmd {
        Command::Chain {
            value,
            factor,
            partials,
            gap_ms,
        } => {
            let runtime = load_runtime(args.config_dir.as_deref())?;
            run_chain(&runtime, value, factor, partials, Duration::from_millis(gap_ms))
        }
        Command::Stress {
            chains,
            steps,
            work_ms,
            workers,
            seed,
        } => {
            let runtime = load_runtime(args.config_dir.as_deref())?;
            let scheduler = match workers {
                Some(n) => SchedulerConfig::fixed(n)
                    .with_thread_name_prefix(runtime.scheduler.thread_name_prefix.clone()),
                None => runtime.scheduler,
            };
            run_stress(scheduler, chains, steps, work_ms, seed)
        }
        Command::Config { user, save } => {
            let store = match (user, args.config_dir.as_deref()) {
                (true, _) => Some(FsConfigStore::new()?),
                (false, Some(dir)) => Some(FsConfigStore::at(dir)?),
                (false, None) => None,
            };
            show_config(store, save)
        }
    }
}

fn load_runtime(dir: Option<&Path>) -> Result<RuntimeConfig> {
    let Some(dir) = dir else {
        return Ok(RuntimeConfig::default());
    };
    let service = ConfigService::new(FsConfigStore::at(dir)?);
    service
        .load_runtime()
        .with_context(|| format!("load runtime config from {}", dir.display()))
}

fn show_config(store: Option<FsConfigStore>, save: bool) -> Result<()> {
    let config = match &store {
        Some(store) => {
            info!(dir = %store.base().display(), "reading runtime config");
            ConfigService::new(store.clone()).load_runtime()?
        }
        None => RuntimeConfig::default(),
    };
    if save {
        let Some(store) = store else {
            bail!("--save needs --config-dir or --user");
        };
        ConfigService::new(store.clone()).save_runtime(&config)?;
        info!(dir = %store.base().display(), "runtime config saved");
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn describe(result: &LoadResult<u64>) -> String {
    let kind = result.kind().to_string();
    match result.get() {
        Ok(value) => format!("{kind:<8} {value}"),
        Err(err) => format!("{kind:<8} {err}"),
    }
}

fn run_chain(runtime: &RuntimeConfig, value: u64, factor: u64, partials: u64, gap: Duration) -> Result<()> {
    let scheduler = FallbackScheduler::new(runtime.scheduler.clone())?;
    let feed = Feed::new(value, partials, gap);
    let loader = ChainLoader::with_delegate(
        Stage::new(factor, Duration::ZERO),
        Arc::new(feed),
        scheduler.clone(),
    );

    let (tx, rx) = mpsc::channel();
    let listener = loader.register_listener(Arc::new(move |_: LoaderId, r: &LoadResult<u64>| {
        let _ = tx.send(r.clone());
    }));
    loader.start_loading();
    let deadline = Instant::now() + RUN_TIMEOUT;
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        let result = rx
            .recv_timeout(wait)
            .context("chain did not complete in time")?;
        println!("async   {}", describe(&result));
        if result.kind().ends_cycle() {
            break;
        }
    }
    loader.unregister_listener(listener);

    let bridge = SyncBridge::from_config(Arc::new(InlineAffinity), &runtime.bridge);
    let first = bridge.get(&loader)?;
    println!("bridge  {}", describe(&first));

    if !scheduler.shutdown_and_wait(Duration::from_secs(5)) {
        warn!("scheduler workers still running at exit");
    }
    Ok(())
}

struct Line {
    loader: ChainLoader<Stage>,
    steps: u64,
    work_ms: u64,
    base: u64,
}

fn run_stress(config: SchedulerConfig, chains: u64, steps: u64, work_ms: u64, seed: u64) -> Result<()> {
    if chains == 0 || steps == 0 {
        bail!("--chains and --steps must be at least 1");
    }
    let scheduler = FallbackScheduler::new(config)?;
    info!(workers = scheduler.worker_count(), chains, steps, "stress run starting");

    let mut jitter = Jitter::new(seed);
    let (tx, rx) = mpsc::channel::<usize>();
    let mut lines = Vec::new();
    for index in 0..chains {
        let work_ms = jitter.around(work_ms);
        let base = index * 1_000;
        let loader = ChainLoader::with_delegate(
            Stage::new(1, Duration::from_millis(work_ms)),
            Arc::new(Feed::new(base, steps - 1, Duration::ZERO)),
            scheduler.clone(),
        );
        let done = tx.clone();
        let slot = lines.len();
        loader.register_listener(Arc::new(move |_: LoaderId, r: &LoadResult<u64>| {
            if r.kind().ends_cycle() {
                let _ = done.send(slot);
            }
        }));
        lines.push(Line {
            loader,
            steps,
            work_ms,
            base,
        });
    }

    let started = Instant::now();
    for line in &lines {
        line.loader.start_loading();
    }
    for _ in 0..lines.len() {
        rx.recv_timeout(RUN_TIMEOUT)
            .context("stress chains did not complete in time")?;
    }
    let elapsed = started.elapsed();
    if !scheduler.shutdown_and_wait(Duration::from_secs(5)) {
        warn!("scheduler workers still running at exit");
    }

    let mut table = Table::new();
    table.set_header(vec!["chain", "steps", "work ms", "in order"]);
    let mut all_ordered = true;
    let mut serial_ms = 0;
    for (index, line) in lines.iter().enumerate() {
        let expected: Vec<u64> = (line.base..line.base + line.steps).collect();
        let ordered = line.loader.source().seen() == expected;
        all_ordered &= ordered;
        serial_ms += line.work_ms * line.steps;
        table.add_row(vec![
            index.to_string(),
            line.steps.to_string(),
            line.work_ms.to_string(),
            if ordered { "yes" } else { "NO" }.to_string(),
        ]);
    }
    println!("{table}");
    println!("elapsed {} ms, serial {serial_ms} ms", elapsed.as_millis());
    if !all_ordered {
        bail!("per-chain ordering was violated");
    }
    println!("all chains in order");
    Ok(())
}
