// CLI commands for running scripts and exercising the bridge

use crate::config::WorkletsConfig;
use crate::context::WorkletsContext;
use crate::dispatch::DispatchStats;
use crate::engine::NativeEngineFactory;
use crate::worklet::{WorkletClosure, WorkletCode, WorkletValue};
use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate a script on the main runtime with the worklet API installed
    Run {
        /// Script to evaluate
        script: PathBuf,

        /// Config file (default: per-user config if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Exit after this many milliseconds without pending work
        #[arg(long, default_value = "200")]
        quiet_ms: u64,
    },

    /// Stress shared value increments from native worklets on N runtimes
    Bench {
        /// Number of worker runtimes
        #[arg(short, long, default_value = "4")]
        runtimes: usize,

        /// Total number of increments
        #[arg(short, long, default_value = "10000")]
        tasks: usize,

        /// Config file (default: per-user config if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Config file (default: per-user config if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Outcome of a `bench` run
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub runtimes: usize,
    pub tasks: usize,
    pub final_value: f64,
    pub elapsed_ms: u128,
    pub stats: DispatchStats,
}

impl Commands {
    /// Execute the command
    pub fn run(self) -> Result<()> {
        match self {
            Commands::Run {
                script,
                config,
                quiet_ms,
            } => Self::run_cmd(&script, config.as_deref(), Duration::from_millis(quiet_ms)),
            Commands::Bench {
                runtimes,
                tasks,
                config,
            } => {
                let config = WorkletsConfig::load_or_default(config.as_deref())?;
                let report = bench(config, runtimes, tasks)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Commands::Config { config } => {
                let config = WorkletsConfig::load_or_default(config.as_deref())?;
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
        }
    }

    #[cfg(feature = "js-runtime")]
    fn run_cmd(script: &Path, config: Option<&Path>, quiet: Duration) -> Result<()> {
        use crate::engine::{QuickJsEngine, QuickJsEngineFactory};
        use crate::invoker::HostEventLoop;
        use anyhow::Context as _;

        let config = WorkletsConfig::load_or_default(config)?;
        let source = std::fs::read_to_string(script)
            .with_context(|| format!("failed to read {}", script.display()))?;

        let host = HostEventLoop::new();
        let context = WorkletsContext::new(config.clone(), Arc::new(QuickJsEngineFactory));
        let engine = QuickJsEngine::new(&config.runtime)?;
        let main = context.install_main(Box::new(engine), Arc::new(host.invoker()))?;

        let mut pending =
            context
                .dispatcher()
                .evaluate(&main, source, script.display().to_string());
        let handled = host.run_until_quiet(quiet);
        let result = pending.try_take();

        let cancelled = context.teardown();
        host.run_until_idle();
        tracing::info!(handled, cancelled, "script finished");

        match result {
            Some(Ok(value)) => {
                if !value.is_undefined() {
                    println!("{value}");
                }
                Ok(())
            }
            Some(Err(err)) => Err(err.into()),
            None => bail!("{} did not finish evaluating", script.display()),
        }
    }

    #[cfg(not(feature = "js-runtime"))]
    fn run_cmd(script: &Path, _config: Option<&Path>, _quiet: Duration) -> Result<()> {
        bail!(
            "cannot run {}: built without the js-runtime feature",
            script.display()
        )
    }
}

/// Increment one shared value `tasks` times from native worklets spread
/// round-robin over `runtimes` worker runtimes
pub fn bench(config: WorkletsConfig, runtimes: usize, tasks: usize) -> Result<BenchReport> {
    if runtimes == 0 {
        bail!("bench needs at least one runtime");
    }

    let context = WorkletsContext::new(config, Arc::new(NativeEngineFactory));
    let counter = context.create_shared_value(0);
    let increment = WorkletClosure::capture(
        "increment",
        WorkletCode::native(|scope, _args| {
            let counter = scope.shared("counter")?;
            let version =
                counter.update(|value| WorkletValue::from(value.as_f64().unwrap_or(0.0) + 1.0));
            Ok(WorkletValue::from(version as f64))
        }),
        [("counter", counter.clone())],
    )?;

    let workers = (0..runtimes)
        .map(|index| context.create_runtime(&format!("bench-{index}")))
        .collect::<Result<Vec<_>, _>>()?;

    let started = Instant::now();
    let pending: Vec<_> = (0..tasks)
        .map(|index| {
            context
                .dispatcher()
                .run_async(increment.clone(), &workers[index % runtimes], Vec::new())
        })
        .collect();
    for result in pending {
        result.wait()?;
    }
    let elapsed = started.elapsed();

    let report = BenchReport {
        runtimes,
        tasks,
        final_value: counter.get().as_f64().unwrap_or(0.0),
        elapsed_ms: elapsed.as_millis(),
        stats: context.dispatcher().stats(),
    };
    context.teardown();
    Ok(report)
}
