//! tw-tune: run one experiment file to completion and print the trial summary.
//!
//! # Usage
//!
//! ```text
//! tw-tune --config experiment.json --step-interval-ms 10
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tw_executor::{TrainableRegistry, TrialExecutor};
use tw_tune::{BasicVariantGenerator, ExperimentConfig, TrialRunner};

#[derive(Parser)]
#[command(name = "tw-tune", about = "Run a Tunewell experiment")]
struct Cli {
    /// Experiment definition (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Override the bound on staged resource requests.
    #[arg(long)]
    max_pending_trials: Option<usize>,

    /// Pause between control steps, in milliseconds.
    #[arg(long, default_value = "0")]
    step_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let experiment = ExperimentConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let mut runner_config = experiment.runner.clone().apply_env()?;
    if let Some(n) = cli.max_pending_trials {
        if n == 0 {
            bail!("--max-pending-trials must be at least 1");
        }
        runner_config = runner_config.with_max_pending_trials(n);
    }

    let registry = TrainableRegistry::with_builtins();
    if !registry.contains(&experiment.trainable) {
        bail!("trainable '{}' is not registered", experiment.trainable);
    }

    let executor = TrialExecutor::local(
        &experiment.cluster,
        experiment.resource_manager,
        &runner_config,
        registry,
    )?;
    let mut search = match experiment.seed {
        Some(seed) => BasicVariantGenerator::with_seed(seed),
        None => BasicVariantGenerator::new(),
    };
    search.add_experiment(experiment.to_experiment()?)?;

    let mut runner = TrialRunner::new(executor)
        .with_search_alg(Box::new(search))
        .with_scheduler(experiment.scheduler.build());

    info!(
        experiment = %experiment.name,
        scheduler = runner.scheduler().name(),
        max_pending_trials = runner_config.max_pending_trials,
        "starting experiment"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(cli.step_interval_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !runner.is_finished() {
        if experiment
            .max_steps
            .is_some_and(|max| runner.iteration() >= max)
        {
            warn!(steps = runner.iteration(), "step limit reached");
            break;
        }
        tokio::select! {
            _ = interval.tick() => runner.step()?,
            _ = &mut ctrl_c => {
                warn!("interrupted, stopping remaining trials");
                break;
            }
        }
    }

    runner.cleanup();
    info!(steps = runner.iteration(), trials = runner.get_trials().len(), "experiment finished");
    println!("{}", serde_json::to_string_pretty(&runner.summary())?);
    Ok(())
}
