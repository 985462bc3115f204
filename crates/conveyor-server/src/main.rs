//! Conveyor CI scheduler server entrypoint.

use anyhow::Context;
use clap::Parser;
use conveyor_core::pipeline::PipelineSpec;
use conveyor_scheduler::{QueueInfo, Scheduler, TracingStatusSink, parse_labels};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod logging;

use config::{LogFormat, ServerConfig};

#[derive(Parser)]
#[command(name = "conveyor-server")]
#[command(author, version, about = "Conveyor CI scheduler server", long_about = None)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CONVEYOR_LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, env = "CONVEYOR_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    #[arg(long, env = "CONVEYOR_LEASE_DURATION_MS")]
    lease_duration_ms: Option<u64>,

    #[arg(long, env = "CONVEYOR_MAX_REQUEUES")]
    max_requeues: Option<u32>,

    /// Label applied to workflows that declare none, as KEY=VALUE. Repeatable.
    #[arg(long = "default-label", value_name = "KEY=VALUE")]
    default_labels: Vec<String>,

    /// Pipeline spec (YAML) to submit at startup. Repeatable.
    #[arg(long, value_name = "FILE")]
    submit: Vec<PathBuf>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Some(ms) = self.lease_duration_ms {
            config.scheduler.lease_duration_ms = ms;
        }
        if let Some(max) = self.max_requeues {
            config.scheduler.max_requeues = max;
        }
        if !self.default_labels.is_empty() {
            config.scheduler.default_labels = parse_labels(&self.default_labels)?;
        }

        config.scheduler.validate()?;
        anyhow::ensure!(config.info_interval_ms > 0, "info_interval_ms must be positive");
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    logging::init(&config.log)?;

    let scheduler = Scheduler::new(config.scheduler.clone(), Arc::new(TracingStatusSink))?;
    let shutdown = CancellationToken::new();

    let sweeper = scheduler.lease_manager().spawn(shutdown.clone());
    let reporter = tokio::spawn(log_queue_info(
        scheduler.clone(),
        config.info_interval(),
        shutdown.clone(),
    ));

    for path in &cli.submit {
        submit_file(&scheduler, path)?;
    }

    info!(
        lease_duration_ms = config.scheduler.lease_duration_ms,
        sweep_interval_ms = config.scheduler.sweep_interval_ms,
        max_requeues = config.scheduler.max_requeues,
        "Conveyor scheduler started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    shutdown.cancel();
    sweeper.await?;
    reporter.await?;

    Ok(())
}

fn submit_file(scheduler: &Scheduler, path: &Path) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline {}", path.display()))?;
    let spec: PipelineSpec = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing pipeline {}", path.display()))?;
    let pipeline_id = spec.id;

    scheduler
        .submit_pipeline(spec)
        .with_context(|| format!("submitting pipeline {pipeline_id}"))?;
    Ok(())
}

/// Log queue counts whenever they change.
async fn log_queue_info(scheduler: Scheduler, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last: Option<QueueInfo> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match scheduler.info() {
                    Ok(queue) if last.as_ref() != Some(&queue) => {
                        info!(
                            pending = queue.pending,
                            waiting = queue.waiting_on_dependency,
                            running = queue.running,
                            agents = queue.agents,
                            paused = queue.paused,
                            "Queue info"
                        );
                        last = Some(queue);
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to read queue info"),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
