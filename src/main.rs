use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use autoapply::cli::{Cli, Command};
use autoapply::config::AutoApplyConfig;
use autoapply::orchestrator::RunContext;
use autoapply::scheduler::{RunSummary, Scheduler};
use autoapply::tracking::{JsonlTrackingSink, MemoryTrackingSink};
use autoapply::ui::RunProgress;

const REFRESH: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "autoapply=debug" } else { "autoapply=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Command::Run { platforms } => {
            let mut config = AutoApplyConfig::load(cli.config.as_deref())
                .context("failed to load configuration")?;
            apply_overrides(&mut config, cli.max_retries, &platforms)?;
            let ctx = RunContext::from_config(&config, CancellationToken::new())?;
            let (progress, summary) = execute(ctx).await;
            progress.finish(&summary);
            info!(path = %config.tracking.path, "outcomes appended");
        }
        Command::Demo => {
            let mut config = AutoApplyConfig::demo();
            apply_overrides(&mut config, cli.max_retries, &[])?;
            let mut ctx = RunContext::from_config(&config, CancellationToken::new())?;
            let sink = Arc::new(MemoryTrackingSink::new());
            ctx.sink = sink.clone();
            let (progress, summary) = execute(ctx).await;
            progress.print_records(&sink.records());
            progress.finish(&summary);
        }
        Command::Status { file } => status(cli.config.as_deref(), file).await?,
    }
    Ok(())
}

/// Flags of the command line take precedence over the file.
fn apply_overrides(
    config: &mut AutoApplyConfig,
    max_retries: Option<u32>,
    only: &[String],
) -> Result<()> {
    if let Some(max_retries) = max_retries {
        config.retry.max_retries = max_retries;
    }
    if !only.is_empty() {
        if let Some(unknown) = only.iter().find(|name| !config.platforms.contains_key(*name)) {
            bail!("unknown platform {unknown}");
        }
        for (name, platform) in config.platforms.iter_mut() {
            platform.enabled = platform.enabled && only.contains(name);
        }
    }
    config.validate()?;
    Ok(())
}

/// Run every platform until all of them go idle or Ctrl-C arrives.
async fn execute(ctx: RunContext) -> (RunProgress, RunSummary) {
    let cancel = ctx.cancel.clone();
    let scheduler = Scheduler::start(Arc::new(ctx));
    let handle = scheduler.handle();
    let progress = RunProgress::start("starting platform workers");

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight steps");
            interrupt.cancel();
        }
    });

    {
        let idle = scheduler.wait_idle();
        tokio::pin!(idle);
        let mut refresh = tokio::time::interval(REFRESH);
        loop {
            tokio::select! {
                _ = &mut idle => break,
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => progress.update(&handle.snapshots()),
            }
        }
    }

    let summary = scheduler.shutdown().await;
    (progress, summary)
}

async fn status(config: Option<&Path>, file: Option<PathBuf>) -> Result<()> {
    let path = match file {
        Some(path) => path,
        None => PathBuf::from(AutoApplyConfig::load(config)?.tracking.path),
    };
    let records = JsonlTrackingSink::read_all(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    RunProgress::start("reading outcomes").print_records(&records);
    Ok(())
}
