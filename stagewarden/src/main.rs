mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use stagewarden::events::JsonLinesReporter;
use stagewarden::observability::init_tracing;
use stagewarden::pipeline::PipelineSupervisor;
use stagewarden::plan::PipelinePlan;
use stagewarden::PipelineReport;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose, cli.log_json) {
        eprintln!("warning: {e}");
    }

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            plan,
            timeout_secs,
            report,
            events,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_plan(&plan, timeout_secs, report.as_deref(), events))
        }
        Commands::Validate { plan } => validate_plan(&plan),
    }
}

async fn run_plan(
    path: &Path,
    timeout_secs: Option<u64>,
    report_path: Option<&Path>,
    events: bool,
) -> Result<ExitCode> {
    let plan = PipelinePlan::from_path(path)
        .with_context(|| format!("Failed to load plan {}", path.display()))?;

    let timeout = match timeout_secs {
        Some(0) => bail!("--timeout-secs must be positive"),
        Some(secs) => Duration::from_secs(secs),
        None => plan.timeout(),
    };

    // Stage transitions are already logged by the supervisor itself.
    let mut supervisor = PipelineSupervisor::new(plan.supervisor_config());
    if events {
        supervisor = supervisor.with_reporter(Arc::new(JsonLinesReporter::stdout()));
    }
    if let Some(worker) = plan.worker() {
        supervisor = supervisor.with_worker(worker);
    }

    let cancel = supervisor.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel("interrupted by Ctrl-C");
        }
    });

    tracing::info!(
        pipeline = %plan.name,
        stages = plan.stages.len(),
        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        "Starting pipeline"
    );
    let stages = plan.stages();
    let report = supervisor.run(&stages, timeout).await;
    interrupt.abort();

    if let Some(out) = report_path {
        write_report(&report, out)?;
    }

    // Keep stdout clean for the event stream.
    if events {
        eprintln!("{}", report.summary());
    } else {
        println!("{}", report.summary());
    }

    Ok(exit_code(&report))
}

fn write_report(report: &PipelineReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    tracing::info!(path = %path.display(), "Report written");
    Ok(())
}

fn validate_plan(path: &Path) -> Result<ExitCode> {
    let plan = PipelinePlan::from_path(path)
        .with_context(|| format!("Invalid plan {}", path.display()))?;

    println!(
        "Plan '{}' is valid: {} stage(s), timeout {}ms",
        plan.name,
        plan.stages.len(),
        plan.timeout_ms
    );
    if let Some(worker) = &plan.worker {
        println!("  worker: {} ({})", worker.name, worker.command);
    }
    for stage in &plan.stages {
        println!(
            "  - {} [{}ms, {} attempt(s){}{}]: {}",
            stage.name,
            stage.timeout_ms,
            stage.max_attempts,
            if stage.critical { "" } else { ", non-critical" },
            if stage.requires_worker { ", needs worker" } else { "" },
            stage.command
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(report: &PipelineReport) -> ExitCode {
    u8::try_from(report.exit_code()).map_or(ExitCode::FAILURE, ExitCode::from)
}
