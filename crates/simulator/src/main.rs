use anyhow::Context;
use clap::Parser;
use common::setup_logging;
use geomipc::paths::CHANNEL_SIZE;
use geomipc::{Channel, Presence, Sender, SenderConfig, presence, spawn_result_poller};
use simulator::cli::Cli;
use simulator::config::SimulatorConfig;
use simulator::report::{JobReport, JobStatus};
use simulator::staging;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = SimulatorConfig::from_env()?.with_stale_after_secs(cli.stale_after_secs);
    setup_logging(config.environment);

    let source = std::path::absolute(&cli.file)
        .with_context(|| format!("Invalid path {}", cli.file.display()))?;
    if !source.is_file() {
        anyhow::bail!("File not found: {}", source.display());
    }

    let report = run(&config, &source, cli.skip_presence_check).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(ExitCode::from(report.exit_status()))
}

async fn run(config: &SimulatorConfig, source: &Path, skip_presence_check: bool) -> JobReport {
    let processor = if skip_presence_check {
        Presence::Unknown
    } else {
        presence::probe(&config.processor_name)
    };
    let report = JobReport::new(JobStatus::Interrupted, source.to_path_buf(), processor);

    match processor {
        Presence::NotRunning => {
            tracing::warn!(process = %config.processor_name, "Geometry processor not found");
            return JobReport {
                status: JobStatus::ProcessorNotRunning,
                ..report
            };
        }
        Presence::Unknown if !skip_presence_check => {
            tracing::warn!("Cannot tell whether the geometry processor runs, submitting anyway");
        }
        _ => {}
    }

    let settings = &config.channel;
    let channel = match Channel::open_in(&settings.shm_dir, &settings.name, CHANNEL_SIZE) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(error = %e, "Shared channel unavailable");
            return report.failed(&e);
        }
    };

    let exe_dir = staging::exe_dir().unwrap_or_else(|_| Path::new(".").to_path_buf());
    let submitted = staging::stage_or_original(source, config.handoff_dir.as_deref(), &exe_dir);

    let mut sender = Sender::new(
        channel,
        SenderConfig {
            stale_after: config.stale_after,
        },
    );
    let seq = match sender.submit(&submitted) {
        Ok(seq) => seq,
        Err(e) => return report.submitted(submitted, None).failed(&e),
    };
    let report = report.submitted(submitted, Some(seq));

    let sender = Arc::new(Mutex::new(sender));
    let (events_tx, mut events_rx) = mpsc::channel(1);
    let task = spawn_result_poller(Arc::clone(&sender), settings.poll_interval, events_tx);

    let report = tokio::select! {
        event = events_rx.recv() => match event {
            Some(Ok(result)) => report.completed(result),
            Some(Err(e)) => report.failed(&e),
            None => report.message("result poller stopped"),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(seq, "Interrupted, the job stays queued for the processor");
            report
        }
    };

    task.stop().await;
    let in_flight = sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .in_flight();
    tracing::debug!(seq, ?in_flight, "Result poller stopped");

    report
}
