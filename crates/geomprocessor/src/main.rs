use anyhow::Context;
use common::setup_logging;
use geomipc::paths::CHANNEL_SIZE;
use geomipc::{Channel, Receiver, ReceiverConfig, ReceiverPoll, spawn_request_poller};
use geomprocessor::config::ProcessorConfig;
use geomprocessor::engine::Engine;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

const SHUTDOWN_CHECK: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct JobCounts {
    completed: u64,
    failed: u64,
    superseded: u64,
}

impl JobCounts {
    fn record(&mut self, poll: &ReceiverPoll) {
        match poll {
            ReceiverPoll::Completed { .. } => self.completed += 1,
            ReceiverPoll::Failed { .. } => self.failed += 1,
            ReceiverPoll::Superseded { .. } => self.superseded += 1,
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProcessorConfig::from_env()?;
    setup_logging(config.environment);

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    let engine = Engine::from_kind(&config.engine).context("Failed to set up geometry engine")?;
    tracing::info!(
        engine = engine.name(),
        channel = %config.channel.name,
        interval_ms = config.channel.poll_interval.as_millis() as u64,
        environment = config.environment.as_str(),
        "Geometry processor starting"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // Without the channel the processor stays up with the feature disabled
    let settings = &config.channel;
    let task = match Channel::open_in(&settings.shm_dir, &settings.name, CHANNEL_SIZE) {
        Ok(channel) => {
            tracing::info!(
                segment = %channel.path().display(),
                size = channel.size(),
                created = channel.created(),
                reclaim_after = ?config.reclaim_after,
                "Serving requests"
            );
            let receiver = Receiver::with_config(
                channel,
                engine,
                ReceiverConfig {
                    reclaim_after: config.reclaim_after,
                },
            );
            Some(spawn_request_poller(
                receiver,
                settings.poll_interval,
                Some(events_tx),
            ))
        }
        Err(e) => {
            tracing::error!(error = %e, "Shared channel unavailable, request handling disabled");
            None
        }
    };

    let mut counts = JobCounts::default();
    while !shutdown.load(Ordering::Relaxed) {
        tokio::select! {
            Some(event) = events_rx.recv() => counts.record(&event),
            _ = tokio::time::sleep(SHUTDOWN_CHECK) => {}
        }

        if let Some(task) = &task
            && task.is_finished()
        {
            anyhow::bail!("Request poller stopped unexpectedly");
        }
    }

    tracing::info!("Shutdown requested");
    if let Some(task) = task {
        task.stop().await;
    }
    while let Ok(event) = events_rx.try_recv() {
        counts.record(&event);
    }

    tracing::info!(
        completed = counts.completed,
        failed = counts.failed,
        superseded = counts.superseded,
        "Geometry processor stopped"
    );
    Ok(())
}
