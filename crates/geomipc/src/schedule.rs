//! Timer-driven poll tasks for hosts running a tokio runtime.
//!
//! Each side of the protocol is driven by its own fixed-interval task. There
//! is no cross-process wake-up: every tick takes the lock, looks at the block
//! and lets go.

use crate::errors::GeomIpcError;
use crate::receiver::{GeometryEngine, Receiver, ReceiverPoll};
use crate::sender::{JobResult, Sender, SenderPoll};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Shortest period a task ticks at.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A periodically fired task with explicit stop control.
///
/// Dropping the handle without calling [`PollTask::stop`] also ends the
/// task, at its next wake-up.
pub struct PollTask {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollTask {
    /// Run `tick` every `period`, first tick immediately.
    ///
    /// Ticks never overlap; a tick that overruns makes the missed ones be
    /// skipped rather than bunched up. A `period` below [`MIN_PERIOD`]
    /// (zero included) is raised to it.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = name, "Poll task stopped");
        });

        tracing::debug!(task = name, ?period, "Poll task started");
        Self {
            name,
            stop_tx,
            handle,
        }
    }

    /// Ask the task to stop and wait for the current tick to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "Poll task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Outcomes the sender task forwards to the host.
pub type SenderEvent = Result<JobResult, GeomIpcError>;

/// Poll for results of jobs submitted through `sender`.
///
/// Completed results and job failures are sent on `events`; pending and idle
/// ticks are not. The host keeps its clone of `sender` for submissions.
pub fn spawn_result_poller(
    sender: Arc<Mutex<Sender>>,
    period: Duration,
    events: mpsc::Sender<SenderEvent>,
) -> PollTask {
    PollTask::spawn("result_poller", period, move || {
        let sender = Arc::clone(&sender);
        let events = events.clone();
        async move {
            let outcome = {
                let mut sender = sender.lock().unwrap_or_else(PoisonError::into_inner);
                sender.poll_for_result()
            };

            let event = match outcome {
                Ok(SenderPoll::Completed(result)) => Ok(result),
                Ok(SenderPoll::Orphaned { seq, cmd }) => {
                    tracing::debug!(seq, cmd = ?cmd, "Orphaned block cleared");
                    return;
                }
                Ok(poll) => {
                    tracing::trace!(?poll, "Result poll");
                    return;
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Result poll will retry");
                    return;
                }
                Err(e) => Err(e),
            };

            if events.send(event).await.is_err() {
                tracing::debug!("Result listener gone");
            }
        }
    })
}

/// Poll for requests and run them through the receiver's engine.
///
/// Each tick runs on the blocking pool since the engine may do heavy file
/// I/O. `events`, if given, receives every tick that changed the block.
pub fn spawn_request_poller<E>(
    receiver: Receiver<E>,
    period: Duration,
    events: Option<mpsc::UnboundedSender<ReceiverPoll>>,
) -> PollTask
where
    E: GeometryEngine + Send + 'static,
{
    let receiver = Arc::new(Mutex::new(receiver));

    PollTask::spawn("request_poller", period, move || {
        let receiver = Arc::clone(&receiver);
        let events = events.clone();
        async move {
            let polled = tokio::task::spawn_blocking(move || {
                let mut receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                receiver.poll_for_request()
            })
            .await;

            let poll = match polled {
                Ok(Ok(poll)) => poll,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Request poll failed");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Request poll task panicked or was cancelled");
                    return;
                }
            };

            let changed = matches!(
                poll,
                ReceiverPoll::Completed { .. }
                    | ReceiverPoll::Failed { .. }
                    | ReceiverPoll::Superseded { .. }
            );
            if changed && let Some(events) = events {
                let _ = events.send(poll);
            }
        }
    })
}
