use crate::block::Command;
use crate::channel::Channel;
use crate::errors::GeomIpcError;
use crate::payload;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct SenderConfig {
    /// Give up on a job the receiver has not answered within this long.
    /// `None` waits forever.
    pub stale_after: Option<Duration>,
}

/// A result the receiver produced for one of our jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub seq: u32,
    pub result_path: PathBuf,
}

/// What a result poll observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderPoll {
    /// Block unusable this tick (foreign magic, version or command).
    NotReady,
    /// Nothing submitted by this sender is pending.
    Idle,
    Pending { seq: u32, cmd: Command },
    Completed(JobResult),
    /// A terminal block left by a previous sender instance was acknowledged.
    Orphaned { seq: u32, cmd: Command },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    seq: u32,
    submitted_at: Instant,
}

/// Sending half of the protocol.
///
/// Keeps at most one job in flight: [`Sender::submit`] refuses a new job
/// until the previous one's result or error has been consumed by
/// [`Sender::poll_for_result`] (or it went stale).
pub struct Sender {
    channel: Channel,
    config: SenderConfig,
    last_seq: u32,
    in_flight: Option<InFlight>,
}

impl Sender {
    pub fn new(channel: Channel, config: SenderConfig) -> Self {
        Self {
            channel,
            config,
            last_seq: 0,
            in_flight: None,
        }
    }

    /// Publish a job for `geom_path` and return its sequence number.
    ///
    /// The block is overwritten whatever state it is in; only this sender's
    /// own in-flight job blocks a submission.
    pub fn submit(&mut self, geom_path: &Path) -> Result<u32, GeomIpcError> {
        if let Some(job) = self.in_flight {
            return Err(GeomIpcError::JobInFlight { seq: job.seq });
        }

        let mut guard = self.channel.lock()?;
        let (mut block, previous) = guard.load()?;

        // Never reuse a number, even one issued by an earlier instance
        let seq = self
            .last_seq
            .max(block.seq_no)
            .checked_add(1)
            .ok_or(GeomIpcError::SequenceExhausted)?;

        block.set_geom_file_path(geom_path)?;
        block.clear_outcome();
        block.clear_claim();
        block.seq_no = seq;
        block.set_command(Command::SendRequested);
        guard.write(&block);
        drop(guard);

        self.last_seq = seq;
        self.in_flight = Some(InFlight {
            seq,
            submitted_at: Instant::now(),
        });

        if previous != Command::Idle {
            tracing::warn!(seq, previous = ?previous, "Submission overwrote a busy block");
        }
        tracing::info!(seq, path = %geom_path.display(), "Job submitted");

        Ok(seq)
    }

    /// One tick of the result poll.
    ///
    /// A `RESULT_READY` or `ERROR` block for the in-flight job is reset to
    /// `IDLE` in the same lock scope it is read in. The result file is
    /// checked afterwards, outside the lock.
    ///
    /// The `stale_after` deadline runs whatever occupies the block, so a job
    /// also expires while an incompatible peer holds the channel.
    pub fn poll_for_result(&mut self) -> Result<SenderPoll, GeomIpcError> {
        let mut guard = self.channel.lock()?;
        let (mut block, cmd) = match guard.load() {
            Ok(loaded) => loaded,
            Err(e @ GeomIpcError::ProtocolMismatch { .. }) => {
                drop(guard);
                if let Some(job) = self.in_flight
                    && let Some(elapsed) = overdue(&self.config, job)
                {
                    return Err(self.abandon(job, elapsed));
                }
                tracing::debug!(error = %e, "Channel not ready");
                return Ok(SenderPoll::NotReady);
            }
            Err(e) => return Err(e),
        };
        let seq = block.seq_no;

        let Some(job) = self.in_flight else {
            if cmd.is_terminal() {
                block.set_command(Command::Idle);
                guard.write(&block);
                drop(guard);
                tracing::warn!(seq, cmd = ?cmd, "Acknowledged orphaned job");
                return Ok(SenderPoll::Orphaned { seq, cmd });
            }
            return Ok(SenderPoll::Idle);
        };

        if cmd.is_terminal() && seq == job.seq {
            block.set_command(Command::Idle);
            guard.write(&block);
            drop(guard);
            self.in_flight = None;
            return self.consume(block.result_file_path(), block.error_msg(), seq, cmd);
        }

        if let Some(elapsed) = overdue(&self.config, job) {
            if seq == job.seq && matches!(cmd, Command::SendRequested | Command::Processing) {
                block.set_command(Command::Idle);
                guard.write(&block);
            }
            drop(guard);
            return Err(self.abandon(job, elapsed));
        }

        if seq != job.seq {
            tracing::debug!(seq = job.seq, block_seq = seq, cmd = ?cmd, "Block holds another job");
        }
        Ok(SenderPoll::Pending { seq: job.seq, cmd })
    }

    fn abandon(&mut self, job: InFlight, elapsed: Duration) -> GeomIpcError {
        self.in_flight = None;
        tracing::warn!(seq = job.seq, ?elapsed, "Job abandoned, no answer from processor");
        GeomIpcError::StaleJob {
            seq: job.seq,
            elapsed,
        }
    }

    fn consume(
        &self,
        result_path: PathBuf,
        message: String,
        seq: u32,
        cmd: Command,
    ) -> Result<SenderPoll, GeomIpcError> {
        if cmd == Command::Error {
            tracing::warn!(seq, message = %message, "Processor reported an error");
            return Err(GeomIpcError::PeerError { seq, message });
        }

        payload::verify_readable(&result_path)?;
        tracing::info!(seq, path = %result_path.display(), "Result received");
        Ok(SenderPoll::Completed(JobResult { seq, result_path }))
    }

    /// Sequence number of the job awaiting an answer, if any.
    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight.map(|job| job.seq)
    }
}

/// Time `job` has waited, once that exceeds the configured deadline.
fn overdue(config: &SenderConfig, job: InFlight) -> Option<Duration> {
    let limit = config.stale_after?;
    let elapsed = job.submitted_at.elapsed();
    (elapsed >= limit).then_some(elapsed)
}
