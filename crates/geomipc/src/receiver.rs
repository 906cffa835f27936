use crate::block::{self, Command, CommandBlock};
use crate::channel::Channel;
use crate::errors::GeomIpcError;
use crate::payload;
use crate::presence::{self, Presence};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// External geometry processing invoked for each request.
///
/// Runs outside the channel lock, so it may take as long as it needs.
pub trait GeometryEngine {
    /// Load, check and transform the geometry at `input`, write the result
    /// to a file and return that file's path.
    fn process(&mut self, input: &Path) -> anyhow::Result<PathBuf>;
}

impl<F> GeometryEngine for F
where
    F: FnMut(&Path) -> anyhow::Result<PathBuf>,
{
    fn process(&mut self, input: &Path) -> anyhow::Result<PathBuf> {
        self(input)
    }
}

/// What a request poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverPoll {
    /// Block unusable this tick (foreign magic, version or command).
    NotReady,
    Idle,
    /// Nothing for us: waiting for the sender to acknowledge, or the job is
    /// already being handled.
    Waiting { seq: u32, cmd: Command },
    Completed { seq: u32, result_path: PathBuf },
    Failed { seq: u32, message: String },
    /// The sender replaced the job while it was being processed; the outcome
    /// was dropped.
    Superseded { seq: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct ReceiverConfig {
    /// Take over a job another live receiver has held this long. `None`
    /// only takes over jobs whose claiming process has exited.
    pub reclaim_after: Option<Duration>,
}

enum Taken {
    Job { seq: u32, input: PathBuf },
    Nothing(ReceiverPoll),
}

/// Receiving half of the protocol.
pub struct Receiver<E> {
    channel: Channel,
    engine: E,
    config: ReceiverConfig,
    pid: u32,
    last_taken: Option<u32>,
}

impl<E: GeometryEngine> Receiver<E> {
    pub fn new(channel: Channel, engine: E) -> Self {
        Self::with_config(channel, engine, ReceiverConfig::default())
    }

    pub fn with_config(channel: Channel, engine: E, config: ReceiverConfig) -> Self {
        Self {
            channel,
            engine,
            config,
            pid: std::process::id(),
            last_taken: None,
        }
    }

    /// One tick of the request poll.
    ///
    /// Picks up a `SEND_REQUESTED` block (or a `PROCESSING` one whose owner
    /// is gone), stamps our claim on it as `PROCESSING`, runs the engine
    /// without holding the lock, then writes `RESULT_READY` or `ERROR` back
    /// if the block still carries the same job.
    pub fn poll_for_request(&mut self) -> Result<ReceiverPoll, GeomIpcError> {
        let (seq, input) = match self.take_request()? {
            Taken::Job { seq, input } => (seq, input),
            Taken::Nothing(poll) => return Ok(poll),
        };

        let outcome = self.run_engine(&input);

        let mut guard = self.channel.lock()?;
        let (mut block, cmd) = match guard.load() {
            Ok(loaded) => loaded,
            Err(e @ GeomIpcError::ProtocolMismatch { .. }) => {
                tracing::warn!(seq, error = %e, "Channel replaced while processing");
                return Ok(ReceiverPoll::Superseded { seq });
            }
            Err(e) => return Err(e),
        };

        if block.seq_no != seq || cmd != Command::Processing {
            drop(guard);
            tracing::warn!(seq, block_seq = block.seq_no, cmd = ?cmd, "Job superseded, dropping outcome");
            return Ok(ReceiverPoll::Superseded { seq });
        }

        block.clear_claim();
        let poll = match outcome {
            Ok(result_path) => {
                block.clear_outcome();
                block.set_result_file_path(&result_path)?;
                block.set_command(Command::ResultReady);
                ReceiverPoll::Completed { seq, result_path }
            }
            Err(message) => {
                block.clear_outcome();
                if block.set_error_msg(&message) {
                    tracing::debug!(seq, "Error message truncated to fit the block");
                }
                block.set_command(Command::Error);
                ReceiverPoll::Failed { seq, message }
            }
        };
        guard.write(&block);
        drop(guard);

        match &poll {
            ReceiverPoll::Completed { result_path, .. } => {
                tracing::info!(seq, path = %result_path.display(), "Result published")
            }
            ReceiverPoll::Failed { message, .. } => {
                tracing::warn!(seq, message = %message, "Failure published")
            }
            _ => {}
        }
        Ok(poll)
    }

    /// Claim a pending job under the lock, or report why there is none.
    fn take_request(&mut self) -> Result<Taken, GeomIpcError> {
        let mut guard = self.channel.lock()?;
        let (mut block, cmd) = match guard.load() {
            Ok(loaded) => loaded,
            Err(e @ GeomIpcError::ProtocolMismatch { .. }) => {
                tracing::debug!(error = %e, "Channel not ready");
                return Ok(Taken::Nothing(ReceiverPoll::NotReady));
            }
            Err(e) => return Err(e),
        };

        let seq = block.seq_no;
        match cmd {
            Command::SendRequested => {}
            Command::Processing if self.last_taken != Some(seq) => {
                let Some(reason) = abandoned(&block, self.pid, &self.config) else {
                    return Ok(Taken::Nothing(ReceiverPoll::Waiting { seq, cmd }));
                };
                tracing::warn!(seq, owner = block.claim_pid, reason, "Reclaiming abandoned job");
            }
            Command::Idle => return Ok(Taken::Nothing(ReceiverPoll::Idle)),
            _ => return Ok(Taken::Nothing(ReceiverPoll::Waiting { seq, cmd })),
        }

        block.set_command(Command::Processing);
        block.stamp_claim(self.pid, SystemTime::now());
        guard.write(&block);
        drop(guard);

        self.last_taken = Some(seq);
        let input = block.geom_file_path();
        tracing::info!(seq, path = %input.display(), "Request taken");
        Ok(Taken::Job { seq, input })
    }

    /// Input check, engine call and output check, flattened to the message
    /// the sender will see on failure.
    fn run_engine(&mut self, input: &Path) -> Result<PathBuf, String> {
        if let Err(e) = payload::verify_readable(input) {
            return Err(payload::describe_missing(input, &e));
        }

        let result_path = self.engine.process(input).map_err(|e| format!("{e:#}"))?;

        if let Err(e) = payload::verify_readable(&result_path) {
            return Err(format!(
                "engine produced no readable result: {}",
                payload::describe_missing(&result_path, &e)
            ));
        }
        block::check_path_fits("resultFilePath", &result_path).map_err(|e| e.to_string())?;
        Ok(result_path)
    }
}

/// Why a `PROCESSING` block we did not take is up for grabs, if it is.
///
/// A block without a claim stamp belongs to a peer that does not stamp; it
/// is never taken over.
fn abandoned(block: &CommandBlock, own_pid: u32, config: &ReceiverConfig) -> Option<&'static str> {
    let claim = block.claim()?;
    if claim.pid != own_pid && presence::pid_status(claim.pid) == Presence::NotRunning {
        return Some("owner exited");
    }
    let limit = config.reclaim_after?;
    // A claim stamped in the future is not old
    let age = SystemTime::now().duration_since(claim.at).ok()?;
    (age >= limit).then_some("claim expired")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    // Above PID_MAX_LIMIT, so no process can have it
    const EXITED_PID: u32 = i32::MAX as u32;

    fn copy_engine(input: &Path) -> anyhow::Result<PathBuf> {
        let output = input.with_extension("out.stp");
        std::fs::copy(input, &output)?;
        Ok(output)
    }

    fn setup<E: GeometryEngine>(engine: E) -> (TempDir, Receiver<E>, Channel) {
        let dir = tempdir().unwrap();
        let receiver_side = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let peer_side = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        (dir, Receiver::new(receiver_side, engine), peer_side)
    }

    fn request(peer: &mut Channel, seq: u32, path: &Path) {
        let mut guard = peer.lock().unwrap();
        let mut block = guard.read();
        block.seq_no = seq;
        block.set_geom_file_path(path).unwrap();
        block.set_command(Command::SendRequested);
        guard.write(&block);
    }

    #[test]
    fn test_idle_block_is_left_alone() {
        let (_dir, mut receiver, mut peer) = setup(copy_engine);
        assert_eq!(receiver.poll_for_request().unwrap(), ReceiverPoll::Idle);
        assert_eq!(peer.snapshot().unwrap().command(), Some(Command::Idle));
    }

    #[test]
    fn test_request_produces_result() {
        let (dir, mut receiver, mut peer) = setup(copy_engine);
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"ISO-10303-21;").unwrap();
        request(&mut peer, 3, &input);

        let poll = receiver.poll_for_request().unwrap();
        let expected = dir.path().join("in.out.stp");
        assert_eq!(
            poll,
            ReceiverPoll::Completed {
                seq: 3,
                result_path: expected.clone()
            }
        );

        let block = peer.snapshot().unwrap();
        assert_eq!(block.command(), Some(Command::ResultReady));
        assert_eq!(block.result_file_path(), expected);
        assert_eq!(block.seq_no, 3);
    }

    #[test]
    fn test_missing_input_reports_error() {
        let (dir, mut receiver, mut peer) = setup(copy_engine);
        let input = dir.path().join("x.step");
        request(&mut peer, 1, &input);

        let poll = receiver.poll_for_request().unwrap();
        let message = format!("file not found: {}", input.display());
        assert_eq!(
            poll,
            ReceiverPoll::Failed {
                seq: 1,
                message: message.clone()
            }
        );

        let block = peer.snapshot().unwrap();
        assert_eq!(block.command(), Some(Command::Error));
        assert_eq!(block.error_msg(), message);
    }

    #[test]
    fn test_engine_failure_is_reported_with_context() {
        let failing = |_: &Path| -> anyhow::Result<PathBuf> {
            Err(anyhow::anyhow!("no solids found").context("STEP transfer failed"))
        };
        let (dir, mut receiver, mut peer) = setup(failing);
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"ISO-10303-21;").unwrap();
        request(&mut peer, 1, &input);

        receiver.poll_for_request().unwrap();
        let block = peer.snapshot().unwrap();
        assert_eq!(block.command(), Some(Command::Error));
        assert_eq!(block.error_msg(), "STEP transfer failed: no solids found");
    }

    #[test]
    fn test_result_ready_waits_for_acknowledgment() {
        let (dir, mut receiver, mut peer) = setup(copy_engine);
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"data").unwrap();
        request(&mut peer, 1, &input);
        receiver.poll_for_request().unwrap();

        assert_eq!(
            receiver.poll_for_request().unwrap(),
            ReceiverPoll::Waiting {
                seq: 1,
                cmd: Command::ResultReady
            }
        );
    }

    fn claimed(peer: &mut Channel, pid: u32, at: SystemTime) {
        let mut guard = peer.lock().unwrap();
        let mut block = guard.read();
        block.set_command(Command::Processing);
        block.stamp_claim(pid, at);
        guard.write(&block);
    }

    #[test]
    fn test_taken_request_carries_claim() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"data").unwrap();
        let mut peer = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let mut observer = Channel::open_in(dir.path(), "chan", 2048).unwrap();

        let engine = move |path: &Path| -> anyhow::Result<PathBuf> {
            let claim = observer.snapshot()?.claim().expect("claim stamped");
            assert_eq!(claim.pid, std::process::id());
            copy_engine(path)
        };
        let channel = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let mut receiver = Receiver::new(channel, engine);

        request(&mut peer, 1, &input);
        assert!(matches!(
            receiver.poll_for_request().unwrap(),
            ReceiverPoll::Completed { seq: 1, .. }
        ));
        assert_eq!(peer.snapshot().unwrap().claim(), None);
    }

    #[test]
    fn test_job_of_exited_receiver_is_reclaimed() {
        let (dir, mut receiver, mut peer) = setup(copy_engine);
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"data").unwrap();
        request(&mut peer, 8, &input);
        claimed(&mut peer, EXITED_PID, SystemTime::now());

        assert!(matches!(
            receiver.poll_for_request().unwrap(),
            ReceiverPoll::Completed { seq: 8, .. }
        ));
    }

    #[test]
    fn test_unclaimed_processing_block_is_left_to_its_owner() {
        let (dir, mut receiver, mut peer) = setup(copy_engine);
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"data").unwrap();
        request(&mut peer, 8, &input);
        {
            let mut guard = peer.lock().unwrap();
            let mut block = guard.read();
            block.set_command(Command::Processing);
            guard.write(&block);
        }

        assert_eq!(
            receiver.poll_for_request().unwrap(),
            ReceiverPoll::Waiting {
                seq: 8,
                cmd: Command::Processing
            }
        );
    }

    #[test]
    fn test_second_receiver_waits_for_live_owner() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"data").unwrap();
        let mut peer = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&runs);
        let mut second = Receiver::new(
            Channel::open_in(dir.path(), "chan", 2048).unwrap(),
            move |path: &Path| {
                counted.fetch_add(1, Ordering::SeqCst);
                copy_engine(path)
            },
        );

        // The first receiver's engine lets the second one poll mid-job
        let counted = Arc::clone(&runs);
        let mut seen_by_second = None;
        let seen = &mut seen_by_second;
        let engine = move |path: &Path| -> anyhow::Result<PathBuf> {
            counted.fetch_add(1, Ordering::SeqCst);
            *seen = Some(second.poll_for_request()?);
            copy_engine(path)
        };
        let mut first = Receiver::new(Channel::open_in(dir.path(), "chan", 2048).unwrap(), engine);

        request(&mut peer, 1, &input);
        assert!(matches!(
            first.poll_for_request().unwrap(),
            ReceiverPoll::Completed { seq: 1, .. }
        ));
        drop(first);

        assert_eq!(
            seen_by_second,
            Some(ReceiverPoll::Waiting {
                seq: 1,
                cmd: Command::Processing
            })
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1, "engine must run once per job");
        assert_eq!(
            peer.snapshot().unwrap().command(),
            Some(Command::ResultReady)
        );
    }

    #[test]
    fn test_expired_claim_is_reclaimed() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"data").unwrap();
        let mut peer = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let channel = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let mut receiver = Receiver::with_config(
            channel,
            copy_engine,
            ReceiverConfig {
                reclaim_after: Some(Duration::from_secs(60)),
            },
        );

        // Held by a live process, but for longer than the deadline
        request(&mut peer, 4, &input);
        claimed(&mut peer, std::process::id(), SystemTime::now() - Duration::from_secs(120));
        assert!(matches!(
            receiver.poll_for_request().unwrap(),
            ReceiverPoll::Completed { seq: 4, .. }
        ));

        // A fresh claim is respected
        request(&mut peer, 5, &input);
        claimed(&mut peer, std::process::id(), SystemTime::now());
        assert_eq!(
            receiver.poll_for_request().unwrap(),
            ReceiverPoll::Waiting {
                seq: 5,
                cmd: Command::Processing
            }
        );
    }

    #[test]
    fn test_superseded_job_outcome_is_dropped() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.stp");
        std::fs::write(&input, b"data").unwrap();
        let mut peer = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let mut meddler = Channel::open_in(dir.path(), "chan", 2048).unwrap();

        // The engine itself plays a sender that overwrites the block mid-job
        let engine = move |path: &Path| -> anyhow::Result<PathBuf> {
            let mut guard = meddler.lock()?;
            let mut block = guard.read();
            block.seq_no += 1;
            block.set_command(Command::SendRequested);
            guard.write(&block);
            Ok(path.to_path_buf())
        };
        let channel = Channel::open_in(dir.path(), "chan", 2048).unwrap();
        let mut receiver = Receiver::new(channel, engine);

        request(&mut peer, 1, &input);
        assert_eq!(
            receiver.poll_for_request().unwrap(),
            ReceiverPoll::Superseded { seq: 1 }
        );

        let block = peer.snapshot().unwrap();
        assert_eq!(block.seq_no, 2);
        assert_eq!(block.command(), Some(Command::SendRequested));
    }

    #[test]
    fn test_foreign_block_is_not_ready() {
        let (_dir, mut receiver, mut peer) = setup(copy_engine);
        {
            let mut guard = peer.lock().unwrap();
            let mut block = CommandBlock::new();
            block.version = 7;
            block.set_command(Command::SendRequested);
            guard.write(&block);
        }
        assert_eq!(receiver.poll_for_request().unwrap(), ReceiverPoll::NotReady);
        assert_eq!(peer.snapshot().unwrap().command(), None);
    }
}
