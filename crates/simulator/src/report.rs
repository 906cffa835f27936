use geomipc::{GeomIpcError, JobResult, Presence};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    /// The processor reported a failure.
    Failed,
    /// Result announced but the file could not be read here.
    ResultMissing,
    Stale,
    ProcessorNotRunning,
    ChannelUnavailable,
    /// The submission itself was refused.
    Rejected,
    /// Interrupted before the result arrived; the job may still complete.
    Interrupted,
}

/// Outcome of one `simtool` run, printed as text or JSON.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub status: JobStatus,
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub processor: Presence,
}

impl JobReport {
    pub fn new(status: JobStatus, source: PathBuf, processor: Presence) -> Self {
        Self {
            status,
            source,
            submitted: None,
            seq: None,
            result_path: None,
            message: None,
            processor,
        }
    }

    pub fn submitted(mut self, path: PathBuf, seq: Option<u32>) -> Self {
        self.submitted = Some(path);
        self.seq = seq;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn completed(mut self, result: JobResult) -> Self {
        self.status = JobStatus::Completed;
        self.seq = Some(result.seq);
        self.result_path = Some(result.result_path);
        self
    }

    /// Fold a job failure into the report.
    pub fn failed(mut self, err: &GeomIpcError) -> Self {
        self.status = match err {
            GeomIpcError::PeerError { seq, message } => {
                self.seq = Some(*seq);
                self.message = Some(message.clone());
                JobStatus::Failed
            }
            GeomIpcError::PayloadMissing { path, .. } => {
                self.result_path = Some(path.clone());
                JobStatus::ResultMissing
            }
            GeomIpcError::StaleJob { seq, .. } => {
                self.seq = Some(*seq);
                JobStatus::Stale
            }
            GeomIpcError::ChannelUnavailable { .. } => JobStatus::ChannelUnavailable,
            _ => JobStatus::Rejected,
        };
        if self.message.is_none() {
            self.message = Some(err.to_string());
        }
        self
    }

    /// Process exit status for this outcome.
    pub fn exit_status(&self) -> u8 {
        match self.status {
            JobStatus::Completed => 0,
            JobStatus::ProcessorNotRunning | JobStatus::ChannelUnavailable => 2,
            JobStatus::Interrupted => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let job = self.seq.map(|s| format!(" #{s}")).unwrap_or_default();
        match self.status {
            JobStatus::Completed => {
                write!(f, "Geometry job{job} completed")?;
                if let Some(path) = &self.result_path {
                    write!(f, ": result at {}", path.display())?;
                }
            }
            JobStatus::Failed => write!(f, "Geometry processing failed")?,
            JobStatus::ResultMissing => write!(f, "Result file could not be read")?,
            JobStatus::Stale => write!(f, "Geometry job{job} abandoned, no answer from processor")?,
            JobStatus::ProcessorNotRunning => write!(
                f,
                "Geometry processor is not running; start it and submit {} again",
                self.source.display()
            )?,
            JobStatus::ChannelUnavailable => write!(f, "Shared channel unavailable")?,
            JobStatus::Rejected => write!(f, "Submission refused")?,
            JobStatus::Interrupted => write!(f, "Interrupted while waiting for job{job}")?,
        }
        if self.status != JobStatus::Completed
            && let Some(message) = &self.message
        {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}
