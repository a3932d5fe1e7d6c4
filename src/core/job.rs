//! Jobs and their lifecycle

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::core::destination::RemoteFile;
use crate::core::progress::Stage;
use crate::core::source::Source;
use crate::core::ticket::TicketId;

/// Sequential identifier assigned at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One unit of work: fetch `source`, store it for `owner`, report on `ticket`
#[derive(Debug, Clone)]
pub struct Job {
    pub source: Source,
    /// Identity whose storage session receives the upload
    pub owner: String,
    pub ticket: TicketId,
    /// Cancelling aborts the job wherever it is
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(source: Source, owner: impl Into<String>, ticket: TicketId) -> Self {
        Self {
            source,
            owner: owner.into(),
            ticket,
            cancel: CancellationToken::new(),
        }
    }
}

/// Lifecycle of a job; `Completed` and `Failed` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// What a successful job produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub file_name: String,
    pub size: u64,
    pub remote: RemoteFile,
}

/// Why a job failed, and in which stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// `None` for failures outside a transfer stage (session check, panics...)
    pub stage: Option<Stage>,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{} failed: {}", stage.noun(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub id: JobId,
    pub state: JobState,
    pub result: Result<Completion, JobFailure>,
}

impl JobOutcome {
    pub fn completed(id: JobId, completion: Completion) -> Self {
        Self {
            id,
            state: JobState::Completed,
            result: Ok(completion),
        }
    }

    pub fn failed(id: JobId, failure: JobFailure) -> Self {
        Self {
            id,
            state: JobState::Failed,
            result: Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
