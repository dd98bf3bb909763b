use crate::config::types::EvalError;
use crate::core::submission::{Submission, SubmissionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Timing and identity of one isolated run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub submission_id: SubmissionId,
    /// Name of the run's working directory
    pub run_id: String,
    /// When the submission was built, before any time spent pending
    pub submitted_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The run ended because a hook observed cancellation
    pub aborted: bool,
}

impl RunReport {
    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Time between submission and the start of its run
    pub fn queued_ms(&self) -> i64 {
        (self.started_at - self.submitted_at).num_milliseconds()
    }
}

/// A submission whose run finished, possibly cut short by cancellation.
///
/// Consumers check [`Submission::is_canceled`] before trusting the trace.
#[derive(Clone, Debug)]
pub struct CompletedEvaluation {
    pub submission: Arc<Submission>,
    pub report: RunReport,
}

/// A submission whose run faulted
#[derive(Clone, Debug)]
pub struct FailedEvaluation {
    pub submission: Arc<Submission>,
    pub error: Arc<EvalError>,
    /// Absent when the run never reached its working directory
    pub report: Option<RunReport>,
}

/// Published to every subscriber once per finished attempt
#[derive(Clone, Debug)]
pub enum EvaluationEvent {
    Completed(CompletedEvaluation),
    Failed(FailedEvaluation),
}

impl EvaluationEvent {
    pub fn submission(&self) -> &Arc<Submission> {
        match self {
            EvaluationEvent::Completed(done) => &done.submission,
            EvaluationEvent::Failed(failed) => &failed.submission,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, EvaluationEvent::Failed(_))
    }
}
