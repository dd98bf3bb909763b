//! Submissions: one versioned unit of user code offered for evaluation.

use crate::core::hook::{Aborted, HookResult};
use crate::core::project::Project;
use crate::trace::operation::MethodCall;
use crate::trace::sink::{CancelProbe, InstrumentationSink, MemorySink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_SUBMISSION_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique, strictly increasing submission identity.
///
/// Only [`SubmissionId::allocate`] creates new ids, so two submissions built
/// in the same process never share one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubmissionId(u32);

impl SubmissionId {
    pub fn allocate() -> Self {
        Self(NEXT_SUBMISSION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-way cancellation flag shared between a submission and its sink
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn probe(&self) -> CancelProbe {
        let flag = Arc::clone(&self.0);
        Box::new(move || flag.load(Ordering::Acquire))
    }
}

pub struct Submission {
    id: SubmissionId,
    project: Project,
    eval_code: String,
    sink: Mutex<Box<dyn InstrumentationSink>>,
    canceled: CancelFlag,
    tag: Option<String>,
    created_at: DateTime<Utc>,
}

impl Submission {
    /// Submission recording into a [`MemorySink`]
    pub fn new(id: SubmissionId, project: Project, eval_code: impl Into<String>) -> Self {
        Self::with_custom_sink(id, project, eval_code, |probe| {
            Box::new(MemorySink::new(probe))
        })
    }

    /// Submission recording into a caller-built sink. The factory receives the
    /// probe reading this submission's cancellation flag.
    pub fn with_custom_sink<F>(
        id: SubmissionId,
        project: Project,
        eval_code: impl Into<String>,
        make_sink: F,
    ) -> Self
    where
        F: FnOnce(CancelProbe) -> Box<dyn InstrumentationSink>,
    {
        let canceled = CancelFlag::default();
        let sink = make_sink(canceled.probe());
        Self {
            id,
            project,
            eval_code: eval_code.into(),
            sink: Mutex::new(sink),
            canceled,
            tag: None,
            created_at: Utc::now(),
        }
    }

    /// Attach opaque collaborator context, carried back on the completion event
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn eval_code(&self) -> &str {
        &self.eval_code
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cancel(&self) {
        self.canceled.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_canceled()
    }

    pub fn check_canceled(&self) -> HookResult<()> {
        if self.is_canceled() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    /// Run `f` with exclusive access to the sink
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut dyn InstrumentationSink) -> R) -> R {
        // A poisoned sink still holds a usable partial tree.
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut **sink)
    }

    /// Snapshot of the recorded root method calls
    pub fn root_calls(&self) -> BTreeMap<u32, MethodCall> {
        self.with_sink(|sink| sink.root_calls().clone())
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("id", &self.id)
            .field("sources", &self.project.sources.len())
            .field("references", &self.project.references)
            .field("canceled", &self.is_canceled())
            .field("tag", &self.tag)
            .finish()
    }
}
