//! Hook Facade: the process-wide entry points instrumented code calls into.
//!
//! The registered submission is the only process-wide mutable state the
//! engine keeps, and it lives here alone. The isolated runner writes it once
//! per run through [`load_submission`] and the returned [`Registration`]
//! clears it when the run ends. Every hook reads it. This is sound because
//! the evaluator executes at most one run at a time. The lock guards only the
//! slot itself: a hook clones the `Arc` and releases the lock before it
//! touches the sink, so no sink call ever happens under it.
//!
//! Every hook takes the submission id baked into the instrumented call site.
//! A call whose id does not match the registered submission, or whose
//! submission has been canceled, fails with [`Aborted`]. Containers are
//! always closed before `Aborted` is raised so the trace stays well formed,
//! and nothing is appended once cancellation has been observed.

use crate::core::submission::{Submission, SubmissionId};
use crate::trace::operation::StateChange;
use crate::trace::sink::InstrumentationSink;
use std::fmt::Display;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Control-flow signal ending a superseded or canceled run.
///
/// Kept apart from [`crate::config::types::EvalError`]: the isolated runner
/// swallows it, it is never reported as a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("evaluation aborted: submission canceled or superseded")]
pub struct Aborted;

pub type HookResult<T> = std::result::Result<T, Aborted>;

static CURRENT: RwLock<Option<Arc<Submission>>> = RwLock::new(None);

/// Keeps a submission registered as current until dropped
#[must_use = "the submission is unregistered as soon as the registration is dropped"]
pub struct Registration {
    id: SubmissionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut current = CURRENT.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map(|s| s.id()) == Some(self.id) {
            *current = None;
        }
    }
}

/// Register `submission` as the one currently executing
pub fn load_submission(submission: Arc<Submission>) -> Registration {
    let id = submission.id();
    let previous = CURRENT
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(submission);
    if let Some(previous) = previous {
        log::debug!(
            "Submission {} replaces stale hook registration {}",
            id,
            previous.id()
        );
    }
    Registration { id }
}

/// Id of the submission currently registered, if any
pub fn current_submission_id() -> Option<SubmissionId> {
    CURRENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|s| s.id())
}

fn submission(submission_id: u32) -> HookResult<Arc<Submission>> {
    let current = CURRENT.read().unwrap_or_else(PoisonError::into_inner);
    match current.as_ref() {
        Some(s) if s.id().get() == submission_id => Ok(Arc::clone(s)),
        _ => Err(Aborted),
    }
}

/// Abort unless `submission_id` is registered and not canceled. Guest
/// bindings check this before decoding anything out of guest memory.
pub fn ensure_active(submission_id: u32) -> HookResult<()> {
    submission(submission_id)?.check_canceled()
}

fn with_sink<R>(
    submission_id: u32,
    f: impl FnOnce(&mut dyn InstrumentationSink) -> HookResult<R>,
) -> HookResult<R> {
    submission(submission_id)?.with_sink(f)
}

fn ensure_live(sink: &dyn InstrumentationSink) -> HookResult<()> {
    if sink.is_canceled() {
        Err(Aborted)
    } else {
        Ok(())
    }
}

pub fn begin_method(
    submission_id: u32,
    id: u32,
    name: &str,
    arguments: Vec<StateChange>,
) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        ensure_live(sink)?;
        sink.begin_method(id, name, arguments);
        Ok(())
    })
}

pub fn end_method(submission_id: u32, id: u32) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        sink.end_method(id);
        ensure_live(sink)
    })
}

pub fn begin_loop(submission_id: u32, id: u32) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        ensure_live(sink)?;
        sink.begin_loop(id);
        Ok(())
    })
}

pub fn end_loop(submission_id: u32, id: u32) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        sink.end_loop(id);
        ensure_live(sink)
    })
}

pub fn begin_inside_loop(submission_id: u32, id: u32) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        if sink.is_canceled() {
            sink.end_loop(id);
            return Err(Aborted);
        }
        sink.begin_inside_loop(id);
        Ok(())
    })
}

pub fn end_inside_loop(submission_id: u32, id: u32) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        sink.end_inside_loop(id);
        if sink.is_canceled() {
            sink.end_loop(id);
            return Err(Aborted);
        }
        Ok(())
    })
}

pub fn log_variable_change(
    submission_id: u32,
    id: u32,
    name: &str,
    value: impl Into<String>,
) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        ensure_live(sink)?;
        sink.log_variable_change(id, name, value.into());
        Ok(())
    })
}

/// Record an assignment and hand the assigned value back to the call site
pub fn log_object<T: Display>(submission_id: u32, id: u32, name: &str, value: T) -> HookResult<T> {
    log_variable_change(submission_id, id, name, value.to_string())?;
    Ok(value)
}

/// Record a return site; `None` for implicit or void returns
pub fn log_return(submission_id: u32, id: u32, value: Option<String>) -> HookResult<()> {
    with_sink(submission_id, |sink| {
        ensure_live(sink)?;
        sink.log_return(id, value);
        Ok(())
    })
}

/// Record a returned value and hand it back to the call site
pub fn log_return_value<T: Display>(submission_id: u32, id: u32, value: T) -> HookResult<T> {
    log_return(submission_id, id, Some(value.to_string()))?;
    Ok(value)
}

/// Serialises tests that touch the process-wide registration
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::project::Project;

    fn registered() -> (Arc<Submission>, Registration, u32) {
        let submission = Arc::new(Submission::new(
            SubmissionId::allocate(),
            Project::new(),
            "",
        ));
        let sid = submission.id().get();
        let registration = load_submission(Arc::clone(&submission));
        (submission, registration, sid)
    }

    #[test]
    fn test_hooks_build_trace() {
        let _guard = test_guard();
        let (submission, registration, sid) = registered();

        begin_method(sid, 0, "Square", vec![StateChange::new(1, "n", "4")]).unwrap();
        let n = log_object(sid, 2, "result", 16).unwrap();
        assert_eq!(n, 16);
        assert_eq!(log_return_value(sid, 3, n).unwrap(), 16);
        end_method(sid, 0).unwrap();
        drop(registration);

        let roots = submission.root_calls();
        let root = &roots[&0];
        assert_eq!(root.arguments, vec![StateChange::new(1, "n", "4")]);
        assert_eq!(root.operations.len(), 2);
        assert_eq!(root.return_value().unwrap().value.as_deref(), Some("16"));
    }

    #[test]
    fn test_wrong_submission_id_aborts() {
        let _guard = test_guard();
        let (submission, _registration, sid) = registered();

        assert_eq!(begin_method(sid + 1000, 0, "Main", Vec::new()), Err(Aborted));
        assert!(submission.root_calls().is_empty());
    }

    #[test]
    fn test_unregistered_hooks_abort() {
        let _guard = test_guard();
        let (_submission, registration, sid) = registered();
        drop(registration);

        assert_eq!(current_submission_id(), None);
        assert_eq!(log_return(sid, 1, None), Err(Aborted));
    }

    #[test]
    fn test_cancellation_observed_by_next_call() {
        let _guard = test_guard();
        let (submission, registration, sid) = registered();

        begin_method(sid, 0, "Main", Vec::new()).unwrap();
        log_variable_change(sid, 1, "x", "1").unwrap();
        submission.cancel();
        assert_eq!(log_variable_change(sid, 2, "y", "2"), Err(Aborted));
        assert_eq!(begin_loop(sid, 3), Err(Aborted));
        submission.with_sink(|sink| sink.unwind());
        drop(registration);

        let roots = submission.root_calls();
        let root = &roots[&0];
        assert_eq!(root.operations.len(), 1);
        assert_eq!(root.operations[0].as_state_change().unwrap().name, "x");
    }

    #[test]
    fn test_cancel_inside_loop_closes_iteration_and_loop() {
        let _guard = test_guard();
        let (submission, registration, sid) = registered();

        begin_method(sid, 0, "Main", Vec::new()).unwrap();
        begin_loop(sid, 1).unwrap();
        begin_inside_loop(sid, 1).unwrap();
        log_variable_change(sid, 2, "i", "0").unwrap();
        submission.cancel();

        assert_eq!(end_inside_loop(sid, 1), Err(Aborted));
        assert_eq!(submission.with_sink(|sink| sink.depth()), 1);
        drop(registration);

        submission.with_sink(|sink| sink.unwind());
        let roots = submission.root_calls();
        let l = roots[&0].operations[0].as_loop().unwrap();
        assert_eq!(l.iterations.len(), 1);
    }

    #[test]
    fn test_cancel_before_iteration_closes_loop() {
        let _guard = test_guard();
        let (submission, _registration, sid) = registered();

        begin_method(sid, 0, "Main", Vec::new()).unwrap();
        begin_loop(sid, 1).unwrap();
        submission.cancel();

        assert_eq!(begin_inside_loop(sid, 1), Err(Aborted));
        assert_eq!(submission.with_sink(|sink| sink.depth()), 1);
    }

    #[test]
    fn test_ensure_active_tracks_registration_and_cancel() {
        let _guard = test_guard();
        let (submission, registration, sid) = registered();

        assert_eq!(ensure_active(sid), Ok(()));
        assert_eq!(ensure_active(sid + 1000), Err(Aborted));
        submission.cancel();
        assert_eq!(ensure_active(sid), Err(Aborted));
        drop(registration);
        assert_eq!(ensure_active(sid), Err(Aborted));
    }

    #[test]
    fn test_stale_registration_drop_keeps_newer() {
        let _guard = test_guard();
        let (_first, first_registration, _) = registered();
        let (second, _second_registration, _) = registered();

        drop(first_registration);
        assert_eq!(current_submission_id(), Some(second.id()));
    }
}
