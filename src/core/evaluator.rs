//! The background evaluator.
//!
//! One worker thread runs submissions one at a time. Submitters never wait
//! for it: [`Evaluator::push`] swaps the submission into a single pending
//! slot, cancels whatever it displaced, and wakes the worker. A run already
//! in flight is left to finish. When the worker gets around to the slot it
//! takes only the latest submission, so a burst of pushes costs one run, not
//! one per push.

use crate::config::types::{EvalError, EvaluatorConfig, Result};
use crate::core::submission::Submission;
use crate::core::types::{CompletedEvaluation, EvaluationEvent, FailedEvaluation};
use crate::runtime::isolate::{IsolatedRunner, RunOutcome, RunResult};
use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// State shared between submitters and the worker
struct Shared {
    pending: AtomicCell<Option<Arc<Submission>>>,
    /// Capacity one: any number of pushes collapse into a single wake-up
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    disposed: AtomicBool,
    subscribers: Mutex<Vec<Sender<EvaluationEvent>>>,
}

impl Shared {
    fn wake(&self) {
        // A full channel already holds a wake-up the worker has yet to see.
        let _ = self.wake_tx.try_send(());
    }

    fn publish(&self, event: EvaluationEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

pub struct Evaluator {
    shared: Arc<Shared>,
    /// Moves to the worker on start
    runner: Option<IsolatedRunner>,
    worker: Option<JoinHandle<()>>,
    worker_thread_name: String,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Result<Self> {
        let runner = IsolatedRunner::new(&config)?;
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);

        Ok(Self {
            shared: Arc::new(Shared {
                pending: AtomicCell::new(None),
                wake_tx,
                wake_rx,
                disposed: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
            }),
            runner: Some(runner),
            worker: None,
            worker_thread_name: config.worker_thread_name,
        })
    }

    /// Spawn the worker. Submissions pushed earlier are picked up right away.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(EvalError::Disposed);
        }
        let runner = self.runner.take().ok_or(EvalError::AlreadyStarted)?;
        runner.sweep_stale_workspaces();

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name(self.worker_thread_name.clone())
            .spawn(move || worker_loop(shared, runner))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Offer a submission. Any submission still waiting is canceled and
    /// dropped; the one executing runs to completion.
    pub fn push(&self, submission: Arc<Submission>) {
        if self.shared.disposed.load(Ordering::Acquire) {
            warn!(
                "Evaluator disposed, canceling submission {}",
                submission.id()
            );
            submission.cancel();
            return;
        }

        if let Some(bumped) = self.shared.pending.swap(Some(submission)) {
            debug!("Submission {} superseded before running", bumped.id());
            bumped.cancel();
        }
        self.shared.wake();
    }

    /// Receive one event per finished run from now on
    pub fn subscribe(&self) -> Receiver<EvaluationEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.is_finished())
    }

    /// Stop after the current run and cancel whatever is still pending
    pub fn dispose(&mut self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runner = None;
        self.shared.wake();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Evaluator worker terminated abnormally");
            }
        }
        if let Some(pending) = self.shared.pending.take() {
            debug!("Canceling pending submission {} on dispose", pending.id());
            pending.cancel();
        }
    }
}

impl Drop for Evaluator {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn worker_loop(shared: Arc<Shared>, runner: IsolatedRunner) {
    info!("Evaluator worker started");

    while shared.wake_rx.recv().is_ok() {
        if shared.disposed.load(Ordering::Acquire) {
            break;
        }
        let Some(submission) = shared.pending.take() else {
            continue;
        };
        if let Some(event) = evaluate(&runner, submission) {
            shared.publish(event);
        }
    }

    info!("Evaluator worker stopped");
}

/// Run one submission and decide what, if anything, subscribers hear about it
fn evaluate(runner: &IsolatedRunner, submission: Arc<Submission>) -> Option<EvaluationEvent> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&submission)));

    let RunResult { outcome, report } = match result {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Submission {} panicked: {}", submission.id(), message);
            submission.with_sink(|sink| sink.unwind());
            return Some(EvaluationEvent::Failed(FailedEvaluation {
                submission,
                error: Arc::new(EvalError::Panicked(message)),
                report: None,
            }));
        }
    };

    match outcome {
        RunOutcome::Completed | RunOutcome::Aborted => {
            Some(EvaluationEvent::Completed(CompletedEvaluation {
                submission,
                report: report?,
            }))
        }
        RunOutcome::NoChanges(_) => None,
        RunOutcome::Faulted(e) => {
            error!("Submission {} failed: {}", submission.id(), e);
            Some(EvaluationEvent::Failed(FailedEvaluation {
                submission,
                error: Arc::new(e),
                report,
            }))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hook::test_guard;
    use crate::core::project::Project;
    use crate::core::submission::SubmissionId;
    use std::time::Duration;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

    fn evaluator(root: &std::path::Path) -> Evaluator {
        Evaluator::new(EvaluatorConfig {
            workspace_root: root.join("runs"),
            ..EvaluatorConfig::default()
        })
        .unwrap()
    }

    fn submission(eval_code: &str) -> Arc<Submission> {
        Arc::new(Submission::new(
            SubmissionId::allocate(),
            Project::new(),
            eval_code,
        ))
    }

    #[test]
    fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(dir.path());
        evaluator.start().unwrap();
        assert!(evaluator.is_running());
        assert!(matches!(evaluator.start(), Err(EvalError::AlreadyStarted)));
    }

    #[test]
    fn test_latest_pending_wins() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(dir.path());
        let events = evaluator.subscribe();

        let first = submission("nop");
        let second = submission("nop");
        evaluator.push(Arc::clone(&first));
        evaluator.push(Arc::clone(&second));
        assert!(first.is_canceled());
        assert!(!second.is_canceled());

        evaluator.start().unwrap();
        let event = events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(event.submission().id(), second.id());
        assert!(!event.is_failure());
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_fault_reported_and_worker_survives() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(dir.path());
        let events = evaluator.subscribe();
        evaluator.start().unwrap();

        let broken = submission("unreachable");
        evaluator.push(Arc::clone(&broken));
        match events.recv_timeout(EVENT_TIMEOUT).unwrap() {
            EvaluationEvent::Failed(failed) => {
                assert_eq!(failed.submission.id(), broken.id());
                assert!(matches!(*failed.error, EvalError::Runtime { .. }));
                assert!(failed.report.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let fine = submission("nop");
        evaluator.push(Arc::clone(&fine));
        let event = events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(event.submission().id(), fine.id());
        assert!(!event.is_failure());
    }

    #[test]
    fn test_compile_errors_publish_nothing() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(dir.path());
        let events = evaluator.subscribe();
        evaluator.start().unwrap();

        evaluator.push(submission("call $missing"));
        assert!(events.recv_timeout(Duration::from_millis(500)).is_err());

        let fine = submission("nop");
        evaluator.push(Arc::clone(&fine));
        let event = events.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(event.submission().id(), fine.id());
    }

    #[test]
    fn test_push_after_dispose_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(dir.path());
        evaluator.start().unwrap();
        evaluator.dispose();
        assert!(!evaluator.is_running());

        let late = submission("nop");
        evaluator.push(Arc::clone(&late));
        assert!(late.is_canceled());
        assert!(matches!(evaluator.start(), Err(EvalError::Disposed)));
    }

    #[test]
    fn test_dispose_cancels_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(dir.path());
        let waiting = submission("nop");
        evaluator.push(Arc::clone(&waiting));

        evaluator.dispose();
        assert!(waiting.is_canceled());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = evaluator(dir.path());
        drop(evaluator.subscribe());
        let events = evaluator.subscribe();
        evaluator.start().unwrap();

        evaluator.push(submission("nop"));
        events.recv_timeout(EVENT_TIMEOUT).unwrap();
        let subscribers = evaluator.shared.subscribers.lock().unwrap().len();
        assert_eq!(subscribers, 1);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }
}
