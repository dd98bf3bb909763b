//! End-to-end evaluator scenarios
//!
//! Each test drives a real evaluator through push and subscribe only.

mod common;

use common::{hook, Strings, NO_ARGUMENTS};
use crossbeam_channel::Receiver;
use instant_eval::config::types::EvalError;
use instant_eval::core::evaluator::Evaluator;
use instant_eval::core::project::Project;
use instant_eval::core::submission::{Submission, SubmissionId};
use instant_eval::core::types::EvaluationEvent;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);
const QUIET_PERIOD: Duration = Duration::from_millis(500);

fn started_evaluator(root: &Path) -> (Evaluator, Receiver<EvaluationEvent>) {
    let mut evaluator = Evaluator::new(common::config(root)).unwrap();
    let events = evaluator.subscribe();
    evaluator.start().unwrap();
    (evaluator, events)
}

fn submission(project: Project, eval_code: &str) -> Arc<Submission> {
    Arc::new(Submission::new(
        SubmissionId::allocate(),
        project,
        eval_code,
    ))
}

fn expect_event(events: &Receiver<EvaluationEvent>) -> EvaluationEvent {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("evaluator published nothing")
}

/// `Main` with the single assignment `x = 5`
fn single_assignment() -> Project {
    let mut strings = Strings::new();
    let main = strings.add("Main");
    let x = strings.add("x");
    let five = strings.add("5");

    let body = [
        hook("begin_method", &["i32.const 0", &main, NO_ARGUMENTS]),
        hook("log_variable_change", &["i32.const 1", &x, &five]),
        hook("end_method", &["i32.const 0"]),
    ]
    .concat();
    Project::new().with_source_text(format!(
        "{}\n(func $main\n{})",
        strings.data_segment(),
        body
    ))
}

/// `Count` running a loop `iterations` times, assigning `i` once per iteration
fn counting_loop(iterations: u32) -> Project {
    let mut strings = Strings::new();
    let count = strings.add("Count");
    let i = strings.add("i");

    let exit = format!(
        "local.get $i\ni32.const {}\ni32.ge_s\nbr_if $done\n",
        iterations
    );
    let body = [
        hook("begin_method", &["i32.const 0", &count, NO_ARGUMENTS]),
        hook("begin_loop", &["i32.const 1"]),
        "(block $done\n(loop $next\n".to_string(),
        exit,
        hook("begin_inside_loop", &["i32.const 1"]),
        "local.get $i\ni32.const 1\ni32.add\nlocal.set $i\n".to_string(),
        hook("log_i32", &["i32.const 2", &i, "local.get $i"]),
        hook("end_inside_loop", &["i32.const 1"]),
        "br $next))\n".to_string(),
        hook("end_loop", &["i32.const 1"]),
        hook("end_method", &["i32.const 0"]),
    ]
    .concat();
    Project::new().with_source_text(format!(
        "{}\n(func $count (local $i i32)\n{})",
        strings.data_segment(),
        body
    ))
}

#[test]
fn test_single_assignment_is_traced() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    let s = submission(single_assignment(), "call $main");
    evaluator.push(Arc::clone(&s));

    let done = match expect_event(&events) {
        EvaluationEvent::Completed(done) => done,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(done.submission.id(), s.id());
    assert!(!done.report.aborted);

    let roots = s.root_calls();
    assert_eq!(roots.len(), 1);
    let main = &roots[&0];
    assert_eq!(main.name, "Main");
    assert_eq!(main.operations.len(), 1);
    let change = main.operations[0].as_state_change().unwrap();
    assert_eq!(change.name, "x");
    assert_eq!(change.value, "5");
}

#[test]
fn test_pending_submission_superseded_before_start() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let mut evaluator = Evaluator::new(common::config(dir.path())).unwrap();
    let events = evaluator.subscribe();

    let first = submission(single_assignment(), "call $main");
    let second = submission(single_assignment(), "call $main");
    evaluator.push(Arc::clone(&first));
    evaluator.push(Arc::clone(&second));
    evaluator.start().unwrap();

    let event = expect_event(&events);
    assert_eq!(event.submission().id(), second.id());
    assert!(!event.is_failure());
    assert!(first.is_canceled());
    assert!(first.root_calls().is_empty());
    assert!(events.recv_timeout(QUIET_PERIOD).is_err());
}

#[test]
fn test_rapid_pushes_only_run_the_last() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    let burst: Vec<_> = (0..5)
        .map(|_| submission(single_assignment(), "call $main"))
        .collect();
    for s in &burst {
        evaluator.push(Arc::clone(s));
    }
    let last = burst.last().unwrap();

    let mut reported = Vec::new();
    loop {
        let event = expect_event(&events);
        reported.push(event.submission().id());
        if event.submission().id() == last.id() {
            assert!(!event.is_failure());
            break;
        }
    }
    // Every earlier push that never reported was dropped from the pending slot.
    for s in &burst[..4] {
        if !reported.contains(&s.id()) {
            assert!(s.is_canceled());
            assert!(s.root_calls().is_empty());
        }
    }
    assert!(!last.is_canceled());
}

#[test]
fn test_missing_dependency_is_silent() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    let project = single_assignment().with_reference(dir.path().join("nowhere.wasm"));
    evaluator.push(submission(project, "call $main"));
    assert!(events.recv_timeout(QUIET_PERIOD).is_err());

    let next = submission(single_assignment(), "call $main");
    evaluator.push(Arc::clone(&next));
    assert_eq!(expect_event(&events).submission().id(), next.id());
}

#[test]
fn test_compile_error_is_silent() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    let broken = Project::new().with_source_text("(func $main (result i32))");
    evaluator.push(submission(broken, "call $main drop"));
    assert!(events.recv_timeout(QUIET_PERIOD).is_err());

    let next = submission(single_assignment(), "call $main");
    evaluator.push(Arc::clone(&next));
    assert_eq!(expect_event(&events).submission().id(), next.id());
}

#[test]
fn test_loop_iterations_are_segregated() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    let s = submission(counting_loop(3), "call $count");
    evaluator.push(Arc::clone(&s));
    assert!(!expect_event(&events).is_failure());

    let roots = s.root_calls();
    let count = &roots[&0];
    assert_eq!(count.operations.len(), 1);
    let l = count.operations[0].as_loop().unwrap();
    assert_eq!(l.iterations.len(), 3);
    for (n, iteration) in l.iterations.iter().enumerate() {
        assert_eq!(iteration.operations.len(), 1);
        let change = iteration.operations[0].as_state_change().unwrap();
        assert_eq!(change.id, 2);
        assert_eq!(change.name, "i");
        assert_eq!(change.value, (n + 1).to_string());
    }
}

#[test]
fn test_running_submission_finishes_before_next() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    const ITERATIONS: u32 = 20_000;
    let long = submission(counting_loop(ITERATIONS), "call $count");
    evaluator.push(Arc::clone(&long));

    let deadline = Instant::now() + EVENT_TIMEOUT;
    while long.with_sink(|sink| sink.depth()) == 0 && long.root_calls().is_empty() {
        assert!(Instant::now() < deadline, "loop never started");
        std::thread::sleep(Duration::from_millis(1));
    }

    let next = submission(single_assignment(), "call $main");
    evaluator.push(Arc::clone(&next));

    match expect_event(&events) {
        EvaluationEvent::Completed(done) => {
            assert_eq!(done.submission.id(), long.id());
            assert!(!done.report.aborted);
            assert!(!done.submission.is_canceled());
        }
        other => panic!("unexpected event: {:?}", other),
    }
    let roots = long.root_calls();
    let l = roots[&0].operations[0].as_loop().unwrap();
    assert_eq!(l.iterations.len(), ITERATIONS as usize);

    let event = expect_event(&events);
    assert_eq!(event.submission().id(), next.id());
    assert!(!event.is_failure());
    assert!(!next.is_canceled());
}

#[test]
fn test_runtime_fault_keeps_worker_alive() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    let faulty = submission(single_assignment(), "call $main\nunreachable");
    evaluator.push(Arc::clone(&faulty));
    match expect_event(&events) {
        EvaluationEvent::Failed(failed) => {
            assert_eq!(failed.submission.id(), faulty.id());
            assert!(matches!(*failed.error, EvalError::Runtime { .. }));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // The trace recorded before the fault is kept.
    assert_eq!(faulty.root_calls().len(), 1);

    let next = submission(single_assignment(), "call $main");
    evaluator.push(Arc::clone(&next));
    assert!(!expect_event(&events).is_failure());
    assert!(evaluator.is_running());
}

#[test]
fn test_workspaces_removed_after_runs() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (evaluator, events) = started_evaluator(dir.path());

    for _ in 0..3 {
        evaluator.push(submission(single_assignment(), "call $main"));
        expect_event(&events);
    }
    let leftover = std::fs::read_dir(dir.path().join("runs")).unwrap().count();
    assert_eq!(leftover, 0);
}
