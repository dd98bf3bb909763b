//! Instrumentation sinks.
//!
//! A sink receives the begin/end/log stream produced by the Hook Facade and
//! turns it into an Operation Tree. Containers live on an open stack while
//! instrumented code runs inside them and are attached to their parent only
//! when closed, so [`InstrumentationSink::unwind`] is what keeps an aborted
//! run's tree well formed.

use crate::trace::operation::{Loop, LoopIteration, MethodCall, Operation, ReturnValue, StateChange};
use std::collections::BTreeMap;

/// Cancellation predicate handed to a sink at construction
pub type CancelProbe = Box<dyn Fn() -> bool + Send + Sync>;

/// Receiver of trace events for a single submission's run
pub trait InstrumentationSink: Send {
    /// Whether the owning submission has been canceled
    fn is_canceled(&self) -> bool;

    fn begin_method(&mut self, id: u32, name: &str, arguments: Vec<StateChange>);
    fn end_method(&mut self, id: u32);
    fn begin_loop(&mut self, id: u32);
    fn end_loop(&mut self, id: u32);
    fn begin_inside_loop(&mut self, id: u32);
    fn end_inside_loop(&mut self, id: u32);
    fn log_variable_change(&mut self, id: u32, name: &str, value: String);
    fn log_return(&mut self, id: u32, value: Option<String>);

    /// Close every container still open
    fn unwind(&mut self);

    /// Number of containers currently open
    fn depth(&self) -> usize;

    /// Completed root method calls keyed by method id
    fn root_calls(&self) -> &BTreeMap<u32, MethodCall>;
}

#[derive(Debug)]
enum OpenContainer {
    Method(MethodCall),
    Loop(Loop),
    Iteration(LoopIteration),
}

impl OpenContainer {
    fn kind(&self) -> &'static str {
        match self {
            OpenContainer::Method(_) => "method",
            OpenContainer::Loop(_) => "loop",
            OpenContainer::Iteration(_) => "iteration",
        }
    }
}

/// In-memory sink building the Operation Tree directly
pub struct MemorySink {
    roots: BTreeMap<u32, MethodCall>,
    stack: Vec<OpenContainer>,
    probe: CancelProbe,
}

impl MemorySink {
    pub fn new(probe: CancelProbe) -> Self {
        Self {
            roots: BTreeMap::new(),
            stack: Vec::new(),
            probe,
        }
    }

    /// Sink that never reports cancellation
    pub fn detached() -> Self {
        Self::new(Box::new(|| false))
    }

    /// Operation list receiving appends at the current position.
    /// Inside a loop but outside any iteration, appends land in the latest iteration.
    fn active_operations(&mut self) -> Option<&mut Vec<Operation>> {
        match self.stack.last_mut()? {
            OpenContainer::Method(call) => Some(&mut call.operations),
            OpenContainer::Iteration(iteration) => Some(&mut iteration.operations),
            OpenContainer::Loop(l) => l.iterations.last_mut().map(|i| &mut i.operations),
        }
    }

    fn append(&mut self, op: Operation) {
        match self.active_operations() {
            Some(ops) => ops.push(op),
            None => log::warn!(
                "Dropping operation {} recorded outside of any open container",
                op.id()
            ),
        }
    }

    /// Pop the top container if it is of the expected kind
    fn close(&mut self, expected: &'static str, id: u32) {
        match self.stack.last().map(OpenContainer::kind) {
            Some(kind) if kind == expected => self.close_top(),
            Some(kind) => log::warn!(
                "Ignoring end of {} {}: innermost open container is a {}",
                expected,
                id,
                kind
            ),
            None => log::warn!("Ignoring end of {} {}: nothing is open", expected, id),
        }
    }

    fn close_top(&mut self) {
        let Some(container) = self.stack.pop() else {
            return;
        };

        match container {
            OpenContainer::Iteration(iteration) => match self.stack.last_mut() {
                Some(OpenContainer::Loop(l)) => l.iterations.push(iteration),
                _ => log::warn!("Loop iteration {} closed outside of its loop", iteration.id),
            },
            OpenContainer::Loop(l) => self.append(Operation::Loop(l)),
            OpenContainer::Method(call) => {
                if self.stack.is_empty() {
                    self.roots.insert(call.id, call);
                } else {
                    self.append(Operation::MethodCall(call));
                }
            }
        }
    }
}

impl InstrumentationSink for MemorySink {
    fn is_canceled(&self) -> bool {
        (self.probe)()
    }

    fn begin_method(&mut self, id: u32, name: &str, arguments: Vec<StateChange>) {
        self.stack
            .push(OpenContainer::Method(MethodCall::new(id, name, arguments)));
    }

    fn end_method(&mut self, id: u32) {
        self.close("method", id);
    }

    fn begin_loop(&mut self, id: u32) {
        if self.stack.is_empty() {
            log::warn!("Ignoring loop {} started outside of any method", id);
            return;
        }
        self.stack.push(OpenContainer::Loop(Loop {
            id,
            iterations: Vec::new(),
        }));
    }

    fn end_loop(&mut self, id: u32) {
        self.close("loop", id);
    }

    fn begin_inside_loop(&mut self, id: u32) {
        if !matches!(self.stack.last(), Some(OpenContainer::Loop(_))) {
            log::warn!("Ignoring iteration {} started outside of a loop", id);
            return;
        }
        self.stack.push(OpenContainer::Iteration(LoopIteration {
            id,
            operations: Vec::new(),
        }));
    }

    fn end_inside_loop(&mut self, id: u32) {
        self.close("iteration", id);
    }

    fn log_variable_change(&mut self, id: u32, name: &str, value: String) {
        self.append(Operation::StateChange(StateChange::new(id, name, value)));
    }

    fn log_return(&mut self, id: u32, value: Option<String>) {
        self.append(Operation::ReturnValue(ReturnValue { id, value }));
    }

    fn unwind(&mut self) {
        if !self.stack.is_empty() {
            log::debug!("Unwinding {} open trace container(s)", self.stack.len());
        }
        while !self.stack.is_empty() {
            self.close_top();
        }
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn root_calls(&self) -> &BTreeMap<u32, MethodCall> {
        &self.roots
    }
}
