//! Operation Tree: the recorded trace of one submission's execution.
//!
//! Ids identify the instrumented source location, not the dynamic
//! occurrence. The same statement inside a loop body carries the same id in
//! every [`LoopIteration`].

use serde::{Deserialize, Serialize};

/// A named variable assignment with the rendered new value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub id: u32,
    pub name: String,
    pub value: String,
}

impl StateChange {
    pub fn new(id: u32, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A method's return site. `value` is `None` for implicit (void) returns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnValue {
    pub id: u32,
    pub value: Option<String>,
}

/// One pass through a loop body
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopIteration {
    pub id: u32,
    pub operations: Vec<Operation>,
}

/// Full run history of one loop construct
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub id: u32,
    pub iterations: Vec<LoopIteration>,
}

/// A method entry: root of a trace or a nested call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    pub id: u32,
    pub name: String,
    pub arguments: Vec<StateChange>,
    pub operations: Vec<Operation>,
}

impl MethodCall {
    pub fn new(id: u32, name: impl Into<String>, arguments: Vec<StateChange>) -> Self {
        Self {
            id,
            name: name.into(),
            arguments,
            operations: Vec::new(),
        }
    }

    /// Every loop reachable from this call, depth first
    pub fn loops(&self) -> Vec<&Loop> {
        let mut found = Vec::new();
        collect_loops(&self.operations, &mut found);
        found
    }

    /// Last return recorded directly in this call's body
    pub fn return_value(&self) -> Option<&ReturnValue> {
        self.operations.iter().rev().find_map(|op| match op {
            Operation::ReturnValue(ret) => Some(ret),
            _ => None,
        })
    }
}

fn collect_loops<'a>(operations: &'a [Operation], found: &mut Vec<&'a Loop>) {
    for op in operations {
        match op {
            Operation::Loop(l) => {
                found.push(l);
                for iteration in &l.iterations {
                    collect_loops(&iteration.operations, found);
                }
            }
            Operation::MethodCall(call) => collect_loops(&call.operations, found),
            Operation::StateChange(_) | Operation::ReturnValue(_) => {}
        }
    }
}

/// One recorded trace event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    StateChange(StateChange),
    ReturnValue(ReturnValue),
    Loop(Loop),
    MethodCall(MethodCall),
}

impl Operation {
    pub fn id(&self) -> u32 {
        match self {
            Operation::StateChange(op) => op.id,
            Operation::ReturnValue(op) => op.id,
            Operation::Loop(op) => op.id,
            Operation::MethodCall(op) => op.id,
        }
    }

    pub fn as_state_change(&self) -> Option<&StateChange> {
        match self {
            Operation::StateChange(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_loop(&self) -> Option<&Loop> {
        match self {
            Operation::Loop(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_method_call(&self) -> Option<&MethodCall> {
        match self {
            Operation::MethodCall(op) => Some(op),
            _ => None,
        }
    }
}
