//! Trace model
//!
//! The Operation Tree and the sinks that build it while instrumented code runs.

pub mod operation;
pub mod sink;
