//! instant-eval: a live evaluation engine
//! Runs successive versions of instrumented user code in throwaway wasm contexts and
//! records what each run did, skipping any version a newer one supersedes before it runs
//!
//! # Architecture
//!
//! ## Trace Model ([`trace`])
//! - [`trace::operation`]: Operation Tree (method calls, loops, iterations, state changes, returns)
//! - [`trace::sink`]: Instrumentation sinks building the tree from hook events
//!
//! ## Evaluation Core ([`core`])
//! - [`core::submission`]: Submission identity, cancellation and owned sink
//! - [`core::project`]: Sources, binary dependencies and compiler options
//! - [`core::evaluator`]: Single background worker with a latest-wins pending slot
//! - [`core::hook`]: Process-wide hook facade routing instrumented calls to a submission
//! - [`core::types`]: Run reports and evaluation events
//!
//! ## Isolated Runtime ([`runtime`])
//! - [`runtime::isolate`]: Type-state run sequence (stage, compile, invoke, teardown)
//! - [`runtime::wrapper`]: Evaluation unit synthesis with a fixed, versioned entry point
//! - [`runtime::host`]: Guest bindings exposing the hook facade to wasm
//! - [`runtime::compiler`]: Compiler options and diagnostics
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: Run-scoped working directories
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: Configuration loading and environment overrides
//! - [`config::types`]: Evaluator configuration and the error taxonomy
//!
//! # Design Principles
//!
//! 1. **Latest wins** - Only the newest submission is worth running
//! 2. **Cooperative cancellation** - A canceled run stops at its next hook call
//! 3. **No failures from noise** - Code that does not compile yet is skipped silently
//! 4. **Nothing outlives its run** - Contexts and working directories are torn down unconditionally

// Trace Model
pub mod trace;

// Evaluation Core
pub mod core;

// Isolated Runtime
pub mod runtime;

// Safety & Cleanup
pub mod safety;

// Configuration
pub mod config;

// CLI entrypoint wiring for the instant binary
pub mod cli;

pub use crate::config::types::{EvalError, EvaluatorConfig, Result};
pub use crate::core::evaluator::Evaluator;
pub use crate::core::submission::{Submission, SubmissionId};
pub use crate::core::types::EvaluationEvent;
