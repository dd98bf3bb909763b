//! Evaluation core.
//!
//! Submissions and the projects they are built from, the background
//! evaluator that runs them, and the hook facade instrumented code reports
//! into while it runs.

pub mod evaluator;
pub mod hook;
pub mod project;
pub mod submission;
pub mod types;
