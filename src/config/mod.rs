//! Configuration
//!
//! Evaluator settings, their loading, and the shared error type.

pub mod config;
pub mod types;
