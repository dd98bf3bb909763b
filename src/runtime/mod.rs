//! Isolated execution of evaluation units on wasmtime.

pub mod compiler;
pub mod host;
pub mod isolate;
pub mod wrapper;
