//! Safety and cleanup
//!
//! Run-scoped working directories that never outlive their run.

pub mod workspace;
