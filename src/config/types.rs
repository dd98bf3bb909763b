/// Core types and errors shared across the evaluation engine
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Evaluator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Directory under which every run gets its own uniquely named working area
    #[serde(default = "EvaluatorConfig::default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Dependencies under these directories are loaded in place instead of copied
    #[serde(default)]
    pub trusted_reference_dirs: Vec<PathBuf>,
    /// Name given to the background worker thread
    #[serde(default = "EvaluatorConfig::default_worker_thread_name")]
    pub worker_thread_name: String,
    /// Working areas older than this are swept when the evaluator starts.
    /// `None` disables the sweep.
    #[serde(default = "EvaluatorConfig::default_stale_workspace_max_age_secs")]
    pub stale_workspace_max_age_secs: Option<u64>,
}

impl EvaluatorConfig {
    /// Workspace root scoped by process owner so different users never share run directories.
    pub fn default_workspace_root() -> PathBuf {
        let owner = std::env::var("USER").unwrap_or_else(|_| "shared".to_string());
        std::env::temp_dir().join(format!("instant-eval-{}", owner))
    }

    fn default_worker_thread_name() -> String {
        "instant-evaluator".to_string()
    }

    fn default_stale_workspace_max_age_secs() -> Option<u64> {
        Some(60 * 60)
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            workspace_root: Self::default_workspace_root(),
            trusted_reference_dirs: Vec::new(),
            worker_thread_name: Self::default_worker_thread_name(),
            stale_workspace_max_age_secs: Self::default_stale_workspace_max_age_secs(),
        }
    }
}

/// Errors produced by the evaluation engine
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Failed to read source {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Evaluation entry point `{0}` not found")]
    EntryPointMissing(String),

    #[error("Runtime fault: {message}")]
    Runtime {
        message: String,
        trap: Option<String>,
    },

    #[error("Evaluation panicked: {0}")]
    Panicked(String),

    #[error("Evaluator already started")]
    AlreadyStarted,

    #[error("Evaluator has been disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, EvalError>;
