use crate::config::types::{EvalError, EvaluatorConfig, Result};
/// Configuration loading from instant.json
use std::path::{Path, PathBuf};

/// Environment variable overriding the workspace root
pub const WORKSPACE_DIR_ENV: &str = "INSTANT_WORKSPACE_DIR";

/// File looked up in the current directory by [`EvaluatorConfig::load_default`]
pub const DEFAULT_CONFIG_FILE: &str = "instant.json";

impl EvaluatorConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EvalError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config: EvaluatorConfig = serde_json::from_str(&content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load ./instant.json if present, hardcoded defaults otherwise
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| EvalError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if config_path.exists() {
            return Self::load_from_file(config_path);
        }

        log::debug!(
            "{} not found in current directory, using defaults",
            DEFAULT_CONFIG_FILE
        );
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment overrides on top of file or default values
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = std::env::var_os(WORKSPACE_DIR_ENV) {
            if !dir.is_empty() {
                self.workspace_root = PathBuf::from(dir);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(EvalError::Config(
                "workspace_root must not be empty".to_string(),
            ));
        }
        if self.worker_thread_name.contains('\0') {
            return Err(EvalError::Config(
                "worker_thread_name contains NUL byte".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a dependency path lives inside one of the trusted reference directories
    pub fn is_trusted_reference(&self, path: &Path) -> bool {
        self.trusted_reference_dirs
            .iter()
            .any(|dir| path.starts_with(dir))
    }
}
