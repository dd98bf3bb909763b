/// Run-scoped working directories
/// Every run gets a uniquely named directory that is removed when the run ends,
/// so no two runs ever see each other's artifacts.
use crate::config::types::{EvalError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Working directory owned by exactly one run
#[derive(Debug)]
pub struct Workspace {
    /// Unique run ID, also the directory name
    run_id: String,
    /// Run-specific workspace directory
    run_dir: PathBuf,
    /// File names already staged, so two dependencies never overwrite each other
    staged: Vec<String>,
}

impl Workspace {
    /// Create new workspace for a run
    pub fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);

        fs::create_dir_all(&run_dir).map_err(|e| {
            EvalError::Workspace(format!(
                "Failed to create workspace directory {}: {}",
                run_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            run_id,
            run_dir,
            staged: Vec::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write a generated artifact into the workspace
    pub fn write_file(&mut self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.claim(name)?;
        fs::write(&path, content).map_err(|e| {
            EvalError::Workspace(format!("Failed to write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// Copy an existing file into the workspace under its own file name
    pub fn stage_file(&mut self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                EvalError::Workspace(format!("Unusable file name: {}", source.display()))
            })?
            .to_string();
        let path = self.claim(&name)?;
        fs::copy(source, &path).map_err(|e| {
            EvalError::Workspace(format!(
                "Failed to copy {} into workspace: {}",
                source.display(),
                e
            ))
        })?;
        Ok(path)
    }

    fn claim(&mut self, name: &str) -> Result<PathBuf> {
        if self.staged.iter().any(|staged| staged == name) {
            return Err(EvalError::Workspace(format!(
                "{} is already present in workspace {}",
                name, self.run_id
            )));
        }
        self.staged.push(name.to_string());
        Ok(self.run_dir.join(name))
    }

    /// Remove the workspace (idempotent). Failures are logged, never returned.
    pub fn cleanup(&self) {
        if !self.run_dir.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.run_dir) {
            log::warn!(
                "Failed to remove run directory {}: {}",
                self.run_dir.display(),
                e
            );
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Owner of the directory all run workspaces are created under
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| {
            EvalError::Workspace(format!(
                "Failed to create workspace base directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::new(&self.base_dir)
    }

    /// Remove workspaces left behind by crashed processes, returning how many went
    pub fn cleanup_old_workspaces(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();

        if !self.base_dir.exists() {
            return Ok(0);
        }

        let entries = fs::read_dir(&self.base_dir)?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            // Only directories this crate created
            if entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
                .is_none()
            {
                continue;
            }

            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Failed to get modified time for {}: {}", path.display(), e);
                    continue;
                }
            };

            let age = match now.duration_since(modified) {
                Ok(d) => d,
                Err(_) => continue, // Future timestamp, skip
            };

            if age >= max_age {
                log::info!("Cleaning up old workspace: {}", path.display());
                if let Err(e) = fs::remove_dir_all(&path) {
                    log::warn!("Failed to remove old workspace {}: {}", path.display(), e);
                } else {
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }
}
