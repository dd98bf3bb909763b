use crate::config::types::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One compilation input, backed either by a file or by in-memory text
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceBlob {
    File(PathBuf),
    Text(String),
}

impl SourceBlob {
    /// Read the whole blob. A partially read file is an error, never a shorter source.
    pub fn read(&self) -> Result<String> {
        match self {
            SourceBlob::File(path) => {
                std::fs::read_to_string(path).map_err(|source| EvalError::Source {
                    path: path.clone(),
                    source,
                })
            }
            SourceBlob::Text(text) => Ok(text.clone()),
        }
    }
}

/// Sources, binary dependencies and compiler options to build a submission from
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub sources: Vec<SourceBlob>,
    pub references: Vec<PathBuf>,
    #[serde(default)]
    pub compiler_options: String,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source_text(mut self, text: impl Into<String>) -> Self {
        self.sources.push(SourceBlob::Text(text.into()));
        self
    }

    pub fn with_source_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(SourceBlob::File(path.into()));
        self
    }

    pub fn with_reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.references.push(path.into());
        self
    }

    pub fn with_compiler_options(mut self, options: impl Into<String>) -> Self {
        self.compiler_options = options.into();
        self
    }

    /// Read every source in declaration order
    pub fn read_sources(&self) -> Result<Vec<String>> {
        self.sources.iter().map(SourceBlob::read).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_sources_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("b.wat");
        std::fs::write(&file, "(func $b)").unwrap();

        let project = Project::new()
            .with_source_text("(func $a)")
            .with_source_file(&file)
            .with_source_text("(func $c)");

        let sources = project.read_sources().unwrap();
        assert_eq!(sources, vec!["(func $a)", "(func $b)", "(func $c)"]);
    }

    #[test]
    fn test_unreadable_source_reports_path() {
        let project = Project::new().with_source_file("/nonexistent/instant/source.wat");
        match project.read_sources() {
            Err(EvalError::Source { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/instant/source.wat"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
