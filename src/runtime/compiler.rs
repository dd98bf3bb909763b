//! Compiler option parsing and diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;
use wasmtime::{Config, OptLevel};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One message produced while parsing options, compiling or linking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

/// Engine settings derived from a project's free-form option string
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompilerOptions {
    pub opt_level: Option<OptLevelFlag>,
    pub debug_info: bool,
    pub max_wasm_stack: Option<usize>,
}

/// `OptLevel` is not `Eq`, so options keep their own copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptLevelFlag {
    None,
    Speed,
    SpeedAndSize,
}

impl CompilerOptions {
    /// Parse whitespace-separated flags.
    ///
    /// Unknown flags only warn; a malformed value for a known flag is an error.
    pub fn parse(options: &str) -> (Self, Vec<Diagnostic>) {
        let mut parsed = Self::default();
        let mut diagnostics = Vec::new();

        for flag in options.split_whitespace() {
            match flag {
                "-O0" => parsed.opt_level = Some(OptLevelFlag::None),
                "-O1" | "-O2" => parsed.opt_level = Some(OptLevelFlag::Speed),
                "-Os" => parsed.opt_level = Some(OptLevelFlag::SpeedAndSize),
                "-g" => parsed.debug_info = true,
                _ => {
                    if let Some(value) = flag.strip_prefix("--max-wasm-stack=") {
                        match value.parse::<usize>() {
                            Ok(bytes) if bytes > 0 => parsed.max_wasm_stack = Some(bytes),
                            _ => diagnostics.push(Diagnostic::error(format!(
                                "invalid value `{}` for --max-wasm-stack",
                                value
                            ))),
                        }
                    } else {
                        diagnostics.push(Diagnostic::warning(format!(
                            "ignoring unknown compiler option `{}`",
                            flag
                        )));
                    }
                }
            }
        }

        (parsed, diagnostics)
    }

    pub fn engine_config(&self) -> Config {
        let mut config = Config::new();
        if let Some(level) = self.opt_level {
            config.cranelift_opt_level(match level {
                OptLevelFlag::None => OptLevel::None,
                OptLevelFlag::Speed => OptLevel::Speed,
                OptLevelFlag::SpeedAndSize => OptLevel::SpeedAndSize,
            });
        }
        config.debug_info(self.debug_info);
        if let Some(bytes) = self.max_wasm_stack {
            config.max_wasm_stack(bytes);
        }
        config
    }
}

/// Whether any diagnostic blocks compilation
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}
