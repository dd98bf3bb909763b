//! Shared helpers for integration tests.

#![allow(dead_code)]

use instant_eval::config::types::EvaluatorConfig;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Runs register with the process-wide hook facade, so tests in one binary
/// that execute submissions take turns.
pub fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn config(root: &Path) -> EvaluatorConfig {
    EvaluatorConfig {
        workspace_root: root.join("runs"),
        ..EvaluatorConfig::default()
    }
}

/// Builds the data segment holding every string a test unit passes to hooks
#[derive(Default)]
pub struct Strings {
    /// Segment contents as WAT string literal text
    escaped: String,
    len: usize,
}

impl Strings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` and return the `ptr len` operands addressing it
    pub fn add(&mut self, text: &str) -> String {
        let (ptr, len) = self.place(text);
        format!("i32.const {} i32.const {}", ptr, len)
    }

    /// Append a `begin_method` argument table and return its `ptr count` operands
    pub fn add_arguments(&mut self, arguments: &[(&str, &str)]) -> String {
        let words: Vec<u32> = arguments
            .iter()
            .flat_map(|(name, value)| {
                let (name_ptr, name_len) = self.place(name);
                let (value_ptr, value_len) = self.place(value);
                [name_ptr, name_len, value_ptr, value_len]
            })
            .collect();

        let table = self.len;
        for word in words {
            for byte in word.to_le_bytes() {
                self.escaped.push_str(&format!("\\{:02x}", byte));
            }
            self.len += 4;
        }
        format!("i32.const {} i32.const {}", table, arguments.len())
    }

    fn place(&mut self, text: &str) -> (u32, u32) {
        let ptr = self.len;
        self.escaped.push_str(text);
        self.len += text.len();
        (ptr as u32, text.len() as u32)
    }

    pub fn data_segment(&self) -> String {
        format!("(data (i32.const 0) \"{}\")", self.escaped)
    }
}

/// Instructions calling hook `name` for the registered submission
pub fn hook(name: &str, operands: &[&str]) -> String {
    let mut code = String::from("global.get $instant.submission\n");
    for operand in operands {
        code.push_str(operand);
        code.push('\n');
    }
    code.push_str(&format!("call $instant.{}\n", name));
    code
}

/// `ptr len` operands for an empty argument table
pub const NO_ARGUMENTS: &str = "i32.const 0 i32.const 0";
