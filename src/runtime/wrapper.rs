//! Evaluation unit synthesis.
//!
//! Every source is a sequence of WebAssembly text module fields. The unit
//! handed to the compiler is one module holding, in order: the hook imports,
//! every `(import ...)` field found in the sources, the remaining source
//! fields, the entry wrapper around the evaluation code, and the exported
//! linear memory the hooks read strings from.

/// Bumped whenever the entry naming or the hook ABI changes
pub const WRAPPER_VERSION: u32 = 1;

/// Import module name of the hook functions and the submission global
pub const HOOK_MODULE: &str = "instant";

/// Text-format identifier of the synthesized entry function
pub const ENTRY_FUNCTION: &str = "$__instant_v1_evaluate";

/// Export name the runner resolves and invokes
pub const ENTRY_EXPORT: &str = "__instant_v1_evaluate";

pub const MEMORY_EXPORT: &str = "memory";

/// Import name of the constant global holding the registered submission id
pub const SUBMISSION_GLOBAL: &str = "submission";

/// File the assembled unit is written to inside the run's working directory
pub const UNIT_FILE_NAME: &str = "evaluation.wat";

/// Hook imports and their parameter lists. None of them return a value.
pub const HOOK_SIGNATURES: &[(&str, &[&str])] = &[
    ("begin_method", &["i32", "i32", "i32", "i32", "i32", "i32"]),
    ("end_method", &["i32", "i32"]),
    ("begin_loop", &["i32", "i32"]),
    ("end_loop", &["i32", "i32"]),
    ("begin_inside_loop", &["i32", "i32"]),
    ("end_inside_loop", &["i32", "i32"]),
    ("log_variable_change", &["i32", "i32", "i32", "i32", "i32", "i32"]),
    ("log_i32", &["i32", "i32", "i32", "i32", "i32"]),
    ("log_i64", &["i32", "i32", "i32", "i32", "i64"]),
    ("log_f64", &["i32", "i32", "i32", "i32", "f64"]),
    ("log_return", &["i32", "i32"]),
    ("log_return_value", &["i32", "i32", "i32", "i32"]),
    ("log_return_i32", &["i32", "i32", "i32"]),
    ("log_return_i64", &["i32", "i32", "i64"]),
    ("log_return_f64", &["i32", "i32", "f64"]),
];

/// Import declarations every unit starts with
pub fn hook_prelude() -> String {
    let mut prelude = String::new();
    for (name, params) in HOOK_SIGNATURES {
        prelude.push_str(&format!(
            "  (import \"{module}\" \"{name}\" (func ${module}.{name} (param {params})))\n",
            module = HOOK_MODULE,
            name = name,
            params = params.join(" ")
        ));
    }
    prelude.push_str(&format!(
        "  (import \"{module}\" \"{global}\" (global ${module}.{global} i32))\n",
        module = HOOK_MODULE,
        global = SUBMISSION_GLOBAL
    ));
    prelude
}

/// Entry function whose body is exactly `eval_code`
pub fn synthesize_entry(eval_code: &str) -> String {
    format!(
        "  (func {} (export \"{}\")\n{}\n  )\n",
        ENTRY_FUNCTION, ENTRY_EXPORT, eval_code
    )
}

/// Build the complete evaluation unit
pub fn assemble(sources: &[String], eval_code: &str) -> String {
    let mut imports = Vec::new();
    let mut definitions = Vec::new();

    for source in sources {
        match split_fields(source) {
            Some(fields) => {
                for field in fields {
                    if is_import(field) {
                        imports.push(field);
                    } else {
                        definitions.push(field);
                    }
                }
            }
            // Left untouched so the compiler reports where it breaks.
            None => definitions.push(source.as_str()),
        }
    }

    let mut unit = String::from("(module\n");
    unit.push_str(&hook_prelude());
    for field in imports.into_iter().chain(definitions) {
        unit.push_str("  ");
        unit.push_str(field.trim());
        unit.push('\n');
    }
    unit.push_str(&synthesize_entry(eval_code));
    unit.push_str(&format!("  (memory (export \"{}\") 1)\n)\n", MEMORY_EXPORT));
    unit
}

/// Split text into its top-level parenthesised fields.
///
/// Returns `None` for unbalanced text or stray tokens between fields.
/// Comments between fields are dropped, comments inside a field are kept.
pub fn split_fields(source: &str) -> Option<Vec<&str>> {
    let bytes = source.as_bytes();
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b';' if bytes.get(i + 1) == Some(&b';') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'(' if bytes.get(i + 1) == Some(&b';') => {
                i = skip_block_comment(bytes, i)?;
                continue;
            }
            b'"' if depth > 0 => {
                i = skip_string(bytes, i)?;
                continue;
            }
            b'(' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    fields.push(&source[start..=i]);
                }
            }
            b if b.is_ascii_whitespace() => {}
            _ if depth == 0 => return None,
            _ => {}
        }
        i += 1;
    }

    (depth == 0).then_some(fields)
}

fn skip_string(bytes: &[u8], open: usize) -> Option<usize> {
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Block comments nest
fn skip_block_comment(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'(', b';') => {
                depth += 1;
                i += 2;
            }
            (b';', b')') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => i += 1,
        }
    }
    None
}

fn is_import(field: &str) -> bool {
    field[1..]
        .trim_start()
        .strip_prefix("import")
        .and_then(|rest| rest.chars().next())
        .map_or(false, |c| c.is_whitespace() || c == '"')
}
