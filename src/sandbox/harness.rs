//! Language harnesses: static policy plus the wrapper program that feeds
//! parameters and inputs to generated code and reports its result.

use std::collections::BTreeMap;

use serde_json::Value;

use super::ExecutionJob;
use super::policy;

/// Prefix of the single stdout line carrying the JSON result.
pub const RESULT_MARKER: &str = "__MODELSMITH_RESULT__";

pub trait Harness: Send + Sync {
    fn language(&self) -> &str;

    /// Deterministic static check. `Err` carries the violation detail.
    fn check_policy(&self, code: &str) -> Result<(), String>;

    /// Full program source handed to the interpreter.
    fn render(&self, job: &ExecutionJob) -> String;

    /// Whether stderr shows the interpreter ran out of memory.
    fn is_memory_error(&self, stderr: &str) -> bool;

    /// The runtime guard's refusal, when stderr shows one.
    fn guard_violation(&self, _stderr: &str) -> Option<String> {
        None
    }
}

/// JSON object of the job's inputs, keyed by input name.
pub fn inputs_json(job: &ExecutionJob) -> Value {
    let map: BTreeMap<&str, Value> = job
        .inputs
        .iter()
        .map(|(name, table)| {
            (
                name.as_str(),
                serde_json::json!({"columns": table.columns, "rows": table.rows}),
            )
        })
        .collect();
    serde_json::json!(map)
}

/// Encode `value` as a Python string literal containing its JSON text.
/// A JSON string literal is also a valid Python string literal.
fn python_json_literal(value: &Value) -> String {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    serde_json::to_string(&text).unwrap_or_else(|_| "\"null\"".to_string())
}

/// Prefix of the message raised by the runtime guard.
pub const GUARD_MESSAGE: &str = "sandbox: ";

/// Runtime guard installed after the allowed modules are loaded and before
/// generated code runs. It is a `sys.addaudithook` hook, which cannot be
/// removed once added. It refuses:
///
/// * opening files for writing, or for reading outside the interpreter's
///   own install and module directories
/// * listing directories outside those roots
/// * sockets, subprocesses, `os.*` side effects, `ctypes`, `shutil` and the
///   network client modules
const PYTHON_GUARD: &str = r#"
def _ms_install_guard():
    import os, sys
    candidates = [sys.prefix, sys.base_prefix, sys.exec_prefix, sys.base_exec_prefix]
    candidates += [p for p in sys.path if p]
    roots = tuple(set(os.path.join(os.path.realpath(p), "") for p in candidates))
    write_flags = os.O_WRONLY | os.O_RDWR | os.O_APPEND | os.O_CREAT | os.O_TRUNC
    denied = (
        "socket.", "subprocess.", "os.", "shutil.", "ctypes.", "urllib.", "http.",
        "ftplib.", "smtplib.", "poplib.", "imaplib.", "nntplib.", "telnetlib.",
        "webbrowser.", "sqlite3.", "pty.", "fcntl.", "mmap.", "resource.", "signal.",
        "syslog.", "glob.", "tempfile.",
    )
    realpath, fsdecode = os.path.realpath, os.fsdecode

    def inside(path):
        try:
            return realpath(fsdecode(path)).startswith(roots)
        except Exception:
            return False

    def hook(event, args):
        if event == "open":
            path, mode, flags = args
            if isinstance(path, int):
                return
            writing = any(c in (mode or "") for c in "wax+") or bool((flags or 0) & write_flags)
            if not writing and inside(path):
                return
            raise PermissionError("sandbox: file access to %r is not allowed" % (path,))
        if event in ("os.listdir", "os.scandir"):
            if args and args[0] is not None and inside(args[0]):
                return
            raise PermissionError("sandbox: listing %r is not allowed" % (args[0] if args else None,))
        if event.startswith(denied):
            raise PermissionError("sandbox: %s is not allowed" % event)

    sys.addaudithook(hook)


_ms_install_guard()
del _ms_install_guard
"#;

pub struct PythonHarness;

impl PythonHarness {
    /// Import the allowed modules the code uses before the guard goes up, so
    /// their own start-up file access is not refused.
    fn preloads(code: &str) -> String {
        policy::imported_modules(code)
            .into_iter()
            .map(|module| {
                format!(
                    "try:\n    import {module}\nexcept ImportError:\n    pass\n",
                    module = module
                )
            })
            .collect()
    }
}

impl Harness for PythonHarness {
    fn language(&self) -> &str {
        "python"
    }

    fn check_policy(&self, code: &str) -> Result<(), String> {
        policy::check_python(code)
    }

    fn render(&self, job: &ExecutionJob) -> String {
        let parameters = Value::Object(job.parameters.clone());
        format!(
            r#"import json as _ms_json
_MS_PARAMETERS = _ms_json.loads({parameters})
_MS_INPUTS = _ms_json.loads({inputs})
{preloads}{guard}

{code}


def _ms_coerce(value):
    if hasattr(value, "tolist"):
        return value.tolist()
    return float(value)


_ms_result = forecast(_MS_PARAMETERS, _MS_INPUTS)
print("{marker}" + _ms_json.dumps(_ms_result, allow_nan=False, default=_ms_coerce), flush=True)
"#,
            parameters = python_json_literal(&parameters),
            inputs = python_json_literal(&inputs_json(job)),
            preloads = Self::preloads(&job.code),
            guard = PYTHON_GUARD,
            code = job.code,
            marker = RESULT_MARKER,
        )
    }

    fn is_memory_error(&self, stderr: &str) -> bool {
        stderr.contains("MemoryError")
    }

    fn guard_violation(&self, stderr: &str) -> Option<String> {
        stderr.lines().rev().find_map(|line| {
            line.strip_prefix("PermissionError: ")
                .filter(|rest| rest.starts_with(GUARD_MESSAGE))
                .map(str::to_string)
        })
    }
}
