//! Sandboxed executor.
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `policy`   | Static allow-list check for generated Python            |
//! | `harness`  | Per-language wrapper program and result marker          |
//! | `process`  | Local interpreter backend (rlimits, network namespace)  |
//! | `docker`   | Throwaway container backend via bollard                 |
//!
//! The executor never returns `Err` for something the generated code did:
//! policy rejections, crashes, timeouts and malformed output all become a
//! classified `ExecutionResult`. `Err` is reserved for infrastructure
//! failure (no interpreter, Docker daemon down).

pub mod docker;
pub mod harness;
pub mod policy;
pub mod process;

pub use docker::DockerBackend;
pub use harness::{Harness, PythonHarness, RESULT_MARKER};
pub use process::ProcessBackend;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modelsmith_common::{DataTable, ExecutionResult, ExecutionStatus, ForecastOutput};
use serde_json::{Map, Value};

use crate::config::{SandboxBackendKind, SandboxSection};
use crate::errors::ExecutionError;

/// How much of stderr is kept as runtime error detail.
const STDERR_TAIL_CHARS: usize = 2000;

/// One execution request. Inputs are fetched before execution and shared
/// read-only; generated code never fetches data itself.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub code: String,
    pub parameters: Map<String, Value>,
    pub inputs: BTreeMap<String, Arc<DataTable>>,
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub timeout: Duration,
    /// Zero disables the memory ceiling.
    pub memory_bytes: u64,
    pub max_output_bytes: usize,
    pub cpus: f64,
    pub pids_limit: i64,
}

impl Limits {
    pub fn from_config(config: &SandboxSection) -> Self {
        Self {
            timeout: config.timeout(),
            memory_bytes: config.memory_mb * 1024 * 1024,
            max_output_bytes: config.max_output_bytes,
            cpus: config.cpus,
            pids_limit: config.pids_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i64),
    Signaled(i32),
    TimedOut,
    OutOfMemory,
}

/// What a backend observed, before classification.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub exit: ExitKind,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Run `program` in a fresh, isolated interpreter.
    async fn run(&self, program: &str, limits: &Limits) -> Result<RawOutput, ExecutionError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &ExecutionJob) -> Result<ExecutionResult, ExecutionError>;

    fn limits(&self) -> &Limits;
}

pub struct SandboxExecutor {
    harness: Arc<dyn Harness>,
    backend: Arc<dyn SandboxBackend>,
    limits: Limits,
}

impl SandboxExecutor {
    pub fn new(harness: Arc<dyn Harness>, backend: Arc<dyn SandboxBackend>, limits: Limits) -> Self {
        Self {
            harness,
            backend,
            limits,
        }
    }

    /// Python executor on the configured backend.
    pub fn from_config(config: &SandboxSection) -> Result<Self, ExecutionError> {
        let backend: Arc<dyn SandboxBackend> = match config.backend {
            SandboxBackendKind::Process => Arc::new(
                ProcessBackend::new(config.interpreter.clone(), config.path_env.clone())?
                    .with_network_isolation(config.isolate_network),
            ),
            SandboxBackendKind::Docker => Arc::new(DockerBackend::connect(config.image.clone())?),
        };
        Ok(Self::new(
            Arc::new(PythonHarness),
            backend,
            Limits::from_config(config),
        ))
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    async fn execute(&self, job: &ExecutionJob) -> Result<ExecutionResult, ExecutionError> {
        if let Err(detail) = self.harness.check_policy(&job.code) {
            tracing::info!(%detail, "Generated code rejected by policy");
            return Ok(ExecutionResult::failure(
                ExecutionStatus::PolicyViolation,
                detail,
                String::new(),
                0,
            ));
        }

        let program = self.harness.render(job);
        let raw = self.backend.run(&program, &self.limits).await?;
        let result = classify(&raw, self.harness.as_ref(), &self.limits);
        tracing::info!(
            backend = self.backend.name(),
            status = %result.status,
            duration_ms = result.duration_ms,
            "Sandbox execution finished"
        );
        Ok(result)
    }

    fn limits(&self) -> &Limits {
        &self.limits
    }
}

/// Error that aborts a request for a non-success result, `None` on success.
pub fn rejection(result: &ExecutionResult, limits: &Limits) -> Option<ExecutionError> {
    let detail = || result.error.clone().unwrap_or_default();
    match result.status {
        ExecutionStatus::Success => None,
        ExecutionStatus::Timeout => Some(ExecutionError::Timeout {
            limit_ms: limits.timeout.as_millis() as u64,
        }),
        ExecutionStatus::PolicyViolation => {
            Some(ExecutionError::PolicyViolation { detail: detail() })
        }
        ExecutionStatus::RuntimeError => Some(ExecutionError::Runtime { detail: detail() }),
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim_end().to_string();
    }
    text.chars()
        .skip(count - max_chars)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Turn raw backend output into a classified result.
pub fn classify(raw: &RawOutput, harness: &dyn Harness, limits: &Limits) -> ExecutionResult {
    let fail = |status, detail: String, stdout: String| {
        ExecutionResult::failure(status, detail, stdout, raw.duration_ms)
    };

    match raw.exit {
        ExitKind::TimedOut => {
            return fail(
                ExecutionStatus::Timeout,
                format!("exceeded the {}ms limit", limits.timeout.as_millis()),
                String::new(),
            );
        }
        ExitKind::OutOfMemory => {
            return fail(
                ExecutionStatus::PolicyViolation,
                "memory limit exceeded".to_string(),
                String::new(),
            );
        }
        _ => {}
    }

    let mut results = Vec::new();
    let mut other_lines = Vec::new();
    for line in raw.stdout.lines() {
        match line.strip_prefix(RESULT_MARKER) {
            Some(payload) => results.push(payload),
            None => other_lines.push(line),
        }
    }
    let stdout = other_lines.join("\n");

    if raw.exit != ExitKind::Exited(0) && harness.is_memory_error(&raw.stderr) {
        return fail(
            ExecutionStatus::PolicyViolation,
            "memory limit exceeded".to_string(),
            stdout,
        );
    }

    if raw.exit != ExitKind::Exited(0)
        && let Some(detail) = harness.guard_violation(&raw.stderr)
    {
        return fail(ExecutionStatus::PolicyViolation, detail, stdout);
    }

    match raw.exit {
        ExitKind::Exited(code) if code != 0 => {
            let detail = match tail(&raw.stderr, STDERR_TAIL_CHARS) {
                t if t.is_empty() => format!("exited with code {}", code),
                t => t,
            };
            return fail(ExecutionStatus::RuntimeError, detail, stdout);
        }
        ExitKind::Signaled(signal) => {
            return fail(
                ExecutionStatus::RuntimeError,
                format!("terminated by signal {}", signal),
                stdout,
            );
        }
        _ => {}
    }

    let payload = match results.as_slice() {
        [only] => *only,
        [] if raw.stdout_truncated => {
            return fail(
                ExecutionStatus::PolicyViolation,
                format!("output exceeded {} bytes", limits.max_output_bytes),
                stdout,
            );
        }
        [] => {
            return fail(
                ExecutionStatus::PolicyViolation,
                "no result was produced".to_string(),
                stdout,
            );
        }
        many => {
            return fail(
                ExecutionStatus::PolicyViolation,
                format!("{} results were produced, expected exactly one", many.len()),
                stdout,
            );
        }
    };

    if payload.len() > limits.max_output_bytes {
        return fail(
            ExecutionStatus::PolicyViolation,
            format!("result exceeded {} bytes", limits.max_output_bytes),
            stdout,
        );
    }

    let output: ForecastOutput = match serde_json::from_str(payload) {
        Ok(output) => output,
        Err(e) => {
            return fail(
                ExecutionStatus::PolicyViolation,
                format!(
                    "result must be {{\"series\": [numbers]}} or {{\"table\": {{columns, rows}}}}: {}",
                    e
                ),
                stdout,
            );
        }
    };
    if let ForecastOutput::Table { table, .. } = &output
        && let Err(e) = table.validate()
    {
        return fail(ExecutionStatus::PolicyViolation, e, stdout);
    }
    if output.is_empty() {
        return fail(
            ExecutionStatus::PolicyViolation,
            "result is empty".to_string(),
            stdout,
        );
    }

    ExecutionResult::success(output, stdout, raw.duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ShellHarness;

    fn limits() -> Limits {
        Limits {
            timeout: Duration::from_millis(1000),
            memory_bytes: 0,
            max_output_bytes: 4096,
            cpus: 1.0,
            pids_limit: 64,
        }
    }

    fn raw(exit: ExitKind, stdout: &str, stderr: &str) -> RawOutput {
        RawOutput {
            exit,
            stdout: stdout.to_string(),
            stdout_truncated: false,
            stderr: stderr.to_string(),
            duration_ms: 7,
        }
    }

    fn classify_py(raw: &RawOutput) -> ExecutionResult {
        classify(raw, &PythonHarness, &limits())
    }

    fn marker(json: &str) -> String {
        format!("{}{}", RESULT_MARKER, json)
    }

    #[test]
    fn test_classify_success_series() {
        let out = format!("debug line\n{}\n", marker(r#"{"series": [1, 2, 3]}"#));
        let result = classify_py(&raw(ExitKind::Exited(0), &out, ""));
        assert!(result.is_success());
        assert_eq!(result.output.unwrap().len(), 3);
        assert_eq!(result.stdout, "debug line");
    }

    #[test]
    fn test_classify_timeout() {
        let result = classify_py(&raw(ExitKind::TimedOut, "", ""));
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.output.is_none());
    }

    #[test]
    fn test_classify_runtime_error_keeps_stderr_tail() {
        let result = classify_py(&raw(
            ExitKind::Exited(1),
            "",
            "Traceback (most recent call last):\nZeroDivisionError: division by zero\n",
        ));
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.error.unwrap().ends_with("division by zero"));
    }

    #[test]
    fn test_classify_memory_error_is_policy_violation() {
        let result = classify_py(&raw(ExitKind::Exited(1), "", "MemoryError\n"));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
        let result = classify_py(&raw(ExitKind::OutOfMemory, "", ""));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
    }

    #[test]
    fn test_classify_guard_refusal_is_policy_violation() {
        let stderr = "Traceback (most recent call last):\nPermissionError: sandbox: socket.connect is not allowed\n";
        let result = classify_py(&raw(ExitKind::Exited(1), "", stderr));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
        assert_eq!(result.error.unwrap(), "sandbox: socket.connect is not allowed");
    }

    #[test]
    fn test_classify_missing_or_repeated_marker() {
        let result = classify_py(&raw(ExitKind::Exited(0), "just text\n", ""));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
        let out = format!("{}\n{}\n", marker(r#"{"series":[1]}"#), marker(r#"{"series":[2]}"#));
        let result = classify_py(&raw(ExitKind::Exited(0), &out, ""));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
    }

    #[test]
    fn test_classify_wrong_shape() {
        let out = marker(r#"{"values": [1, 2]}"#);
        let result = classify_py(&raw(ExitKind::Exited(0), &out, ""));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
        let out = marker(r#"{"series": []}"#);
        let result = classify_py(&raw(ExitKind::Exited(0), &out, ""));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
    }

    #[test]
    fn test_classify_oversized_result() {
        let big: Vec<String> = (0..2000).map(|i| i.to_string()).collect();
        let out = marker(&format!(r#"{{"series": [{}]}}"#, big.join(",")));
        let result = classify_py(&raw(ExitKind::Exited(0), &out, ""));
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
        assert!(result.error.unwrap().contains("exceeded"));
    }

    #[test]
    fn test_rejection_maps_status() {
        assert!(rejection(&classify_py(&raw(ExitKind::TimedOut, "", "")), &limits()).is_some_and(
            |e| matches!(e, ExecutionError::Timeout { limit_ms: 1000 })
        ));
        let ok = classify_py(&raw(ExitKind::Exited(0), &marker(r#"{"series":[1]}"#), ""));
        assert!(rejection(&ok, &limits()).is_none());
        let crashed = classify_py(&raw(ExitKind::Exited(1), "", "boom"));
        assert!(matches!(
            rejection(&crashed, &limits()),
            Some(ExecutionError::Runtime { detail }) if detail == "boom"
        ));
    }

    #[test]
    fn test_tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab\n", 10), "ab");
    }

    #[tokio::test]
    async fn test_policy_violation_never_runs() {
        let backend = Arc::new(ProcessBackend::new(vec!["/nonexistent".into()], "/usr/bin").unwrap());
        let executor = SandboxExecutor::new(Arc::new(PythonHarness), backend, limits());
        let job = ExecutionJob {
            code: "import os\ndef forecast(p, i):\n    return {}\n".into(),
            parameters: Map::new(),
            inputs: BTreeMap::new(),
        };
        // A missing interpreter would be Err(Unavailable) if anything ran.
        let result = executor.execute(&job).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::PolicyViolation);
    }

    #[cfg(unix)]
    mod shell {
        use super::*;
        use crate::testing::{growth_series_code, shell_executor};
        use serde_json::json;

        fn job(code: &str) -> ExecutionJob {
            ExecutionJob {
                code: code.to_string(),
                parameters: serde_json::from_value(json!({
                    "periods": 12,
                    "initial_customers": 100,
                    "average_revenue_per_customer": 100,
                    "monthly_growth_rate": 0.05
                }))
                .unwrap(),
                inputs: BTreeMap::new(),
            }
        }

        #[tokio::test]
        async fn test_success_end_to_end() {
            let executor = shell_executor(Duration::from_secs(5));
            let result = executor.execute(&job(&growth_series_code())).await.unwrap();
            assert!(result.is_success(), "{:?}", result);
            let series = result.output.unwrap().series().unwrap().to_vec();
            assert_eq!(series.len(), 12);
            assert!(series.windows(2).all(|w| w[1] > w[0]));
        }

        #[tokio::test]
        async fn test_same_code_same_classification() {
            let executor = shell_executor(Duration::from_secs(5));
            let a = executor.execute(&job(&growth_series_code())).await.unwrap();
            let b = executor.execute(&job(&growth_series_code())).await.unwrap();
            assert!(a.same_classification(&b));
        }

        #[tokio::test]
        async fn test_timeout_is_classified() {
            let executor = shell_executor(Duration::from_millis(200));
            let code = "forecast() {\n  sleep 5\n  echo '{\"series\":[1]}'\n}\n";
            let result = executor.execute(&job(code)).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Timeout);
        }

        #[tokio::test]
        async fn test_runtime_error_is_classified() {
            let executor = shell_executor(Duration::from_secs(5));
            let code = "forecast() {\n  echo 'bad input' >&2\n  exit 2\n}\n";
            let result = executor.execute(&job(code)).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::RuntimeError);
            assert!(result.error.unwrap().contains("bad input"));
        }

        #[tokio::test]
        async fn test_harness_policy_applies() {
            let executor = shell_executor(Duration::from_secs(5));
            let code = "forecast() {\n  curl http://example.com\n}\n";
            let result = executor.execute(&job(code)).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::PolicyViolation);
        }

        #[test]
        fn test_shell_harness_language() {
            assert_eq!(ShellHarness.language(), "sh");
        }
    }

    /// Real interpreter runs; each test returns early when `python3` is not
    /// installed.
    #[cfg(unix)]
    mod python {
        use super::*;
        use serde_json::json;

        const GROWTH: &str = "\
import math

def forecast(parameters, inputs):
    n = parameters['periods']
    base = parameters['initial_customers'] * parameters['average_revenue_per_customer']
    rate = parameters['monthly_growth_rate']
    return {'series': [base * math.pow(1 + rate, i) for i in range(n)]}
";

        fn python_available() -> bool {
            std::process::Command::new("python3")
                .arg("--version")
                .output()
                .is_ok_and(|out| out.status.success())
        }

        fn backend() -> Arc<ProcessBackend> {
            Arc::new(
                ProcessBackend::new(
                    vec!["python3".into(), "-I".into(), "-".into()],
                    "/usr/local/bin:/usr/bin:/bin",
                )
                .unwrap(),
            )
        }

        fn executor(timeout: Duration) -> SandboxExecutor {
            let limits = Limits {
                timeout,
                ..limits()
            };
            SandboxExecutor::new(Arc::new(PythonHarness), backend(), limits)
        }

        fn job(code: &str) -> ExecutionJob {
            ExecutionJob {
                code: code.to_string(),
                parameters: serde_json::from_value(json!({
                    "periods": 36,
                    "initial_customers": 100,
                    "average_revenue_per_customer": 50,
                    "monthly_growth_rate": 0.05
                }))
                .unwrap(),
                inputs: BTreeMap::new(),
            }
        }

        #[tokio::test]
        async fn test_growth_model_runs() {
            if !python_available() {
                return;
            }
            let result = executor(Duration::from_secs(10)).execute(&job(GROWTH)).await.unwrap();
            assert!(result.is_success(), "{:?}", result);
            let series = result.output.unwrap().series().unwrap().to_vec();
            assert_eq!(series.len(), 36);
            assert!((series[0] - 5000.0).abs() < 1e-6);
            assert!(series.windows(2).all(|w| w[1] > w[0]));
        }

        #[tokio::test]
        async fn test_busy_loop_times_out() {
            if !python_available() {
                return;
            }
            let code = "def forecast(parameters, inputs):\n    while True:\n        pass\n";
            let result = executor(Duration::from_millis(500)).execute(&job(code)).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Timeout);
        }

        #[tokio::test]
        async fn test_import_after_separator_is_refused() {
            if !python_available() {
                return;
            }
            let code = format!("x = 0; import os\n{}", GROWTH);
            let result = executor(Duration::from_secs(10)).execute(&job(&code)).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::PolicyViolation);
        }

        #[tokio::test]
        async fn test_runtime_guard_refuses_file_reads() {
            if !python_available() {
                return;
            }
            // Rendered directly, so only the runtime guard stands in the way.
            let code = "def forecast(parameters, inputs):\n    with open('/etc/passwd') as f:\n        return {'series': [len(f.read())]}\n";
            let program = PythonHarness.render(&job(code));
            let limits = Limits {
                timeout: Duration::from_secs(10),
                ..limits()
            };
            let raw = backend().run(&program, &limits).await.unwrap();
            let result = classify(&raw, &PythonHarness, &limits);
            assert_eq!(result.status, ExecutionStatus::PolicyViolation, "{:?}", result);
            assert!(result.error.unwrap().contains("/etc/passwd"));
        }

        #[tokio::test]
        async fn test_runtime_guard_refuses_file_writes() {
            if !python_available() {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let target = dir.path().join("leak.txt");
            let code = format!(
                "def forecast(parameters, inputs):\n    with open({:?}, 'w') as f:\n        f.write('x')\n    return {{'series': [1]}}\n",
                target.display().to_string()
            );
            let program = PythonHarness.render(&job(&code));
            let limits = Limits {
                timeout: Duration::from_secs(10),
                ..limits()
            };
            let raw = backend().run(&program, &limits).await.unwrap();
            let result = classify(&raw, &PythonHarness, &limits);
            assert_eq!(result.status, ExecutionStatus::PolicyViolation, "{:?}", result);
            assert!(!target.exists());
        }
    }
}
