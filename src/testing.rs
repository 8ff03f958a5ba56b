//! Shared test doubles: a scripted completion service and a POSIX shell
//! harness so sandbox and pipeline tests run without Python or a network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{CompletionRequest, CompletionService, TransportError};
use crate::sandbox::{
    ExecutionJob, Harness, Limits, ProcessBackend, RESULT_MARKER, SandboxExecutor,
};

/// Replays a fixed list of replies, one per call. Once the script runs out
/// every call fails fatally.
pub struct ScriptedCompletionService {
    replies: Mutex<VecDeque<Result<String, TransportError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletionService {
    pub fn new(replies: Vec<Result<String, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Fatal("script exhausted".into())))
    }
}

/// Wrap code in a fenced block the way a model reply would.
pub fn fenced(code: &str) -> String {
    format!("Here is the model:\n\n```python\n{}\n```\n", code)
}

/// Runs `forecast()` shell functions. Scalar parameters are exposed as
/// `P_<name>` variables; the function prints the result JSON.
pub struct ShellHarness;

const SHELL_FORBIDDEN: &[&str] = &["curl", "wget", "rm -"];

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

impl Harness for ShellHarness {
    fn language(&self) -> &str {
        "sh"
    }

    fn check_policy(&self, code: &str) -> Result<(), String> {
        if let Some(word) = SHELL_FORBIDDEN.iter().find(|w| code.contains(**w)) {
            return Err(format!("use of '{}' is not allowed", word));
        }
        if !code.contains("forecast()") {
            return Err("missing entry point 'forecast()'".to_string());
        }
        Ok(())
    }

    fn render(&self, job: &ExecutionJob) -> String {
        let mut program = String::new();
        for (key, value) in &job.parameters {
            if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                continue;
            }
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            program.push_str(&format!("P_{}={}\n", key, shell_quote(&text)));
        }
        program.push_str(&job.code);
        program.push_str(&format!(
            "\n_ms_result=$(forecast) || exit $?\nprintf '%s%s\\n' '{}' \"$_ms_result\"\n",
            RESULT_MARKER
        ));
        program
    }

    fn is_memory_error(&self, stderr: &str) -> bool {
        stderr.contains("Cannot allocate memory")
    }
}

pub fn test_limits(timeout: Duration) -> Limits {
    Limits {
        timeout,
        memory_bytes: 0,
        max_output_bytes: 64 * 1024,
        cpus: 1.0,
        pids_limit: 64,
    }
}

/// Executor running shell programs through `sh -s`.
pub fn shell_executor(timeout: Duration) -> SandboxExecutor {
    let backend = ProcessBackend::new(vec!["sh".into(), "-s".into()], "/usr/bin:/bin").unwrap();
    SandboxExecutor::new(
        Arc::new(ShellHarness),
        Arc::new(backend),
        test_limits(timeout),
    )
}

/// Compounding customer growth times revenue per customer, one point per
/// period. Reads the revenue default parameters.
pub fn growth_series_code() -> String {
    r#"forecast() {
  awk -v n="$P_periods" -v c="$P_initial_customers" -v arpc="$P_average_revenue_per_customer" -v g="$P_monthly_growth_rate" 'BEGIN {
    printf "{\"series\":["
    for (i = 0; i < n; i++) {
      if (i > 0) printf ","
      printf "%.4f", c * arpc * (1 + g) ^ i
    }
    printf "]}"
  }'
}"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Executor;
    use modelsmith_common::ExecutionStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parameters_reach_the_program() {
        let executor = shell_executor(Duration::from_secs(5));
        let job = ExecutionJob {
            code: "forecast() {\n  echo \"{\\\"series\\\":[$P_periods]}\"\n}\n".into(),
            parameters: serde_json::from_value(json!({"periods": 7, "bad key": 1})).unwrap(),
            inputs: BTreeMap::new(),
        };
        let result = executor.execute(&job).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result);
        assert_eq!(result.output.unwrap().series().unwrap(), &[7.0]);
    }
}
