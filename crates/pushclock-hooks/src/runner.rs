//! Hook Runner: context passing, result parsing and outcome classification.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use pushclock_core::config::HookRunnerConfig;
use pushclock_core::error::PushclockError;
use pushclock_core::types::{HookRunStatus, HookSpec, HookType, ScriptLanguage, Task};

use crate::sandbox::{self, SandboxSpec};

const RESULT_START: &str = "__HOOK_RESULT_START__";
const RESULT_END: &str = "__HOOK_RESULT_END__";
const ERROR_START: &str = "__HOOK_ERROR_START__";
const ERROR_END: &str = "__HOOK_ERROR_END__";
const CONTEXT_FILE: &str = "context.json";

/// Firing-specific data handed to after-hooks.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub send_results: Option<Value>,
    pub error: Option<String>,
}

impl HookContext {
    pub fn with_results(send_results: Value) -> Self {
        Self {
            send_results: Some(send_results),
            error: None,
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            send_results: None,
            error: Some(error.into()),
        }
    }
}

/// What happened when a hook ran.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub success: bool,
    pub skipped: bool,
    pub timed_out: bool,
    pub output: String,
    pub error: Option<String>,
    pub data: Option<Value>,
    pub duration: Duration,
}

impl HookOutcome {
    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }

    fn failed(error: String, duration: Duration) -> Self {
        Self {
            error: Some(error),
            duration,
            ..Default::default()
        }
    }

    pub fn status(&self) -> HookRunStatus {
        if self.timed_out {
            HookRunStatus::Timeout
        } else if self.success {
            HookRunStatus::Success
        } else {
            HookRunStatus::Failed
        }
    }
}

/// Runs task hooks in sandboxed subprocesses.
#[derive(Debug, Clone)]
pub struct HookRunner {
    config: HookRunnerConfig,
}

impl HookRunner {
    pub fn new(config: HookRunnerConfig) -> Self {
        Self { config }
    }

    /// Run the task's hook for `hook_type`, or skip if none is configured.
    pub async fn run(&self, hook_type: HookType, task: &Task, context: HookContext) -> HookOutcome {
        match task.hook(hook_type) {
            Some(spec) => self.run_spec(spec, hook_type, task, context).await,
            None => HookOutcome::skipped(),
        }
    }

    /// Run one hook spec regardless of where it came from.
    pub async fn run_spec(&self, spec: &HookSpec, hook_type: HookType, task: &Task, context: HookContext) -> HookOutcome {
        let start = Instant::now();
        let timeout_secs = spec.timeout.unwrap_or(self.config.default_timeout_secs).max(1);

        let sandbox_spec = match self.prepare(spec, hook_type, task, &context, timeout_secs) {
            Ok(s) => s,
            Err(e) => return HookOutcome::failed(e.to_string(), start.elapsed()),
        };

        tracing::debug!("🪝 Running {hook_type} hook ({}) for task {}", spec.language, task.id);
        let output = match sandbox::run(&sandbox_spec).await {
            Ok(output) => output,
            Err(PushclockError::HookTimeout(secs)) => {
                tracing::warn!("⏱️ {hook_type} hook for task {} timed out after {secs}s", task.id);
                return HookOutcome {
                    timed_out: true,
                    ..HookOutcome::failed(PushclockError::HookTimeout(secs).to_string(), start.elapsed())
                };
            }
            Err(e) => {
                tracing::warn!("❌ {hook_type} hook for task {} could not run: {e}", task.id);
                return HookOutcome::failed(e.to_string(), start.elapsed());
            }
        };

        let (stdout, data) = extract_block(&output.stdout, RESULT_START, RESULT_END);
        let data = data.and_then(|raw| match serde_json::from_str::<Value>(raw.trim()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("🪝 Ignoring malformed hook result for task {}: {e}", task.id);
                None
            }
        });
        let output_text = self.truncate_output(stdout.trim());

        if output.success() {
            tracing::info!("✅ {hook_type} hook for task {} finished in {:?}", task.id, output.elapsed);
            HookOutcome {
                success: true,
                output: output_text,
                data,
                duration: start.elapsed(),
                ..Default::default()
            }
        } else {
            let (stderr, signaled) = extract_block(&output.stderr, ERROR_START, ERROR_END);
            let error = match signaled {
                Some(block) => block.trim().to_string(),
                None if !stderr.trim().is_empty() => stderr.trim().to_string(),
                None => format!("exit code {}", output.exit_code.map_or("none".into(), |c| c.to_string())),
            };
            tracing::warn!("❌ {hook_type} hook for task {} failed: {error}", task.id);
            HookOutcome {
                output: output_text,
                error: Some(self.truncate_output(&error)),
                duration: start.elapsed(),
                ..Default::default()
            }
        }
    }

    /// First characters of a script, as stored on the hook log.
    pub fn snapshot(&self, script: &str) -> String {
        truncate(script, self.config.max_script_snapshot_chars)
    }

    fn truncate_output(&self, text: &str) -> String {
        truncate(text, self.config.max_output_chars)
    }

    fn prepare(
        &self,
        spec: &HookSpec,
        hook_type: HookType,
        task: &Task,
        context: &HookContext,
        timeout_secs: u64,
    ) -> pushclock_core::Result<SandboxSpec> {
        let timestamp = Utc::now().to_rfc3339();
        let mut ctx = serde_json::json!({
            "task_id": task.id,
            "task": task,
            "hook_type": hook_type.as_str(),
            "timestamp": timestamp,
        });
        if let Some(results) = &context.send_results {
            ctx["send_results"] = results.clone();
        }
        if let Some(error) = &context.error {
            ctx["error"] = error.clone().into();
        }
        let context_json = serde_json::to_string(&ctx)?;
        let timeout = Duration::from_secs(timeout_secs);

        let sandbox_spec = match spec.language {
            ScriptLanguage::Python => SandboxSpec {
                program: self.config.python_bin.clone(),
                args: vec!["hook_wrapper.py".into()],
                files: vec![
                    (CONTEXT_FILE.into(), context_json),
                    ("hook_wrapper.py".into(), python_wrapper(&spec.script)),
                ],
                env: vec![("PYTHONIOENCODING".into(), "utf-8".into())],
                timeout,
            },
            ScriptLanguage::Shell => {
                let send_results = context
                    .send_results
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".into());
                SandboxSpec {
                    program: self.config.shell_bin.clone(),
                    args: vec!["hook_script.sh".into()],
                    files: vec![
                        (CONTEXT_FILE.into(), context_json),
                        ("hook_script.sh".into(), spec.script.clone()),
                    ],
                    env: vec![
                        ("HOOK_TASK_ID".into(), task.id.to_string()),
                        ("HOOK_TYPE".into(), hook_type.as_str().into()),
                        ("HOOK_TIMESTAMP".into(), timestamp),
                        ("HOOK_TASK_JSON".into(), serde_json::to_string(task)?),
                        ("HOOK_SEND_RESULTS_JSON".into(), send_results),
                        ("HOOK_ERROR".into(), context.error.clone().unwrap_or_default()),
                        ("HOOK_CONTEXT_FILE".into(), CONTEXT_FILE.into()),
                    ],
                    timeout,
                }
            }
        };
        Ok(sandbox_spec)
    }
}

/// Wrap a user script so it sees the context as variables and reports
/// its result or exception through marker blocks.
fn python_wrapper(script: &str) -> String {
    let body: String = script
        .lines()
        .map(|line| format!("    {line}\n"))
        .collect();
    format!(
        r#"import json
import sys
import traceback

with open('{CONTEXT_FILE}', 'r', encoding='utf-8') as _ctx_file:
    context = json.load(_ctx_file)

task_id = context.get('task_id')
task = context.get('task')
hook_type = context.get('hook_type')
send_results = context.get('send_results')
error = context.get('error')
result_data = {{}}

try:
{body}    pass
except Exception:
    print('{ERROR_START}', file=sys.stderr)
    traceback.print_exc()
    print('{ERROR_END}', file=sys.stderr)
    sys.exit(1)

print('{RESULT_START}')
print(json.dumps(result_data, ensure_ascii=False, default=str))
print('{RESULT_END}')
"#
    )
}

/// Split the last `start..end` marker block out of `text`.
/// Returns the text without the block, and the block contents if found.
fn extract_block<'a>(text: &'a str, start: &str, end: &str) -> (String, Option<&'a str>) {
    let Some(s) = text.rfind(start) else {
        return (text.to_string(), None);
    };
    let inner_start = s + start.len();
    let Some(rel_end) = text[inner_start..].find(end) else {
        return (text.to_string(), None);
    };
    let inner_end = inner_start + rel_end;
    let rest = format!("{}{}", &text[..s], &text[inner_end + end.len()..]);
    (rest, Some(&text[inner_start..inner_end]))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushclock_core::types::{ChannelConfig, Delivery, HooksConfig};

    fn task_with(hook_type: HookType, language: ScriptLanguage, script: &str, timeout: Option<u64>) -> Task {
        let mut hooks = HooksConfig::default();
        hooks.insert(
            hook_type,
            HookSpec {
                enabled: true,
                language,
                script: script.into(),
                timeout,
            },
        );
        let mut task = Task::once(1, "Backup", "done", Delivery::single("webhook", ChannelConfig::new()), Utc::now())
            .with_hooks(hooks);
        task.id = 42;
        task
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_no_hook_is_skipped() {
        let runner = HookRunner::new(HookRunnerConfig::default());
        let task = task_with(HookType::AfterSuccess, ScriptLanguage::Shell, "exit 1", None);
        let outcome = runner.run(HookType::BeforeExecute, &task, HookContext::default()).await;
        assert!(outcome.skipped);
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_disabled_hook_is_skipped() {
        let runner = HookRunner::new(HookRunnerConfig::default());
        let mut task = task_with(HookType::BeforeExecute, ScriptLanguage::Shell, "exit 1", None);
        if let Some(hooks) = task.hooks_config.as_mut() {
            hooks.0.values_mut().for_each(|spec| spec.enabled = false);
        }
        let outcome = runner.run(HookType::BeforeExecute, &task, HookContext::default()).await;
        assert!(outcome.skipped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_sees_context_env() {
        let runner = HookRunner::new(HookRunnerConfig::default());
        let script = "echo \"$HOOK_TYPE:$HOOK_TASK_ID:$HOOK_ERROR\"\ntest -f \"$HOOK_CONTEXT_FILE\"";
        let task = task_with(HookType::AfterFailure, ScriptLanguage::Shell, script, None);
        let outcome = runner
            .run(HookType::AfterFailure, &task, HookContext::with_error("channel down"))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.output, "after_failure:42:channel down");
        assert_eq!(outcome.status(), HookRunStatus::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_result_block_parsed() {
        let runner = HookRunner::new(HookRunnerConfig::default());
        let script = "echo before\necho __HOOK_RESULT_START__\necho '{\"archived\": 3}'\necho __HOOK_RESULT_END__";
        let task = task_with(HookType::AfterSuccess, ScriptLanguage::Shell, script, None);
        let outcome = runner
            .run(HookType::AfterSuccess, &task, HookContext::with_results(serde_json::json!({"webhook": {"status": "sent"}})))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(serde_json::json!({"archived": 3})));
        assert_eq!(outcome.output, "before");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_failure_prefers_error_block() {
        let runner = HookRunner::new(HookRunnerConfig::default());
        let script = "echo noise >&2\necho __HOOK_ERROR_START__ >&2\necho 'disk full' >&2\necho __HOOK_ERROR_END__ >&2\nexit 2";
        let task = task_with(HookType::BeforeExecute, ScriptLanguage::Shell, script, None);
        let outcome = runner.run(HookType::BeforeExecute, &task, HookContext::default()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("disk full"));
        assert_eq!(outcome.status(), HookRunStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_outcome() {
        let runner = HookRunner::new(HookRunnerConfig::default());
        let task = task_with(HookType::BeforeExecute, ScriptLanguage::Shell, "sleep 10", Some(1));
        let outcome = runner.run(HookType::BeforeExecute, &task, HookContext::default()).await;
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Script timeout after 1 seconds"));
        assert_eq!(outcome.status(), HookRunStatus::Timeout);
    }

    #[tokio::test]
    async fn test_python_variables_and_result() {
        if !python_available() {
            return;
        }
        let runner = HookRunner::new(HookRunnerConfig::default());
        let script = "result_data['id'] = task_id\nresult_data['title'] = task['title']\nresult_data['hook'] = hook_type";
        let task = task_with(HookType::AfterSuccess, ScriptLanguage::Python, script, None);
        let outcome = runner.run(HookType::AfterSuccess, &task, HookContext::default()).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(
            outcome.data,
            Some(serde_json::json!({"id": 42, "title": "Backup", "hook": "after_success"}))
        );
    }

    #[tokio::test]
    async fn test_python_exception_reported() {
        if !python_available() {
            return;
        }
        let runner = HookRunner::new(HookRunnerConfig::default());
        let task = task_with(HookType::AfterFailure, ScriptLanguage::Python, "raise ValueError('bad ' + error)", None);
        let outcome = runner
            .run(HookType::AfterFailure, &task, HookContext::with_error("news"))
            .await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap_or_default();
        assert!(error.contains("ValueError: bad news"), "{error}");
    }

    #[test]
    fn test_extract_block() {
        let (rest, block) = extract_block("a\n__S__x__E__\nb", "__S__", "__E__");
        assert_eq!(block, Some("x"));
        assert_eq!(rest, "a\n\nb");
        let (rest, block) = extract_block("no markers", "__S__", "__E__");
        assert_eq!(block, None);
        assert_eq!(rest, "no markers");
    }

    #[test]
    fn test_snapshot_truncates_by_chars() {
        let runner = HookRunner::new(HookRunnerConfig {
            max_script_snapshot_chars: 3,
            ..Default::default()
        });
        assert_eq!(runner.snapshot("星期一二三"), "星期一");
    }
}
