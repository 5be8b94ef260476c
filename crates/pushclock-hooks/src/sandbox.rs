//! Isolated subprocess execution.
//!
//! Every run gets a fresh temporary directory as its working directory. The
//! directory is owned by a `TempDir` guard, so it is removed on every exit
//! path: success, script error, spawn failure and timeout alike.

use std::process::Stdio;
use std::time::{Duration, Instant};

use pushclock_core::error::{PushclockError, Result};

/// What to run and with which inputs.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Files written into the working directory before spawning.
    pub files: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `spec` to completion or until its timeout elapses.
///
/// A timeout yields `HookTimeout` and the child is killed when its handle
/// is dropped.
pub async fn run(spec: &SandboxSpec) -> Result<SandboxOutput> {
    let workdir = tempfile::Builder::new().prefix("pushclock-hook-").tempdir()?;
    for (name, contents) in &spec.files {
        tokio::fs::write(workdir.path().join(name), contents).await?;
    }

    let start = Instant::now();
    let child = tokio::process::Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(workdir.path())
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PushclockError::HookFailure(format!("Failed to start {}: {e}", spec.program)))?;

    let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
        Err(_) => {
            tracing::warn!("⏱️ {} killed after {:?}", spec.program, spec.timeout);
            return Err(PushclockError::HookTimeout(spec.timeout.as_secs()));
        }
        Ok(result) => result?,
    };

    Ok(SandboxOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        elapsed: start.elapsed(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str, timeout_secs: u64) -> SandboxSpec {
        SandboxSpec {
            program: "bash".into(),
            args: vec!["script.sh".into()],
            files: vec![("script.sh".into(), script.into())],
            env: vec![("GREETING".into(), "hello".into())],
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_env() {
        let out = run(&shell("echo \"$GREETING from $(basename \"$PWD\")\"", 5)).await.unwrap();
        assert!(out.success());
        assert!(out.stdout.starts_with("hello from pushclock-hook-"), "{}", out.stdout);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let out = run(&shell("echo boom >&2; exit 3", 5)).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let err = run(&shell("sleep 5", 1)).await.unwrap_err();
        assert!(matches!(err, PushclockError::HookTimeout(1)));
    }

    #[tokio::test]
    async fn test_workdir_removed_after_run() {
        let out = run(&shell("pwd", 5)).await.unwrap();
        let dir = std::path::PathBuf::from(out.stdout.trim());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let mut spec = shell("true", 5);
        spec.program = "definitely-not-a-shell-xyz".into();
        assert!(matches!(run(&spec).await, Err(PushclockError::HookFailure(_))));
    }
}
