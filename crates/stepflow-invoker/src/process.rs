use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepflow_core::config::{AppConfig, InvokerConfig};
use stepflow_core::error::{FlowError, Result, StepFailure};
use stepflow_core::traits::StepInvoker;
use stepflow_core::types::{StepOutput, StepRequest};

use crate::output::parse_output;

/// Environment variable holding the full context snapshot as JSON.
pub const CONTEXT_ENV: &str = "STEPFLOW_CONTEXT";
/// Environment variable holding the id of the node being run.
pub const NODE_ID_ENV: &str = "STEPFLOW_NODE_ID";

/// How long to wait for a step's pipes to reach EOF once its group is gone.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Runs each step as a child process.
///
/// The child gets the context through its environment and reports its
/// update on stdout. It runs in its own process group so that a timeout
/// or cancellation can take down everything it spawned.
pub struct ProcessInvoker {
    config: InvokerConfig,
    working_dir: Option<PathBuf>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        let working_dir = config.working_dir.as_ref().map(PathBuf::from);
        Self {
            config,
            working_dir,
        }
    }

    /// Build from the application config (expands `~` in `working_dir`).
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            config: config.invoker.clone(),
            working_dir: config.working_dir(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn resolve_script(&self, script: &str) -> PathBuf {
        let path = Path::new(script);
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn build_command(&self, request: &StepRequest) -> Result<std::process::Command> {
        let script = self.resolve_script(&request.script);
        let interpreter = script
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.config.interpreters.get(ext));

        let mut command = match interpreter.map(|i| i.split_whitespace().collect::<Vec<_>>()) {
            Some(parts) if !parts.is_empty() => {
                let mut c = std::process::Command::new(parts[0]);
                c.args(&parts[1..]).arg(&script);
                c
            }
            _ => std::process::Command::new(&script),
        };

        if !self.config.inherit_env {
            command.env_clear();
            if let Some(path) = std::env::var_os("PATH") {
                command.env("PATH", path);
            }
        }
        for (key, value) in &request.context {
            if !is_env_key(key) {
                debug!(node_id = %request.node_id, key = %key, "Skipping context key that is not a valid env name");
                continue;
            }
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if value.contains('\0') {
                continue;
            }
            command.env(key, value);
        }
        command.env(CONTEXT_ENV, serde_json::to_string(&request.context)?);
        command.env(NODE_ID_ENV, &request.node_id);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        Ok(command)
    }

    async fn run(&self, request: StepRequest, cancel: CancellationToken) -> Result<StepOutput> {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        let timeout = request.timeout.unwrap_or_else(|| self.config.timeout());
        let command = self.build_command(&request)?;
        debug!(
            node_id = %request.node_id,
            script = %request.script,
            timeout_ms = timeout.as_millis() as u64,
            "Spawning step"
        );

        let mut child = tokio::process::Command::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FlowError::Execution {
                node_id: request.node_id.clone(),
                failure: StepFailure::Spawn(format!("{}: {}", request.script, e)),
            })?;
        let pid = child.id();

        let limit = self.config.max_output_bytes;
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_tail(s, limit)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s, limit)));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(_) => {
                // Reap anything the step left running in its group.
                #[cfg(unix)]
                if let Some(pid) = pid {
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
            }
            Outcome::TimedOut | Outcome::Cancelled => {
                terminate(&mut child, pid, self.config.kill_grace()).await;
            }
        }

        let stdout = collect(stdout_task, &request.node_id, "stdout").await;
        let stderr = collect(stderr_task, &request.node_id, "stderr")
            .await
            .unwrap_or_default();

        match outcome {
            Outcome::Cancelled => {
                debug!(node_id = %request.node_id, "Step cancelled");
                Err(FlowError::Cancelled)
            }
            Outcome::TimedOut => {
                warn!(node_id = %request.node_id, timeout_ms = timeout.as_millis() as u64, "Step timed out");
                Err(FlowError::Execution {
                    node_id: request.node_id,
                    failure: StepFailure::Timeout { timeout, stderr },
                })
            }
            Outcome::Exited(Err(e)) => Err(FlowError::Execution {
                node_id: request.node_id,
                failure: StepFailure::Spawn(format!("wait failed: {}", e)),
            }),
            Outcome::Exited(Ok(status)) if !status.success() => Err(FlowError::Execution {
                node_id: request.node_id,
                failure: StepFailure::Exit {
                    code: status.code(),
                    stderr,
                },
            }),
            Outcome::Exited(Ok(_)) => match stdout {
                Some(stdout) => {
                    let (update, warning) = parse_output(&stdout);
                    Ok(StepOutput {
                        update,
                        stdout: stdout.trim().to_string(),
                        warning,
                    })
                }
                None => Ok(StepOutput {
                    warning: Some(
                        "step output could not be read: stdout was still open after the step exited"
                            .to_string(),
                    ),
                    ..StepOutput::default()
                }),
            },
        }
    }
}

impl StepInvoker for ProcessInvoker {
    fn name(&self) -> &str {
        "process"
    }

    fn invoke(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(self.run(request, cancel))
    }
}

/// Ask the process group to exit, then force it after `grace`. Returns
/// once the direct child has been reaped.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::Signal;

        signal_group(pid, Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            debug!(pid, "Grace period elapsed, killing process group");
        }
        signal_group(pid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = ?signal, error = %e, "Failed to signal process group"),
    }
}

/// Drain a pipe, keeping only the last `limit` bytes. Reading continues
/// past the limit so the child never blocks on a full pipe.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut buf = VecDeque::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = &chunk[n.saturating_sub(limit)..n];
                let overflow = (buf.len() + data.len()).saturating_sub(limit);
                if overflow > 0 || data.len() < n {
                    truncated = true;
                    buf.drain(..overflow.min(buf.len()));
                }
                buf.extend(data);
            }
        }
    }
    (buf.into(), truncated)
}

/// Wait for a reader task to hit EOF. `None` means the pipe stayed open
/// past [`OUTPUT_DRAIN`], usually because a detached descendant holds it.
async fn collect(
    task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
    node_id: &str,
    stream: &str,
) -> Option<String> {
    let Some(mut task) = task else {
        return Some(String::new());
    };
    match tokio::time::timeout(OUTPUT_DRAIN, &mut task).await {
        Ok(Ok((bytes, truncated))) => {
            if truncated {
                warn!(node_id = %node_id, stream, kept = bytes.len(), "Step output truncated to its tail");
            }
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        Ok(Err(e)) => {
            warn!(node_id = %node_id, stream, error = %e, "Output reader failed");
            None
        }
        Err(_) => {
            task.abort();
            warn!(node_id = %node_id, stream, "Output pipe still open after step exit");
            None
        }
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use stepflow_core::types::ContextMap;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    fn request(script: String, context: ContextMap) -> StepRequest {
        StepRequest {
            node_id: "n1".into(),
            label: "Test step".into(),
            script,
            context,
            timeout: None,
        }
    }

    fn invoker() -> ProcessInvoker {
        ProcessInvoker::new(InvokerConfig {
            kill_grace_ms: 200,
            ..InvokerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_context_in_env_and_json_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo.sh",
            "echo \"progress\"\necho \"{\\\"greeting\\\": \\\"hi $name\\\", \\\"count\\\": $count}\"\n",
        );
        let mut ctx = ContextMap::new();
        ctx.insert("name".into(), json!("bob"));
        ctx.insert("count".into(), json!(3));
        ctx.insert("not-valid".into(), json!("skipped"));

        let out = invoker()
            .invoke(request(script, ctx), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.warning.is_none());
        assert_eq!(out.update.get("greeting"), Some(&json!("hi bob")));
        assert_eq!(out.update.get("count"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_snapshot_and_node_id_env() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "ctx.sh",
            "echo \"$STEPFLOW_NODE_ID\"\necho \"$STEPFLOW_CONTEXT\"\n",
        );
        let mut ctx = ContextMap::new();
        ctx.insert("items".into(), json!([1, 2]));

        let out = invoker()
            .invoke(request(script, ctx), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.update.get("items"), Some(&json!([1, 2])));
        assert!(out.stdout.starts_with("n1"));
    }

    #[tokio::test]
    async fn test_plain_output_is_warning_not_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "plain.sh", "echo just text\n");
        let out = invoker()
            .invoke(request(script, ContextMap::new()), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.update.is_empty());
        assert!(out.warning.is_some());
        assert_eq!(out.stdout, "just text");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "echo oops >&2\nexit 3\n");
        let err = invoker()
            .invoke(request(script, ContextMap::new()), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            FlowError::Execution { node_id, failure } => {
                assert_eq!(node_id, "n1");
                assert_eq!(failure.exit_code(), Some(3));
                assert!(failure.stderr().contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let err = invoker()
            .invoke(
                request("/nonexistent/step-binary".into(), ContextMap::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::Execution { failure: StepFailure::Spawn(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "slow.sh", "sleep 30\n");
        let mut req = request(script, ContextMap::new());
        req.timeout = Some(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = invoker().invoke(req, CancellationToken::new()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err,
            FlowError::Execution { failure: StepFailure::Timeout { .. }, .. }
        ));
        assert!(err.to_string().contains("timed out after 300ms"));
    }

    #[tokio::test]
    async fn test_result_survives_long_output_before_it() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "chatty.sh",
            "echo '{\"result\": \"early\"}'\n\
             i=0\nwhile [ $i -lt 200 ]; do echo \"progress-line-$i\"; i=$((i + 1)); done\n\
             echo '{\"result\": \"ok\"}'\n",
        );
        let invoker = ProcessInvoker::new(InvokerConfig {
            max_output_bytes: 1024,
            ..InvokerConfig::default()
        });

        let out = invoker
            .invoke(request(script, ContextMap::new()), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.warning.is_none(), "{:?}", out.warning);
        assert_eq!(out.update.get("result"), Some(&json!("ok")));
        assert!(out.stdout.len() <= 1024);
        assert!(out.stdout.contains("progress-line-199"));
        assert!(!out.stdout.contains("progress-line-0\n"));
    }

    #[tokio::test]
    async fn test_stderr_keeps_its_tail() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "noisy.sh",
            "i=0\nwhile [ $i -lt 200 ]; do echo \"warning-$i\" >&2; i=$((i + 1)); done\n\
             echo 'final failure reason' >&2\nexit 2\n",
        );
        let invoker = ProcessInvoker::new(InvokerConfig {
            max_output_bytes: 512,
            ..InvokerConfig::default()
        });

        let err = invoker
            .invoke(request(script, ContextMap::new()), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            FlowError::Execution { failure, .. } => {
                assert_eq!(failure.exit_code(), Some(2));
                assert!(failure.stderr().contains("final failure reason"));
                assert!(failure.stderr().len() <= 512);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_output_read_without_kill_grace() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "quick.sh",
            "i=0\nwhile [ $i -lt 2000 ]; do echo \"line $i\"; i=$((i + 1)); done\n\
             echo '{\"done\": true}'\n",
        );
        let invoker = ProcessInvoker::new(InvokerConfig {
            kill_grace_ms: 0,
            ..InvokerConfig::default()
        });

        for _ in 0..5 {
            let out = invoker
                .invoke(request(script.clone(), ContextMap::new()), CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(out.update.get("done"), Some(&json!(true)));
        }
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes() {
        let data: Vec<u8> = (0..50u8).collect();
        let (kept, truncated) = read_tail(&data[..], 8).await;
        assert!(truncated);
        assert_eq!(kept, (42..50u8).collect::<Vec<_>>());

        let (kept, truncated) = read_tail(&data[..], 100).await;
        assert!(!truncated);
        assert_eq!(kept, data);
    }

    #[tokio::test]
    async fn test_cancel_terminates_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survivor");
        let script = write_script(
            dir.path(),
            "tree.sh",
            &format!(
                "(sleep 2; touch {}) &\nsleep 30\n",
                marker.display()
            ),
        );

        let invoker = Arc::new(invoker());
        let cancel = CancellationToken::new();
        let task = {
            let invoker = invoker.clone();
            let cancel = cancel.clone();
            let req = request(script, ContextMap::new());
            tokio::spawn(async move { invoker.invoke(req, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(FlowError::Cancelled)));

        // The backgrounded grandchild must have been killed with the group.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = invoker()
            .invoke(request("/bin/true".into(), ContextMap::new()), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
    }

    #[tokio::test]
    async fn test_relative_script_uses_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "rel.sh", "echo '{\"where\": \"here\"}'\n");
        let invoker = invoker().with_working_dir(dir.path());
        let out = invoker
            .invoke(request("rel.sh".into(), ContextMap::new()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.update.get("where"), Some(&json!("here")));
    }

    #[test]
    fn test_env_key_rules() {
        assert!(is_env_key("result"));
        assert!(is_env_key("_private1"));
        assert!(!is_env_key("1abc"));
        assert!(!is_env_key("with-dash"));
        assert!(!is_env_key(""));
    }
}
