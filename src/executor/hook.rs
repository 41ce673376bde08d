//! Hook executor: runs an external command per message inside a focus
//! directory.
//!
//! The request is written to `request.json`. The hook reports by writing
//! `outcome.json` (`{ "success": bool, "result_summary": str, "committed": bool }`).
//! A cooperative stop is signalled by creating the file named in
//! `WORKCLAIM_STOP_FILE`; the hook should notice it, persist what it can,
//! write its outcome and exit. Dropping the invocation kills the child.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExecutionOutcome, ExecutionReport, ExecutionRequest, TaskExecutor};
use crate::error::{Error, Result};

const REQUEST_FILE: &str = "request.json";
const OUTCOME_FILE: &str = "outcome.json";
const STOP_FILE: &str = "stop";

/// Hook configuration, the `[executor]` table of the executor TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    /// Executable to run. Relative paths resolve against the process CWD.
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Parent of the per-invocation focus directories.
    #[serde(default = "default_focus_base_dir")]
    pub focus_base_dir: PathBuf,
    /// Extra environment passed to the hook.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Keep focus directories after the hook exits (debugging).
    #[serde(default)]
    pub keep_focus_dirs: bool,
}

fn default_focus_base_dir() -> PathBuf {
    std::env::temp_dir().join("workclaim-foci")
}

/// Focus directory that removes itself when dropped, including when the
/// invocation is cancelled hard.
struct FocusDir {
    path: PathBuf,
    keep: bool,
}

impl Drop for FocusDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(dir = %self.path.display(), "focus cleanup error: {e}");
        }
    }
}

pub struct HookExecutor {
    config: HookConfig,
}

impl HookExecutor {
    pub fn new(config: HookConfig) -> Self {
        Self { config }
    }

    async fn create_focus(&self, request: &ExecutionRequest) -> Result<FocusDir> {
        let dir = self.config.focus_base_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let focus = FocusDir {
            path: dir,
            keep: self.config.keep_focus_dirs,
        };
        let json = serde_json::to_string_pretty(request)?;
        tokio::fs::write(focus.path.join(REQUEST_FILE), json).await?;
        debug!(
            message_id = %request.message_id,
            dir = %focus.path.display(),
            "focus created"
        );
        Ok(focus)
    }

    fn resolve_command(&self) -> Result<PathBuf> {
        // Command::new + current_dir resolves relative paths after chdir, so
        // anchor them to the process CWD first.
        if self.config.command.is_relative() {
            Ok(std::env::current_dir()?.join(&self.config.command))
        } else {
            Ok(self.config.command.clone())
        }
    }

    fn command(&self, focus: &Path, request: &ExecutionRequest) -> Result<Command> {
        let mut cmd = Command::new(self.resolve_command()?);
        cmd.args(&self.config.args)
            .current_dir(focus)
            .envs(&self.config.env)
            .env("WORKCLAIM_FOCUS_DIR", focus)
            .env("WORKCLAIM_REQUEST_FILE", focus.join(REQUEST_FILE))
            .env("WORKCLAIM_OUTCOME_FILE", focus.join(OUTCOME_FILE))
            .env("WORKCLAIM_STOP_FILE", focus.join(STOP_FILE))
            .env("WORKCLAIM_WORKSTREAM", request.workstream_key.to_string())
            .env("WORKCLAIM_MESSAGE_ID", &request.message_id)
            .env("WORKCLAIM_THREAD_ID", &request.thread_id)
            .env("WORKCLAIM_CONTEXT_ID", &request.context.context_id)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

async fn read_outcome(focus: &Path) -> Option<ExecutionOutcome> {
    let content = tokio::fs::read_to_string(focus.join(OUTCOME_FILE)).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(dir = %focus.display(), "bad {OUTCOME_FILE}: {e}");
            None
        }
    }
}

#[async_trait]
impl TaskExecutor for HookExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let start = Instant::now();
        let focus = self.create_focus(&request).await?;
        let mut child = self
            .command(&focus.path, &request)?
            .spawn()
            .map_err(|e| Error::Executor(format!("failed to spawn hook: {e}")))?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                info!(message_id = %request.message_id, "signalling hook to stop");
                tokio::fs::write(focus.path.join(STOP_FILE), b"stop").await?;
                let status = child.wait().await?;
                let committed = read_outcome(&focus.path)
                    .await
                    .is_some_and(|o| o.committed);
                debug!(
                    message_id = %request.message_id,
                    code = status.code().unwrap_or(-1),
                    committed,
                    "hook stopped"
                );
                return Ok(ExecutionReport::Stopped { committed });
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            warn!(message_id = %request.message_id, code, duration_ms, "hook failed");
            let summary = read_outcome(&focus.path)
                .await
                .map(|o| o.result_summary)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("hook exited with status {code}"));
            return Ok(ExecutionReport::Finished(ExecutionOutcome::failure(summary)));
        }

        match read_outcome(&focus.path).await {
            Some(outcome) => Ok(ExecutionReport::Finished(outcome)),
            None => Ok(ExecutionReport::Finished(ExecutionOutcome::failure(format!(
                "hook exited cleanly but wrote no valid {OUTCOME_FILE}"
            )))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{ContextHandle, WorkstreamKey};
    use std::os::unix::fs::PermissionsExt;

    fn request() -> ExecutionRequest {
        let key = WorkstreamKey::new("p1", "u1").unwrap();
        ExecutionRequest {
            workstream_key: key.clone(),
            message_id: "m1".into(),
            thread_id: "t1".into(),
            payload: serde_json::json!({"edit": "add a page"}),
            continuation_token: None,
            context: ContextHandle {
                workstream_key: key,
                thread_id: "t1".into(),
                context_id: "thread/t1".into(),
            },
        }
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("hook.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn executor(dir: &Path, command: PathBuf) -> HookExecutor {
        HookExecutor::new(HookConfig {
            command,
            args: vec![],
            focus_base_dir: dir.join("foci"),
            env: BTreeMap::new(),
            keep_focus_dirs: false,
        })
    }

    #[tokio::test]
    async fn reads_outcome_written_by_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = script(
            tmp.path(),
            r#"test -f "$WORKCLAIM_REQUEST_FILE" || exit 3
echo '{"success": true, "result_summary": "built", "committed": true}' > "$WORKCLAIM_OUTCOME_FILE""#,
        );
        let report = executor(tmp.path(), cmd)
            .execute(request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report,
            ExecutionReport::Finished(ExecutionOutcome::success("built", true))
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = script(tmp.path(), "exit 7");
        let report = executor(tmp.path(), cmd)
            .execute(request(), CancellationToken::new())
            .await
            .unwrap();
        match report {
            ExecutionReport::Finished(outcome) => {
                assert!(!outcome.success);
                assert!(outcome.result_summary.contains('7'));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_file_ends_hook_cooperatively() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = script(
            tmp.path(),
            r#"while [ ! -f "$WORKCLAIM_STOP_FILE" ]; do sleep 0.05; done
echo '{"success": false, "committed": true}' > "$WORKCLAIM_OUTCOME_FILE""#,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let report = executor(tmp.path(), cmd)
            .execute(request(), cancel)
            .await
            .unwrap();
        assert_eq!(report, ExecutionReport::Stopped { committed: true });
    }
}
