//! Git branch context backend.
//!
//! Each thread works on its own branch `<prefix><thread>-<hash>`, forked
//! from a fixed base so threads never see each other's edits. Flushing
//! stages everything and commits when something is staged, optionally
//! pushing.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::ContextBackend;
use crate::error::{Error, Result};
use crate::model::{ContextHandle, WorkstreamKey};

/// The `[context]` table of the executor TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct GitContextConfig {
    /// Working tree the executor edits.
    pub repo: PathBuf,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Branch new thread branches start from. Defaults to the branch
    /// checked out when the first thread is activated.
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Remote to push flushed commits to.
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default = "default_commit_prefix")]
    pub commit_message_prefix: String,
}

fn default_branch_prefix() -> String {
    "thread/".to_string()
}

fn default_commit_prefix() -> String {
    "workclaim: checkpoint".to_string()
}

/// Namespace for the branch suffix that keeps distinct threads apart after
/// their ids are sanitized.
const BRANCH_NAMESPACE: Uuid = Uuid::from_u128(0x2b9e_51c7_0f3a_4d62_8e1b_c4a7_5d90_3f16);

/// Reduce a thread id to characters that are always valid in a ref name.
pub fn sanitize_branch_component(thread_id: &str) -> String {
    let cleaned: String = thread_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "thread".to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct GitContextBackend {
    config: GitContextConfig,
    base: OnceCell<String>,
}

impl GitContextBackend {
    pub fn new(config: GitContextConfig) -> Self {
        Self {
            config,
            base: OnceCell::new(),
        }
    }

    pub fn branch_for(&self, key: &WorkstreamKey, thread_id: &str) -> String {
        let id = Uuid::new_v5(&BRANCH_NAMESPACE, format!("{key}/{thread_id}").as_bytes());
        format!(
            "{}{}-{}",
            self.config.branch_prefix,
            sanitize_branch_component(thread_id),
            &id.simple().to_string()[..8]
        )
    }

    /// The ref thread branches are created from, fixed on first use.
    async fn base(&self) -> Result<&str> {
        self.base
            .get_or_try_init(|| self.resolve_base())
            .await
            .map(String::as_str)
    }

    async fn resolve_base(&self) -> Result<String> {
        if let Some(base) = &self.config.base_branch {
            return Ok(base.clone());
        }
        let out = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"]).await?;
        let base = if out.status.success() {
            String::from_utf8_lossy(&out.stdout).trim().to_string()
        } else {
            // Detached HEAD: pin the commit.
            let out = self.run_checked(&["rev-parse", "HEAD"]).await?;
            String::from_utf8_lossy(&out.stdout).trim().to_string()
        };
        if base.starts_with(&self.config.branch_prefix) {
            return Err(Error::Context(format!(
                "checked-out branch {base} is a thread branch; set base_branch"
            )));
        }
        info!(%base, "thread branches start from the checked-out branch");
        Ok(base)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self
            .run(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await?;
        Ok(out.status.success())
    }

    async fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"]).await?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Context(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.config.repo)
            .output()
            .await
            .map_err(|e| Error::Context(format!("spawn git {}: {e}", args.join(" "))))
    }
}

#[async_trait]
impl ContextBackend for GitContextBackend {
    #[instrument(skip_all, fields(workstream = %key, thread_id = %thread_id))]
    async fn activate(&self, key: &WorkstreamKey, thread_id: &str) -> Result<ContextHandle> {
        let base = self.base().await?;
        let branch = self.branch_for(key, thread_id);
        if self.branch_exists(&branch).await? {
            debug!(%branch, "checking out branch");
            self.run_checked(&["checkout", &branch]).await?;
        } else {
            debug!(%branch, %base, "creating and checking out new branch");
            self.run_checked(&["checkout", "-b", &branch, base]).await?;
        }
        Ok(ContextHandle {
            workstream_key: key.clone(),
            thread_id: thread_id.to_string(),
            context_id: branch,
        })
    }

    #[instrument(skip_all, fields(context_id = %context.context_id))]
    async fn flush(&self, context: &ContextHandle) -> Result<bool> {
        self.run_checked(&["add", "-A"]).await?;
        if !self.has_staged_changes().await? {
            debug!("no staged changes, nothing to flush");
            return Ok(false);
        }
        let message = format!(
            "{} (thread {})",
            self.config.commit_message_prefix, context.thread_id
        );
        self.run_checked(&["commit", "-m", &message]).await?;
        if let Some(remote) = self.config.remote.as_deref() {
            self.run_checked(&["push", remote, &context.context_id]).await?;
        }
        info!(thread_id = %context.thread_id, "flushed thread context");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn key() -> WorkstreamKey {
        WorkstreamKey::new("p1", "u1").unwrap()
    }

    fn config(repo: &Path) -> GitContextConfig {
        GitContextConfig {
            repo: repo.to_path_buf(),
            branch_prefix: default_branch_prefix(),
            base_branch: None,
            remote: None,
            commit_message_prefix: default_commit_prefix(),
        }
    }

    fn git(repo: &Path, args: &[&str]) -> String {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    /// A repository with one commit on `main`.
    fn repo() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        git(dir, &["init", "--quiet"]);
        git(dir, &["checkout", "--quiet", "-b", "main"]);
        git(dir, &["config", "user.email", "worker@example.com"]);
        git(dir, &["config", "user.name", "worker"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
        std::fs::write(dir.join("README"), "site\n").unwrap();
        git(dir, &["add", "README"]);
        git(dir, &["commit", "--quiet", "-m", "init"]);
        tmp
    }

    #[test]
    fn sanitizes_thread_ids_into_ref_safe_names() {
        assert_eq!(sanitize_branch_component("abc-123"), "abc-123");
        assert_eq!(
            sanitize_branch_component("<CAF=x@mail.example.com>"),
            "CAF-x-mail-example-com"
        );
        assert_eq!(sanitize_branch_component("../.."), "thread");
        assert_eq!(sanitize_branch_component(""), "thread");
    }

    #[test]
    fn thread_ids_that_sanitize_alike_get_distinct_branches() {
        let mut config = config(Path::new("."));
        config.branch_prefix = "conv/".into();
        let backend = GitContextBackend::new(config);

        let dotted = backend.branch_for(&key(), "x.y");
        let dashed = backend.branch_for(&key(), "x-y");
        assert!(dotted.starts_with("conv/x-y-"), "{dotted}");
        assert!(dashed.starts_with("conv/x-y-"), "{dashed}");
        assert_ne!(dotted, dashed);
        assert_eq!(dotted, backend.branch_for(&key(), "x.y"));

        let elsewhere = WorkstreamKey::new("p1", "u2").unwrap();
        assert_ne!(dotted, backend.branch_for(&elsewhere, "x.y"));
    }

    #[tokio::test]
    async fn threads_branch_from_the_base_not_from_each_other() {
        let tmp = repo();
        let dir = tmp.path();
        let backend = GitContextBackend::new(config(dir));

        let a = backend.activate(&key(), "thread-A").await.unwrap();
        assert_eq!(git(dir, &["symbolic-ref", "--short", "HEAD"]), a.context_id);
        std::fs::write(dir.join("a_only.txt"), "a\n").unwrap();
        assert!(backend.flush(&a).await.unwrap());

        let b = backend.activate(&key(), "thread-B").await.unwrap();
        assert_ne!(a.context_id, b.context_id);
        assert!(!dir.join("a_only.txt").exists());
        assert!(dir.join("README").exists());

        // Reactivating an existing branch checks it out with its history.
        let again = backend.activate(&key(), "thread-A").await.unwrap();
        assert_eq!(again.context_id, a.context_id);
        assert!(dir.join("a_only.txt").exists());
    }

    #[tokio::test]
    async fn flush_commits_only_when_something_changed() {
        let tmp = repo();
        let dir = tmp.path();
        let backend = GitContextBackend::new(config(dir));

        let t1 = backend.activate(&key(), "t1").await.unwrap();
        assert!(!backend.flush(&t1).await.unwrap());

        std::fs::write(dir.join("page.html"), "<h1>hi</h1>\n").unwrap();
        assert!(backend.flush(&t1).await.unwrap());
        assert_eq!(
            git(dir, &["log", "-1", "--format=%s"]),
            "workclaim: checkpoint (thread t1)"
        );
        assert!(!backend.flush(&t1).await.unwrap());
        assert_eq!(git(dir, &["rev-list", "--count", "HEAD"]), "2");
    }

    #[tokio::test]
    async fn thread_branch_checked_out_at_start_is_not_a_base() {
        let tmp = repo();
        let dir = tmp.path();
        git(dir, &["checkout", "--quiet", "-b", "thread/left-over"]);

        let backend = GitContextBackend::new(config(dir));
        assert!(backend.activate(&key(), "t1").await.is_err());

        let mut pinned = config(dir);
        pinned.base_branch = Some("main".into());
        let backend = GitContextBackend::new(pinned);
        let t1 = backend.activate(&key(), "t1").await.unwrap();
        assert_eq!(git(dir, &["symbolic-ref", "--short", "HEAD"]), t1.context_id);
    }
}
