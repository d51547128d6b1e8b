//! Post-receive plumbing: hook-input parsing, force-push detection, and
//! materialization of the pushed tree for a handler callback.
//!
//! A git hook receives `<old-rev> <new-rev> <ref>` on standard input and
//! runs with the repository as its working directory; everything here
//! assumes that convention unless a directory is passed explicitly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Forty zeros: the revision sentinel for "no such commit", sent for
/// reference creation and deletion.
pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

const SCRATCH_MODE: u32 = 0o774;

// ---------------------------------------------------------------------------
// Hook input
// ---------------------------------------------------------------------------

/// The `<old> <new> <ref>` triple a hook receives on standard input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    pub old_rev: String,
    pub new_rev: String,
    pub ref_name: String,
}

/// Read one line of hook input (until newline or EOF) and split it into
/// a [`HookInfo`]. Exactly three whitespace-separated tokens are
/// required.
pub async fn read_hook_input<R>(mut reader: R) -> Result<HookInfo>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(Error::BadHookInput(format!(
            "expected 3 fields, got {}",
            fields.len()
        )));
    }

    Ok(HookInfo {
        old_rev: fields[0].to_string(),
        new_rev: fields[1].to_string(),
        ref_name: fields[2].to_string(),
    })
}

// ---------------------------------------------------------------------------
// Force-push detection
// ---------------------------------------------------------------------------

/// Whether the update is a non-fast-forward. Reference creation and
/// deletion never count as force pushes.
pub async fn is_force_push(hook: &HookInfo) -> Result<bool> {
    is_force_push_in(hook, Path::new(".")).await
}

/// Same as [`is_force_push`], with the repository directory given
/// explicitly instead of taken from the working directory.
pub async fn is_force_push_in(hook: &HookInfo, repo: &Path) -> Result<bool> {
    if hook.old_rev == ZERO_SHA || hook.new_rev == ZERO_SHA {
        return Ok(false);
    }

    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["merge-base", &hook.old_rev, &hook.new_rev])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let mut combined = output.stdout.clone();
        combined.extend_from_slice(&output.stderr);
        return Err(Error::SubprocessFailed {
            command: "git merge-base".to_string(),
            message: String::from_utf8_lossy(&combined).trim().to_string(),
        });
    }

    let base = String::from_utf8_lossy(&output.stdout).trim().to_string();
    // The update is a fast-forward iff the old tip is the merge base.
    Ok(base != hook.old_rev)
}

/// Full commit message of `sha`, trimmed. Runs in the working
/// directory; see [`read_commit_message_in`] for an explicit repository.
pub async fn read_commit_message(sha: &str) -> Result<String> {
    read_commit_message_in(sha, Path::new(".")).await
}

/// Full commit message of `sha` in the repository at `repo`, trimmed.
pub async fn read_commit_message_in(sha: &str, repo: &Path) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["show", "-s", "--format=%B", sha])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::SubprocessFailed {
            command: "git show".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Callback invoked with the parsed hook input and the directory the
/// pushed tree was extracted into.
pub type HandlerFunc = dyn Fn(&HookInfo, &Path) -> Result<()> + Send + Sync;

/// Post-receive pipeline: parses hook input, enforces the branch
/// policy, extracts the pushed tree into a scratch directory, and hands
/// both to the registered handler.
#[derive(Default)]
pub struct Receiver {
    /// Keep scratch directories around after the handler returns.
    pub debug: bool,
    /// Reject pushes to anything but `refs/heads/main`.
    pub main_only: bool,
    /// Parent directory for per-push scratch directories.
    pub tmp_dir: PathBuf,
    /// Repository to archive from; `None` means the working directory,
    /// which is where git runs hooks.
    pub git_dir: Option<PathBuf>,
    /// Invoked once the pushed tree is on disk.
    pub handler: Option<Box<HandlerFunc>>,
}

impl Receiver {
    /// Run the pipeline against one line of hook input.
    pub async fn handle<R>(&self, reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let hook = read_hook_input(reader).await?;

        if self.main_only && hook.ref_name != "refs/heads/main" {
            return Err(Error::PolicyViolation);
        }

        let scratch = self.tmp_dir.join(Uuid::new_v4().to_string());
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true).mode(SCRATCH_MODE);
        builder.create(&scratch).await?;

        let result = self.extract_and_run(&hook, &scratch).await;

        if self.debug {
            debug!(dir = %scratch.display(), "keeping scratch directory");
        } else if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(dir = %scratch.display(), error = %e, "failed to remove scratch directory");
        }

        result
    }

    async fn extract_and_run(&self, hook: &HookInfo, scratch: &Path) -> Result<()> {
        self.archive_to(&hook.new_rev, scratch).await?;
        match &self.handler {
            Some(handler) => handler(hook, scratch),
            None => Ok(()),
        }
    }

    /// Extract the tree at `rev` into `dir` via a
    /// `git archive | tar -x` subshell.
    async fn archive_to(&self, rev: &str, dir: &Path) -> Result<()> {
        let script = format!("git archive '{}' | tar -x -C '{}'", rev, dir.display());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(git_dir) = &self.git_dir {
            cmd.current_dir(git_dir);
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(archive_failure(
                script,
                String::from_utf8_lossy(&combined).trim().to_string(),
            ));
        }
        Ok(())
    }
}

fn archive_failure(script: String, message: String) -> Error {
    if message.contains("Damaged tar archive") {
        return Error::SubprocessFailed {
            command: script,
            message: "repository might be empty".to_string(),
        };
    }
    Error::SubprocessFailed {
        command: script,
        message,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
