//! Bare repository management.
//!
//! Repositories live as `<name>.git` directories under the configured
//! root; a directory counts as a repository iff it contains `objects/`.
//! Creation and cloning shell out to the configured git binary, and the
//! server-side hook set can be (re)installed into any repository's
//! `hooks/` directory.

use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::{Config, HookScripts};
use crate::{Error, Result};

const HOOK_MODE: u32 = 0o755;

/// Whether `path` is a usable repository (contains `objects/`).
pub async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path.join("objects")).await.is_ok()
}

/// Create a bare repository named `name` under the repositories root,
/// installing hooks when the configuration asks for them.
#[instrument(skip(config), fields(dir = %config.dir.display()))]
pub async fn init(name: &str, config: &Config) -> Result<()> {
    let full = repo_dir(config, name);
    run_git(
        config,
        &["init", "--bare", "--initial-branch=main"],
        &full,
    )
    .await?;
    debug!(path = %full.display(), "bare repository initialised");
    install_configured_hooks(config, &full).await
}

/// Clone `url` into a bare repository named `name`.
#[instrument(skip(config), fields(dir = %config.dir.display()))]
pub async fn clone(name: &str, config: &Config, url: &str) -> Result<()> {
    let full = repo_dir(config, name);
    run_git(config, &["clone", "--bare", url], &full).await?;
    debug!(path = %full.display(), "bare repository cloned");
    install_configured_hooks(config, &full).await
}

/// Install the hook scripts into `repo_path/hooks`, replacing whatever
/// the directory held before. Scripts without a body produce no file.
pub async fn install_hooks(hooks: &HookScripts, repo_path: &Path) -> Result<()> {
    let hook_dir = repo_path.join("hooks");

    match tokio::fs::read_dir(&hook_dir).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::create_dir_all(&hook_dir).await?;
        }
        Err(e) => return Err(e.into()),
    }

    for (name, body) in hooks.entries() {
        let path = hook_dir.join(name);
        tokio::fs::write(&path, body).await?;
        tokio::fs::set_permissions(&path, Permissions::from_mode(HOOK_MODE)).await?;
        debug!(hook = name, path = %path.display(), "hook installed");
    }

    Ok(())
}

/// Prepare the repositories root: create it when missing and, when
/// `auto_hooks` is on, refresh the hook set of every `*.git` directory
/// underneath it.
pub async fn setup(config: &Config) -> Result<()> {
    if tokio::fs::metadata(&config.dir).await.is_err() {
        tokio::fs::create_dir(&config.dir).await?;
        tokio::fs::set_permissions(&config.dir, Permissions::from_mode(0o755)).await?;
    }

    if !config.auto_hooks {
        return Ok(());
    }
    let Some(hooks) = &config.hooks else {
        return Ok(());
    };

    let mut stack = vec![config.dir.clone()];
    while let Some(current) = stack.pop() {
        let is_repo = current
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".git"));
        if is_repo {
            install_hooks(hooks, &current).await?;
        }

        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            }
        }
    }

    Ok(())
}

/// On-disk directory for `name`; repositories always carry the `.git`
/// suffix.
fn repo_dir(config: &Config, name: &str) -> PathBuf {
    if name.ends_with(".git") {
        config.dir.join(name)
    } else {
        config.dir.join(format!("{name}.git"))
    }
}

async fn install_configured_hooks(config: &Config, full: &Path) -> Result<()> {
    if config.auto_hooks {
        if let Some(hooks) = &config.hooks {
            install_hooks(hooks, full).await?;
        }
    }
    Ok(())
}

/// Run the git binary with `args` plus the target path, capturing
/// stderr for the error message.
async fn run_git(config: &Config, args: &[&str], target: &Path) -> Result<()> {
    let output = Command::new(config.git_binary())
        .args(args)
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::SubprocessFailed {
            command: format!("{} {}", config.git_binary(), args.join(" ")),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hooks() -> HookScripts {
        HookScripts {
            pre_receive: Some("#!/bin/sh\nexit 0\n".to_string()),
            update: None,
            post_receive: Some("#!/bin/sh\necho done\n".to_string()),
        }
    }

    #[tokio::test]
    async fn exists_requires_objects_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("project.git");
        std::fs::create_dir(&repo).unwrap();
        assert!(!exists(&repo).await);

        std::fs::create_dir(repo.join("objects")).unwrap();
        assert!(exists(&repo).await);
    }

    #[tokio::test]
    async fn init_appends_git_suffix_and_creates_bare_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            dir: tmp.path().to_path_buf(),
            ..Config::default()
        };

        init("project", &config).await.unwrap();
        assert!(exists(&tmp.path().join("project.git")).await);
    }

    #[tokio::test]
    async fn init_failure_carries_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        // A file in the way makes `git init --bare` fail.
        std::fs::write(tmp.path().join("taken.git"), "occupied").unwrap();
        let config = Config {
            dir: tmp.path().to_path_buf(),
            ..Config::default()
        };

        let err = init("taken", &config).await.unwrap_err();
        match err {
            Error::SubprocessFailed { message, .. } => assert!(!message.is_empty()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn install_hooks_is_idempotent_and_skips_empty_bodies() {
        let tmp = tempfile::tempdir().unwrap();
        let hooks = sample_hooks();

        install_hooks(&hooks, tmp.path()).await.unwrap();
        install_hooks(&hooks, tmp.path()).await.unwrap();

        let hook_dir = tmp.path().join("hooks");
        let names: Vec<String> = std::fs::read_dir(&hook_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"pre-receive".to_string()));
        assert!(names.contains(&"post-receive".to_string()));

        let mode = std::fs::metadata(hook_dir.join("pre-receive"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[tokio::test]
    async fn install_hooks_replaces_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let hook_dir = tmp.path().join("hooks");
        std::fs::create_dir(&hook_dir).unwrap();
        std::fs::write(hook_dir.join("stale"), "old").unwrap();

        install_hooks(&sample_hooks(), tmp.path()).await.unwrap();
        assert!(!hook_dir.join("stale").exists());
        assert!(hook_dir.join("pre-receive").exists());
    }

    #[tokio::test]
    async fn setup_walks_git_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repos");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir_all(root.join("a.git")).unwrap();
        std::fs::create_dir_all(root.join("org/b.git")).unwrap();
        std::fs::create_dir_all(root.join("plain")).unwrap();

        let config = Config {
            dir: root.clone(),
            auto_hooks: true,
            hooks: Some(sample_hooks()),
            ..Config::default()
        };
        setup(&config).await.unwrap();

        assert!(root.join("a.git/hooks/pre-receive").exists());
        assert!(root.join("org/b.git/hooks/pre-receive").exists());
        assert!(!root.join("plain/hooks").exists());
    }

    #[tokio::test]
    async fn setup_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repos");
        let config = Config {
            dir: root.clone(),
            ..Config::default()
        };
        setup(&config).await.unwrap();

        let mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}
