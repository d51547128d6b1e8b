//! Server configuration.
//!
//! A [`Config`] is built in code by the embedding application or loaded
//! from a YAML file via [`load_config`]. It is treated as immutable once
//! the server has started listening.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the server host keys.
    pub key_dir: PathBuf,
    /// Directory that contains the served repositories.
    pub dir: PathBuf,
    /// Path to the git binary. Empty means `git`, resolved via PATH.
    pub git_path: String,
    /// Required SSH login name. When set (and `auth` is on), connections
    /// using any other login are rejected.
    pub git_user: Option<String>,
    /// Create missing repositories on first access.
    pub auto_create: bool,
    /// Keep every repository's hook set in sync with `hooks`.
    pub auto_hooks: bool,
    /// Server-side hook script bodies.
    pub hooks: Option<HookScripts>,
    /// Require public-key authentication.
    pub auth: bool,
    /// Forward the child's real exit code over the channel. The
    /// historical wire behavior (and the default) replies with zero no
    /// matter how the child exited; flip this to report failures to the
    /// client.
    pub report_exit_status: bool,
}

impl Config {
    /// The git binary to invoke for repository management.
    pub fn git_binary(&self) -> &str {
        if self.git_path.is_empty() {
            "git"
        } else {
            &self.git_path
        }
    }

    /// Location of the private host key for `algo` (`rsa`, `ed25519`).
    pub fn key_path(&self, algo: &str) -> PathBuf {
        self.key_dir.join(format!("gitkit.{algo}"))
    }
}

// ---------------------------------------------------------------------------
// Hook scripts
// ---------------------------------------------------------------------------

/// Bodies for the three server-side hooks. Scripts with a missing or
/// empty body produce no file on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookScripts {
    pub pre_receive: Option<String>,
    pub update: Option<String>,
    pub post_receive: Option<String>,
}

impl HookScripts {
    /// `(file name, body)` pairs for every script with content.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("pre-receive", self.pre_receive.as_deref()),
            ("update", self.update.as_deref()),
            ("post-receive", self.post_receive.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, body)| match body {
            Some(body) if !body.is_empty() => Some((name, body)),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&contents)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_binary_defaults_to_path_lookup() {
        let config = Config::default();
        assert_eq!(config.git_binary(), "git");

        let config = Config {
            git_path: "/usr/local/bin/git".to_string(),
            ..Config::default()
        };
        assert_eq!(config.git_binary(), "/usr/local/bin/git");
    }

    #[test]
    fn key_path_layout() {
        let config = Config {
            key_dir: PathBuf::from("/var/lib/gitkit/keys"),
            ..Config::default()
        };
        assert_eq!(
            config.key_path("rsa"),
            PathBuf::from("/var/lib/gitkit/keys/gitkit.rsa")
        );
    }

    #[test]
    fn hook_entries_skip_empty_bodies() {
        let hooks = HookScripts {
            pre_receive: Some("#!/bin/sh\nexit 0\n".to_string()),
            update: Some(String::new()),
            post_receive: None,
        };
        let entries: Vec<_> = hooks.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "pre-receive");
    }

    #[test]
    fn load_config_from_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "key_dir: /tmp/keys\ndir: /tmp/repos\nauto_create: true\nauth: true\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.dir, PathBuf::from("/tmp/repos"));
        assert!(config.auto_create);
        assert!(config.auth);
        assert!(!config.auto_hooks);
        assert!(config.git_user.is_none());
    }

    #[test]
    fn load_config_rejects_bad_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "dir: [unclosed").unwrap();
        assert!(load_config(&path).is_err());
    }
}
