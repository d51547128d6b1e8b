//! Per-connection SSH session handler.
//!
//! Each inbound connection is served by a dedicated [`SshSession`]
//! implementing the russh [`Handler`] trait. The handler performs
//! public-key authentication through the host lookup callback, then
//! turns `exec` requests into authorized smart-transport subprocesses,
//! splicing the channel into the child's stdin/stdout/stderr until the
//! child exits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey as OfferedKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::server::SessionContext;
use crate::{command, repo, Error};

/// Bound on unconsumed stdin chunks per channel.
const STDIN_QUEUE: usize = 32;
const COPY_BUF: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

pub(crate) struct SshSession {
    ctx: Arc<SessionContext>,
    peer_addr: Option<SocketAddr>,
    /// Key id resolved during auth; empty for anonymous connections.
    key_id: Option<String>,
    /// Per-channel feeds into the running child's stdin.
    stdin_pipes: HashMap<ChannelId, mpsc::Sender<Vec<u8>>>,
}

impl SshSession {
    pub(crate) fn new(ctx: Arc<SessionContext>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer_addr,
            key_id: None,
            stdin_pipes: HashMap::new(),
        }
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    /// Write a short explanation to the channel and end the session.
    fn refuse(&self, channel_id: ChannelId, session: &mut Session, line: &str) {
        session.data(channel_id, CryptoVec::from_slice(line.as_bytes()));
        session.close(channel_id);
    }
}

/// SHA-256 fingerprint of an offered key in the `ssh-keygen -l` format.
fn fingerprint_of(key: &OfferedKey) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for SshSession {
    type Error = Error;

    /// Anonymous access, available only when authentication is off.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.ctx.config.auth {
            return Ok(self.reject());
        }
        debug!(peer = ?self.peer_addr, user = %user, "anonymous client accepted");
        Ok(Auth::Accept)
    }

    /// Resolve the offered key through the host lookup callback. The
    /// callback sees the key in authorized-keys text form and returns
    /// the principal's key id, which follows the session into the
    /// child's `GITKIT_KEY`.
    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &OfferedKey,
    ) -> Result<Auth, Self::Error> {
        if !self.ctx.config.auth {
            return Ok(Auth::Accept);
        }

        let fingerprint = fingerprint_of(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fingerprint,
            "public-key auth attempt"
        );

        if let Some(required) = &self.ctx.config.git_user {
            if user != required {
                warn!(user = %user, "login does not match the configured git user");
                return Ok(self.reject());
            }
        }

        let Some(lookup) = &self.ctx.public_key_lookup else {
            error!("authentication enabled without a public key lookup callback");
            return Ok(self.reject());
        };

        let line = format!("{} {}", key.name(), key.public_key_base64());
        match lookup(line.trim_end()) {
            Ok(Some(known)) => {
                debug!(fingerprint = %fingerprint, key_id = %known.id, "key resolved");
                self.key_id = Some(known.id);
                Ok(Auth::Accept)
            }
            Ok(None) => {
                warn!(fingerprint = %fingerprint, "lookup did not return a key");
                Ok(self.reject())
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "key lookup failed");
                Ok(self.reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// `env` requests are acknowledged and dropped: the variable is not
    /// exported into a later exec.
    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            name = %variable_name,
            value = %variable_value,
            "discarding env request"
        );
        session.channel_success(channel_id);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data);
        let payload = command::clean_command(&raw);
        info!(peer = ?self.peer_addr, command = %payload, "exec request");

        let gitcmd = match command::parse(&payload) {
            Ok(gitcmd) => gitcmd,
            Err(e) => {
                warn!(command = %payload, error = %e, "rejecting exec payload");
                self.refuse(channel_id, session, "Invalid command.\r\n");
                return Ok(());
            }
        };

        let key_id = self.key_id.clone().unwrap_or_default();

        if let Some(authorize) = &self.ctx.authorize {
            let repo_name = gitcmd.repo.strip_suffix(".git").unwrap_or(&gitcmd.repo);
            match authorize(&key_id, repo_name) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        key_id = %key_id,
                        repo = %gitcmd.repo,
                        "key not authorized for repository"
                    );
                    session.close(channel_id);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "authorization callback failed");
                    session.close(channel_id);
                    return Ok(());
                }
            }
        }

        let full = self.ctx.config.dir.join(&gitcmd.repo);
        if !repo::exists(&full).await && self.ctx.config.auto_create {
            if let Err(e) = repo::init(&gitcmd.repo, &self.ctx.config).await {
                error!(repo = %gitcmd.repo, error = %e, "repository auto-create failed");
                session.close(channel_id);
                return Ok(());
            }
        }

        // `git-upload-pack` executes the dedicated binary; the
        // space-separated verb form runs git with a subcommand.
        let mut parts = gitcmd.verb.split_whitespace();
        let program = parts.next().unwrap_or("git");
        let mut child_cmd = Command::new(program);
        child_cmd
            .args(parts)
            .arg(&gitcmd.repo)
            .current_dir(&self.ctx.config.dir)
            .env("GITKIT_KEY", &key_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match child_cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(verb = %gitcmd.verb, error = %e, "failed to spawn transport subprocess");
                session.close(channel_id);
                return Ok(());
            }
        };

        let (Some(mut child_stdin), Some(mut child_stdout), Some(mut child_stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            error!("transport subprocess pipes unavailable");
            session.close(channel_id);
            return Ok(());
        };

        session.channel_success(channel_id);

        // Channel data -> child stdin. The writer lives on its own task
        // and ends when the channel sees EOF (the sender is dropped) or
        // the child stops reading.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE);
        self.stdin_pipes.insert(channel_id, stdin_tx);
        tokio::spawn(async move {
            while let Some(chunk) = stdin_rx.recv().await {
                if child_stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            // Dropping stdin closes the pipe so the child sees EOF.
        });

        // Child stdout/stderr -> channel, then the exit status. The
        // two output streams are drained in order, each preserving the
        // child's byte order; no interleaving between them is promised.
        let handle = session.handle();
        let report_exit_status = self.ctx.config.report_exit_status;
        let verb = gitcmd.verb.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; COPY_BUF];
            loop {
                match child_stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle
                            .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            loop {
                match child_stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle
                            .extended_data(channel_id, 1, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }

            match child.wait().await {
                Ok(status) => {
                    if !status.success() {
                        warn!(verb = %verb, status = %status, "transport subprocess exited nonzero");
                    }
                    let code = if report_exit_status {
                        status.code().unwrap_or(1) as u32
                    } else {
                        0
                    };
                    let _ = handle.exit_status_request(channel_id, code).await;
                }
                Err(e) => {
                    warn!(verb = %verb, error = %e, "transport subprocess wait failed");
                }
            }
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.stdin_pipes.get(&channel_id) {
            if stdin.send(data.to_vec()).await.is_err() {
                self.stdin_pipes.remove(&channel_id);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender closes the child's stdin.
        self.stdin_pipes.remove(&channel_id);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin_pipes.remove(&channel_id);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, "rejecting shell request");
        self.refuse(channel_id, session, "Unsupported request type.\r\n");
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(subsystem = %name, "rejecting subsystem request");
        self.refuse(channel_id, session, "Unsupported request type.\r\n");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, "rejecting pty request");
        self.refuse(channel_id, session, "Unsupported request type.\r\n");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_has_standard_shape() {
        let pair = russh_keys::key::KeyPair::generate_ed25519();
        let public = pair.clone_public_key().unwrap();
        let fingerprint = fingerprint_of(&public);
        assert!(fingerprint.starts_with("SHA256:"));
        assert!(!fingerprint.ends_with('='));
    }
}
