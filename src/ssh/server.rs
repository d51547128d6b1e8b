//! Server control surface and connection bootstrap.
//!
//! [`Server`] owns a single listener slot with `listen` / `serve` /
//! `address` / `stop` lifecycle semantics. Every accepted socket is
//! handed to the russh protocol driver on its own task, with a fresh
//! [`SshSession`] handler per connection.

use std::sync::Arc;
use std::time::Duration;

use russh::server as russh_server;
use russh::{MethodSet, SshId};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::session::SshSession;
use super::{Authorize, PublicKey, PublicKeyLookup};
use crate::config::Config;
use crate::{keys, repo, Error, Result};

// ---------------------------------------------------------------------------
// Shared session context
// ---------------------------------------------------------------------------

/// Everything a connection handler needs, shared across sessions.
pub(crate) struct SessionContext {
    pub(crate) config: Config,
    pub(crate) public_key_lookup: Option<Arc<PublicKeyLookup>>,
    pub(crate) authorize: Option<Arc<Authorize>>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ListenState {
    listener: Option<Arc<TcpListener>>,
    ssh_config: Option<Arc<russh_server::Config>>,
    /// Wakes the accept loop on `stop()`. Fresh per `listen()` so a
    /// stale permit cannot abort a later generation.
    shutdown: Option<Arc<Notify>>,
}

/// Embeddable SSH server exposing bare repositories over the smart
/// transport.
///
/// Construct it with a [`Config`], register the host callbacks, then
/// drive the lifecycle: [`listen`](Server::listen) binds and prepares
/// the SSH identity, [`serve`](Server::serve) accepts until the
/// listener fails or [`stop`](Server::stop) is called. All lifecycle
/// methods take `&self`, so the server can be shared in an [`Arc`]
/// across tasks.
pub struct Server {
    config: Config,
    public_key_lookup: Option<Arc<PublicKeyLookup>>,
    authorize: Option<Arc<Authorize>>,
    state: Mutex<ListenState>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            public_key_lookup: None,
            authorize: None,
            state: Mutex::new(ListenState::default()),
        }
    }

    /// Register the key resolution callback. Receives each offered key
    /// in authorized-keys text form; returning `Ok(None)` rejects it.
    /// Required before [`listen`](Server::listen) when `auth` is on.
    pub fn set_public_key_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Result<Option<PublicKey>> + Send + Sync + 'static,
    {
        self.public_key_lookup = Some(Arc::new(lookup));
    }

    /// Register the access-control callback, called per exec request
    /// with `(key_id, repo)` where `repo` has no `.git` suffix.
    pub fn set_authorize<F>(&mut self, authorize: F)
    where
        F: Fn(&str, &str) -> Result<bool> + Send + Sync + 'static,
    {
        self.authorize = Some(Arc::new(authorize));
    }

    /// Prepare the SSH identity and repository root, then bind `addr`.
    /// Addresses without a host part (`:2222`, `:0`) bind the wildcard
    /// interface. Fails with [`Error::AlreadyStarted`] while listening.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.listener.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let ssh_config = self.build_ssh_config().await?;
        repo::setup(&self.config).await?;

        let listener = TcpListener::bind(normalize_addr(addr)).await?;
        info!(address = %listener.local_addr()?, "listening");

        state.ssh_config = Some(ssh_config);
        state.listener = Some(Arc::new(listener));
        state.shutdown = Some(Arc::new(Notify::new()));
        Ok(())
    }

    /// Accept connections until the listener fails or
    /// [`stop`](Server::stop) wakes the loop. Each connection performs
    /// its handshake and runs its sessions on a dedicated task.
    pub async fn serve(&self) -> Result<()> {
        let (listener, ssh_config, shutdown) = {
            let state = self.state.lock().await;
            match (&state.listener, &state.ssh_config, &state.shutdown) {
                (Some(listener), Some(ssh_config), Some(shutdown)) => (
                    Arc::clone(listener),
                    Arc::clone(ssh_config),
                    Arc::clone(shutdown),
                ),
                _ => return Err(Error::NoListener),
            }
        };

        let ctx = Arc::new(SessionContext {
            config: self.config.clone(),
            public_key_lookup: self.public_key_lookup.clone(),
            authorize: self.authorize.clone(),
        });

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.notified() => return Err(Error::ListenerClosed),
            };

            debug!(peer = %peer_addr, "connection accepted");

            let handler = SshSession::new(Arc::clone(&ctx), Some(peer_addr));
            let ssh_config = Arc::clone(&ssh_config);
            tokio::spawn(async move {
                match russh_server::run_stream(ssh_config, stream, handler).await {
                    Ok(session) => {
                        if let Err(e) = session.await {
                            debug!(peer = %peer_addr, error = %e, "session ended with error");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "handshake failed");
                    }
                }
            });
        }
    }

    /// [`listen`](Server::listen) and [`serve`](Server::serve) composed.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        self.listen(addr).await?;
        self.serve().await
    }

    /// The bound address, or the empty string when not listening. With
    /// `listen(":0")` this is where the OS-chosen port shows up.
    pub async fn address(&self) -> String {
        let state = self.state.lock().await;
        state
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    /// Close the listener and wake the accept loop; a no-op when not
    /// listening. Sessions already running are left to finish on their
    /// own.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.listener.take().is_some() {
            state.ssh_config = None;
            if let Some(shutdown) = state.shutdown.take() {
                // A stored permit covers a serve() that has read the
                // state but not yet reached its select.
                shutdown.notify_one();
                shutdown.notify_waiters();
            }
            info!("listener stopped");
        }
    }

    async fn build_ssh_config(&self) -> Result<Arc<russh_server::Config>> {
        if self.config.auth && self.public_key_lookup.is_none() {
            return Err(Error::MissingLookup);
        }

        let host_keys = keys::setup_host_keys(&self.config.key_dir).await?;

        let methods = if self.config.auth {
            MethodSet::PUBLICKEY
        } else {
            MethodSet::NONE
        };

        Ok(Arc::new(russh_server::Config {
            server_id: SshId::Standard(format!(
                "SSH-2.0-gitkit {}",
                env!("CARGO_PKG_VERSION")
            )),
            keys: host_keys,
            methods,
            inactivity_timeout: Some(Duration::from_secs(600)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        }))
    }
}

/// `net.Listen`-style addresses like `:0` have no host part; bind the
/// wildcard interface for them.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_addr_fills_wildcard_host() {
        assert_eq!(normalize_addr(":0"), "0.0.0.0:0");
        assert_eq!(normalize_addr(":2222"), "0.0.0.0:2222");
        assert_eq!(normalize_addr("127.0.0.1:22"), "127.0.0.1:22");
    }

    #[tokio::test]
    async fn listen_requires_lookup_when_auth_is_on() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Server::new(Config {
            key_dir: tmp.path().join("keys"),
            dir: tmp.path().join("repos"),
            auth: true,
            ..Config::default()
        });

        assert!(matches!(
            server.listen("127.0.0.1:0").await,
            Err(Error::MissingLookup)
        ));
    }

    #[tokio::test]
    async fn serve_before_listen_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Server::new(Config {
            key_dir: tmp.path().join("keys"),
            dir: tmp.path().join("repos"),
            ..Config::default()
        });
        assert!(matches!(server.serve().await, Err(Error::NoListener)));
    }
}
