//! Embeddable SSH server for bare git repositories.
//!
//! gitkit terminates SSH connections, authenticates them through
//! host-supplied callbacks, and dispatches the three smart-transport
//! subcommands (`git-upload-pack`, `git-upload-archive`,
//! `git-receive-pack`) against a directory of bare repositories,
//! splicing each child's stdio with the SSH channel. A post-receive
//! [`Receiver`] pipeline is included for server-side hooks.
//!
//! ```no_run
//! use gitkit::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> gitkit::Result<()> {
//!     let mut server = Server::new(Config {
//!         key_dir: "/var/lib/gitkit/keys".into(),
//!         dir: "/var/lib/gitkit/repos".into(),
//!         auto_create: true,
//!         ..Config::default()
//!     });
//!     server.set_authorize(|_key_id, repo| Ok(repo != "private"));
//!     server.listen_and_serve(":2222").await
//! }
//! ```

pub mod command;
pub mod config;
mod error;
pub mod keys;
pub mod receiver;
pub mod repo;
pub mod ssh;

pub use command::GitCommand;
pub use config::{load_config, Config, HookScripts};
pub use error::{Error, Result};
pub use receiver::{
    is_force_push, is_force_push_in, read_commit_message, read_commit_message_in,
    read_hook_input, HookInfo, Receiver, ZERO_SHA,
};
pub use ssh::{Authorize, PublicKey, PublicKeyLookup, Server};
