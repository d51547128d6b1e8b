//! SSH transport: the server control surface and the per-connection
//! session dispatcher.

mod server;
mod session;

pub use server::Server;

use crate::Result;

/// A public key the host recognizes, as returned by the lookup
/// callback. `id` is the opaque principal identifier threaded through
/// authorization and into the child's `GITKIT_KEY` environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicKey {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub content: String,
}

/// Resolves an offered public key, given in authorized-keys text form,
/// to a [`PublicKey`]. `Ok(None)` rejects the key.
pub type PublicKeyLookup = dyn Fn(&str) -> Result<Option<PublicKey>> + Send + Sync;

/// Decides whether `key_id` may access `repo` (`.git` suffix removed).
pub type Authorize = dyn Fn(&str, &str) -> Result<bool> + Send + Sync;
