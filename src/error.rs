use std::io;

/// Errors surfaced by the server, the repository manager, and the
/// post-receive pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The SSH exec payload did not match the git command grammar.
    #[error("invalid git command")]
    InvalidCommand,

    #[error("server has already been started")]
    AlreadyStarted,

    #[error("cannot call serve() before listen()")]
    NoListener,

    /// The accept loop was woken by `stop()`.
    #[error("listener closed")]
    ListenerClosed,

    /// The host authorization callback refused the key.
    #[error("key '{0}' is not authorized")]
    AuthRejected(String),

    #[error("cant push to non-main branch")]
    PolicyViolation,

    #[error("bad hook input: {0}")]
    BadHookInput(String),

    /// A spawned child failed; `message` carries its captured stderr.
    #[error("{command}: {message}")]
    SubprocessFailed { command: String, message: String },

    #[error("host key error: {0}")]
    HostKey(String),

    #[error("public key lookup func is not provided")]
    MissingLookup,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh_keys::Error),

    /// Escape hatch for host-supplied callbacks.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
