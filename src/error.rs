//! Error types for caller-facing operations.
//!
//! These cover configuration and usage mistakes that are reported
//! synchronously. Transport and timeout failures are asynchronous and reach
//! the caller through the relevant callback instead.

use thiserror::Error;

/// Errors returned synchronously from [`crate::MeshMq`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Category or command registration after `start()`.
    #[error("categories and commands cannot be changed after start()")]
    AlreadyStarted,

    /// `start()` called twice.
    #[error("start() may only be called once")]
    AlreadyRunning,

    /// Network operation attempted before `start()`.
    #[error("instance is not running; call start() first")]
    NotStarted,

    /// Category name reused.
    #[error("category `{0}` already exists")]
    DuplicateCategory(String),

    /// Category or command name outside `[A-Za-z0-9_-]+`.
    #[error("invalid name `{0}`: names must match [A-Za-z0-9_-]+")]
    InvalidName(String),

    /// Command added to a category that was never registered.
    #[error("unknown category `{0}`")]
    UnknownCategory(String),

    /// Command name reused within a category.
    #[error("command `{0}` already exists in category `{1}`")]
    DuplicateCommand(String, String),

    /// Listening on an in-process endpoint; those exist only through
    /// `connect_inproc`.
    #[error("cannot listen on in-process endpoint `{0}`; use connect_inproc")]
    InprocListen(String),

    /// Endpoint string that is not `tcp://`, `ipc://` or `inproc://`.
    #[error("unparseable endpoint `{0}`")]
    BadEndpoint(String),

    /// Pre-start listener failed to bind.
    #[error("failed to bind `{addr}`: {reason}")]
    Bind { addr: String, reason: String },

    /// The proxy thread failed to come up.
    #[error("proxy startup failed: {0}")]
    Startup(String),
}
