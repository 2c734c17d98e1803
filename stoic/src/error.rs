//! Error types for stoic sessions.

use stoic_proto::{FailureCode, ProtoError};

/// Alias for `Result<T, stoic::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Framing or payload decoding failed; the connection is unusable.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// An I/O error from the connection or the plugin store.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, received {received}")]
    VersionMismatch {
        /// Our protocol version.
        expected: i32,
        /// The peer's protocol version.
        received: i32,
    },

    /// `StartPlugin` named neither a builtin nor an uploaded plugin.
    #[error("StartPlugin must set at least one of pluginName/pluginSha")]
    InvalidDispatch,

    /// A message arrived that the current state cannot handle.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The peer answered a request with `Failed`.
    #[error("request rejected ({code:?}): {message}")]
    Rejected {
        /// Failure code from the response.
        code: FailureCode,
        /// Failure detail from the response.
        message: String,
    },

    /// The plugin is unknown to the server and no upload is available.
    #[error("plugin not found: {0}")]
    PluginMissing(String),

    /// The peer reported a fatal session error.
    #[error("remote protocol error: {0}")]
    Remote(String),

    /// A plugin name or hash is not usable as a store key.
    #[error("invalid {0}")]
    InvalidIdentity(String),

    /// An uploaded plugin could not be turned into a runnable body.
    #[error("failed to load plugin {name}: {reason}")]
    Load {
        /// Plugin name.
        name: String,
        /// Loader diagnostic.
        reason: String,
    },

    /// Server configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed configuration file.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
