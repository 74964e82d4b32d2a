//! Error types for the job token pool.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while negotiating or exchanging job tokens.
#[derive(Debug, Error)]
pub enum JobServerError {
    /// The parent advertised a token channel that cannot be opened.
    #[error("job server channel {channel} is unreachable: {reason}")]
    Unreachable {
        /// Human-readable description of the advertised channel.
        channel: String,
        /// Why the channel could not be used.
        reason: String,
    },

    /// A client was requested but no parent advertised a channel.
    #[error("no job server advertised in MAKEFLAGS")]
    NotAdvertised,

    /// The parent runs with a single job slot, so nothing could ever be acquired.
    #[error("parent job server has no spare tokens (-j{jobs})")]
    NoSpareTokens {
        /// Job count advertised by the parent.
        jobs: usize,
    },

    /// `MAKEFLAGS` could not be parsed.
    #[error("malformed MAKEFLAGS entry `{0}`")]
    MalformedFlags(String),

    /// A FIFO channel path could not be opened.
    #[error("cannot open job server fifo {path}: {source}")]
    Fifo {
        /// FIFO path from `--jobserver-auth=fifo:PATH`.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The token channel reached end-of-file.
    #[error("job server channel closed")]
    Closed,

    /// The requested job count does not fit into the token pipe.
    #[error("cannot serve {requested} jobs: token pipe holds at most {limit}")]
    TooManyJobs {
        /// Requested token count.
        requested: usize,
        /// Pipe buffer size in bytes, one byte per token.
        limit: usize,
    },

    /// The pool was shut down while waiting.
    #[error("job token pool shut down")]
    ShutDown,

    /// Waiting was abandoned because the caller cancelled.
    #[error("token acquisition cancelled")]
    Cancelled,

    /// Low-level I/O failure on the channel.
    #[error("job server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for job server operations.
pub type JobServerResult<T> = Result<T, JobServerError>;
