//! Errors for subprocess execution and log classification.

use thiserror::Error;

/// Errors raised while launching or supervising a subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// No program was given.
    #[error("empty command line")]
    EmptyCommand,

    /// The program could not be started (not found, not executable, ...).
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        /// Program as written in argv[0].
        program: String,
        /// Error reported by the operating system.
        #[source]
        source: std::io::Error,
    },

    /// A diagnostic rule did not compile.
    #[error("invalid diagnostic pattern `{pattern}`: {source}")]
    Pattern {
        /// The offending regular expression.
        pattern: String,
        /// Compilation error.
        #[source]
        source: regex::Error,
    },

    /// I/O failure while reading output or waiting for exit.
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;
