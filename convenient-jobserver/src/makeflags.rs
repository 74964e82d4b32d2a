//! `MAKEFLAGS` codec for the GNU make job server protocol.
//!
//! GNU make advertises its token channel to recursive invocations through the
//! `MAKEFLAGS` environment variable. Two spellings exist for anonymous pipes
//! (`--jobserver-auth=R,W` and the legacy `--jobserver-fds=R,W`) and make 4.4
//! added named FIFOs (`--jobserver-auth=fifo:PATH`).

use crate::error::{JobServerError, JobServerResult};
use std::os::fd::RawFd;
use std::path::PathBuf;

/// Name of the environment variable carrying the flags.
pub const MAKEFLAGS: &str = "MAKEFLAGS";

/// Token channel advertised by a parent job server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Inherited anonymous pipe descriptors.
    Pipe {
        /// Read end (tokens are taken from here).
        read: RawFd,
        /// Write end (tokens are returned here).
        write: RawFd,
    },
    /// Named FIFO shared by path.
    Fifo(PathBuf),
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Pipe { read, write } => write!(f, "pipe {read},{write}"),
            Channel::Fifo(path) => write!(f, "fifo {}", path.display()),
        }
    }
}

/// The job-server relevant subset of `MAKEFLAGS`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MakeFlags {
    /// Total job count (`-jN`), if the parent set one.
    pub jobs: Option<usize>,
    /// Advertised token channel, if any.
    pub channel: Option<Channel>,
    /// The unmodified value, forwarded verbatim to our own children.
    pub raw: String,
}

impl MakeFlags {
    /// Parse a `MAKEFLAGS` value.
    ///
    /// Descriptors of `-2,-2` mean the parent deliberately disabled the job
    /// server for this child and are treated as "not advertised".
    pub fn parse(value: &str) -> JobServerResult<Self> {
        let mut flags = MakeFlags {
            raw: value.to_string(),
            ..Default::default()
        };

        for word in value.split_whitespace() {
            if let Some(auth) = word
                .strip_prefix("--jobserver-auth=")
                .or_else(|| word.strip_prefix("--jobserver-fds="))
            {
                flags.channel = parse_auth(auth)?;
            } else if let Some(count) = word.strip_prefix("-j") {
                if count.is_empty() {
                    flags.jobs = None;
                } else {
                    let jobs = count
                        .parse::<usize>()
                        .map_err(|_| JobServerError::MalformedFlags(word.to_string()))?;
                    flags.jobs = Some(jobs);
                }
            }
        }

        Ok(flags)
    }

    /// Read and parse `MAKEFLAGS` from the process environment.
    ///
    /// Returns `Ok(None)` when the variable is unset.
    pub fn from_env() -> JobServerResult<Option<Self>> {
        match std::env::var(MAKEFLAGS) {
            Ok(value) => Self::parse(&value).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Render the flags a server hands to its children.
    pub fn render_server(jobs: usize, read: RawFd, write: RawFd) -> String {
        format!(" -j{jobs} --jobserver-auth={read},{write} --jobserver-fds={read},{write}")
    }
}

fn parse_auth(auth: &str) -> JobServerResult<Option<Channel>> {
    if let Some(path) = auth.strip_prefix("fifo:") {
        if path.is_empty() {
            return Err(JobServerError::MalformedFlags(auth.to_string()));
        }
        return Ok(Some(Channel::Fifo(PathBuf::from(path))));
    }

    let (read, write) = auth
        .split_once(',')
        .ok_or_else(|| JobServerError::MalformedFlags(auth.to_string()))?;
    let read: RawFd = read
        .parse()
        .map_err(|_| JobServerError::MalformedFlags(auth.to_string()))?;
    let write: RawFd = write
        .parse()
        .map_err(|_| JobServerError::MalformedFlags(auth.to_string()))?;

    if read < 0 || write < 0 {
        return Ok(None);
    }
    Ok(Some(Channel::Pipe { read, write }))
}
