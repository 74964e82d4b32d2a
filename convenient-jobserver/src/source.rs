//! Token sources: where job tokens physically come from.
//!
//! A top-level orchestrator owns the token channel ([`GnuMakeServer`]); an
//! orchestrator started beneath another parallel build borrows the parent's
//! channel ([`GnuMakeClient`]). Both speak the same byte-per-token protocol and
//! are interchangeable behind [`TokenSource`].

use crate::error::{JobServerError, JobServerResult};
use crate::makeflags::{Channel, MAKEFLAGS, MakeFlags};
use crate::pipe::TokenPipe;
use nix::fcntl::{FcntlArg, fcntl};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::{debug, info};

/// Byte written into pipes created by [`GnuMakeServer`].
pub const TOKEN_BYTE: u8 = b'+';

/// A supplier of job tokens.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync + std::fmt::Debug {
    /// Wait until a token is available and take it.
    async fn acquire(&self) -> JobServerResult<u8>;

    /// Give a previously acquired token back.
    fn release(&self, token: u8) -> JobServerResult<()>;

    /// Number of tokens this source hands out, when known.
    fn capacity(&self) -> Option<usize>;

    /// Environment entries children need to join the same token budget.
    fn child_env(&self) -> Vec<(String, String)>;

    /// Short label for logs.
    fn kind(&self) -> &'static str;
}

/// Top-level job server owning an inheritable token pipe.
#[derive(Debug)]
pub struct GnuMakeServer {
    /// Inheritable descriptors advertised to children; kept open for our lifetime.
    advertised_read: OwnedFd,
    advertised_write: OwnedFd,
    pipe: TokenPipe,
    capacity: usize,
}

impl GnuMakeServer {
    /// Create a server that hands out `capacity` tokens.
    ///
    /// The orchestrator's own implicit slot is not part of `capacity`.
    /// Must be called from within a tokio runtime.
    pub fn new(capacity: usize) -> JobServerResult<Self> {
        let capacity = capacity.max(1);
        let (read, write) = nix::unistd::pipe().map_err(std::io::Error::from)?;

        reserve_pipe(write.as_raw_fd(), capacity)?;
        let pipe = TokenPipe::from_inherited(read.as_raw_fd(), write.as_raw_fd())?;
        for _ in 0..capacity {
            pipe.write_token(TOKEN_BYTE)?;
        }

        info!(
            capacity,
            read_fd = read.as_raw_fd(),
            write_fd = write.as_raw_fd(),
            "Started job server"
        );

        Ok(Self {
            advertised_read: read,
            advertised_write: write,
            pipe,
            capacity,
        })
    }

    /// Capacity used when nothing else was configured: one slot per CPU,
    /// minus the orchestrator's implicit slot, but never less than one.
    pub fn default_capacity() -> usize {
        num_cpus::get().saturating_sub(1).max(1)
    }
}

/// Grow the pipe buffer so that `capacity` preloaded tokens fit.
fn reserve_pipe(fd: RawFd, capacity: usize) -> JobServerResult<()> {
    let size = fcntl(fd, FcntlArg::F_GETPIPE_SZ).map_err(std::io::Error::from)?;
    let limit = usize::try_from(size).unwrap_or(0);
    if capacity <= limit {
        return Ok(());
    }

    let too_many = JobServerError::TooManyJobs {
        requested: capacity,
        limit,
    };
    let Ok(wanted) = i32::try_from(capacity) else {
        return Err(too_many);
    };
    match fcntl(fd, FcntlArg::F_SETPIPE_SZ(wanted)) {
        Ok(size) => {
            debug!(size, capacity, "Enlarged job server pipe");
            Ok(())
        }
        Err(errno) => {
            debug!(capacity, "Cannot enlarge job server pipe: {}", errno);
            Err(too_many)
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for GnuMakeServer {
    async fn acquire(&self) -> JobServerResult<u8> {
        self.pipe.read_token().await
    }

    fn release(&self, token: u8) -> JobServerResult<()> {
        self.pipe.write_token(token)
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn child_env(&self) -> Vec<(String, String)> {
        vec![(
            MAKEFLAGS.to_string(),
            MakeFlags::render_server(
                self.capacity + 1,
                self.advertised_read.as_raw_fd(),
                self.advertised_write.as_raw_fd(),
            ),
        )]
    }

    fn kind(&self) -> &'static str {
        "server"
    }
}

/// Client of a parent job server.
///
/// Never fabricates tokens: every byte written back was read first.
#[derive(Debug)]
pub struct GnuMakeClient {
    pipe: TokenPipe,
    flags: MakeFlags,
}

impl GnuMakeClient {
    /// Join the channel described by `flags`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(flags: MakeFlags) -> JobServerResult<Self> {
        let channel = flags.channel.clone().ok_or(JobServerError::NotAdvertised)?;

        if let Some(jobs) = flags.jobs.filter(|&jobs| jobs <= 1) {
            return Err(JobServerError::NoSpareTokens { jobs });
        }

        let pipe = match &channel {
            Channel::Pipe { read, write } => TokenPipe::from_inherited(*read, *write)?,
            Channel::Fifo(path) => TokenPipe::from_fifo(path)?,
        };

        debug!(%channel, jobs = ?flags.jobs, "Joined parent job server");
        Ok(Self { pipe, flags })
    }

    /// Join the channel advertised in this process's `MAKEFLAGS`.
    pub fn from_env() -> JobServerResult<Self> {
        let flags = MakeFlags::from_env()?.ok_or(JobServerError::NotAdvertised)?;
        Self::connect(flags)
    }
}

#[async_trait::async_trait]
impl TokenSource for GnuMakeClient {
    async fn acquire(&self) -> JobServerResult<u8> {
        self.pipe.read_token().await
    }

    fn release(&self, token: u8) -> JobServerResult<()> {
        self.pipe.write_token(token)
    }

    fn capacity(&self) -> Option<usize> {
        // The parent's budget is shared with siblings we cannot see.
        None
    }

    fn child_env(&self) -> Vec<(String, String)> {
        vec![(MAKEFLAGS.to_string(), self.flags.raw.clone())]
    }

    fn kind(&self) -> &'static str {
        "client"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_hands_out_capacity_tokens() {
        let server = GnuMakeServer::new(2).unwrap();
        let a = server.acquire().await.unwrap();
        let b = server.acquire().await.unwrap();
        assert_eq!(a, TOKEN_BYTE);
        assert_eq!(b, TOKEN_BYTE);

        let third =
            tokio::time::timeout(std::time::Duration::from_millis(50), server.acquire()).await;
        assert!(third.is_err(), "third token must not be available");

        server.release(a).unwrap();
        server.release(b).unwrap();
    }

    #[tokio::test]
    async fn test_server_larger_than_default_pipe() {
        let server = GnuMakeServer::new(100_000).unwrap();
        assert_eq!(server.capacity(), Some(100_000));
        let token = server.acquire().await.unwrap();
        server.release(token).unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_unrepresentable_job_count() {
        let err = GnuMakeServer::new(usize::MAX).unwrap_err();
        assert!(matches!(
            err,
            JobServerError::TooManyJobs { requested: usize::MAX, .. }
        ));
        assert!(err.to_string().starts_with("cannot serve"));
    }

    #[tokio::test]
    async fn test_server_env_advertises_channel() {
        let server = GnuMakeServer::new(3).unwrap();
        let env = server.child_env();
        assert_eq!(env.len(), 1);
        let flags = MakeFlags::parse(&env[0].1).unwrap();
        assert_eq!(flags.jobs, Some(4));
        assert!(matches!(flags.channel, Some(Channel::Pipe { .. })));
    }

    #[tokio::test]
    async fn test_client_shares_server_tokens() {
        let server = GnuMakeServer::new(1).unwrap();
        let (_, makeflags) = server.child_env().remove(0);
        let client = GnuMakeClient::connect(MakeFlags::parse(&makeflags).unwrap()).unwrap();

        let token = client.acquire().await.unwrap();
        let starved =
            tokio::time::timeout(std::time::Duration::from_millis(50), server.acquire()).await;
        assert!(starved.is_err(), "client holds the only token");

        client.release(token).unwrap();
        let again = server.acquire().await.unwrap();
        server.release(again).unwrap();
    }

    #[tokio::test]
    async fn test_client_unreachable_descriptors() {
        let flags = MakeFlags::parse("-j4 --jobserver-auth=900,901").unwrap();
        let err = GnuMakeClient::connect(flags).unwrap_err();
        assert!(matches!(err, JobServerError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_client_rejects_single_slot_parent() {
        let flags = MakeFlags::parse("-j1 --jobserver-auth=3,4").unwrap();
        let err = GnuMakeClient::connect(flags).unwrap_err();
        assert!(matches!(err, JobServerError::NoSpareTokens { jobs: 1 }));
    }

    #[tokio::test]
    async fn test_client_requires_channel() {
        let flags = MakeFlags::parse("-j4").unwrap();
        let err = GnuMakeClient::connect(flags).unwrap_err();
        assert!(matches!(err, JobServerError::NotAdvertised));
    }
}
