//! Job Token Pool
//!
//! Bounds the number of concurrently running subprocesses across this
//! orchestrator and every make-aware child it spawns. Tokens are handed out as
//! [`JobToken`] guards which return their byte on drop, so a token can never
//! leak on an early return, a panic unwind or a cancelled future.

use crate::error::{JobServerError, JobServerResult};
use crate::makeflags::MakeFlags;
use crate::source::{GnuMakeClient, GnuMakeServer, TokenSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the pool obtains its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobServerMode {
    /// Join a parent job server if `MAKEFLAGS` advertises one, else serve.
    #[default]
    Auto,
    /// Always act as the top-level server.
    Server,
    /// Always join a parent; missing channel is an error.
    Client,
}

#[derive(Debug)]
struct PoolInner {
    source: Box<dyn TokenSource>,
    shutdown: CancellationToken,
    held: AtomicUsize,
    high_water: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Shared, cloneable handle to a token source.
#[derive(Debug, Clone)]
pub struct JobTokenPool {
    inner: Arc<PoolInner>,
}

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Tokens currently held through this pool.
    pub held: usize,
    /// Highest number of tokens held at once.
    pub high_water: usize,
    /// Total successful acquisitions.
    pub acquired: u64,
    /// Total releases.
    pub released: u64,
}

impl JobTokenPool {
    /// Wrap an arbitrary token source.
    pub fn with_source(source: Box<dyn TokenSource>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                source,
                shutdown: CancellationToken::new(),
                held: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Top-level pool handing out `capacity` tokens.
    pub fn server(capacity: usize) -> JobServerResult<Self> {
        Ok(Self::with_source(Box::new(GnuMakeServer::new(capacity)?)))
    }

    /// Pool borrowing tokens from the parent advertised in `MAKEFLAGS`.
    pub fn client() -> JobServerResult<Self> {
        Ok(Self::with_source(Box::new(GnuMakeClient::from_env()?)))
    }

    /// Default capacity for a top-level pool.
    pub fn default_capacity() -> usize {
        GnuMakeServer::default_capacity()
    }

    /// Pick a token source once at startup.
    ///
    /// An explicit `jobs` count always yields a server, since the caller asked
    /// for a specific budget rather than the parent's.
    pub fn from_mode(mode: JobServerMode, jobs: Option<usize>) -> JobServerResult<Self> {
        match (mode, jobs) {
            (JobServerMode::Client, _) => Self::client(),
            (_, Some(jobs)) => Self::server(jobs),
            (JobServerMode::Server, None) => Self::server(Self::default_capacity()),
            (JobServerMode::Auto, None) => {
                let advertised = MakeFlags::from_env()?.filter(|flags| flags.channel.is_some());
                match advertised {
                    Some(flags) => {
                        info!(makeflags = %flags.raw, "Parent job server detected");
                        Ok(Self::with_source(Box::new(GnuMakeClient::connect(flags)?)))
                    }
                    None => Self::server(Self::default_capacity()),
                }
            }
        }
    }

    /// Wait for a token.
    ///
    /// Fails with [`JobServerError::ShutDown`] once [`shutdown`](Self::shutdown)
    /// was called, even for callers already waiting.
    pub async fn acquire(&self) -> JobServerResult<JobToken> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JobServerError::ShutDown);
        }

        let byte = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return Err(JobServerError::ShutDown),
            byte = self.inner.source.acquire() => byte?,
        };

        Ok(self.track(byte))
    }

    /// Wait for a token unless `cancel` fires first.
    pub async fn acquire_or_cancel(&self, cancel: &CancellationToken) -> JobServerResult<JobToken> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JobServerError::Cancelled),
            token = self.acquire() => token,
        }
    }

    fn track(&self, byte: u8) -> JobToken {
        let held = self.inner.held.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.high_water.fetch_max(held, Ordering::SeqCst);
        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(held, source = self.inner.source.kind(), "Acquired job token");

        JobToken {
            byte,
            pool: self.inner.clone(),
        }
    }

    /// Stop handing out tokens and wake all waiters.
    ///
    /// Tokens already held stay valid and are still returned on drop.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Tokens currently held.
    pub fn held(&self) -> usize {
        self.inner.held.load(Ordering::SeqCst)
    }

    /// Highest concurrent hold count observed.
    pub fn high_water(&self) -> usize {
        self.inner.high_water.load(Ordering::SeqCst)
    }

    /// Accounting snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            held: self.held(),
            high_water: self.high_water(),
            acquired: self.inner.acquired.load(Ordering::SeqCst),
            released: self.inner.released.load(Ordering::SeqCst),
        }
    }

    /// Token count, if the source knows it.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.source.capacity()
    }

    /// `"server"` or `"client"`.
    pub fn kind(&self) -> &'static str {
        self.inner.source.kind()
    }

    /// Environment for children so they share this budget.
    pub fn child_env(&self) -> Vec<(String, String)> {
        self.inner.source.child_env()
    }
}

/// One held job token, returned to its pool on drop.
#[derive(Debug)]
#[must_use = "dropping a JobToken releases it immediately"]
pub struct JobToken {
    byte: u8,
    pool: Arc<PoolInner>,
}

impl JobToken {
    /// Return the token now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for JobToken {
    fn drop(&mut self) {
        if let Err(e) = self.pool.source.release(self.byte) {
            warn!("Failed to return job token: {}", e);
        }
        let held = self.pool.held.fetch_sub(1, Ordering::SeqCst) - 1;
        self.pool.released.fetch_add(1, Ordering::SeqCst);
        debug!(held, "Released job token");
    }
}
