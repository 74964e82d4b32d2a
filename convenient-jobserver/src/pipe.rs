//! Async access to a job server token channel.
//!
//! The descriptors a parent hands down are shared open file descriptions:
//! flipping them to non-blocking would also change them for the parent make.
//! We therefore reopen the channel through `/proc/self/fd` (or the FIFO path),
//! which yields private descriptions that can be non-blocking and close-on-exec
//! while the originals stay untouched for our children to inherit.

use crate::error::{JobServerError, JobServerResult};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tokio::io::unix::AsyncFd;

/// Non-blocking reader/writer over one token channel.
#[derive(Debug)]
pub(crate) struct TokenPipe {
    reader: AsyncFd<OwnedFd>,
    writer: OwnedFd,
}

impl TokenPipe {
    /// Open private handles onto inherited pipe descriptors.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn from_inherited(read: RawFd, write: RawFd) -> JobServerResult<Self> {
        let channel = format!("pipe {read},{write}");
        for fd in [read, write] {
            fcntl(fd, FcntlArg::F_GETFD).map_err(|errno| JobServerError::Unreachable {
                channel: channel.clone(),
                reason: format!("descriptor {fd} is not open ({errno})"),
            })?;
        }

        let reader = reopen(Path::new(&format!("/proc/self/fd/{read}")), false).map_err(|e| {
            JobServerError::Unreachable {
                channel: channel.clone(),
                reason: e.to_string(),
            }
        })?;
        let writer = reopen(Path::new(&format!("/proc/self/fd/{write}")), true).map_err(|e| {
            JobServerError::Unreachable {
                channel: channel.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            reader: AsyncFd::new(reader)?,
            writer,
        })
    }

    /// Open a named FIFO channel.
    pub(crate) fn from_fifo(path: &Path) -> JobServerResult<Self> {
        let fifo_err = |source| JobServerError::Fifo {
            path: path.to_path_buf(),
            source,
        };
        // The read side has to exist before a non-blocking writer may open.
        let reader = reopen(path, false).map_err(fifo_err)?;
        let writer = reopen(path, true).map_err(fifo_err)?;

        Ok(Self {
            reader: AsyncFd::new(reader)?,
            writer,
        })
    }

    /// Wait for one token byte.
    pub(crate) async fn read_token(&self) -> JobServerResult<u8> {
        loop {
            let mut guard = self.reader.readable().await?;
            let mut buf = [0u8; 1];

            let attempt = guard.try_io(|inner| {
                nix::unistd::read(inner.get_ref().as_raw_fd(), &mut buf).map_err(io::Error::from)
            });

            match attempt {
                Ok(Ok(1)) => return Ok(buf[0]),
                Ok(Ok(_)) => return Err(JobServerError::Closed),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                // Another waiter won the byte; readiness was cleared, wait again.
                Err(_would_block) => continue,
            }
        }
    }

    /// Return one token byte to the channel.
    pub(crate) fn write_token(&self, token: u8) -> JobServerResult<()> {
        loop {
            match nix::unistd::write(&self.writer, &[token]) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(JobServerError::Closed),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from(errno).into()),
            }
        }
    }
}

fn reopen(path: &Path, write: bool) -> io::Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)?;
    Ok(OwnedFd::from(file))
}
