//! GNU make compatible job token pool.
//!
//! A build orchestrator that launches many compilers at once has to agree with
//! whoever started it on how much parallelism the host can take. GNU make solves
//! this with a *job server*: a pipe holding one byte per free job slot. This
//! crate speaks that protocol in both directions:
//!
//! - at the top level it creates the pipe itself ([`GnuMakeServer`]) and
//!   advertises it to children through `MAKEFLAGS`;
//! - when started beneath `make -jN` it joins the parent's pipe
//!   ([`GnuMakeClient`]) and never invents tokens of its own.
//!
//! Either way callers only see a [`JobTokenPool`] handing out RAII
//! [`JobToken`]s.
//!
//! ```no_run
//! use convenient_jobserver::{JobServerMode, JobTokenPool};
//!
//! # async fn demo() -> convenient_jobserver::JobServerResult<()> {
//! let pool = JobTokenPool::from_mode(JobServerMode::Auto, None)?;
//! let token = pool.acquire().await?;
//! // ... run one subprocess ...
//! drop(token);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod makeflags;
mod pipe;
pub mod pool;
pub mod source;

pub use error::{JobServerError, JobServerResult};
pub use makeflags::{Channel, MAKEFLAGS, MakeFlags};
pub use pool::{JobServerMode, JobToken, JobTokenPool, PoolStats};
pub use source::{GnuMakeClient, GnuMakeServer, TOKEN_BYTE, TokenSource};
