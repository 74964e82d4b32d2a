//! Subprocess execution and multiplexed build logs.
//!
//! - [`ProcessRunner`] starts one tool and yields its merged stdout/stderr
//!   line by line.
//! - [`LogMultiplexer`] collects the lines of many concurrently running tools
//!   into one sink, classifies them with [`Classifier`] rules, and offers a
//!   completion barrier ([`LogMultiplexer::wait_for_log_end`]).
//! - [`run_logged`] glues the two together for the common case.

pub mod classify;
pub mod command;
pub mod error;
pub mod log;
pub mod mux;
pub mod runner;

pub use classify::{Classifier, DiagnosticRule, RuleSpec};
pub use command::CommandSpec;
pub use error::{ProcessError, ProcessResult};
pub use log::{LogRecord, Severity, SourceId};
pub use mux::{LogMultiplexer, LogSink, LogSource, MemorySink, SourceSummary, TracingSink};
pub use runner::{
    ProcessOutcome, ProcessRunner, RunningProcess, StopReason, Supervised, TERMINATE_GRACE,
    exit_code, run_logged,
};
