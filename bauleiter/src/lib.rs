//! Bauleiter - parallel firmware build orchestrator
//!
//! Builds many firmware projects at once. Each project is configured,
//! compiled as one or more units (e.g. RO and RW images), packed into a
//! single image and optionally signed. All subprocesses share one GNU make
//! job server budget, and their output is merged into one classified log.
//!
//! ```text
//! BUILD.yml files ─► ProjectRegistry ─► selectors ─► BuildPipeline
//!                                                      │
//!                     JobTokenPool ◄── StepExecutor ◄──┤ per unit
//!                     LogMultiplexer ◄─────────────────┘
//! ```

pub mod commands;
pub mod error;
pub mod packers;
pub mod pipeline;
pub mod result;
pub mod settings;
pub mod signals;
pub mod signers;
pub mod state;
pub mod steps;
pub mod unit;

pub use error::{BuildError, BuildResult, ErrorKind};
pub use pipeline::{BuildPipeline, PipelineOptions};
pub use result::{Artifact, EXIT_CANCELLED, ProjectResult, RunResult, UnitOutcome, UnitResult};
pub use settings::{Settings, StepTemplates, ToolPaths};
pub use state::{ProjectState, StateMachine};
pub use steps::StepExecutor;
pub use unit::BuildUnit;
