//! Bauleiter command-line interface
//!
//! - `build`: configure, compile, pack and sign the selected projects
//! - `list-projects`: print the selected projects through a template

use crate::settings::Settings;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod build;
pub mod list;

/// Bauleiter - parallel firmware build orchestrator
#[derive(Parser, Debug)]
#[command(name = "bauleiter")]
#[command(about = "Parallel firmware build orchestrator for multi-board embedded projects")]
#[command(version)]
pub struct Cli {
    /// Settings file (default: ./bauleiter.yml when present)
    #[arg(short = 'C', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Root of all build output
    #[arg(long, global = true)]
    pub build_dir: Option<PathBuf>,

    /// Directory searched for BUILD.yml files (repeatable)
    #[arg(short = 'p', long = "projects-dir", global = true)]
    pub projects_dirs: Vec<PathBuf>,

    /// Job count; forces a fresh job server with this many tokens
    #[arg(short, long, global = true)]
    pub jobs: Option<usize>,

    /// Debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build projects
    Build(BuildArgs),

    /// List projects
    ListProjects {
        /// Names, wildcards or %program selectors (default: all projects)
        selectors: Vec<String>,

        /// Output template; supports {name} {board} {program} {toolchains}
        /// {packer} {signer} {dir} and the escapes \n \t
        #[arg(long, default_value = "{name}\\n")]
        format: String,
    },
}

/// Arguments of `build`.
#[derive(Args, Debug, Clone, Default)]
pub struct BuildArgs {
    /// Names, wildcards or %program selectors
    pub selectors: Vec<String>,

    /// Build every known project
    #[arg(short, long)]
    pub all: bool,

    /// Keep building other projects and units after a failure
    #[arg(short, long)]
    pub keep_going: bool,

    /// Remove each project's build directory first
    #[arg(long)]
    pub clobber: bool,

    /// Toolchain for all projects instead of their preferred one
    #[arg(long)]
    pub toolchain: Option<String>,

    /// Remove unit build trees after a project succeeded
    #[arg(long)]
    pub delete_intermediates: bool,

    /// Write a JSON report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl Cli {
    /// Apply global flags on top of the settings file.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(build_dir) = &self.build_dir {
            settings.build_dir = build_dir.clone();
        }
        if !self.projects_dirs.is_empty() {
            settings.search_dirs = self.projects_dirs.clone();
        }
        if self.jobs.is_some() {
            settings.jobs = self.jobs;
        }
    }

    /// Default log filter for the chosen verbosity.
    pub fn default_filter(&self) -> String {
        let level = if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        };
        ["bauleiter", "convenient_jobserver", "convenient_process", "convenient_project", "build"]
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_flags() {
        let cli = Cli::parse_from([
            "bauleiter", "-j", "4", "-p", "a", "-p", "b", "build", "-k", "--clobber", "fatcat",
            "%skyrim",
        ]);
        let Commands::Build(args) = &cli.command else {
            panic!("expected build");
        };
        assert!(args.keep_going);
        assert!(args.clobber);
        assert_eq!(args.selectors, vec!["fatcat", "%skyrim"]);

        let mut settings = Settings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.jobs, Some(4));
        assert_eq!(settings.search_dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(settings.build_dir, PathBuf::from("build"));
    }

    #[test]
    fn test_list_default_format() {
        let cli = Cli::parse_from(["bauleiter", "list-projects"]);
        match cli.command {
            Commands::ListProjects { selectors, format } => {
                assert!(selectors.is_empty());
                assert_eq!(format, "{name}\\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_verbosity_filter() {
        let cli = Cli::parse_from(["bauleiter", "-q", "list-projects"]);
        assert!(cli.default_filter().starts_with("bauleiter=warn,"));
        assert!(Cli::try_parse_from(["bauleiter", "-q", "-v", "list-projects"]).is_err());
    }
}
