//! Bauleiter - parallel firmware build orchestrator

use bauleiter::commands::{self, Cli, Commands};
use bauleiter::settings::Settings;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.default_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> bauleiter::BuildResult<i32> {
    let mut settings = Settings::discover(cli.config.as_deref())?;
    cli.apply(&mut settings);

    match &cli.command {
        Commands::Build(args) => commands::build::execute(settings, args).await,
        Commands::ListProjects { selectors, format } => {
            commands::list::execute(&settings, selectors, format)?;
            Ok(0)
        }
    }
}
