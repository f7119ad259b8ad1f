mod cli;
mod commands;
mod components;
mod config;

use std::process;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::App;
use crate::config::PumpFile;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let file = PumpFile::load(&args.config)?;
    init_logging(args.verbose, args.quiet, file.log_level.as_deref());
    debug!(config = %args.config.display(), "Loaded definition file");

    let app = App::build(file, &components::registry())?;
    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run(app).await,
        Commands::Check => {
            commands::check(&app);
            Ok(())
        }
    }
}

fn init_logging(verbose: u8, quiet: bool, file_level: Option<&str>) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose > 1 {
        EnvFilter::new("trace")
    } else if verbose == 1 {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(file_level.unwrap_or("info")))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
