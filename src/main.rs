mod agents;
mod cli;
mod config;
mod engine;
mod error;
mod inventory;
mod jobs;
mod model;
mod repository;
mod store;
mod utils;
mod version;
mod workflow;

use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use config::Settings;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = Settings::load(&cli.config).and_then(|settings| match cli.command {
        Commands::Import { inventory } => workflow::execute_import(&settings, &inventory),
        Commands::Check => workflow::execute_check(&settings),
        Commands::List { include_unstable } => workflow::execute_list(&settings, include_unstable),
        Commands::Update { unit, to } => workflow::execute_update(&settings, unit, to),
        Commands::Restart { stack } => workflow::execute_restart(&settings, stack),
        Commands::Reset => workflow::execute_reset(&settings),
        Commands::Serve { max_ticks } => workflow::execute_serve(&settings, max_ticks),
    });

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}
