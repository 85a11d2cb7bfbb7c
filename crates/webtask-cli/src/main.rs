//! webtask CLI entry point

use anyhow::Result;
use clap::Parser;
use webtask_cli::{
    cli::{Cli, Commands},
    commands::{download, fetch},
    logging,
    utils::ColoredOutput,
    Settings,
};

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {:#}", ColoredOutput::error("Error:"), e);
            1
        }
    };

    std::process::exit(exit_code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.json_logs)?;
    if cli.no_color {
        colored::control::set_override(false);
    }
    tracing::debug!("webtask CLI v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Fetch(args) => fetch::run(args, &settings),
        Commands::Download(args) => download::run(args, &settings),
    }
}
