use anyhow::{Context, Result};
use clap::Parser;

mod cli;
mod commands;

use app_locker::AppLockerConfig;
use app_locker::config::get_config_path;
use cli::{Args, Commands, ResetCommands};
use commands::{apps, reset, setup, utils::init_logging};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => get_config_path()?,
    };

    // Works before a config file exists
    if let Commands::InitConfig { force } = args.command {
        return setup::init_config(&config_path, force);
    }

    let config = AppLockerConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    init_logging(args.verbose, &config.logging)?;
    tracing::debug!("Using config: {}", config_path.display());

    match args.command {
        Commands::InitConfig { .. } => Ok(()),
        Commands::Setup { identity } => setup::setup(&config, &identity),
        Commands::Apps { filter } => apps::apps(filter.as_deref()),
        Commands::Protect { apps: names } => apps::protect(&config, &names),
        Commands::Unprotect { app, code } => apps::unprotect(&config, &app, code),
        Commands::List => apps::list(&config),
        Commands::SetPin { code } => setup::set_pin(&config, code),
        Commands::Reset { command } => match command {
            ResetCommands::Request { identity } => reset::request(&config, &identity),
            ResetCommands::Complete { identity, code } => {
                reset::complete(&config, &identity, &code)
            }
        },
        Commands::Run { no_console } => commands::run::run(&config, no_console),
    }
}
