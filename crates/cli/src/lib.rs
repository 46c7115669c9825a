pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use opsbot_core::config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "opsbot",
    about = "Opsbot operator CLI",
    long_about = "Chat with the infrastructure assistant, inspect its intent catalog and \
                  effective configuration, run readiness checks, and apply migrations.",
    after_help = "Examples:\n  opsbot chat\n  opsbot chat --persist --session ops\n  opsbot doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Start an interactive conversation against the demo backend")]
    Chat {
        #[arg(long, help = "Session id to resume or create (random by default)")]
        session: Option<String>,
        #[arg(long, help = "Persist session context in the configured SQLite database")]
        persist: bool,
    },
    #[command(about = "List the intent catalog with required slots and risk flags")]
    Intents,
    #[command(about = "Inspect effective configuration values with secrets redacted")]
    Config,
    #[command(about = "Validate config, database connectivity, and LLM reachability")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
}

pub fn init_logging(config: &AppConfig) {
    use opsbot_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Chat { session, persist } => commands::chat::run(session, persist),
        Command::Intents => {
            commands::CommandResult { exit_code: 0, output: commands::intents::run() }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Migrate => commands::migrate::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
