pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Parley operator CLI",
    long_about = "Operate the Parley conversational runtime: migrations, demo catalog, \
                  config inspection, readiness checks, handoffs and the dead-letter queue.",
    after_help = "Examples:\n  parley doctor --json\n  parley handoff release demo whatsapp \
                  +5511999990000\n  parley dead-letter requeue wamid.42"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo catalog into a workspace (idempotent)")]
    Seed {
        #[arg(long, default_value = "demo", help = "Workspace that receives the catalog")]
        workspace: String,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, reasoning service, outbound channel and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    /// Inspect or release conversations handed to a human
    #[command(subcommand)]
    Handoff(HandoffCommand),
    /// Inspect or requeue dead-lettered inbound events
    #[command(subcommand)]
    DeadLetter(DeadLetterCommand),
}

#[derive(Debug, Subcommand)]
enum HandoffCommand {
    #[command(about = "List conversations currently in handoff")]
    List,
    #[command(about = "Return a conversation to the agent")]
    Release { workspace: String, channel: String, sender: String },
}

#[derive(Debug, Subcommand)]
enum DeadLetterCommand {
    #[command(about = "List dead-lettered events, newest first")]
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    #[command(about = "Move a dead-lettered event back to pending")]
    Requeue { correlation_id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed { workspace } => commands::seed::run(&workspace),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Handoff(HandoffCommand::List) => commands::handoff::list(),
        Command::Handoff(HandoffCommand::Release { workspace, channel, sender }) => {
            commands::handoff::release(&workspace, &channel, &sender)
        }
        Command::DeadLetter(DeadLetterCommand::List { limit }) => {
            commands::dead_letter::list(limit)
        }
        Command::DeadLetter(DeadLetterCommand::Requeue { correlation_id }) => {
            commands::dead_letter::requeue(&correlation_id)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
