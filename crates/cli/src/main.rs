//! termpilot CLI, the main entry point.
//!
//! Commands:
//! - `chat`       Interactive session, or a single message with `-m`
//! - `models`     List the models a provider offers
//! - `providers`  Show the supported backends
//! - `config`     Show, locate, initialize or validate the configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use termpilot_core::{ApprovalPolicy, ProviderKind};

mod commands;

#[derive(Parser)]
#[command(
    name = "termpilot",
    about = "termpilot: a coding assistant in your terminal",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the coding agent
    #[command(alias = "agent")]
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Backend to use: openai, ollama or huggingface
        #[arg(short, long, env = "TERMPILOT_PROVIDER")]
        provider: Option<ProviderKind>,

        /// Model to request
        #[arg(long)]
        model: Option<String>,

        /// suggest, auto-edit or full-auto
        #[arg(short, long)]
        approval_mode: Option<ApprovalPolicy>,

        /// Directory commands run in
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Print every agent event as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// List models offered by a provider
    Models {
        /// Backend to ask; defaults to the configured one
        #[arg(short, long)]
        provider: Option<ProviderKind>,
    },

    /// Show the supported providers
    Providers,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so they never mix with the conversation.
    let filter = if cli.verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Chat {
            message,
            provider,
            model,
            approval_mode,
            workdir,
            json,
        } => {
            commands::chat::run(commands::chat::ChatArgs {
                message,
                provider,
                model,
                approval_mode,
                workdir,
                json,
            })
            .await?
        }
        Commands::Models { provider } => commands::models::run(provider).await?,
        Commands::Providers => commands::providers::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
        },
    }

    Ok(())
}
