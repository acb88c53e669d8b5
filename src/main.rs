//! Main entry point for the Nanai Translator CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nanai_translator::cli::commands::{self, Commands};

/// Nanai Translator - Russian ↔ Nanai translation service
#[derive(Parser, Debug)]
#[command(name = "nanai-translator", version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults to environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let crate_target = env!("CARGO_PKG_NAME").replace('-', "_");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}={},tower_http={}", crate_target, default_level, default_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(command) = args.command else {
        println!("Please specify a command. Use --help for more information.");
        return Ok(());
    };

    let config = commands::load_config(args.config.as_deref())?;

    // Execute command
    match command {
        Commands::Server { host, port, lazy } => {
            commands::handle_server(config, host, port, lazy).await?;
        }
        Commands::Translate {
            direction,
            max_length,
            attempt,
            text,
        } => {
            commands::handle_translate(config, direction, max_length, attempt, text).await?;
        }
        Commands::Batch {
            file,
            output,
            direction,
        } => {
            commands::handle_batch(config, file, output, direction).await?;
        }
        Commands::Download => {
            commands::handle_download(config).await?;
        }
    }

    Ok(())
}
