//! contextloom CLI: offline inspection of context assembly.
//!
//! Commands:
//! - `assemble`: Build the context for a stored session and show what was kept
//! - `analyze`: Show tool chains, segments and dependency clusters of a session
//! - `count`: Count tokens with the configured strategy
//! - `config`: Show the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "contextloom",
    about = "contextloom: token-budgeted context assembly for conversational agents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.contextloom/config.toml)
    #[arg(short, long, global = true, env = "CONTEXTLOOM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the context for a session file
    Assemble {
        /// Session file ({"session_id": ..., "turns": [...]})
        #[arg(short, long)]
        session: PathBuf,

        /// Use a fixed history budget instead of the model limit
        #[arg(short, long)]
        budget: Option<usize>,

        /// Reduction level (0 = none, 3 = current turn only)
        #[arg(short, long, default_value_t = 0)]
        level: u32,

        /// Bridging strategy: conservative, moderate, aggressive, dependency_only
        #[arg(long)]
        strategy: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Analyze a session file
    Analyze {
        #[arg(short, long)]
        session: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Count tokens in text, a file, or stdin
    Count {
        text: Option<String>,

        #[arg(short, long, conflicts_with = "text")]
        file: Option<PathBuf>,
    },

    /// Show configuration
    Config {
        /// Print the built-in defaults instead of the effective config
        #[arg(long)]
        defaults: bool,

        /// Print the config file path only
        #[arg(long, conflicts_with = "defaults")]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Assemble {
            session,
            budget,
            level,
            strategy,
            json,
        } => {
            let options = commands::assemble::AssembleOptions {
                session,
                budget,
                level,
                strategy,
                json,
            };
            commands::assemble::run(config, options).await?
        }
        Commands::Analyze { session, json } => commands::analyze::run(config, &session, json).await?,
        Commands::Count { text, file } => commands::count::run(config, text, file.as_deref()).await?,
        Commands::Config { defaults, path } => commands::config_cmd::run(config, defaults, path)?,
    }

    Ok(())
}
