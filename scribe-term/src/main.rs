//! Scribe terminal client
//!
//! Edit a shared text document from the command line, or run a local relay
//! for other clients to join.
//!
//! # Commands
//!
//! - `connect` - Join a session and append stdin lines to the document
//! - `relay` - Run a relay on the given address

mod commands;

use clap::{Parser, Subcommand};
use scribe_sync::Stage;

/// Collaborative text editing over WebSocket.
#[derive(Parser)]
#[command(name = "scribe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a session and edit it from stdin
    Connect {
        /// Server base URL (overrides SCRIBE_URL)
        #[arg(short, long)]
        url: Option<String>,

        /// Session to join (overrides SCRIBE_SESSION)
        #[arg(short, long)]
        session: Option<String>,

        /// Authentication token (overrides SCRIBE_TOKEN)
        #[arg(short, long)]
        token: Option<String>,

        /// Do not reconnect after the connection drops
        #[arg(long)]
        no_reconnect: bool,

        /// Delay between reconnection attempts in milliseconds
        #[arg(long)]
        reconnect_ms: Option<u64>,
    },

    /// Run a relay server
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:9001")]
        bind: String,

        /// Outbound frame buffer per peer
        #[arg(short, long, default_value = "256")]
        capacity: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over the stage default.
    let stage = Stage::from_env();
    let filter = if cli.verbose {
        "debug"
    } else {
        stage.default_log_filter()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    log::debug!("Running in {} stage", stage.as_str());

    match cli.command {
        Commands::Connect {
            url,
            session,
            token,
            no_reconnect,
            reconnect_ms,
        } => {
            let options = commands::connect::Options {
                url,
                session,
                token,
                no_reconnect,
                reconnect_ms,
            };
            commands::connect::run(options).await?;
        }
        Commands::Relay { bind, capacity } => {
            commands::relay::run(bind, capacity).await?;
        }
    }

    Ok(())
}
