//! rowsync CLI
//!
//! Command-line tools for running and inspecting a rowsync server.
//!
//! # Commands
//!
//! - `serve` - Run the demo sync server over HTTP
//! - `schema` - Print the demo schema and its version hash
//! - `version` - Show version information

mod commands;
mod demo;

use clap::{Parser, Subcommand};
use commands::serve::ServeOptions;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// rowsync command-line tools.
#[derive(Parser)]
#[command(name = "rowsync")]
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
    /// Run the demo sync server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// User id to issue a `token-<id>` bearer token for (repeatable)
        #[arg(short, long = "user")]
        users: Vec<String>,

        /// Reject requests without a bearer token
        #[arg(long)]
        require_auth: bool,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Change-log entries kept for incremental pulls
        #[arg(long, default_value = "10000")]
        retention: usize,
    },

    /// Print the demo schema
    Schema {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            bind,
            users,
            require_auth,
            timeout,
            retention,
        } => {
            commands::serve::run(ServeOptions {
                bind,
                users,
                require_auth,
                timeout_secs: timeout,
                retention,
            })?;
        }
        Commands::Schema { format } => {
            commands::schema::run(&format)?;
        }
        Commands::Version => {
            println!("rowsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Sync protocol v{}", rowsync_protocol::PROTOCOL_VERSION);
            println!("Demo schema {}", demo::registry()?.version());
        }
    }

    Ok(())
}
