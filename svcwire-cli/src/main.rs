//! svcwire-cli - Command-line interface for svcwire
//!
//! One-shot calls, event listening and emitting, and file uploads.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use svcwire_client::{Client, ConnectionConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "svcwire-cli")]
#[command(about = "Command-line interface for svcwire servers")]
#[command(version)]
pub struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7420")]
    server: SocketAddr,

    /// Authentication token
    #[arg(short = 't', long, env = "SVCWIRE_TOKEN")]
    token: Option<String>,

    /// Client id sent at handshake (random if unset)
    #[arg(long, env = "SVCWIRE_CLIENT_ID")]
    client_id: Option<String>,

    /// Client name sent at handshake
    #[arg(long, default_value = "svcwire-cli")]
    client_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// Invoke a service method
    Call {
        /// Command as Service.method
        command: String,

        /// Parameters, each JSON or @file.json. Non-JSON is sent as a string.
        params: Vec<String>,
    },

    /// List listeners registered for an event
    Listeners {
        /// Event name
        name: String,
    },

    /// Register a listener and print deliveries until Ctrl+C
    Listen {
        /// Event name
        name: String,

        /// Listener info JSON, matched by emitters
        #[arg(short, long)]
        info: Option<String>,
    },

    /// Emit an event to the listeners whose info matches the data
    Emit {
        /// Event name
        name: String,

        /// Event data JSON
        data: String,

        /// Deliver to every listener regardless of info
        #[arg(long)]
        all: bool,
    },

    /// Upload a local file to the server
    Upload {
        /// Local file
        local: PathBuf,

        /// Destination path under the server's upload root
        remote: String,

        /// Fragment size in bytes
        #[arg(long, default_value = "1048576")]
        chunk_size: usize,
    },

    /// Print reload notices addressed to this client until Ctrl+C
    WatchReloads,

    /// Generate SHA-256 hash of a token for config files
    HashToken {
        /// The token to hash
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // No server connection needed
    if let Commands::HashToken { token } = &cli.command {
        println!("{}", commands::hash_token(token));
        return Ok(());
    }

    let mut config = ConnectionConfig::new(cli.server).with_client_name(&cli.client_name);
    if let Some(ref token) = cli.token {
        config = config.with_auth_token(token);
    }
    if let Some(ref id) = cli.client_id {
        config = config.with_client_id(id);
    }
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match cli.command {
        Commands::Listen { name, info } => {
            let info = match info {
                Some(ref arg) => commands::parse_json_arg(arg)?,
                None => svcwire_protocol::Value::Null,
            };
            let mut subscription = match client.add_listener(&name, info).await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            };
            eprintln!(
                "{} {} (key: {})",
                "Listening".green(),
                name.cyan(),
                subscription.key()
            );
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            loop {
                tokio::select! {
                    data = subscription.recv() => {
                        match data {
                            Some(data) => println!("{}", data),
                            None => {
                                eprintln!("{}", "Listener removed".red());
                                break;
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping listener...".dimmed());
                        let _ = client.remove_listener(subscription.key()).await;
                        break;
                    }
                }
            }
        }
        Commands::WatchReloads => {
            let mut reloads = client.subscribe_reloads();
            eprintln!("{}", "Watching reload notices...".green());
            loop {
                tokio::select! {
                    notice = reloads.recv() => {
                        match notice {
                            Ok(reload) => println!("{}", commands::format_reload(&reload)),
                            Err(RecvError::Lagged(n)) => {
                                eprintln!("{}: lagged {} notices", "Warning".yellow(), n);
                            }
                            Err(RecvError::Closed) => {
                                eprintln!("{}", "Connection closed".red());
                                break;
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        cmd => match commands::execute(&client, cmd).await {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}
