//! Command-line client for the screenmic daemon.
//!
//! Usage:
//!   screenmicctl list application.name media.name
//!   screenmicctl link '{"include": [{"key": "node.name", "value": "Firefox"}]}'
//!   screenmicctl unlink

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use screenmic_ipc::{EventType, IpcClient, Method};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "screenmicctl", version)]
#[command(about = "Control the screenmic daemon")]
struct Cli {
    /// IPC socket path (defaults to the daemon's runtime socket)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a PipeWire server is reachable
    Probe,
    /// List audio-producing nodes
    List {
        /// Property keys to show (default: application.name node.name)
        keys: Vec<String>,
    },
    /// Route matching nodes into the virtual microphone
    Link {
        /// Filter as JSON; a plain word selects by node name
        filter: String,
    },
    /// Tear down all links and the virtual microphone
    Unlink,
    /// Show the active link session
    Session,
    /// Print daemon events until interrupted
    Watch,
    /// Stop the daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let socket = cli.socket.unwrap_or_else(screenmic_ipc::socket_path);
    let mut client = IpcClient::connect(&socket)
        .await
        .with_context(|| format!("Failed to connect to daemon at {socket:?}"))?;

    let method = match cli.command {
        Commands::Probe => Method::Probe,
        Commands::List { keys } => {
            Method::List { props: (!keys.is_empty()).then(|| Value::from(keys)) }
        }
        Commands::Link { filter } => Method::Link { filter: parse_filter_arg(&filter) },
        Commands::Unlink => Method::Unlink,
        Commands::Session => Method::GetSession,
        Commands::Shutdown => Method::Shutdown,
        Commands::Watch => return watch(&mut client).await,
    };

    let value = client.call(method).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// JSON if it parses, otherwise a bare node name.
fn parse_filter_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

async fn watch(client: &mut IpcClient) -> Result<()> {
    client
        .call(Method::Subscribe {
            events: vec![EventType::SessionChanged, EventType::GraphLost, EventType::DefaultSinkChanged],
        })
        .await?;

    while let Some(event) = client.events().recv().await {
        println!("{}", serde_json::to_string(&event)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_arg_json_or_name() {
        assert_eq!(parse_filter_arg(r#"{"key":"node.name","value":"mpv"}"#)["value"], "mpv");
        assert_eq!(parse_filter_arg("Firefox"), Value::String("Firefox".into()));
    }

    #[test]
    fn test_cli_parses_list_keys() {
        let cli = Cli::try_parse_from(["screenmicctl", "list", "media.name", "node.name"])
            .expect("Failed to parse arguments");
        assert!(matches!(cli.command, Commands::List { ref keys } if keys.len() == 2));
    }
}
