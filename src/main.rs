//! Operator CLI for running a meshradio node from a terminal.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use meshradio::{MeshEvent, MeshNode, NodeConfig, Platform, SendOptions};

#[derive(Parser)]
#[command(name = "meshradio")]
#[command(about = "Off-grid mesh walkie-talkie node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Channel to join (1-99)
    #[arg(short, long, default_value = "1")]
    channel: u8,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node and print received transmissions
    Start,

    /// Send one text transmission and exit
    Send { message: String },

    /// Print a status snapshot and exit
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = NodeConfig::from_env();
    let node = Arc::new(MeshNode::new(config, Platform::in_process())?);
    node.set_channel(cli.channel)?;
    node.power_on().await?;

    match cli.command {
        Commands::Start => {
            let _events = node.subscribe_events(|event| match event {
                MeshEvent::PeerDiscovered(peer) => {
                    println!("+ peer {} ({})", hex::encode(peer.node_id), peer.display_name);
                }
                MeshEvent::PeerLost(peer) => {
                    println!("- peer {}", hex::encode(peer));
                }
                MeshEvent::TransmissionReceived(t) => {
                    println!(
                        "[ch {}] {}: {}",
                        t.channel,
                        hex::encode(t.sender_id),
                        String::from_utf8_lossy(&t.content)
                    );
                }
                MeshEvent::EmergencyReceived(t) => {
                    println!(
                        "!! EMERGENCY from {}: {}",
                        hex::encode(t.sender_id),
                        String::from_utf8_lossy(&t.content)
                    );
                }
                _ => {}
            });
            println!(
                "node {} on channel {}, ctrl-c to stop",
                hex::encode(node.node_id()),
                node.current_channel()
            );
            tokio::signal::ctrl_c().await?;
        }
        Commands::Send { message } => {
            node.transmit_text(&message, SendOptions::default())
                .await
                .map_err(|e| format!("send failed: {}", e))?;
            // Give the flood a moment to leave the machine.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Commands::Status => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let status = node.status().await;
            println!("{:#?}", status);
        }
    }

    node.power_off().await?;
    Ok(())
}
