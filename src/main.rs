//! peerweave - Encrypted UDP gossip replication
//!
//! Peers replicate versioned objects over encrypted datagrams and converge
//! through inventory advertisements and history pulls.

mod clock;
mod config;
mod crypto;
mod discovery;
mod network;
mod protocol;
mod replication;
mod repository;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use config::Config;
use crypto::PeerKeys;
use network::{Client, Node, PeerDirectory, TransportResult};
use protocol::{Message, ObjectRef, PropertyMap, Value};
use repository::MemoryRepository;

/// peerweave - replicate objects between peers over encrypted UDP
#[derive(Parser)]
#[command(name = "peerweave")]
#[command(version = "0.1.0")]
#[command(about = "Encrypted peer-to-peer object replication", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peer until interrupted or killed
    Run {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Peer name to report
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Generate an RSA keypair
    Keygen {
        /// Directory for private.pem and public.pem
        #[arg(short, long, default_value = "keys")]
        out: PathBuf,
    },

    /// Send one control message to the configured peers
    Send {
        #[command(subcommand)]
        message: SendCommand,
    },

    /// Create an object, push it to the configured peers and exit
    Publish {
        /// Object type
        object_type: String,

        /// Properties as key=value
        properties: Vec<String>,
    },

    /// Read a property from the object's owner
    Get {
        /// Object id
        object: Uuid,

        /// Owning peer id
        #[arg(long)]
        owner: Uuid,

        key: String,

        /// Read the value staged in this transaction
        #[arg(long)]
        tx: Option<Uuid>,
    },

    /// Write a property at the object's owner
    Set {
        /// Object id
        object: Uuid,

        /// Owning peer id
        #[arg(long)]
        owner: Uuid,

        key: String,

        value: String,

        /// Stage the write in this transaction
        #[arg(long)]
        tx: Option<Uuid>,
    },

    /// Delete an object on every reachable peer
    Delete {
        /// Object id
        object: Uuid,
    },

    /// Open or commit a transaction on a peer
    Tx {
        #[command(subcommand)]
        action: TxCommand,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[derive(Subcommand)]
enum SendCommand {
    /// Stop every reachable peer
    Kill,
    /// Ask every peer to print its state
    Info,
    /// Text for one peer
    Direct {
        /// Recipient peer id
        #[arg(long)]
        to: Uuid,

        text: String,
    },
}

#[derive(Subcommand)]
enum TxCommand {
    /// Open a transaction and print its id
    Begin {
        /// Peer that holds the transaction
        #[arg(long)]
        owner: Uuid,

        /// Milliseconds before staged writes are discarded
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// Apply every write staged in a transaction
    Commit {
        /// Peer that holds the transaction
        #[arg(long)]
        owner: Uuid,

        tx: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Run { port, name } => {
            run_peer(config, port, name).await?;
        }
        Commands::Keygen { out } => {
            let keys = PeerKeys::generate()?;
            keys.save(&out)
                .with_context(|| format!("writing keys to {}", out.display()))?;
            println!("Keypair written to: {}", out.display());
        }
        Commands::Send { message } => {
            let message = match message {
                SendCommand::Kill => Message::Broadcast {
                    text: protocol::KILL.to_string(),
                },
                SendCommand::Info => Message::Broadcast {
                    text: protocol::INFO.to_string(),
                },
                SendCommand::Direct { to, text } => Message::Direct { recipient: to, text },
            };
            send_once(config, message).await?;
        }
        Commands::Publish {
            object_type,
            properties,
        } => {
            publish(config, &object_type, &properties).await?;
        }
        Commands::Get {
            object,
            owner,
            key,
            tx,
        } => {
            let (client, run) = start_client(&config).await?;
            let result = client.get(ObjectRef::new(object, owner), tx, &key).await;
            finish(client, run).await?;
            println!("{}", result?);
        }
        Commands::Set {
            object,
            owner,
            key,
            value,
            tx,
        } => {
            let (client, run) = start_client(&config).await?;
            let result = client
                .set(ObjectRef::new(object, owner), tx, &key, Value::from(value))
                .await;
            finish(client, run).await?;
            result?;
            println!("Set {}.{}", object, key);
        }
        Commands::Delete { object } => {
            let (client, run) = start_client(&config).await?;
            let result = client.delete_object(object).await;
            finish(client, run).await?;
            result?;
            println!("Deleted {}", object);
        }
        Commands::Tx { action } => {
            let (client, run) = start_client(&config).await?;
            let result = match action {
                TxCommand::Begin { owner, timeout_ms } => client
                    .begin_transaction(owner, Duration::from_millis(timeout_ms))
                    .await
                    .map(|tx| tx.to_string()),
                TxCommand::Commit { owner, tx } => client
                    .commit(owner, tx)
                    .await
                    .map(|()| format!("Committed {}", tx)),
            };
            finish(client, run).await?;
            println!("{}", result?);
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Bind a node from the configuration
async fn bind_node(config: &Config, port: Option<u16>, name: String) -> anyhow::Result<Node> {
    let mut net_config = config.network_config();
    if let Some(port) = port {
        net_config.port = port;
    }

    let keys = config.load_keys()?;
    let directory = PeerDirectory::with_peers(config.load_peers()?);

    let node = Node::bind(
        config.peer_id(),
        name,
        net_config,
        keys,
        Arc::new(MemoryRepository::new()),
        directory,
    )
    .await?;
    Ok(node)
}

/// Run a peer in the foreground
async fn run_peer(config: Config, port: Option<u16>, name: Option<String>) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(|| config.general.name.clone());
    let node = bind_node(&config, port, name.clone()).await?;
    let peer = node.peer();
    let addr = node.local_addr()?;

    println!("\n========================================");
    println!("  peerweave running");
    println!("========================================");
    println!("  Name: {}", name);
    println!("  Id:   {}", peer.id());
    println!("  Addr: {}", addr);
    println!("  Peers: {}", peer.directory().len().await);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let mut run = tokio::spawn(node.run());
    let interrupted = tokio::select! {
        result = &mut run => {
            result??;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        println!("\nShutting down...");
        peer.stop();
        run.await??;
    }

    tracing::info!("Peer stopped");
    Ok(())
}

/// Start a short-lived node on an ephemeral port for one command
async fn start_client(config: &Config) -> anyhow::Result<(Client, JoinHandle<TransportResult<()>>)> {
    let node = bind_node(config, Some(0), config.general.name.clone()).await?;
    let client = Client::new(node.peer());
    let run = tokio::spawn(node.run());
    Ok((client, run))
}

/// Stop a node started by [`start_client`]
async fn finish(client: Client, run: JoinHandle<TransportResult<()>>) -> anyhow::Result<()> {
    // Let the send task drain before shutting down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.peer().stop();
    run.await??;
    Ok(())
}

/// Send one message from a short-lived node
async fn send_once(config: Config, message: Message) -> anyhow::Result<()> {
    let (client, run) = start_client(&config).await?;
    let peer = client.peer();
    match message.recipient() {
        Some(to) => peer.send_to_id(to, message).await,
        None => peer.broadcast(message).await,
    };
    finish(client, run).await
}

/// Create one object from `key=value` pairs and push it out
async fn publish(config: Config, object_type: &str, properties: &[String]) -> anyhow::Result<()> {
    let mut data = PropertyMap::new();
    for pair in properties {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected key=value, got {:?}", pair))?;
        data.insert(key.to_string(), Value::from(value));
    }

    let (client, run) = start_client(&config).await?;
    let result = client.create_object(object_type, Uuid::nil(), data).await;
    finish(client, run).await?;
    let object = result?;
    println!("Published {} owned by {}", object.id, object.owner);
    Ok(())
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("peerweave Protocol Information");
    println!("==============================\n");

    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Max Datagram: {} bytes", protocol::MAX_DATAGRAM_SIZE);
    println!("Header Size: {} bytes", protocol::HEADER_SIZE);
    println!(
        "Cipher: RSA-{} PKCS#1 v1.5, {}-byte blocks to {}-byte blocks",
        crypto::KEY_BITS,
        crypto::PLAIN_BLOCK,
        crypto::CIPHER_BLOCK
    );
    println!("Commands: {}", protocol::CommandRegistry::new().len());

    let path = |p: &Option<PathBuf>| p.as_ref().map_or("(none)".to_string(), |p| p.display().to_string());
    println!("\nPrivate key: {}", path(&config.keys.private_key));
    println!("Public key:  {}", path(&config.keys.public_key));

    println!("\nConfigured peers: {}", config.peers.len());
    for peer in &config.peers {
        let key = if peer.public_key.is_some() { "key" } else { "no key" };
        println!("  {} {}:{} ({})", peer.id, peer.address, peer.port, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["peerweave", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_send_direct_parsing() {
        let to = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "peerweave",
            "send",
            "direct",
            "--to",
            &to.to_string(),
            "hello",
        ])
        .unwrap();
        match cli.command {
            Commands::Send {
                message: SendCommand::Direct { to: parsed, text },
            } => {
                assert_eq!(parsed, to);
                assert_eq!(text, "hello");
            }
            _ => panic!("expected send direct"),
        }
    }

    #[test]
    fn test_bad_recipient_rejected() {
        let cli = Cli::try_parse_from(["peerweave", "send", "direct", "--to", "nope", "x"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_get_parsing() {
        let (object, owner, tx) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let cli = Cli::try_parse_from([
            "peerweave",
            "get",
            &object.to_string(),
            "--owner",
            &owner.to_string(),
            "title",
            "--tx",
            &tx.to_string(),
        ])
        .unwrap();
        match cli.command {
            Commands::Get {
                object: o,
                owner: w,
                key,
                tx: t,
            } => {
                assert_eq!((o, w, t), (object, owner, Some(tx)));
                assert_eq!(key, "title");
            }
            _ => panic!("expected get"),
        }
    }

    #[test]
    fn test_set_parsing() {
        let (object, owner) = (Uuid::new_v4(), Uuid::new_v4());
        let cli = Cli::try_parse_from([
            "peerweave",
            "set",
            &object.to_string(),
            "--owner",
            &owner.to_string(),
            "title",
            "final",
        ])
        .unwrap();
        match cli.command {
            Commands::Set { key, value, tx, .. } => {
                assert_eq!(key, "title");
                assert_eq!(value, "final");
                assert_eq!(tx, None);
            }
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn test_tx_parsing() {
        let owner = Uuid::new_v4();
        let cli = Cli::try_parse_from(["peerweave", "tx", "begin", "--owner", &owner.to_string()])
            .unwrap();
        match cli.command {
            Commands::Tx {
                action: TxCommand::Begin { owner: o, timeout_ms },
            } => {
                assert_eq!(o, owner);
                assert_eq!(timeout_ms, 30_000);
            }
            _ => panic!("expected tx begin"),
        }

        let tx = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "peerweave",
            "tx",
            "commit",
            "--owner",
            &owner.to_string(),
            &tx.to_string(),
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Tx { action: TxCommand::Commit { tx: t, .. } } if t == tx
        ));
    }

    #[test]
    fn test_get_requires_owner() {
        let object = Uuid::new_v4().to_string();
        assert!(Cli::try_parse_from(["peerweave", "get", &object, "title"]).is_err());
    }
}
