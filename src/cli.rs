// CLI commands

use crate::config::NodeConfig;
use crate::network::Node;
use crate::storage::{BlockStore, SledBlockStore};
use crate::{Block, BlockchainManager, MerkleTree};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "upload-ledger")]
#[command(about = "Replicated file-upload ledger node", long_about = None)]
pub struct Cli {
    /// TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node; file paths read from stdin are uploaded
    Run {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Heartbeat port
        #[arg(long)]
        heartbeat_port: Option<u16>,
        /// Service (gossip) port
        #[arg(long)]
        service_port: Option<u16>,
        /// Peer as host:heartbeat_port:service_port (repeatable)
        #[arg(short, long = "peer")]
        peers: Vec<String>,
    },

    /// Show a stored block
    Block {
        /// Block hash
        hash: String,
    },

    /// Print the Merkle root of the given leaf signatures
    Merkle {
        #[arg(required = true)]
        leaves: Vec<String>,
    },
}

/// CLI handler
pub struct CliHandler {
    config: NodeConfig,
}

impl CliHandler {
    /// Load the config file (if any) and apply global overrides
    pub fn new(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Self, String> {
        let mut config = match config_path {
            Some(path) => {
                log::info!("Loading config from {}", path.display());
                NodeConfig::load(path).map_err(|e| e.to_string())?
            }
            None => NodeConfig::default(),
        };
        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }
        Ok(Self { config })
    }

    /// Handle CLI command
    pub async fn handle(self, command: Commands) -> Result<(), String> {
        match command {
            Commands::Run {
                host,
                heartbeat_port,
                service_port,
                peers,
            } => self.run(host, heartbeat_port, service_port, peers).await,
            Commands::Block { hash } => self.show_block(&hash),
            Commands::Merkle { leaves } => Self::merkle(&leaves),
        }
    }

    fn block_store(&self) -> Result<SledBlockStore, String> {
        SledBlockStore::new(self.config.data_dir.join("blocks")).map_err(|e| e.to_string())
    }

    /// Run a node until interrupted
    async fn run(
        mut self,
        host: Option<String>,
        heartbeat_port: Option<u16>,
        service_port: Option<u16>,
        peers: Vec<String>,
    ) -> Result<(), String> {
        if let Some(host) = host {
            self.config.host = host;
        }
        if let Some(port) = heartbeat_port {
            self.config.heartbeat_port = port;
        }
        if let Some(port) = service_port {
            self.config.service_port = port;
        }
        self.config.peers.extend(peers);
        self.config.validate().map_err(|e| e.to_string())?;

        let store = Arc::new(self.block_store()?);
        log::info!("Opened block store with {} stored blocks", store.len());
        let manager = BlockchainManager::new(self.config.chain.clone(), Arc::clone(&store) as Arc<dyn BlockStore>)
            .map_err(|e| e.to_string())?;
        let node = Node::new(self.config, Arc::new(manager))
            .await
            .map_err(|e| e.to_string())?;
        let handle = node.start().await.map_err(|e| format!("Failed to start node: {}", e))?;

        println!("Node started");
        println!("  Heartbeat: {}", handle.heartbeat_addr);
        println!("  Service: {}", handle.service_addr);
        println!("Enter file paths to upload, Ctrl-C to stop.");

        let mut membership = node.subscribe_membership();
        tokio::spawn(async move {
            while let Ok(change) = membership.recv().await {
                println!("{} peer(s) disconnected, {} remaining", change.evicted.len(), change.peer_count);
            }
        });

        let manager = Arc::clone(node.manager());
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let path = line.trim();
                if path.is_empty() {
                    continue;
                }
                let tx = manager.upload_file(path);
                println!("Transaction added for {}, being broadcast", tx.file_name);
            }
        });

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Failed to wait for Ctrl-C: {}", e))?;

        println!("Chain length: {}", node.manager().get_blockchain_length().await);
        handle.shutdown();
        store.flush().map_err(|e| e.to_string())?;
        Ok(())
    }

    fn show_block(&self, hash: &str) -> Result<(), String> {
        let store = self.block_store()?;
        let data = store
            .get(hash)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Block not found: {}", hash))?;
        let block = Block::from_json(&data).map_err(|e| format!("Corrupt block {}: {}", hash, e))?;
        print_block(&block);
        Ok(())
    }

    fn merkle(leaves: &[String]) -> Result<(), String> {
        let tree = MerkleTree::new(leaves).ok_or("At least one leaf is required")?;
        println!("Merkle root: {}", tree.root());
        println!("  Depth: {}", tree.depth());
        println!("  Nodes: {}", tree.node_count());
        Ok(())
    }
}

/// Print block information
fn print_block(block: &Block) {
    println!("Block:");
    println!("  Hash: {}", block.hash);
    println!("  Previous: {}", block.prev_hash);
    if let Some(root) = block.merkle_root() {
        println!("  Merkle root: {}", root);
    }
    println!("  Timestamp: {}", block.time_stamp);
    println!("  Transactions: {}", block.transactions().len());

    for (i, tx) in block.transactions().iter().enumerate() {
        println!("    [{}] {} ({})", i, tx.file_name, tx.payload);
    }
}
