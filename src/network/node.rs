// Network node - wires block production, gossip and liveness together

use crate::chain::BlockchainManager;
use crate::config::{ConfigError, NodeConfig};
use crate::core::now_millis;
use crate::network::heartbeat::{serve_heartbeats, HeartbeatIdentity, HeartbeatScheduler, MembershipChange};
use crate::network::{BroadcastMessage, PeerSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

const GOSSIP_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const MEMBERSHIP_CHANNEL_CAPACITY: usize = 64;

/// A running ledger node
pub struct Node {
    config: NodeConfig,
    manager: Arc<BlockchainManager>,
    peers: PeerSet,
    membership: broadcast::Sender<MembershipChange>,
}

/// Background tasks of a started node
pub struct NodeHandle {
    pub heartbeat_addr: SocketAddr,
    pub service_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Stop every background task
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

impl Node {
    /// Create a node seeded with the configured peers; the config is validated first
    pub async fn new(config: NodeConfig, manager: Arc<BlockchainManager>) -> Result<Self, ConfigError> {
        config.validate()?;
        let peers = PeerSet::new();
        for peer in config.peer_addresses()? {
            peers.insert(peer).await;
        }
        let (membership, _) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            manager,
            peers,
            membership,
        })
    }

    pub fn manager(&self) -> &Arc<BlockchainManager> {
        &self.manager
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Subscribe to peer-set shrink events
    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipChange> {
        self.membership.subscribe()
    }

    /// Bind the listeners and start all background tasks
    pub async fn start(&self) -> io::Result<NodeHandle> {
        let host = self.config.host.as_str();
        let heartbeat_listener = TcpListener::bind((host, self.config.heartbeat_port)).await?;
        let service_listener = TcpListener::bind((host, self.config.service_port)).await?;
        let heartbeat_addr = heartbeat_listener.local_addr()?;
        let service_addr = service_listener.local_addr()?;

        log::info!("Node listening on {} (heartbeat) and {} (service)", heartbeat_addr, service_addr);

        let identity = HeartbeatIdentity {
            heartbeat_port: heartbeat_addr.port(),
            service_port: service_addr.port(),
        };
        let heartbeat = self.config.heartbeat.clone();

        let tasks = vec![
            tokio::spawn(serve_heartbeats(heartbeat_listener, self.peers.clone(), heartbeat.probe_timeout())),
            HeartbeatScheduler::new(self.peers.clone(), identity, heartbeat, self.membership.clone()).spawn(),
            tokio::spawn(serve_gossip(service_listener, Arc::clone(&self.manager))),
            tokio::spawn(forward_broadcasts(self.manager.subscribe(), self.peers.clone())),
            self.spawn_batch_loop(),
        ];

        Ok(NodeHandle {
            heartbeat_addr,
            service_addr,
            tasks,
        })
    }

    /// Periodic seal check; each sealed batch is mined on its own task
    fn spawn_batch_loop(&self) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let period = manager.config().batch_tick();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                for batch in manager.seal_ready_batches(now_millis()) {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        match manager.on_batch_sealed(batch).await {
                            Ok(block) => log::info!("Produced block {}", block.hash),
                            Err(e) => log::error!("Block production failed: {}", e),
                        }
                    });
                }
            }
        })
    }
}

/// Accept peer connections carrying newline-delimited broadcasts
async fn serve_gossip(listener: TcpListener, manager: Arc<BlockchainManager>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Failed to accept connection: {}", e);
                continue;
            }
        };

        log::debug!("New gossip connection from {}", addr);
        let manager = Arc::clone(&manager);

        // Handle peer in separate task
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    // Rejections are logged by the manager
                    Ok(Some(line)) => {
                        let _ = manager.ingest_message(&line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("Gossip connection from {} failed: {}", addr, e);
                        break;
                    }
                }
            }
        });
    }
}

/// Forward every local broadcast to each known peer's service port
async fn forward_broadcasts(mut events: broadcast::Receiver<BroadcastMessage>, peers: PeerSet) {
    loop {
        let message = match events.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Gossip forwarder lagged, {} broadcasts dropped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let line = match message.to_json() {
            Ok(json) => json + "\n",
            Err(e) => {
                log::error!("Failed to encode broadcast: {}", e);
                continue;
            }
        };

        let targets = peers.snapshot().await;
        log::debug!("Broadcasting flag {} to {} peers", message.flag, targets.len());
        for peer in targets {
            let line = line.clone();
            tokio::spawn(async move {
                let addr = peer.service_addr();
                match timeout(GOSSIP_SEND_TIMEOUT, send_line(addr, &line)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::debug!("Failed to send broadcast to {}: {}", addr, e),
                    Err(_) => log::debug!("Sending broadcast to {} timed out", addr),
                }
            });
        }
    }
}

async fn send_line(addr: SocketAddr, line: &str) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
