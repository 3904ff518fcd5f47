// Heartbeat protocol: probes, rounds, scheduler and responder

use crate::config::{HeartbeatConfig, PeerAddress};
use crate::network::{PeerId, PeerSet};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};

/// Request tag written first on every heartbeat
pub const HEARTBEAT_REQUEST: i32 = 101;
/// Reply meaning "alive"
pub const HEARTBEAT_ACK: i32 = 102;

/// Ports this node advertises in its heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatIdentity {
    pub heartbeat_port: u16,
    pub service_port: u16,
}

/// Why a single probe failed
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected reply {0}")]
    UnexpectedReply(i32),
}

/// Emitted when a round ends with fewer peers than it started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub peer_count: usize,
    pub evicted: Vec<PeerId>,
}

/// Outcome of one heartbeat round
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub probed: usize,
    pub alive: usize,
    pub evicted: Vec<PeerId>,
    pub membership_change: Option<MembershipChange>,
}

/// Send one heartbeat and wait for the acknowledgment
pub async fn probe(addr: SocketAddr, identity: HeartbeatIdentity, limit: Duration) -> Result<(), ProbeError> {
    timeout(limit, exchange_heartbeat(addr, identity))
        .await
        .map_err(|_| ProbeError::Timeout(limit))?
}

async fn exchange_heartbeat(addr: SocketAddr, identity: HeartbeatIdentity) -> Result<(), ProbeError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_i32(HEARTBEAT_REQUEST).await?;
    stream.write_i32(i32::from(identity.heartbeat_port)).await?;
    stream.write_i32(i32::from(identity.service_port)).await?;
    stream.flush().await?;

    match stream.read_i32().await? {
        HEARTBEAT_ACK => Ok(()),
        other => Err(ProbeError::UnexpectedReply(other)),
    }
}

/// Run one heartbeat round against every known peer
///
/// Probes run concurrently with independent timeouts, so the round takes
/// about as long as the slowest peer.
pub async fn heartbeat_round(peers: &PeerSet, identity: HeartbeatIdentity, config: &HeartbeatConfig) -> RoundReport {
    let (stale, targets) = peers.begin_round(config.miss_threshold).await;

    let mut report = RoundReport {
        probed: targets.len(),
        evicted: stale.iter().map(|p| p.id()).collect(),
        ..RoundReport::default()
    };

    let mut probes = JoinSet::new();
    for peer in targets {
        let limit = config.probe_timeout();
        probes.spawn(async move {
            let id = peer.id();
            (id, probe(id, identity, limit).await)
        });
    }

    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((id, Ok(()))) => {
                if peers.reset_misses(&id).await {
                    report.alive += 1;
                }
            }
            Ok((id, Err(e))) => log::debug!("Heartbeat to {} failed: {}", id, e),
            Err(e) => log::error!("Heartbeat probe task failed: {}", e),
        }
    }

    report
        .evicted
        .extend(peers.evict_over(config.miss_threshold).await.iter().map(|p| p.id()));
    for id in &report.evicted {
        log::info!("Peer {} evicted after missed heartbeats", id);
    }

    if !report.evicted.is_empty() {
        let peer_count = peers.len().await;
        log::info!("{} peer(s) disconnected, {} remaining", report.evicted.len(), peer_count);
        report.membership_change = Some(MembershipChange {
            peer_count,
            evicted: report.evicted.clone(),
        });
    }

    report
}

/// Periodically runs heartbeat rounds against an injected peer set
pub struct HeartbeatScheduler {
    peers: PeerSet,
    identity: HeartbeatIdentity,
    config: HeartbeatConfig,
    events: broadcast::Sender<MembershipChange>,
}

impl HeartbeatScheduler {
    pub fn new(
        peers: PeerSet,
        identity: HeartbeatIdentity,
        config: HeartbeatConfig,
        events: broadcast::Sender<MembershipChange>,
    ) -> Self {
        Self {
            peers,
            identity,
            config,
            events,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let report = heartbeat_round(&self.peers, self.identity, &self.config).await;
                log::debug!("Heartbeat round: {}/{} peers alive", report.alive, report.probed);

                if let Some(change) = report.membership_change {
                    // No subscribers is fine
                    let _ = self.events.send(change);
                }
            }
        })
    }
}

/// Answer heartbeats on `listener`, registering each caller as a peer
pub async fn serve_heartbeats(listener: TcpListener, peers: PeerSet, read_timeout: Duration) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Failed to accept heartbeat connection: {}", e);
                continue;
            }
        };

        let peers = peers.clone();
        tokio::spawn(async move {
            match timeout(read_timeout, answer_heartbeat(stream, addr)).await {
                Ok(Ok(peer)) => peers.mark_alive(peer).await,
                Ok(Err(e)) => log::debug!("Bad heartbeat from {}: {}", addr, e),
                Err(_) => log::debug!("Heartbeat from {} timed out", addr),
            }
        });
    }
}

async fn answer_heartbeat(mut stream: TcpStream, addr: SocketAddr) -> Result<PeerAddress, ProbeError> {
    let tag = stream.read_i32().await?;
    if tag != HEARTBEAT_REQUEST {
        return Err(ProbeError::UnexpectedReply(tag));
    }
    let heartbeat_port = read_port(&mut stream).await?;
    let service_port = read_port(&mut stream).await?;

    stream.write_i32(HEARTBEAT_ACK).await?;
    stream.flush().await?;

    Ok(PeerAddress {
        address: addr.ip(),
        heartbeat_port,
        service_port,
    })
}

async fn read_port(stream: &mut TcpStream) -> Result<u16, ProbeError> {
    let value = stream.read_i32().await?;
    u16::try_from(value).map_err(|_| ProbeError::UnexpectedReply(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: HeartbeatIdentity = HeartbeatIdentity {
        heartbeat_port: 9000,
        service_port: 9001,
    };

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms: 50,
            probe_timeout_ms: 300,
            miss_threshold: 3,
        }
    }

    /// Listener that answers every heartbeat with `reply`
    async fn responder(reply: i32) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut request = [0u8; 12];
                    if stream.read_exact(&mut request).await.is_ok() {
                        let _ = stream.write_i32(reply).await;
                    }
                });
            }
        });
        addr
    }

    /// Listener that accepts but never answers
    async fn silent() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                held.push(stream);
            }
        });
        addr
    }

    /// Address with nothing listening on it
    async fn closed() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn peer_at(addr: SocketAddr) -> PeerAddress {
        PeerAddress {
            address: addr.ip(),
            heartbeat_port: addr.port(),
            service_port: 1,
        }
    }

    #[tokio::test]
    async fn test_probe_alive() {
        let addr = responder(HEARTBEAT_ACK).await;
        assert!(probe(addr, IDENTITY, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_wrong_reply() {
        let addr = responder(7).await;
        let result = probe(addr, IDENTITY, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::UnexpectedReply(7))));
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let addr = silent().await;
        let result = probe(addr, IDENTITY, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let addr = closed().await;
        let result = probe(addr, IDENTITY, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::Io(_))));
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let addr = responder(HEARTBEAT_ACK).await;
        let peers = PeerSet::new();
        peers.insert(peer_at(addr)).await;
        peers.set_misses(&addr, 2).await;

        let report = heartbeat_round(&peers, IDENTITY, &fast_config()).await;
        assert_eq!(report.alive, 1);
        assert_eq!(peers.get(&addr).await.unwrap().misses, 0);
        assert!(report.membership_change.is_none());
    }

    #[tokio::test]
    async fn test_peer_at_threshold_evicted_after_failure() {
        let addr = closed().await;
        let peers = PeerSet::new();
        peers.insert(peer_at(addr)).await;
        peers.set_misses(&addr, 3).await;

        let report = heartbeat_round(&peers, IDENTITY, &fast_config()).await;
        assert!(peers.get(&addr).await.is_none());
        assert_eq!(report.evicted, vec![addr]);
        assert_eq!(
            report.membership_change,
            Some(MembershipChange {
                peer_count: 0,
                evicted: vec![addr],
            })
        );
    }

    #[tokio::test]
    async fn test_eviction_reported_when_peer_joins_mid_round() {
        let peers = PeerSet::new();
        let dead = closed().await;
        peers.insert(peer_at(dead)).await;
        peers.set_misses(&dead, 3).await;

        // Answers the heartbeat only after a new peer has been registered
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let introducer = listener.local_addr().unwrap();
        let newcomer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        {
            let peers = peers.clone();
            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = [0u8; 12];
                stream.read_exact(&mut request).await.unwrap();
                peers.insert(peer_at(newcomer)).await;
                stream.write_i32(HEARTBEAT_ACK).await.unwrap();
            });
        }
        peers.insert(peer_at(introducer)).await;

        let report = heartbeat_round(&peers, IDENTITY, &fast_config()).await;
        assert_eq!(report.evicted, vec![dead]);
        assert_eq!(
            report.membership_change,
            Some(MembershipChange {
                peer_count: 2,
                evicted: vec![dead],
            })
        );
    }

    #[tokio::test]
    async fn test_failure_below_threshold_increments() {
        let addr = closed().await;
        let peers = PeerSet::new();
        peers.insert(peer_at(addr)).await;

        heartbeat_round(&peers, IDENTITY, &fast_config()).await;
        heartbeat_round(&peers, IDENTITY, &fast_config()).await;
        assert_eq!(peers.get(&addr).await.unwrap().misses, 2);
    }

    #[tokio::test]
    async fn test_round_latency_bounded_by_slowest_peer() {
        let peers = PeerSet::new();
        for _ in 0..4 {
            peers.insert(peer_at(silent().await)).await;
        }

        let started = std::time::Instant::now();
        let report = heartbeat_round(&peers, IDENTITY, &fast_config()).await;
        let elapsed = started.elapsed();

        assert_eq!(report.probed, 4);
        assert_eq!(report.alive, 0);
        // Four sequential 300ms timeouts would take 1.2s
        assert!(elapsed < Duration::from_millis(1_000), "round took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_responder_registers_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peers = PeerSet::new();
        tokio::spawn(serve_heartbeats(listener, peers.clone(), Duration::from_secs(1)));

        probe(addr, IDENTITY, Duration::from_secs(1)).await.unwrap();

        // Registration happens after the ack is written
        let caller: PeerId = "127.0.0.1:9000".parse().unwrap();
        let mut registered = None;
        for _ in 0..50 {
            registered = peers.get(&caller).await;
            if registered.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = registered.expect("caller was not registered");
        assert_eq!(record.service_port, 9001);
        assert_eq!(record.misses, 0);
    }

    #[tokio::test]
    async fn test_scheduler_reports_membership_change() {
        let peers = PeerSet::new();
        let dead = closed().await;
        peers.insert(peer_at(dead)).await;
        peers.set_misses(&dead, 3).await;

        let (events, mut changes) = broadcast::channel(4);
        let handle = HeartbeatScheduler::new(peers.clone(), IDENTITY, fast_config(), events).spawn();

        let change = timeout(Duration::from_secs(2), changes.recv()).await.unwrap().unwrap();
        assert_eq!(change.peer_count, 0);
        assert!(peers.is_empty().await);
        handle.abort();
    }
}
