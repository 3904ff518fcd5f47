// Peer membership shared by the liveness tasks

use crate::config::PeerAddress;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Peers are keyed by their heartbeat address
pub type PeerId = SocketAddr;

/// A known peer and its consecutive heartbeat misses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub heartbeat_port: u16,
    pub service_port: u16,
    pub misses: u32,
}

impl PeerRecord {
    pub fn new(peer: PeerAddress) -> Self {
        Self {
            address: peer.address,
            heartbeat_port: peer.heartbeat_port,
            service_port: peer.service_port,
            misses: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.heartbeat_addr()
    }

    pub fn heartbeat_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.heartbeat_port)
    }

    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.service_port)
    }
}

/// Concurrent peer map handle; clones share the same set
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    peers: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer if unknown; returns true when it was inserted
    pub async fn insert(&self, peer: PeerAddress) -> bool {
        let record = PeerRecord::new(peer);
        let mut peers = self.peers.write().await;
        if peers.contains_key(&record.id()) {
            return false;
        }
        peers.insert(record.id(), record);
        true
    }

    /// Record a successful contact: reset the miss counter, or add the peer
    pub async fn mark_alive(&self, peer: PeerAddress) {
        let record = PeerRecord::new(peer);
        let mut peers = self.peers.write().await;
        peers
            .entry(record.id())
            .and_modify(|existing| {
                existing.misses = 0;
                existing.service_port = record.service_port;
            })
            .or_insert(record);
    }

    /// Reset the miss counter of a known peer
    pub async fn reset_misses(&self, id: &PeerId) -> bool {
        match self.peers.write().await.get_mut(id) {
            Some(peer) => {
                peer.misses = 0;
                true
            }
            None => false,
        }
    }

    /// Start a heartbeat round
    ///
    /// Evicts peers already above `threshold`, bumps every other peer's miss
    /// counter and returns (evicted, peers to probe).
    pub async fn begin_round(&self, threshold: u32) -> (Vec<PeerRecord>, Vec<PeerRecord>) {
        let mut peers = self.peers.write().await;
        let evicted = Self::drain_over(&mut peers, threshold);

        let survivors = peers
            .values_mut()
            .map(|peer| {
                peer.misses += 1;
                peer.clone()
            })
            .collect();

        (evicted, survivors)
    }

    /// Remove every peer whose miss counter exceeds `threshold`
    pub async fn evict_over(&self, threshold: u32) -> Vec<PeerRecord> {
        Self::drain_over(&mut *self.peers.write().await, threshold)
    }

    fn drain_over(peers: &mut HashMap<PeerId, PeerRecord>, threshold: u32) -> Vec<PeerRecord> {
        let ids: Vec<PeerId> = peers
            .values()
            .filter(|peer| peer.misses > threshold)
            .map(PeerRecord::id)
            .collect();
        ids.iter().filter_map(|id| peers.remove(id)).collect()
    }

    pub async fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) async fn set_misses(&self, id: &PeerId, misses: u32) {
        if let Some(peer) = self.peers.write().await.get_mut(id) {
            peer.misses = misses;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(hb: u16) -> PeerAddress {
        PeerAddress {
            address: "127.0.0.1".parse().unwrap(),
            heartbeat_port: hb,
            service_port: hb + 1,
        }
    }

    #[tokio::test]
    async fn test_insert_once() {
        let peers = PeerSet::new();
        assert!(peers.insert(peer(7000)).await);
        assert!(!peers.insert(peer(7000)).await);
        assert_eq!(peers.len().await, 1);

        let record = peers.get(&peer(7000).heartbeat_addr()).await.unwrap();
        assert_eq!(record.service_addr(), peer(7000).service_addr());
        assert_eq!(record.misses, 0);
    }

    #[tokio::test]
    async fn test_begin_round_bumps_and_evicts() {
        let peers = PeerSet::new();
        peers.insert(peer(7000)).await;
        peers.insert(peer(7100)).await;
        peers.set_misses(&peer(7100).heartbeat_addr(), 4).await;

        let (evicted, survivors) = peers.begin_round(3).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].heartbeat_port, 7100);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].misses, 1);
        assert_eq!(peers.get(&peer(7000).heartbeat_addr()).await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_mark_alive_resets_or_adds() {
        let peers = PeerSet::new();
        peers.insert(peer(7000)).await;
        peers.set_misses(&peer(7000).heartbeat_addr(), 2).await;

        peers.mark_alive(peer(7000)).await;
        assert_eq!(peers.get(&peer(7000).heartbeat_addr()).await.unwrap().misses, 0);

        peers.mark_alive(peer(7200)).await;
        assert_eq!(peers.len().await, 2);
    }

    #[tokio::test]
    async fn test_evict_over_threshold() {
        let peers = PeerSet::new();
        peers.insert(peer(7000)).await;
        peers.insert(peer(7100)).await;
        peers.set_misses(&peer(7000).heartbeat_addr(), 3).await;
        peers.set_misses(&peer(7100).heartbeat_addr(), 4).await;

        let evicted = peers.evict_over(3).await;
        assert_eq!(evicted.len(), 1);
        assert!(peers.get(&peer(7000).heartbeat_addr()).await.is_some());
        assert!(!peers.reset_misses(&peer(7100).heartbeat_addr()).await);
    }
}
