//! Inter-node replication.
//!
//! Every node keeps the full subscription table and retained store of the cluster.
//! Sessions owned by a peer appear locally as [`RemoteSession`](crate::session::RemoteSession)
//! proxies. Local mutations are mirrored to all linked peers; whatever arrives from a peer
//! is applied as remote and never mirrored again, so events cannot loop.
//!
//! Links are plain TCP framed by `LengthDelimitedCodec`, one per node pair. Membership is
//! learned from UDP broadcast ([`discovery`]) and from the static peer list.

use tokio::sync::mpsc;

use fluxmq_conf::Cluster;

use crate::types::{HashMap, NodeName};

pub mod connection;
pub mod discovery;
mod message;

pub use message::{ClusterMessage, DiscoveryPacket};

pub type LinkId = u64;
pub type PeerTx = mpsc::UnboundedSender<ClusterMessage>;
pub type PeerRx = mpsc::UnboundedReceiver<ClusterMessage>;

#[derive(Debug)]
pub struct Peer {
    pub link_id: LinkId,
    /// Node that opened the link.
    pub dialer: NodeName,
    tx: PeerTx,
}

impl Peer {
    pub fn new(link_id: LinkId, dialer: NodeName, tx: PeerTx) -> Self {
        Self { link_id, dialer, tx }
    }

    #[inline]
    pub fn send(&self, msg: ClusterMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Linked peers of this node.
#[derive(Debug)]
pub struct ClusterState {
    pub name: NodeName,
    pub cluster_name: String,
    peers: HashMap<NodeName, Peer>,
}

impl ClusterState {
    pub fn new(cfg: &Cluster) -> Self {
        Self { name: cfg.name.clone(), cluster_name: cfg.cluster_name.clone(), peers: HashMap::default() }
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[inline]
    pub fn names(&self) -> impl Iterator<Item = &NodeName> {
        self.peers.keys()
    }

    /// Accepts a new link unless an established one should win. With two links to the
    /// same node both sides keep the link opened by the node with the smaller name.
    pub fn link_up(&mut self, name: NodeName, peer: Peer) -> bool {
        if let Some(existing) = self.peers.get(&name) {
            if existing.dialer <= peer.dialer {
                log::debug!(
                    "duplicate link {} to {}, keeping link {} dialed by {}",
                    peer.link_id,
                    name,
                    existing.link_id,
                    existing.dialer
                );
                return false;
            }
            log::debug!("link {} to {} replaced by link {}", existing.link_id, name, peer.link_id);
        }
        self.peers.insert(name, peer);
        true
    }

    /// Drops the peer if `link_id` is still its current link.
    pub fn link_down(&mut self, name: &str, link_id: LinkId) -> bool {
        match self.peers.get(name) {
            Some(p) if p.link_id == link_id => {
                self.peers.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn send(&self, node: &str, msg: ClusterMessage) -> bool {
        match self.peers.get(node) {
            Some(p) => p.send(msg),
            None => {
                log::debug!("{} not linked, {} dropped", node, msg.name());
                false
            }
        }
    }

    pub fn broadcast(&self, msg: ClusterMessage) {
        for (name, peer) in self.peers.iter() {
            if !peer.send(msg.clone()) {
                log::debug!("link to {} is closing, {} dropped", name, msg.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionInfo;

    fn state(name: &str) -> ClusterState {
        let cfg = Cluster { name: name.into(), ..Default::default() };
        ClusterState::new(&cfg)
    }

    #[test]
    fn duplicate_links_resolve_the_same_way_on_both_sides() {
        // n1 and n2 dial each other at the same time: link 1 by n1, link 2 by n2
        let (tx, _rx1) = mpsc::unbounded_channel();
        let mut on_n1 = state("n1");
        assert!(on_n1.link_up("n2".into(), Peer::new(2, "n2".into(), tx.clone())));
        assert!(on_n1.link_up("n2".into(), Peer::new(1, "n1".into(), tx.clone())));
        assert_eq!(on_n1.get("n2").map(|p| p.link_id), Some(1));

        let mut on_n2 = state("n2");
        assert!(on_n2.link_up("n1".into(), Peer::new(1, "n1".into(), tx.clone())));
        assert!(!on_n2.link_up("n1".into(), Peer::new(2, "n2".into(), tx)));
        assert_eq!(on_n2.get("n1").map(|p| p.link_id), Some(1));

        // the losing link going down leaves the peer in place
        assert!(!on_n1.link_down("n2", 2));
        assert!(on_n1.contains("n2"));
        assert!(on_n1.link_down("n2", 1));
        assert!(on_n1.is_empty());
    }

    #[test]
    fn send_and_broadcast() {
        let mut s = state("n1");
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        s.link_up("n2".into(), Peer::new(1, "n1".into(), tx2));
        s.link_up("n3".into(), Peer::new(2, "n1".into(), tx3));
        let info = SessionInfo {
            client_id: "c".into(),
            connected: true,
            protocol: crate::types::ProtocolVersion::V5,
            session_expiry_interval: 0,
            disconnected_at: None,
        };
        s.broadcast(ClusterMessage::SessionUpdate(info));
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
        assert!(s.send("n3", ClusterMessage::SessionTakenOver { client_id: "c".into() }));
        assert!(matches!(rx3.try_recv(), Ok(ClusterMessage::SessionTakenOver { .. })));
        assert!(!s.send("n4", ClusterMessage::SessionTakenOver { client_id: "c".into() }));
        assert_eq!(s.len(), 2);
    }
}
