use serde::{Deserialize, Serialize};

use crate::retain::Retained;
use crate::types::{ClientId, Message, NodeName, SessionInfo, Subscription, TopicFilter, TopicName};
use crate::Result;

/// Frames exchanged over an inter-node link. Everything a node receives is applied
/// as remote and never mirrored again.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum ClusterMessage {
    Hello { cluster_name: String, name: NodeName },
    SessionUpdate(SessionInfo),
    SessionTakenOver { client_id: ClientId },
    Subscribe { client_id: ClientId, subscription: Subscription },
    /// `topic_filter` is the full filter, share prefix included.
    Unsubscribe { client_id: ClientId, topic_filter: TopicFilter },
    Retain { topic: TopicName, retained: Retained },
    /// Routed by the receiver to its own local subscribers.
    Publish { publisher: Option<ClientId>, message: Message },
    /// Targeted delivery to one session owned by the receiver.
    Deliver { client_id: ClientId, message: Message },
}

impl ClusterMessage {
    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(anyhow::Error::new)?)
    }

    #[inline]
    pub fn decode(data: &[u8]) -> Result<ClusterMessage> {
        Ok(bincode::deserialize::<ClusterMessage>(data).map_err(anyhow::Error::new)?)
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::SessionUpdate(_) => "SessionUpdate",
            ClusterMessage::SessionTakenOver { .. } => "SessionTakenOver",
            ClusterMessage::Subscribe { .. } => "Subscribe",
            ClusterMessage::Unsubscribe { .. } => "Unsubscribe",
            ClusterMessage::Retain { .. } => "Retain",
            ClusterMessage::Publish { .. } => "Publish",
            ClusterMessage::Deliver { .. } => "Deliver",
        }
    }
}

/// Broadcast on the discovery port every discovery interval.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub cluster_name: String,
    pub name: NodeName,
    /// inter-node listen port
    pub port: u16,
}

impl DiscoveryPacket {
    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(anyhow::Error::new)?)
    }

    #[inline]
    pub fn decode(data: &[u8]) -> Result<DiscoveryPacket> {
        Ok(bincode::deserialize::<DiscoveryPacket>(data).map_err(anyhow::Error::new)?)
    }
}
