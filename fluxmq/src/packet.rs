//! Protocol-neutral packets exchanged between connection tasks and the broker.

use bytes::Bytes;
use bytestring::ByteString;

use crate::error::ReasonCode;
use crate::types::{
    ClientId, Message, PacketId, ProtocolVersion, QoS, SubscribeFilter, SubscriptionIdentifier, TopicFilter,
    Will,
};

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub protocol: ProtocolVersion,
    pub client_id: ClientId,
    pub clean_start: bool,
    pub keep_alive: u16,
    /// None for v3, the connect property for v5
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: u16,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
    pub auth_method: Option<ByteString>,
    pub will: Option<Will>,
}

impl ConnectRequest {
    pub fn new<C: Into<ClientId>>(protocol: ProtocolVersion, client_id: C) -> Self {
        Self {
            protocol,
            client_id: client_id.into(),
            clean_start: true,
            keep_alive: 60,
            session_expiry_interval: None,
            receive_maximum: None,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            username: None,
            password: None,
            auth_method: None,
            will: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub reason: ReasonCode,
    pub session_present: bool,
    pub assigned_client_id: Option<ClientId>,
    pub session_expiry_interval: Option<u32>,
    pub server_keep_alive: Option<u16>,
    pub receive_maximum: u16,
    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub maximum_packet_size: u32,
    pub topic_alias_maximum: u16,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscription_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Granted(QoS),
    Refused(ReasonCode),
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Publish { packet_id: Option<PacketId>, message: Message },
    PubAck { packet_id: PacketId },
    PubRec { packet_id: PacketId },
    PubRel { packet_id: PacketId },
    PubComp { packet_id: PacketId },
    Subscribe {
        packet_id: PacketId,
        subscription_identifier: Option<SubscriptionIdentifier>,
        filters: Vec<SubscribeFilter>,
    },
    Unsubscribe { packet_id: PacketId, filters: Vec<TopicFilter> },
    PingReq,
    /// `normal` is false for a v5 DISCONNECT asking for the will to be published.
    Disconnect { normal: bool, session_expiry_interval: Option<u32> },
}

#[derive(Debug, Clone)]
pub enum Outbound {
    ConnAck(Box<ConnAck>),
    Publish { packet_id: Option<PacketId>, message: Message },
    PubAck { packet_id: PacketId, reason: ReasonCode },
    PubRec { packet_id: PacketId, reason: ReasonCode },
    PubRel { packet_id: PacketId, reason: ReasonCode },
    PubComp { packet_id: PacketId, reason: ReasonCode },
    SubAck { packet_id: PacketId, status: Vec<SubscribeStatus> },
    UnsubAck { packet_id: PacketId, status: Vec<ReasonCode> },
    PingResp,
    Disconnect { reason: ReasonCode, server_reference: Option<ByteString> },
    /// Tells the connection task to close the socket once everything before it is written.
    Close,
}
