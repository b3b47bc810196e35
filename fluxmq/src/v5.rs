//! MQTT 5.0 framing: properties, reason codes and client topic aliases.

use std::num::{NonZeroU16, NonZeroU32};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use nonzero_ext::nonzero;
use tokio::io::{AsyncRead, AsyncWrite};

use fluxmq_net::v5::MqttStream;
use rmqtt_codec::types::Publish;
use rmqtt_codec::v5::{
    Connect, ConnectAck, ConnectAckReason, Disconnect, DisconnectReasonCode, LastWill, Packet, PublishAck,
    PublishAck2, PublishAck2Reason, PublishAckReason, PublishProperties, RetainHandling as RetainHandlingV5,
    SubscribeAck, SubscribeAckReason, UnsubscribeAck, UnsubscribeAckReason,
};

use crate::connection::Transport;
use crate::error::{BrokerError, ReasonCode};
use crate::packet::{ConnAck, ConnectRequest, Inbound, Outbound, SubscribeStatus};
use crate::types::{
    HashMap, Message, MessageProperties, ProtocolVersion, QoS, RetainHandling, SubscribeFilter, TopicName, Will,
};
use crate::Result;

/// Topic aliases a client registered on this connection.
#[derive(Debug, Default)]
pub struct TopicAliases {
    max: u16,
    topics: HashMap<u16, TopicName>,
}

impl TopicAliases {
    pub fn new(max: u16) -> Self {
        Self { max, topics: HashMap::default() }
    }

    /// An empty topic with an alias reuses the registered topic; a topic with an alias (re)registers it.
    pub fn resolve(
        &mut self,
        alias: Option<NonZeroU16>,
        topic: TopicName,
    ) -> std::result::Result<TopicName, BrokerError> {
        let Some(alias) = alias else { return Ok(topic) };
        if alias.get() > self.max {
            return Err(BrokerError::protocol(
                ReasonCode::TopicAliasInvalid,
                format!("topic alias {} exceeds the maximum {}", alias, self.max),
            ));
        }
        if topic.is_empty() {
            self.topics.get(&alias.get()).cloned().ok_or_else(|| {
                BrokerError::protocol(
                    ReasonCode::TopicAliasInvalid,
                    format!("topic alias {} is not registered", alias),
                )
            })
        } else {
            self.topics.insert(alias.get(), topic.clone());
            Ok(topic)
        }
    }
}

pub struct V5Transport<Io> {
    stream: MqttStream<Io>,
    aliases: TopicAliases,
}

impl<Io> V5Transport<Io> {
    pub fn new(stream: MqttStream<Io>, max_topic_alias: u16) -> Self {
        Self { stream, aliases: TopicAliases::new(max_topic_alias) }
    }
}

#[async_trait]
impl<Io> Transport for V5Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[inline]
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::V5
    }

    #[inline]
    fn remote_addr(&self) -> SocketAddr {
        self.stream.remote_addr
    }

    async fn recv_connect(&mut self, tm: Duration) -> Result<ConnectRequest> {
        let c = self.stream.recv_connect(tm).await?;
        //the client caps what the server may send
        if let Some(max) = c.max_packet_size {
            self.stream.set_max_outbound_size(max.get());
        }
        Ok(connect_request(*c))
    }

    async fn recv(&mut self, tm: Duration) -> Result<Option<Inbound>> {
        match self.stream.recv(tm).await? {
            Some(p) => Ok(Some(inbound(p, &mut self.aliases)?)),
            None => Ok(None),
        }
    }

    async fn send(&mut self, packet: Outbound) -> Result<()> {
        match outbound(packet) {
            Some(p) => self.stream.send(p).await,
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close().await
    }
}

fn will(w: LastWill) -> Will {
    let props = MessageProperties {
        payload_format_utf8: w.is_utf8_payload.unwrap_or(false),
        message_expiry_interval: w.message_expiry_interval.map(|v| v.get()),
        content_type: w.content_type,
        response_topic: w.response_topic,
        correlation_data: w.correlation_data,
        user_properties: w.user_properties,
        subscription_ids: Vec::new(),
    };
    Will {
        message: Message::new(w.topic, w.qos, w.retain, w.message, props),
        delay_interval: w.will_delay_interval_sec.unwrap_or(0),
    }
}

pub fn connect_request(c: Connect) -> ConnectRequest {
    ConnectRequest {
        clean_start: c.clean_start,
        keep_alive: c.keep_alive,
        session_expiry_interval: Some(c.session_expiry_interval_secs),
        receive_maximum: c.receive_max.map(|v| v.get()),
        maximum_packet_size: c.max_packet_size.map(|v| v.get()),
        topic_alias_maximum: c.topic_alias_max,
        username: c.username,
        password: c.password,
        auth_method: c.auth_method,
        will: c.last_will.map(will),
        ..ConnectRequest::new(ProtocolVersion::V5, c.client_id)
    }
}

fn message_properties(p: Option<PublishProperties>) -> MessageProperties {
    match p {
        Some(p) => MessageProperties {
            payload_format_utf8: p.is_utf8_payload,
            message_expiry_interval: p.message_expiry_interval.map(|v| v.get()),
            content_type: p.content_type,
            response_topic: p.response_topic,
            correlation_data: p.correlation_data,
            user_properties: p.user_properties,
            subscription_ids: Vec::new(),
        },
        None => MessageProperties::default(),
    }
}

pub fn inbound(packet: Packet, aliases: &mut TopicAliases) -> std::result::Result<Inbound, BrokerError> {
    Ok(match packet {
        Packet::Publish(p) => {
            let p = *p;
            let alias = p.properties.as_ref().and_then(|props| props.topic_alias);
            let topic = aliases.resolve(alias, p.topic)?;
            let props = message_properties(p.properties);
            let message = Message::new(topic, p.qos, p.retain, p.payload, props);
            Inbound::Publish { packet_id: p.packet_id, message }
        }
        Packet::PublishAck(ack) => Inbound::PubAck { packet_id: ack.packet_id },
        //a failed PUBREC ends the QoS 2 flow like a PUBACK
        Packet::PublishReceived(ack) if ack.reason_code as u8 >= 0x80 => {
            Inbound::PubAck { packet_id: ack.packet_id }
        }
        Packet::PublishReceived(ack) => Inbound::PubRec { packet_id: ack.packet_id },
        Packet::PublishRelease(ack) => Inbound::PubRel { packet_id: ack.packet_id },
        Packet::PublishComplete(ack) => Inbound::PubComp { packet_id: ack.packet_id },
        Packet::Subscribe(s) => Inbound::Subscribe {
            packet_id: s.packet_id,
            subscription_identifier: s.id.map(|id| id.get()),
            filters: s
                .topic_filters
                .into_iter()
                .map(|(topic_filter, opts)| SubscribeFilter {
                    topic_filter,
                    qos: opts.qos,
                    no_local: opts.no_local,
                    retain_as_published: opts.retain_as_published,
                    retain_handling: match opts.retain_handling {
                        RetainHandlingV5::AtSubscribe => RetainHandling::AtSubscribe,
                        RetainHandlingV5::AtSubscribeNew => RetainHandling::AtSubscribeNew,
                        RetainHandlingV5::NoAtSubscribe => RetainHandling::NoAtSubscribe,
                    },
                })
                .collect(),
        },
        Packet::Unsubscribe(u) => Inbound::Unsubscribe { packet_id: u.packet_id, filters: u.topic_filters },
        Packet::PingRequest => Inbound::PingReq,
        Packet::Disconnect(d) => Inbound::Disconnect {
            normal: d.reason_code == DisconnectReasonCode::NormalDisconnection,
            session_expiry_interval: d.session_expiry_interval_secs,
        },
        Packet::Auth(_) => {
            return Err(BrokerError::protocol(ReasonCode::BadAuthenticationMethod, "enhanced authentication"))
        }
        other => {
            return Err(BrokerError::protocol(
                ReasonCode::ProtocolError,
                format!("unexpected packet type {} from client", other.packet_type()),
            ))
        }
    })
}

fn publish_properties(p: MessageProperties) -> PublishProperties {
    PublishProperties {
        topic_alias: None,
        correlation_data: p.correlation_data,
        message_expiry_interval: p.message_expiry_interval.and_then(NonZeroU32::new),
        content_type: p.content_type,
        user_properties: p.user_properties,
        is_utf8_payload: p.payload_format_utf8,
        response_topic: p.response_topic,
        subscription_ids: p.subscription_ids.into_iter().filter_map(NonZeroU32::new).collect(),
    }
}

pub fn outbound(packet: Outbound) -> Option<Packet> {
    Some(match packet {
        Outbound::ConnAck(ack) => Packet::ConnectAck(Box::new(connect_ack(*ack))),
        Outbound::Publish { packet_id, message } => Packet::Publish(Box::new(Publish {
            dup: message.dup,
            retain: message.retain,
            qos: message.qos,
            topic: message.topic,
            packet_id,
            payload: message.payload,
            properties: Some(publish_properties(message.properties)),
            delay_interval: None,
            create_time: Some(message.create_time),
        })),
        Outbound::PubAck { packet_id, reason } => {
            Packet::PublishAck(PublishAck { packet_id, reason_code: puback_reason(reason), ..Default::default() })
        }
        Outbound::PubRec { packet_id, reason } => {
            let reason_code = puback_reason(reason);
            Packet::PublishReceived(PublishAck { packet_id, reason_code, ..Default::default() })
        }
        Outbound::PubRel { packet_id, reason } => {
            let reason_code = ack2_reason(reason);
            Packet::PublishRelease(PublishAck2 { packet_id, reason_code, ..Default::default() })
        }
        Outbound::PubComp { packet_id, reason } => {
            let reason_code = ack2_reason(reason);
            Packet::PublishComplete(PublishAck2 { packet_id, reason_code, ..Default::default() })
        }
        Outbound::SubAck { packet_id, status } => Packet::SubscribeAck(SubscribeAck {
            packet_id,
            properties: Vec::new(),
            reason_string: None,
            status: status.into_iter().map(suback_reason).collect(),
        }),
        Outbound::UnsubAck { packet_id, status } => Packet::UnsubscribeAck(UnsubscribeAck {
            packet_id,
            properties: Vec::new(),
            reason_string: None,
            status: status.into_iter().map(unsuback_reason).collect(),
        }),
        Outbound::PingResp => Packet::PingResponse,
        Outbound::Disconnect { reason, server_reference } => Packet::Disconnect(Disconnect {
            server_reference,
            ..Disconnect::new(disconnect_reason(reason))
        }),
        Outbound::Close => return None,
    })
}

fn connect_ack(ack: ConnAck) -> ConnectAck {
    let reason_code = connack_reason(ack.reason);
    if reason_code != ConnectAckReason::Success {
        return ConnectAck { reason_code, ..Default::default() };
    }
    ConnectAck {
        session_present: ack.session_present,
        reason_code,
        session_expiry_interval_secs: ack.session_expiry_interval,
        receive_max: NonZeroU16::new(ack.receive_maximum).unwrap_or(nonzero!(65535u16)),
        max_qos: ack.maximum_qos,
        max_packet_size: Some(ack.maximum_packet_size),
        assigned_client_id: ack.assigned_client_id,
        topic_alias_max: ack.topic_alias_maximum,
        retain_available: ack.retain_available,
        wildcard_subscription_available: ack.wildcard_subscription_available,
        subscription_identifiers_available: ack.subscription_identifiers_available,
        shared_subscription_available: ack.shared_subscription_available,
        server_keepalive_sec: ack.server_keep_alive,
        ..Default::default()
    }
}

pub fn connack_reason(reason: ReasonCode) -> ConnectAckReason {
    match reason {
        ReasonCode::Success => ConnectAckReason::Success,
        ReasonCode::MalformedPacket => ConnectAckReason::MalformedPacket,
        ReasonCode::ProtocolError => ConnectAckReason::ProtocolError,
        ReasonCode::ImplementationSpecificError => ConnectAckReason::ImplementationSpecificError,
        ReasonCode::UnsupportedProtocolVersion => ConnectAckReason::UnsupportedProtocolVersion,
        ReasonCode::ClientIdentifierNotValid => ConnectAckReason::ClientIdentifierNotValid,
        ReasonCode::BadUserNameOrPassword => ConnectAckReason::BadUserNameOrPassword,
        ReasonCode::NotAuthorized => ConnectAckReason::NotAuthorized,
        ReasonCode::ServerUnavailable => ConnectAckReason::ServerUnavailable,
        ReasonCode::ServerBusy => ConnectAckReason::ServerBusy,
        ReasonCode::BadAuthenticationMethod => ConnectAckReason::BadAuthenticationMethod,
        ReasonCode::TopicNameInvalid => ConnectAckReason::TopicNameInvalid,
        ReasonCode::PacketTooLarge => ConnectAckReason::PacketTooLarge,
        ReasonCode::QuotaExceeded => ConnectAckReason::QuotaExceeded,
        ReasonCode::PayloadFormatInvalid => ConnectAckReason::PayloadFormatInvalid,
        ReasonCode::RetainNotSupported => ConnectAckReason::RetainNotSupported,
        ReasonCode::QosNotSupported => ConnectAckReason::QosNotSupported,
        ReasonCode::UseAnotherServer => ConnectAckReason::UseAnotherServer,
        ReasonCode::ServerMoved => ConnectAckReason::ServerMoved,
        _ => ConnectAckReason::UnspecifiedError,
    }
}

pub fn disconnect_reason(reason: ReasonCode) -> DisconnectReasonCode {
    match reason {
        ReasonCode::Success => DisconnectReasonCode::NormalDisconnection,
        ReasonCode::MalformedPacket => DisconnectReasonCode::MalformedPacket,
        ReasonCode::ProtocolError => DisconnectReasonCode::ProtocolError,
        ReasonCode::ImplementationSpecificError => DisconnectReasonCode::ImplementationSpecificError,
        ReasonCode::NotAuthorized => DisconnectReasonCode::NotAuthorized,
        ReasonCode::ServerBusy => DisconnectReasonCode::ServerBusy,
        ReasonCode::ServerShuttingDown => DisconnectReasonCode::ServerShuttingDown,
        ReasonCode::BadAuthenticationMethod => DisconnectReasonCode::BadAuthenticationMethod,
        ReasonCode::KeepAliveTimeout => DisconnectReasonCode::KeepAliveTimeout,
        ReasonCode::SessionTakenOver => DisconnectReasonCode::SessionTakenOver,
        ReasonCode::TopicFilterInvalid => DisconnectReasonCode::TopicFilterInvalid,
        ReasonCode::TopicNameInvalid => DisconnectReasonCode::TopicNameInvalid,
        ReasonCode::ReceiveMaximumExceeded => DisconnectReasonCode::ReceiveMaximumExceeded,
        ReasonCode::TopicAliasInvalid => DisconnectReasonCode::TopicAliasInvalid,
        ReasonCode::PacketTooLarge => DisconnectReasonCode::PacketTooLarge,
        ReasonCode::QuotaExceeded => DisconnectReasonCode::QuotaExceeded,
        ReasonCode::PayloadFormatInvalid => DisconnectReasonCode::PayloadFormatInvalid,
        ReasonCode::RetainNotSupported => DisconnectReasonCode::RetainNotSupported,
        ReasonCode::QosNotSupported => DisconnectReasonCode::QosNotSupported,
        ReasonCode::UseAnotherServer => DisconnectReasonCode::UseAnotherServer,
        ReasonCode::ServerMoved => DisconnectReasonCode::ServerMoved,
        ReasonCode::SharedSubscriptionsNotSupported => DisconnectReasonCode::SharedSubscriptionNotSupported,
        ReasonCode::SubscriptionIdentifiersNotSupported => {
            DisconnectReasonCode::SubscriptionIdentifiersNotSupported
        }
        ReasonCode::WildcardSubscriptionsNotSupported => DisconnectReasonCode::WildcardSubscriptionsNotSupported,
        _ => DisconnectReasonCode::UnspecifiedError,
    }
}

fn puback_reason(reason: ReasonCode) -> PublishAckReason {
    match reason {
        ReasonCode::Success => PublishAckReason::Success,
        ReasonCode::NoMatchingSubscribers => PublishAckReason::NoMatchingSubscribers,
        ReasonCode::ImplementationSpecificError => PublishAckReason::ImplementationSpecificError,
        ReasonCode::NotAuthorized => PublishAckReason::NotAuthorized,
        ReasonCode::TopicNameInvalid => PublishAckReason::TopicNameInvalid,
        ReasonCode::PacketIdentifierInUse => PublishAckReason::PacketIdentifierInUse,
        ReasonCode::QuotaExceeded => PublishAckReason::QuotaExceeded,
        ReasonCode::PayloadFormatInvalid => PublishAckReason::PayloadFormatInvalid,
        _ => PublishAckReason::UnspecifiedError,
    }
}

#[inline]
fn ack2_reason(reason: ReasonCode) -> PublishAck2Reason {
    match reason {
        ReasonCode::PacketIdentifierNotFound => PublishAck2Reason::PacketIdNotFound,
        _ => PublishAck2Reason::Success,
    }
}

fn suback_reason(status: SubscribeStatus) -> SubscribeAckReason {
    match status {
        SubscribeStatus::Granted(QoS::AtMostOnce) => SubscribeAckReason::GrantedQos0,
        SubscribeStatus::Granted(QoS::AtLeastOnce) => SubscribeAckReason::GrantedQos1,
        SubscribeStatus::Granted(QoS::ExactlyOnce) => SubscribeAckReason::GrantedQos2,
        SubscribeStatus::Refused(reason) => match reason {
            ReasonCode::ImplementationSpecificError => SubscribeAckReason::ImplementationSpecificError,
            ReasonCode::NotAuthorized => SubscribeAckReason::NotAuthorized,
            ReasonCode::TopicFilterInvalid => SubscribeAckReason::TopicFilterInvalid,
            ReasonCode::PacketIdentifierInUse => SubscribeAckReason::PacketIdentifierInUse,
            ReasonCode::QuotaExceeded => SubscribeAckReason::QuotaExceeded,
            ReasonCode::SharedSubscriptionsNotSupported => SubscribeAckReason::SharedSubscriptionNotSupported,
            ReasonCode::SubscriptionIdentifiersNotSupported => {
                SubscribeAckReason::SubscriptionIdentifiersNotSupported
            }
            ReasonCode::WildcardSubscriptionsNotSupported => SubscribeAckReason::WildcardSubscriptionsNotSupported,
            _ => SubscribeAckReason::UnspecifiedError,
        },
    }
}

fn unsuback_reason(reason: ReasonCode) -> UnsubscribeAckReason {
    match reason {
        ReasonCode::Success => UnsubscribeAckReason::Success,
        ReasonCode::NoSubscriptionExisted => UnsubscribeAckReason::NoSubscriptionExisted,
        ReasonCode::NotAuthorized => UnsubscribeAckReason::NotAuthorized,
        ReasonCode::TopicFilterInvalid => UnsubscribeAckReason::TopicFilterInvalid,
        ReasonCode::PacketIdentifierInUse => UnsubscribeAckReason::PacketIdentifierInUse,
        _ => UnsubscribeAckReason::UnspecifiedError,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rmqtt_codec::v5::{Subscribe, SubscriptionOptions};

    use super::*;

    fn publish(topic: &str, alias: Option<u16>) -> Packet {
        let properties = PublishProperties { topic_alias: alias.and_then(NonZeroU16::new), ..Default::default() };
        Packet::Publish(Box::new(Publish {
            dup: false,
            retain: false,
            qos: QoS::AtMostOnce,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::from_static(b"x"),
            properties: Some(properties),
            delay_interval: None,
            create_time: None,
        }))
    }

    fn topic_of(r: std::result::Result<Inbound, BrokerError>) -> String {
        match r {
            Ok(Inbound::Publish { message, .. }) => message.topic.to_string(),
            other => panic!("unexpected {:?}", other.map_err(|e| e.to_string())),
        }
    }

    #[test]
    fn topic_alias_resolution() {
        let mut aliases = TopicAliases::new(4);
        assert_eq!(topic_of(inbound(publish("a/b", Some(1)), &mut aliases)), "a/b");
        assert_eq!(topic_of(inbound(publish("", Some(1)), &mut aliases)), "a/b");
        assert_eq!(topic_of(inbound(publish("c", Some(1)), &mut aliases)), "c");
        assert_eq!(topic_of(inbound(publish("", Some(1)), &mut aliases)), "c");

        let e = inbound(publish("x", Some(5)), &mut aliases).unwrap_err();
        assert_eq!(e.reason_code(), ReasonCode::TopicAliasInvalid);
        let e = inbound(publish("", Some(2)), &mut aliases).unwrap_err();
        assert_eq!(e.reason_code(), ReasonCode::TopicAliasInvalid);

        let mut none = TopicAliases::new(0);
        let e = inbound(publish("x", Some(1)), &mut none).unwrap_err();
        assert_eq!(e.reason_code(), ReasonCode::TopicAliasInvalid);
    }

    #[test]
    fn subscribe_options() {
        let mut opts = SubscriptionOptions { qos: QoS::ExactlyOnce, no_local: true, ..Default::default() };
        opts.retain_handling = RetainHandlingV5::AtSubscribeNew;
        let s = Subscribe {
            packet_id: NonZeroU16::new(3).unwrap(),
            id: NonZeroU32::new(9),
            user_properties: Vec::new(),
            topic_filters: vec![("a/+".into(), opts)],
        };
        match inbound(Packet::Subscribe(s), &mut TopicAliases::default()) {
            Ok(Inbound::Subscribe { subscription_identifier, filters, .. }) => {
                assert_eq!(subscription_identifier, Some(9));
                assert_eq!(filters.len(), 1);
                assert!(filters[0].no_local);
                assert_eq!(filters[0].qos, QoS::ExactlyOnce);
                assert_eq!(filters[0].retain_handling, RetainHandling::AtSubscribeNew);
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn failed_pubrec_acts_as_puback() {
        let id = NonZeroU16::new(2).unwrap();
        let ack = PublishAck { packet_id: id, reason_code: PublishAckReason::QuotaExceeded, ..Default::default() };
        assert!(matches!(
            inbound(Packet::PublishReceived(ack), &mut TopicAliases::default()),
            Ok(Inbound::PubAck { .. })
        ));
        let ack = PublishAck { packet_id: id, ..Default::default() };
        assert!(matches!(
            inbound(Packet::PublishReceived(ack), &mut TopicAliases::default()),
            Ok(Inbound::PubRec { .. })
        ));
    }

    #[test]
    fn refused_connack_carries_only_the_reason() {
        let ack = ConnAck {
            reason: ReasonCode::BadUserNameOrPassword,
            session_present: true,
            assigned_client_id: None,
            session_expiry_interval: Some(10),
            server_keep_alive: None,
            receive_maximum: 10,
            maximum_qos: QoS::AtLeastOnce,
            retain_available: false,
            maximum_packet_size: 1024,
            topic_alias_maximum: 0,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscription_available: true,
        };
        let refused = connect_ack(ack.clone());
        assert_eq!(refused.reason_code, ConnectAckReason::BadUserNameOrPassword);
        assert!(!refused.session_present);
        assert_eq!(refused.session_expiry_interval_secs, None);

        let accepted = connect_ack(ConnAck { reason: ReasonCode::Success, ..ack });
        assert!(accepted.session_present);
        assert_eq!(accepted.receive_max.get(), 10);
        assert_eq!(accepted.max_qos, QoS::AtLeastOnce);
        assert!(!accepted.retain_available);
    }

    #[test]
    fn server_disconnect() {
        match outbound(Outbound::Disconnect {
            reason: ReasonCode::ServerMoved,
            server_reference: Some("other:1883".into()),
        }) {
            Some(Packet::Disconnect(d)) => {
                assert_eq!(d.reason_code, DisconnectReasonCode::ServerMoved);
                assert_eq!(d.server_reference.as_deref(), Some("other:1883"));
            }
            _ => panic!("expected Disconnect"),
        }
        assert!(outbound(Outbound::Close).is_none());
    }
}
