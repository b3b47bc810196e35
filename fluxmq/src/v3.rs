//! MQTT 3.1 / 3.1.1 framing.
//!
//! MQTT 3 has no reason codes on acknowledgements and no server DISCONNECT, so
//! refusals collapse onto the six CONNACK return codes, a refused subscription is
//! `Failure`, and a server-side disconnect is just the socket closing.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use fluxmq_net::v3::MqttStream;
use rmqtt_codec::types::Publish;
use rmqtt_codec::v3::{Connect, ConnectAck, ConnectAckReason, Packet, SubscribeReturnCode};

use crate::connection::Transport;
use crate::error::{BrokerError, ReasonCode};
use crate::packet::{ConnAck, ConnectRequest, Inbound, Outbound, SubscribeStatus};
use crate::types::{Message, MessageProperties, ProtocolVersion, SubscribeFilter, Will};
use crate::Result;

pub struct V3Transport<Io> {
    stream: MqttStream<Io>,
}

impl<Io> V3Transport<Io> {
    pub fn new(stream: MqttStream<Io>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<Io> Transport for V3Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[inline]
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::V3
    }

    #[inline]
    fn remote_addr(&self) -> SocketAddr {
        self.stream.remote_addr
    }

    async fn recv_connect(&mut self, tm: Duration) -> Result<ConnectRequest> {
        let c = self.stream.recv_connect(tm).await?;
        Ok(connect_request(*c))
    }

    async fn recv(&mut self, tm: Duration) -> Result<Option<Inbound>> {
        match self.stream.recv(tm).await? {
            Some(p) => Ok(Some(inbound(p)?)),
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

pub fn connect_request(c: Connect) -> ConnectRequest {
    let will = c.last_will.map(|w| Will {
        message: Message::new(w.topic, w.qos, w.retain, w.message, MessageProperties::default()),
        delay_interval: 0,
    });
    ConnectRequest {
        clean_start: c.clean_session,
        keep_alive: c.keep_alive,
        username: c.username,
        password: c.password,
        will,
        ..ConnectRequest::new(ProtocolVersion::V3, c.client_id)
    }
}

pub fn inbound(packet: Packet) -> std::result::Result<Inbound, BrokerError> {
    Ok(match packet {
        Packet::Publish(p) => Inbound::Publish {
            packet_id: p.packet_id,
            message: Message::new(p.topic, p.qos, p.retain, p.payload, MessageProperties::default()),
        },
        Packet::PublishAck { packet_id } => Inbound::PubAck { packet_id },
        Packet::PublishReceived { packet_id } => Inbound::PubRec { packet_id },
        Packet::PublishRelease { packet_id } => Inbound::PubRel { packet_id },
        Packet::PublishComplete { packet_id } => Inbound::PubComp { packet_id },
        Packet::Subscribe { packet_id, topic_filters } => Inbound::Subscribe {
            packet_id,
            subscription_identifier: None,
            filters: topic_filters.into_iter().map(|(f, qos)| SubscribeFilter::new(f, qos)).collect(),
        },
        Packet::Unsubscribe { packet_id, topic_filters } => {
            Inbound::Unsubscribe { packet_id, filters: topic_filters }
        }
        Packet::PingRequest => Inbound::PingReq,
        Packet::Disconnect => Inbound::Disconnect { normal: true, session_expiry_interval: None },
        other => {
            return Err(BrokerError::protocol(
                ReasonCode::ProtocolError,
                format!("unexpected packet type {} from client", other.packet_type()),
            ))
        }
    })
}

/// `None` for packets MQTT 3 has no wire form for.
pub fn outbound(packet: Outbound) -> Option<Packet> {
    Some(match packet {
        Outbound::ConnAck(ack) => Packet::ConnectAck(connect_ack(&ack)),
        Outbound::Publish { packet_id, message } => Packet::Publish(Box::new(Publish {
            dup: message.dup,
            retain: message.retain,
            qos: message.qos,
            topic: message.topic,
            packet_id,
            payload: message.payload,
            properties: None,
            delay_interval: None,
            create_time: Some(message.create_time),
        })),
        Outbound::PubAck { packet_id, .. } => Packet::PublishAck { packet_id },
        Outbound::PubRec { packet_id, .. } => Packet::PublishReceived { packet_id },
        Outbound::PubRel { packet_id, .. } => Packet::PublishRelease { packet_id },
        Outbound::PubComp { packet_id, .. } => Packet::PublishComplete { packet_id },
        Outbound::SubAck { packet_id, status } => Packet::SubscribeAck {
            packet_id,
            status: status
                .into_iter()
                .map(|s| match s {
                    SubscribeStatus::Granted(qos) => SubscribeReturnCode::Success(qos),
                    SubscribeStatus::Refused(_) => SubscribeReturnCode::Failure,
                })
                .collect(),
        },
        Outbound::UnsubAck { packet_id, .. } => Packet::UnsubscribeAck { packet_id },
        Outbound::PingResp => Packet::PingResponse,
        Outbound::Disconnect { .. } | Outbound::Close => return None,
    })
}

fn connect_ack(ack: &ConnAck) -> ConnectAck {
    let return_code = connack_reason(ack.reason);
    let session_present = ack.session_present && return_code == ConnectAckReason::ConnectionAccepted;
    ConnectAck { return_code, session_present }
}

pub fn connack_reason(reason: ReasonCode) -> ConnectAckReason {
    match reason {
        ReasonCode::Success => ConnectAckReason::ConnectionAccepted,
        ReasonCode::UnsupportedProtocolVersion => ConnectAckReason::UnacceptableProtocolVersion,
        ReasonCode::ClientIdentifierNotValid => ConnectAckReason::IdentifierRejected,
        ReasonCode::BadUserNameOrPassword => ConnectAckReason::BadUserNameOrPassword,
        ReasonCode::NotAuthorized | ReasonCode::BadAuthenticationMethod => ConnectAckReason::NotAuthorized,
        _ => ConnectAckReason::ServiceUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use rmqtt_codec::v3::LastWill;
    use rmqtt_codec::types::QoS;

    use super::*;

    #[test]
    fn connect_and_will() {
        let c = Connect {
            clean_session: false,
            keep_alive: 30,
            client_id: "c1".into(),
            last_will: Some(LastWill {
                qos: QoS::AtLeastOnce,
                retain: true,
                topic: "w".into(),
                message: "bye".into(),
            }),
            ..Default::default()
        };
        let req = connect_request(c);
        assert_eq!(req.protocol, ProtocolVersion::V3);
        assert!(!req.clean_start);
        assert_eq!(req.keep_alive, 30);
        assert_eq!(req.session_expiry_interval, None);
        let will = req.will.unwrap();
        assert_eq!(will.message.topic, "w");
        assert!(will.message.retain);
        assert_eq!(will.delay_interval, 0);
    }

    #[test]
    fn subscribe_refusal_is_failure() {
        let id = NonZeroU16::new(7).unwrap();
        let p = outbound(Outbound::SubAck {
            packet_id: id,
            status: vec![
                SubscribeStatus::Granted(QoS::AtLeastOnce),
                SubscribeStatus::Refused(ReasonCode::NotAuthorized),
            ],
        });
        assert_eq!(
            p,
            Some(Packet::SubscribeAck {
                packet_id: id,
                status: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce), SubscribeReturnCode::Failure]
            })
        );
        assert!(outbound(Outbound::Disconnect { reason: ReasonCode::SessionTakenOver, server_reference: None })
            .is_none());
    }

    #[test]
    fn connack_codes() {
        assert_eq!(connack_reason(ReasonCode::Success), ConnectAckReason::ConnectionAccepted);
        assert_eq!(connack_reason(ReasonCode::ClientIdentifierNotValid), ConnectAckReason::IdentifierRejected);
        assert_eq!(connack_reason(ReasonCode::BadUserNameOrPassword), ConnectAckReason::BadUserNameOrPassword);
        assert_eq!(connack_reason(ReasonCode::QosNotSupported), ConnectAckReason::ServiceUnavailable);
    }

    #[test]
    fn second_connect_is_protocol_error() {
        let e = inbound(Packet::Connect(Box::default())).unwrap_err();
        assert_eq!(e.reason_code(), ReasonCode::ProtocolError);
        assert!(matches!(inbound(Packet::Disconnect), Ok(Inbound::Disconnect { normal: true, .. })));
    }
}
