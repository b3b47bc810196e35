use std::fmt;

use fluxmq_net::MqttError;
use rmqtt_codec::error::{DecodeError, EncodeError};
use serde::{Deserialize, Serialize};

/// Protocol-neutral reason codes; `v3` and `v5` map them onto their wire forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    Success,
    NoMatchingSubscribers,
    NoSubscriptionExisted,
    UnspecifiedError,
    MalformedPacket,
    ProtocolError,
    ImplementationSpecificError,
    UnsupportedProtocolVersion,
    ClientIdentifierNotValid,
    BadUserNameOrPassword,
    NotAuthorized,
    ServerUnavailable,
    ServerBusy,
    ServerShuttingDown,
    BadAuthenticationMethod,
    KeepAliveTimeout,
    SessionTakenOver,
    TopicFilterInvalid,
    TopicNameInvalid,
    PacketIdentifierInUse,
    PacketIdentifierNotFound,
    ReceiveMaximumExceeded,
    TopicAliasInvalid,
    PacketTooLarge,
    QuotaExceeded,
    PayloadFormatInvalid,
    RetainNotSupported,
    QosNotSupported,
    UseAnotherServer,
    ServerMoved,
    SharedSubscriptionsNotSupported,
    SubscriptionIdentifiersNotSupported,
    WildcardSubscriptionsNotSupported,
}

impl ReasonCode {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, ReasonCode::Success | ReasonCode::NoMatchingSubscribers)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("protocol error ({0}): {1}")]
    Protocol(ReasonCode, String),
    #[error("no free packet identifier")]
    PacketIdExhausted,
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("storage error, {0}")]
    Storage(String),
    #[error("cluster error, {0}")]
    Cluster(String),
}

impl BrokerError {
    #[inline]
    pub fn protocol<S: Into<String>>(code: ReasonCode, msg: S) -> Self {
        BrokerError::Protocol(code, msg.into())
    }

    pub fn reason_code(&self) -> ReasonCode {
        match self {
            BrokerError::Protocol(code, _) => *code,
            BrokerError::PacketIdExhausted => ReasonCode::QuotaExceeded,
            BrokerError::Topic(_) => ReasonCode::TopicNameInvalid,
            BrokerError::Storage(_) | BrokerError::Cluster(_) => ReasonCode::ImplementationSpecificError,
        }
    }
}

impl From<sled::Error> for BrokerError {
    fn from(e: sled::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for BrokerError {
    fn from(e: bincode::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

/// Reason code to close a connection with after `e` ended it.
pub fn reason_of(e: &anyhow::Error) -> ReasonCode {
    if let Some(e) = e.downcast_ref::<BrokerError>() {
        return e.reason_code();
    }
    if e.downcast_ref::<TopicError>().is_some() {
        return ReasonCode::TopicNameInvalid;
    }
    if let Some(e) = e.downcast_ref::<MqttError>() {
        return match e {
            MqttError::Decode(DecodeError::MaxSizeExceeded) => ReasonCode::PacketTooLarge,
            MqttError::Decode(_) => ReasonCode::MalformedPacket,
            MqttError::Encode(EncodeError::OverMaxPacketSize) => ReasonCode::PacketTooLarge,
            MqttError::InvalidProtocol => ReasonCode::UnsupportedProtocolVersion,
            MqttError::ServiceUnavailable => ReasonCode::ServerBusy,
            MqttError::ReadTimeout
            | MqttError::WriteTimeout
            | MqttError::FlushTimeout
            | MqttError::CloseTimeout => ReasonCode::KeepAliveTimeout,
            MqttError::Encode(_) | MqttError::SendPacket(_) => ReasonCode::ImplementationSpecificError,
        };
    }
    ReasonCode::UnspecifiedError
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_reason() {
        let e = BrokerError::protocol(ReasonCode::TopicAliasInvalid, "alias 0");
        assert_eq!(e.reason_code(), ReasonCode::TopicAliasInvalid);
        assert_eq!(reason_of(&anyhow::Error::new(e)), ReasonCode::TopicAliasInvalid);
        assert_eq!(BrokerError::PacketIdExhausted.reason_code(), ReasonCode::QuotaExceeded);
        assert_eq!(reason_of(&anyhow::anyhow!("boom")), ReasonCode::UnspecifiedError);
        assert!(ReasonCode::NoMatchingSubscribers.is_success());
        assert!(!ReasonCode::NotAuthorized.is_success());
    }
}
