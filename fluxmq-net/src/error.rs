use rmqtt_codec::error::{DecodeError, EncodeError, SendPacketError};
use rmqtt_codec::v5::{DisconnectReasonCode, ToReasonCode};

/// Transport level failures of a single client connection.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    #[error("Mqtt send packet error: {0:?}")]
    SendPacket(#[from] SendPacketError),
    #[error("Read timeout")]
    ReadTimeout,
    #[error("Write timeout")]
    WriteTimeout,
    #[error("Flush timeout")]
    FlushTimeout,
    #[error("Close timeout")]
    CloseTimeout,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("invalid protocol")]
    InvalidProtocol,
}

impl ToReasonCode for MqttError {
    fn to_reason_code(&self) -> DisconnectReasonCode {
        match self {
            MqttError::Decode(DecodeError::MaxSizeExceeded) => DisconnectReasonCode::PacketTooLarge,
            MqttError::Decode(_) => DisconnectReasonCode::MalformedPacket,
            MqttError::Encode(EncodeError::OverMaxPacketSize) => DisconnectReasonCode::PacketTooLarge,
            MqttError::Encode(_) | MqttError::SendPacket(_) => {
                DisconnectReasonCode::ImplementationSpecificError
            }
            MqttError::ReadTimeout
            | MqttError::WriteTimeout
            | MqttError::FlushTimeout
            | MqttError::CloseTimeout => DisconnectReasonCode::KeepAliveTimeout,
            MqttError::ServiceUnavailable => DisconnectReasonCode::ServerBusy,
            MqttError::InvalidProtocol => DisconnectReasonCode::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes() {
        assert_eq!(
            MqttError::Decode(DecodeError::MaxSizeExceeded).to_reason_code(),
            DisconnectReasonCode::PacketTooLarge
        );
        assert_eq!(
            MqttError::Decode(DecodeError::MalformedPacket).to_reason_code(),
            DisconnectReasonCode::MalformedPacket
        );
        assert_eq!(MqttError::ReadTimeout.to_reason_code(), DisconnectReasonCode::KeepAliveTimeout);
        assert_eq!(MqttError::InvalidProtocol.to_reason_code(), DisconnectReasonCode::ProtocolError);
    }
}
