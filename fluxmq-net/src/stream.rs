use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use rmqtt_codec::error::{DecodeError, EncodeError, SendPacketError};
use rmqtt_codec::v3::Codec as CodecV3;
use rmqtt_codec::v5::Codec as CodecV5;
use rmqtt_codec::version::{ProtocolVersion, VersionCodec};
use rmqtt_codec::{MqttCodec, MqttPacket};

use crate::error::MqttError;
use crate::{Builder, Result};

/// A connection whose MQTT protocol version is not known yet.
pub struct Dispatcher<Io> {
    io: Framed<Io, MqttCodec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> Dispatcher<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        Dispatcher { io: Framed::new(io, MqttCodec::Version(VersionCodec)), remote_addr, cfg }
    }

    /// Reads the protocol level of the first CONNECT and switches to the matching codec.
    /// The CONNECT itself stays buffered for `recv_connect`.
    pub async fn mqtt(mut self) -> Result<MqttStream<Io>> {
        let first = tokio::time::timeout(self.cfg.handshake_timeout, self.io.next());
        let ver = match first.await {
            Ok(Some(Ok((MqttPacket::Version(ver), _)))) => ver,
            Ok(Some(Err(e))) => return Err(MqttError::Decode(e).into()),
            Ok(_) => return Err(anyhow!(MqttError::Decode(DecodeError::InvalidProtocol))),
            Err(_) => return Err(MqttError::ReadTimeout.into()),
        };

        let max = self.cfg.max_packet_size;
        Ok(match ver {
            ProtocolVersion::MQTT3 => {
                *self.io.codec_mut() = MqttCodec::V3(CodecV3::new(max));
                MqttStream::V3(v3::MqttStream { io: self.io, remote_addr: self.remote_addr, cfg: self.cfg })
            }
            ProtocolVersion::MQTT5 => {
                *self.io.codec_mut() = MqttCodec::V5(CodecV5::new(max, max));
                MqttStream::V5(v5::MqttStream { io: self.io, remote_addr: self.remote_addr, cfg: self.cfg })
            }
        })
    }
}

pub enum MqttStream<Io> {
    V3(v3::MqttStream<Io>),
    V5(v5::MqttStream<Io>),
}

impl<Io> MqttStream<Io> {
    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            MqttStream::V3(s) => s.remote_addr,
            MqttStream::V5(s) => s.remote_addr,
        }
    }
}

macro_rules! framed_stream {
    ($packet:ty, $variant:ident) => {
        pub struct MqttStream<Io> {
            pub io: Framed<Io, MqttCodec>,
            pub remote_addr: SocketAddr,
            pub cfg: Arc<Builder>,
        }

        impl<Io> MqttStream<Io>
        where
            Io: AsyncRead + AsyncWrite + Unpin,
        {
            #[inline]
            pub async fn send(&mut self, packet: $packet) -> Result<()> {
                super::send(&mut self.io, MqttPacket::$variant(packet), self.cfg.send_timeout).await
            }

            /// Encodes into the write buffer without flushing.
            #[inline]
            pub async fn feed(&mut self, packet: $packet) -> Result<()> {
                let io = &mut self.io;
                super::timed(self.cfg.send_timeout, io.feed(MqttPacket::$variant(packet)), MqttError::WriteTimeout)
                    .await
            }

            #[inline]
            pub async fn flush(&mut self) -> Result<()> {
                super::timed(self.cfg.send_timeout, self.io.flush(), MqttError::FlushTimeout).await
            }

            #[inline]
            pub async fn close(&mut self) -> Result<()> {
                super::timed(self.cfg.send_timeout, self.io.close(), MqttError::CloseTimeout).await
            }

            /// Next packet, `None` once the peer closed the stream.
            #[inline]
            pub async fn recv(&mut self, tm: Duration) -> Result<Option<$packet>> {
                match tokio::time::timeout(tm, self.next()).await {
                    Ok(Some(Ok(p))) => Ok(Some(p)),
                    Ok(Some(Err(e))) => Err(e),
                    Ok(None) => Ok(None),
                    Err(_) => Err(MqttError::ReadTimeout.into()),
                }
            }

            #[inline]
            pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
                match self.recv(tm).await? {
                    Some(Packet::Connect(connect)) => Ok(connect),
                    _ => Err(MqttError::InvalidProtocol.into()),
                }
            }
        }

        impl<Io> futures::Stream for MqttStream<Io>
        where
            Io: AsyncRead + Unpin,
        {
            type Item = Result<$packet>;

            fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
                let next = Pin::new(&mut self.io).poll_next(cx);
                Poll::Ready(match futures::ready!(next) {
                    Some(Ok((MqttPacket::$variant(packet), _))) => Some(Ok(packet)),
                    Some(Ok(_)) => Some(Err(MqttError::Decode(DecodeError::MalformedPacket).into())),
                    Some(Err(e)) => Some(Err(MqttError::Decode(e).into())),
                    None => None,
                })
            }
        }
    };
}

pub mod v3 {
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_util::codec::Framed;

    use rmqtt_codec::error::DecodeError;
    use rmqtt_codec::v3::{Connect, Packet};
    use rmqtt_codec::{MqttCodec, MqttPacket};

    use crate::error::MqttError;
    use crate::{Builder, Result};

    framed_stream!(Packet, V3);
}

pub mod v5 {
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_util::codec::Framed;

    use rmqtt_codec::error::DecodeError;
    use rmqtt_codec::v5::{Connect, Packet};
    use rmqtt_codec::{MqttCodec, MqttPacket};

    use crate::error::MqttError;
    use crate::{Builder, Result};

    framed_stream!(Packet, V5);

    impl<Io> MqttStream<Io> {
        /// Applies the client's Maximum Packet Size to outgoing packets.
        pub fn set_max_outbound_size(&mut self, size: u32) {
            if let MqttCodec::V5(codec) = self.io.codec_mut() {
                codec.set_max_outbound_size(size);
            }
        }
    }
}

async fn timed<F>(tm: Duration, fut: F, on_timeout: MqttError) -> Result<()>
where
    F: Future<Output = std::result::Result<(), EncodeError>>,
{
    if tm.is_zero() {
        return fut.await.map_err(|e| MqttError::Encode(e).into());
    }
    match tokio::time::timeout(tm, fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MqttError::Encode(e).into()),
        Err(_) => Err(on_timeout.into()),
    }
}

async fn send<Io>(io: &mut Framed<Io, MqttCodec>, packet: MqttPacket, tm: Duration) -> Result<()>
where
    Io: AsyncWrite + Unpin,
{
    let fut = io.send(packet);
    let res = if tm.is_zero() {
        fut.await
    } else {
        tokio::time::timeout(tm, fut).await.map_err(|_| MqttError::WriteTimeout)?
    };
    res.map_err(|e| MqttError::SendPacket(SendPacketError::Encode(e)).into())
}
