use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
#[cfg(not(target_os = "windows"))]
#[cfg(feature = "tls")]
use rustls::crypto::aws_lc_rs as provider;
#[cfg(feature = "tls")]
#[cfg(target_os = "windows")]
use rustls::crypto::ring as provider;
#[cfg(feature = "tls")]
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(feature = "tls")]
use tokio_rustls::{server::TlsStream, TlsAcceptor};
#[cfg(feature = "ws")]
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
    tungstenite::http::HeaderValue,
};

use crate::stream::Dispatcher;
#[cfg(feature = "ws")]
use crate::ws::WsStream;
use crate::Result;
#[cfg(any(feature = "tls", feature = "ws"))]
use crate::MqttError;

/// Socket and handshake settings of one listener, filled in from its config table.
#[derive(Clone, Debug)]
pub struct Builder {
    /// Listener name used in logs, e.g. `external/tcp`.
    pub name: String,
    pub laddr: SocketAddr,
    pub backlog: i32,
    pub nodelay: bool,
    pub reuseaddr: bool,
    pub reuseport: bool,
    /// Largest inbound packet accepted by the codec, 0 means unlimited.
    pub max_packet_size: u32,
    pub handshake_timeout: Duration,
    /// Bound for each write, flush and close, zero disables it.
    pub send_timeout: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: String::new(),
            laddr: ([0, 0, 0, 0], 1883).into(),
            backlog: 1024,
            nodelay: false,
            reuseaddr: true,
            reuseport: false,
            max_packet_size: 1024 * 1024,
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Builder {
    /// Opens a non-blocking listening socket; the result accepts plain TCP until upgraded.
    pub fn bind(self) -> Result<Listener> {
        let domain = if self.laddr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(self.reuseaddr)?;
        #[cfg(not(windows))]
        socket.set_reuse_port(self.reuseport)?;
        socket.bind(&SockAddr::from(self.laddr))?;
        socket.listen(self.backlog)?;

        let tcp_listener = TcpListener::from_std(socket.into())?;
        log::info!("{} listening on {}", self.name, tcp_listener.local_addr()?);
        Ok(Listener {
            typ: ListenerType::TCP,
            cfg: Arc::new(self),
            tcp_listener,
            #[cfg(feature = "tls")]
            tls_acceptor: None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerType {
    TCP,
    #[cfg(feature = "tls")]
    TLS,
    #[cfg(feature = "ws")]
    WS,
    #[cfg(all(feature = "tls", feature = "ws"))]
    WSS,
}

pub struct Listener {
    pub typ: ListenerType,
    pub cfg: Arc<Builder>,
    tcp_listener: TcpListener,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<TlsAcceptor>,
}

impl Listener {
    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }

    fn upgrade(&mut self, to: ListenerType) -> Result<()> {
        if self.typ != ListenerType::TCP {
            return Err(anyhow!("{} is already {:?}, can not upgrade to {:?}", self.cfg.name, self.typ, to));
        }
        self.typ = to;
        Ok(())
    }

    #[cfg(feature = "ws")]
    pub fn ws(mut self) -> Result<Self> {
        self.upgrade(ListenerType::WS)?;
        Ok(self)
    }

    #[cfg(feature = "tls")]
    pub fn tls(mut self) -> Result<Self> {
        self.upgrade(ListenerType::TLS)?;
        self.tls_acceptor = Some(tls_acceptor(&self.cfg)?);
        Ok(self)
    }

    #[cfg(all(feature = "tls", feature = "ws"))]
    pub fn wss(mut self) -> Result<Self> {
        self.upgrade(ListenerType::WSS)?;
        self.tls_acceptor = Some(tls_acceptor(&self.cfg)?);
        Ok(self)
    }

    pub async fn accept(&self) -> Result<Acceptor<TcpStream>> {
        let (socket, remote_addr) = self.tcp_listener.accept().await?;
        socket.set_nodelay(self.cfg.nodelay)?;
        Ok(Acceptor {
            socket,
            remote_addr,
            #[cfg(feature = "tls")]
            tls_acceptor: self.tls_acceptor.clone(),
            cfg: self.cfg.clone(),
            typ: self.typ,
        })
    }
}

/// Server certificate chain and key from PEM files; clients are not asked for certificates.
#[cfg(feature = "tls")]
fn tls_acceptor(cfg: &Builder) -> Result<TlsAcceptor> {
    let cert_file = cfg.tls_cert.as_ref().ok_or_else(|| anyhow!("{} has no tls cert", cfg.name))?;
    let key_file = cfg.tls_key.as_ref().ok_or_else(|| anyhow!("{} has no tls key", cfg.name))?;
    let certs = CertificateDer::pem_file_iter(cert_file)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| anyhow!("tls cert {}: {}", cert_file, e))?;
    let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| anyhow!("tls key {}: {}", key_file, e))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!(e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("bad certs/private key, {e}"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// An accepted socket that still has to complete the handshake of its listener type.
pub struct Acceptor<S> {
    pub(crate) socket: S,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<TlsAcceptor>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
    pub typ: ListenerType,
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn ensure(&self, typ: ListenerType) -> Result<()> {
        if self.typ == typ {
            Ok(())
        } else {
            Err(anyhow!("{:?} connection handed to the {:?} handshake", self.typ, typ))
        }
    }

    #[inline]
    pub fn tcp(self) -> Result<Dispatcher<S>> {
        self.ensure(ListenerType::TCP)?;
        Ok(Dispatcher::new(self.socket, self.remote_addr, self.cfg))
    }

    #[cfg(feature = "tls")]
    async fn tls_handshake(
        socket: S,
        acceptor: Option<TlsAcceptor>,
        cfg: &Builder,
    ) -> Result<TlsStream<S>> {
        let acceptor = acceptor.ok_or(MqttError::ServiceUnavailable)?;
        within(cfg.handshake_timeout, acceptor.accept(socket)).await
    }

    #[cfg(feature = "tls")]
    pub async fn tls(self) -> Result<Dispatcher<TlsStream<S>>> {
        self.ensure(ListenerType::TLS)?;
        let tls = Self::tls_handshake(self.socket, self.tls_acceptor, &self.cfg).await?;
        Ok(Dispatcher::new(tls, self.remote_addr, self.cfg))
    }

    #[cfg(feature = "ws")]
    pub async fn ws(self) -> Result<Dispatcher<WsStream<S>>> {
        self.ensure(ListenerType::WS)?;
        let ws = within(self.cfg.handshake_timeout, accept_hdr_async(self.socket, mqtt_subprotocol)).await?;
        Ok(Dispatcher::new(WsStream::new(ws), self.remote_addr, self.cfg))
    }

    #[cfg(all(feature = "tls", feature = "ws"))]
    pub async fn wss(self) -> Result<Dispatcher<WsStream<TlsStream<S>>>> {
        self.ensure(ListenerType::WSS)?;
        let tls = Self::tls_handshake(self.socket, self.tls_acceptor, &self.cfg).await?;
        let ws = within(self.cfg.handshake_timeout, accept_hdr_async(tls, mqtt_subprotocol)).await?;
        Ok(Dispatcher::new(WsStream::new(ws), self.remote_addr, self.cfg))
    }
}

/// Runs one handshake step, a timeout reads as [`MqttError::ReadTimeout`].
#[cfg(any(feature = "tls", feature = "ws"))]
async fn within<F, T, E>(tm: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    anyhow::Error: From<E>,
{
    Ok(tokio::time::timeout(tm, fut).await.map_err(|_| MqttError::ReadTimeout)??)
}

/// Only accepts clients that negotiate the `mqtt` websocket sub-protocol.
#[allow(clippy::result_large_err)]
#[cfg(feature = "ws")]
fn mqtt_subprotocol(req: &Request, mut response: Response) -> std::result::Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim() == "mqtt"))
        .unwrap_or(false);
    if !offered {
        return Err(ErrorResponse::new(Some("the mqtt sub-protocol is required".into())));
    }
    response.headers_mut().insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
    Ok(response)
}
