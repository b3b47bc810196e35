//! The broker event loop.
//!
//! All broker state lives in one task. Client connections, cluster links, discovery and
//! the maintenance tick talk to it through a single [`Command`] channel, so commands from
//! one connection are always handled in the order they were sent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytestring::ByteString;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use fluxmq_conf::{Listener as ListenerConfig, ListenerKind, Settings};
use fluxmq_net::{Acceptor, Builder, Dispatcher, Listener, ListenerType};
use fluxmq_utils::timestamp_millis;

use crate::acl::StaticAuth;
use crate::broker::Broker;
use crate::cluster::connection::{self as link, LocalNode};
use crate::cluster::discovery::{should_dial, Discovery};
use crate::cluster::{ClusterMessage, ClusterState, DiscoveryPacket, LinkId, PeerTx};
use crate::connection::{self, ConnectionConfig};
use crate::error::BrokerError;
use crate::packet::{ConnectRequest, Inbound};
use crate::persistence;
use crate::session::Tx;
use crate::types::{ClientId, ConnId, HashSet, Message, NodeName};
use crate::Result;

pub type CommandTx = mpsc::UnboundedSender<Command>;
pub type CommandRx = mpsc::UnboundedReceiver<Command>;

pub enum Command {
    Connect { conn_id: ConnId, req: Box<ConnectRequest>, tx: Tx },
    Inbound { conn_id: ConnId, packet: Inbound },
    Closed { conn_id: ConnId },
    /// Publish on behalf of the server itself, replies whether any session took the message.
    Publish { message: Message, reply: oneshot::Sender<std::result::Result<bool, BrokerError>> },
    IsConnected { client_id: ClientId, reply: oneshot::Sender<bool> },
    Stop { server_reference: Option<ByteString>, temporarily_moved: bool, reply: Option<oneshot::Sender<()>> },
    LinkUp { name: NodeName, link_id: LinkId, dialer: NodeName, tx: PeerTx },
    LinkDown { name: NodeName, link_id: LinkId },
    Cluster { from: NodeName, msg: ClusterMessage },
    Discovered { packet: DiscoveryPacket, from: SocketAddr },
    /// A dial task ended, the address may be dialed again.
    DialDone { addr: SocketAddr },
}

/// Cloneable entry point for code running outside the event loop.
#[derive(Clone)]
pub struct ServerHandle {
    cmd_tx: CommandTx,
}

impl ServerHandle {
    pub async fn publish(&self, message: Message) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Publish { message, reply }).map_err(|_| anyhow!("server stopped"))?;
        Ok(rx.await.map_err(|_| anyhow!("server stopped"))??)
    }

    pub async fn is_client_connected(&self, client_id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::IsConnected { client_id: ClientId::from(client_id), reply })
            .map_err(|_| anyhow!("server stopped"))?;
        rx.await.map_err(|_| anyhow!("server stopped"))
    }

    /// Disconnects every client and ends the event loop. With a `server_reference` clients
    /// are told to use another server, permanently unless `temporarily_moved`.
    pub async fn stop(&self, server_reference: Option<ByteString>, temporarily_moved: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop { server_reference, temporarily_moved, reply: Some(reply) })
            .map_err(|_| anyhow!("server stopped"))?;
        rx.await.map_err(|_| anyhow!("server stopped"))
    }
}

pub struct Server {
    settings: Settings,
    broker: Broker,
    local: LocalNode,
    cmd_tx: CommandTx,
    cmd_rx: CommandRx,
    dialing: HashSet<SocketAddr>,
}

impl Server {
    pub fn new(settings: Settings) -> Result<Self> {
        let persistence = persistence::build(&settings.storage)?;
        let auth = Arc::new(StaticAuth::new(&settings.auth));
        let cluster = ClusterState::new(&settings.cluster);
        let local = LocalNode { cluster_name: cluster.cluster_name.clone(), name: cluster.name.clone() };
        let mut broker = Broker::new(settings.mqtt.clone(), cluster, persistence, auth.clone(), auth);
        broker.restore()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Self { settings, broker, local, cmd_tx, cmd_rx, dialing: HashSet::default() })
    }

    #[inline]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle { cmd_tx: self.cmd_tx.clone() }
    }

    #[inline]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Binds every configured listener and runs the event loop until [`ServerHandle::stop`].
    pub async fn listen(mut self) -> Result<()> {
        let mut tasks = Vec::new();
        for (kind, l) in self.settings.listeners.enabled() {
            if let Some(l) = open(kind, l, &self.settings)? {
                tasks.push(self.spawn_listener(l));
            }
        }

        let mut discovery = None;
        if self.settings.cluster.enable {
            let l = TcpListener::bind(self.settings.cluster.addr).await?;
            log::info!("cluster node {} listening on {}", self.local.name, self.settings.cluster.addr);
            tasks.push(tokio::spawn(accept_links(l, self.local.clone(), self.cmd_tx.clone())));
            if self.settings.cluster.discovery {
                let d = Arc::new(Discovery::bind(&self.settings.cluster)?);
                tasks.push(tokio::spawn(recv_discovery(d.clone(), self.cmd_tx.clone())));
                discovery = Some(d);
            }
        }

        self.run(discovery).await;
        for t in tasks {
            t.abort();
        }
        Ok(())
    }

    async fn run(&mut self, discovery: Option<Arc<Discovery>>) {
        let mut tick = tokio::time::interval(self.settings.mqtt.min_keep_alive_check_interval);
        let mut cluster_tick = tokio::time::interval(self.settings.cluster.discovery_interval);
        let cluster_enabled = self.settings.cluster.enable;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.broker.clean_up_operations(timestamp_millis()),
                _ = cluster_tick.tick(), if cluster_enabled => {
                    if let Some(d) = discovery.as_ref() {
                        if let Err(e) = d.announce().await {
                            log::debug!("discovery announce failed, {}", e);
                        }
                    }
                    for addr in self.settings.cluster.peers.clone() {
                        self.dial(addr);
                    }
                }
            }
        }
        log::info!("event loop stopped");
    }

    /// One non-blocking iteration: drains queued commands, then runs one maintenance tick.
    /// Returns false once the server was stopped.
    pub fn step(&mut self) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if !self.handle_command(cmd) {
                return false;
            }
        }
        self.broker.clean_up_operations(timestamp_millis());
        true
    }

    /// Returns false once the server was stopped.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { conn_id, req, tx } => {
                self.broker.connect(conn_id, *req, tx);
            }
            Command::Inbound { conn_id, packet } => self.broker.handle_inbound(conn_id, packet),
            Command::Closed { conn_id } => self.broker.closed(conn_id),
            Command::Publish { message, reply } => {
                let _ = reply.send(self.broker.publish(None, message, false));
            }
            Command::IsConnected { client_id, reply } => {
                let _ = reply.send(self.broker.is_client_connected(&client_id));
            }
            Command::Stop { server_reference, temporarily_moved, reply } => {
                log::info!(
                    "stopping, server reference: {:?}, temporarily: {}",
                    server_reference,
                    temporarily_moved
                );
                self.broker.stop(server_reference, temporarily_moved);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return false;
            }
            Command::LinkUp { name, link_id, dialer, tx } => {
                self.broker.link_up(name, link_id, dialer, tx);
            }
            Command::LinkDown { name, link_id } => self.broker.link_down(&name, link_id),
            Command::Cluster { from, msg } => self.broker.handle_cluster(from, msg),
            Command::Discovered { packet, from } => {
                if should_dial(&self.local.cluster_name, &self.local.name, &packet)
                    && !self.broker.cluster().contains(&packet.name)
                {
                    self.dial(from);
                }
            }
            Command::DialDone { addr } => {
                self.dialing.remove(&addr);
            }
        }
        true
    }

    /// At most one dial task per address; the task lives as long as the link.
    fn dial(&mut self, addr: SocketAddr) {
        if !self.dialing.insert(addr) {
            return;
        }
        let local = self.local.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = link::dial(addr, local, cmd_tx.clone()).await {
                log::debug!("cluster link to {} failed, {}", addr, e);
            }
            let _ = cmd_tx.send(Command::DialDone { addr });
        });
    }

    fn spawn_listener(&self, l: Listener) -> JoinHandle<()> {
        let cfg = ConnectionConfig {
            handshake_timeout: l.cfg.handshake_timeout,
            max_topic_alias: self.settings.mqtt.maximum_topic_alias,
            server_keep_alive: self.settings.mqtt.server_keep_alive,
        };
        tokio::spawn(accept_clients(l, cfg, self.cmd_tx.clone()))
    }
}

fn open(kind: ListenerKind, l: &ListenerConfig, settings: &Settings) -> Result<Option<Listener>> {
    let listener = match kind {
        ListenerKind::Tcp => bind(l, settings)?,
        #[cfg(feature = "tls")]
        ListenerKind::Tls => bind(l, settings)?.tls()?,
        #[cfg(feature = "ws")]
        ListenerKind::Ws => bind(l, settings)?.ws()?,
        #[cfg(all(feature = "tls", feature = "ws"))]
        ListenerKind::Wss => bind(l, settings)?.wss()?,
        #[allow(unreachable_patterns)]
        _ => {
            log::warn!("{} skipped, fluxmq was built without {} support", l.name, kind);
            return Ok(None);
        }
    };
    Ok(Some(listener))
}

fn bind(l: &ListenerConfig, settings: &Settings) -> Result<Listener> {
    Builder {
        name: l.name.clone(),
        laddr: l.addr,
        backlog: l.backlog,
        nodelay: l.nodelay,
        reuseaddr: l.reuseaddr,
        reuseport: l.reuseport,
        max_packet_size: l.max_packet_size.as_u32().min(settings.mqtt.maximum_packet_size.as_u32()),
        handshake_timeout: l.handshake_timeout,
        send_timeout: l.send_timeout,
        tls_cert: l.cert.clone(),
        tls_key: l.key.clone(),
    }
    .bind()
}

async fn accept_clients(l: Listener, cfg: ConnectionConfig, cmd_tx: CommandTx) {
    loop {
        match l.accept().await {
            Ok(acceptor) => {
                let cmd_tx = cmd_tx.clone();
                tokio::spawn(async move {
                    let remote_addr = acceptor.remote_addr;
                    let typ = acceptor.typ;
                    if let Err(e) = serve(acceptor, cfg, cmd_tx).await {
                        log::debug!("{:?} connection from {} ended, {}", typ, remote_addr, e);
                    }
                });
            }
            Err(e) => {
                log::warn!("{} accept error, {}", l.cfg.name, e);
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
    }
}

async fn serve(acceptor: Acceptor<TcpStream>, cfg: ConnectionConfig, cmd_tx: CommandTx) -> Result<()> {
    match acceptor.typ {
        ListenerType::TCP => dispatch(acceptor.tcp()?, cfg, cmd_tx).await,
        #[cfg(feature = "tls")]
        ListenerType::TLS => dispatch(acceptor.tls().await?, cfg, cmd_tx).await,
        #[cfg(feature = "ws")]
        ListenerType::WS => dispatch(acceptor.ws().await?, cfg, cmd_tx).await,
        #[cfg(all(feature = "tls", feature = "ws"))]
        ListenerType::WSS => dispatch(acceptor.wss().await?, cfg, cmd_tx).await,
    }
}

async fn dispatch<Io>(d: Dispatcher<Io>, cfg: ConnectionConfig, cmd_tx: CommandTx) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send,
{
    let stream = d.mqtt().await?;
    connection::process(stream, cfg, cmd_tx).await
}

async fn accept_links(l: TcpListener, local: LocalNode, cmd_tx: CommandTx) {
    loop {
        match l.accept().await {
            Ok((stream, addr)) => {
                let local = local.clone();
                let cmd_tx = cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    if let Err(e) = link::run(stream, addr, local, cmd_tx, false).await {
                        log::debug!("cluster link from {} ended, {}", addr, e);
                    }
                });
            }
            Err(e) => {
                log::warn!("cluster accept error, {}", e);
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
    }
}

async fn recv_discovery(d: Arc<Discovery>, cmd_tx: CommandTx) {
    loop {
        match d.recv().await {
            Ok((packet, from)) => {
                if cmd_tx.send(Command::Discovered { packet, from }).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("discovery receive error, {}", e);
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
    }
}
