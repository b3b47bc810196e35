//! One task per client connection.
//!
//! The task owns the socket and nothing else: decoded packets go to the broker as
//! [`Command::Inbound`], and whatever the broker queues on the connection's
//! [`Tx`](crate::session::Tx) is encoded back to the client. [`Outbound::Close`] or a
//! read error ends the task, which always reports [`Command::Closed`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use fluxmq_net::MqttStream;

use crate::error::reason_of;
use crate::packet::{ConnectRequest, Inbound, Outbound};
use crate::server::{Command, CommandTx};
use crate::types::{ConnId, ProtocolVersion};
use crate::v3::V3Transport;
use crate::v5::V5Transport;
use crate::Result;

/// Read timeout when the client disabled keep alive.
const IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Protocol version specific framing behind a protocol-neutral packet model.
#[async_trait]
pub trait Transport: Send {
    fn protocol(&self) -> ProtocolVersion;

    fn remote_addr(&self) -> SocketAddr;

    async fn recv_connect(&mut self, tm: Duration) -> Result<ConnectRequest>;

    /// `None` once the client closed the stream.
    async fn recv(&mut self, tm: Duration) -> Result<Option<Inbound>>;

    async fn send(&mut self, packet: Outbound) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Limits the connection task applies on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    /// Topic aliases a v5 client may use.
    pub max_topic_alias: u16,
    pub server_keep_alive: Option<u16>,
}

pub async fn process<Io>(stream: MqttStream<Io>, cfg: ConnectionConfig, cmd_tx: CommandTx) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send,
{
    match stream {
        MqttStream::V3(s) => run(V3Transport::new(s), cfg, cmd_tx).await,
        MqttStream::V5(s) => run(V5Transport::new(s, cfg.max_topic_alias), cfg, cmd_tx).await,
    }
}

/// Backstop read timeout; the broker itself closes idle sessions after 1.5 keep-alive periods.
#[inline]
fn idle_timeout(keep_alive: u16) -> Duration {
    if keep_alive == 0 {
        IDLE_TIMEOUT
    } else {
        Duration::from_secs(keep_alive as u64 * 2)
    }
}

pub async fn run<T: Transport>(mut t: T, cfg: ConnectionConfig, cmd_tx: CommandTx) -> Result<()> {
    let remote_addr = t.remote_addr();
    let req = t.recv_connect(cfg.handshake_timeout).await?;
    let conn_id: ConnId = NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst);
    log::debug!(
        "{} CONNECT from {}, protocol: {:?}, conn_id: {}",
        req.client_id,
        remote_addr,
        t.protocol(),
        conn_id
    );
    let idle = idle_timeout(cfg.server_keep_alive.unwrap_or(req.keep_alive));

    let (tx, mut rx) = mpsc::unbounded_channel();
    cmd_tx.send(Command::Connect { conn_id, req: Box::new(req), tx }).map_err(|_| anyhow!("broker stopped"))?;

    let res = loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Close) | None => break Ok(()),
                Some(packet) => {
                    if let Err(e) = t.send(packet).await {
                        break Err(e);
                    }
                }
            },
            inbound = t.recv(idle) => match inbound {
                Ok(Some(packet)) => {
                    if cmd_tx.send(Command::Inbound { conn_id, packet }).is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    let reason = reason_of(&e);
                    log::debug!("conn_id {} read error, {}, reason: {}", conn_id, e, reason);
                    let _ = t.send(Outbound::Disconnect { reason, server_reference: None }).await;
                    break Err(e);
                }
            },
        }
    };

    if let Err(e) = t.close().await {
        log::debug!("conn_id {} close error, {}", conn_id, e);
    }
    let _ = cmd_tx.send(Command::Closed { conn_id });
    log::debug!("conn_id {} from {} closed", conn_id, remote_addr);
    res
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::ReasonCode;

    /// Scripted transport: replays `input`, records everything sent.
    struct Scripted {
        input: VecDeque<Inbound>,
        sent: Arc<Mutex<Vec<Outbound>>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        fn protocol(&self) -> ProtocolVersion {
            ProtocolVersion::V5
        }

        fn remote_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 1883))
        }

        async fn recv_connect(&mut self, _tm: Duration) -> Result<ConnectRequest> {
            Ok(ConnectRequest::new(ProtocolVersion::V5, "c1"))
        }

        async fn recv(&mut self, _tm: Duration) -> Result<Option<Inbound>> {
            match self.input.pop_front() {
                Some(p) => Ok(Some(p)),
                None => std::future::pending().await,
            }
        }

        async fn send(&mut self, packet: Outbound) -> Result<()> {
            self.sent.lock().push(packet);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn relays_until_close() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let t = Scripted { input: VecDeque::from(vec![Inbound::PingReq]), sent: sent.clone() };
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(t, ConnectionConfig::default(), cmd_tx));

        let (conn_id, tx) = match cmd_rx.recv().await {
            Some(Command::Connect { conn_id, req, tx }) => {
                assert_eq!(req.client_id, "c1");
                (conn_id, tx)
            }
            _ => panic!("expected Connect"),
        };
        assert!(matches!(
            cmd_rx.recv().await,
            Some(Command::Inbound { packet: Inbound::PingReq, conn_id: id }) if id == conn_id
        ));

        tx.send(Outbound::PingResp).unwrap();
        tx.send(Outbound::Disconnect { reason: ReasonCode::ServerShuttingDown, server_reference: None }).unwrap();
        tx.send(Outbound::Close).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert!(matches!(cmd_rx.recv().await, Some(Command::Closed { conn_id: id }) if id == conn_id));

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Outbound::PingResp));
        assert!(matches!(sent[1], Outbound::Disconnect { reason: ReasonCode::ServerShuttingDown, .. }));
    }

    #[test]
    fn idle_backstop() {
        assert_eq!(idle_timeout(0), IDLE_TIMEOUT);
        assert_eq!(idle_timeout(30), Duration::from_secs(60));
    }
}
