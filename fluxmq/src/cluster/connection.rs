use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::server::{Command, CommandTx};
use crate::types::NodeName;
use crate::Result;

use super::{ClusterMessage, LinkId};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Inter-node frames carry whole sessions in snapshots.
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity this node presents on every link.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub cluster_name: String,
    pub name: NodeName,
}

impl LocalNode {
    #[inline]
    fn hello(&self) -> ClusterMessage {
        ClusterMessage::Hello { cluster_name: self.cluster_name.clone(), name: self.name.clone() }
    }
}

/// Dials `addr` and runs the link until it goes down.
pub async fn dial(addr: SocketAddr, local: LocalNode, cmd_tx: CommandTx) -> Result<()> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("connect {} timeout", addr))??;
    stream.set_nodelay(true)?;
    log::debug!("cluster link to {} established", addr);
    run(stream, addr, local, cmd_tx, true).await
}

/// Hello exchange, then frames are relayed between the socket and the broker until either
/// side closes. The broker learns about the link through `LinkUp` and `LinkDown`.
pub async fn run<Io>(
    io: Io,
    remote_addr: SocketAddr,
    local: LocalNode,
    cmd_tx: CommandTx,
    dialed: bool,
) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let codec = LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LENGTH).new_codec();
    let mut framed = Framed::new(io, codec);

    framed.send(Bytes::from(local.hello().encode()?)).await?;
    let name = match tokio::time::timeout(HELLO_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(frame))) => match ClusterMessage::decode(&frame)? {
            ClusterMessage::Hello { cluster_name, name } => {
                if cluster_name != local.cluster_name {
                    return Err(anyhow!("{} belongs to cluster {}", remote_addr, cluster_name));
                }
                if name == local.name {
                    return Err(anyhow!("{} is this node", remote_addr));
                }
                name
            }
            other => return Err(anyhow!("expected Hello from {}, got {}", remote_addr, other.name())),
        },
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Err(anyhow!("{} closed during hello", remote_addr)),
        Err(_) => return Err(anyhow!("hello from {} timeout", remote_addr)),
    };

    let link_id: LinkId = NEXT_LINK_ID.fetch_add(1, Ordering::SeqCst);
    let dialer = if dialed { local.name.clone() } else { name.clone() };
    let (tx, mut rx) = mpsc::unbounded_channel();
    cmd_tx
        .send(Command::LinkUp { name: name.clone(), link_id, dialer, tx })
        .map_err(|_| anyhow!("broker stopped"))?;
    log::info!("cluster link {} with {} ({}) up", link_id, name, remote_addr);

    let res = relay(&mut framed, &mut rx, &name, &cmd_tx).await;

    let _ = cmd_tx.send(Command::LinkDown { name: name.clone(), link_id });
    let _ = SinkExt::<Bytes>::close(&mut framed).await;
    log::info!("cluster link {} with {} down", link_id, name);
    res
}

async fn relay<Io>(
    framed: &mut Framed<Io, LengthDelimitedCodec>,
    rx: &mut mpsc::UnboundedReceiver<ClusterMessage>,
    name: &NodeName,
    cmd_tx: &CommandTx,
) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(msg) => framed.send(Bytes::from(msg.encode()?)).await?,
                //the broker dropped this link
                None => return Ok(()),
            },
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    let msg = ClusterMessage::decode(&frame)?;
                    log::trace!("cluster {} from {}", msg.name(), name);
                    if cmd_tx.send(Command::Cluster { from: name.clone(), msg }).is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}
