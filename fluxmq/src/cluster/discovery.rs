//! UDP broadcast membership.
//!
//! Each node announces a [`DiscoveryPacket`] on the discovery port every discovery
//! interval. Of two nodes that hear each other only the one with the smaller name dials,
//! so a pair ends up with a single link.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;

use fluxmq_conf::Cluster;

use crate::Result;

use super::DiscoveryPacket;

const MAX_DATAGRAM: usize = 1024;

pub struct Discovery {
    socket: UdpSocket,
    announce: Vec<u8>,
    target: SocketAddr,
}

impl Discovery {
    pub fn bind(cfg: &Cluster) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(not(windows))]
        socket.set_reuse_port(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let laddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.discovery_port);
        socket.bind(&SockAddr::from(laddr))?;
        let socket = UdpSocket::from_std(std::net::UdpSocket::from(socket))?;

        let announce = DiscoveryPacket {
            cluster_name: cfg.cluster_name.clone(),
            name: cfg.name.clone(),
            port: cfg.addr.port(),
        }
        .encode()?;
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, cfg.discovery_port).into();
        log::info!("cluster discovery on udp port {}", cfg.discovery_port);
        Ok(Self { socket, announce, target })
    }

    pub async fn announce(&self) -> Result<()> {
        self.socket.send_to(&self.announce, self.target).await?;
        Ok(())
    }

    /// Next announcement heard, with the inter-node address of its sender.
    pub async fn recv(&self) -> Result<(DiscoveryPacket, SocketAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match DiscoveryPacket::decode(&buf[..n]) {
                Ok(packet) => {
                    let addr = SocketAddr::new(from.ip(), packet.port);
                    return Ok((packet, addr));
                }
                Err(e) => log::debug!("ignore datagram from {}, {}", from, e),
            }
        }
    }
}

/// Whether this node should open the link to the announcing node.
#[inline]
pub fn should_dial(cluster_name: &str, name: &str, packet: &DiscoveryPacket) -> bool {
    packet.cluster_name == cluster_name && packet.name.as_str() > name
}
