//! `[listener.<kind>.<name>]` tables.
//!
//! ```toml
//! [listener.tcp.external]
//! addr = "0.0.0.0:1883"
//!
//! [listener.tls.secure]
//! addr = "0.0.0.0:8883"
//! cert = "/etc/fluxmq/cert.pem"
//! key = "/etc/fluxmq/key.pem"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;

use fluxmq_utils::{deserialize_addr, deserialize_duration, Bytesize};

use crate::{HashMap, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Kind::Tcp => "tcp",
            Kind::Tls => "tls",
            Kind::Ws => "ws",
            Kind::Wss => "wss",
        })
    }
}

/// Named listeners per kind, in name order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Listeners {
    tcp: BTreeMap<String, Listener>,
    tls: BTreeMap<String, Listener>,
    ws: BTreeMap<String, Listener>,
    wss: BTreeMap<String, Listener>,
}

impl Listeners {
    /// Names every listener `<name>/<kind>`, rejects two enabled listeners on one port and
    /// falls back to plain TCP on 1883 when nothing is enabled.
    pub(crate) fn init(&mut self) -> Result<()> {
        for (kind, tables) in [
            (Kind::Tcp, &mut self.tcp),
            (Kind::Tls, &mut self.tls),
            (Kind::Ws, &mut self.ws),
            (Kind::Wss, &mut self.wss),
        ] {
            for (name, l) in tables.iter_mut() {
                l.name = format!("{name}/{kind}");
            }
        }

        let mut ports: HashMap<u16, &str> = HashMap::default();
        for (_, l) in self.enabled() {
            if let Some(other) = ports.insert(l.addr.port(), &l.name) {
                return Err(anyhow!("listeners {} and {} share port {}", other, l.name, l.addr.port()));
            }
        }

        if ports.is_empty() {
            let l = Listener { name: "external/tcp".into(), ..Default::default() };
            self.tcp.insert("external".into(), l);
        }
        Ok(())
    }

    /// Enabled listeners, grouped by kind.
    pub fn enabled(&self) -> impl Iterator<Item = (Kind, &Listener)> {
        [(Kind::Tcp, &self.tcp), (Kind::Tls, &self.tls), (Kind::Ws, &self.ws), (Kind::Wss, &self.wss)]
            .into_iter()
            .flat_map(|(kind, t)| t.values().filter(|l| l.enable).map(move |l| (kind, l)))
    }

    pub fn get(&self, port: u16) -> Option<(Kind, &Listener)> {
        self.enabled().find(|(_, l)| l.addr.port() == port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Listener {
    #[serde(skip)]
    pub name: String,
    pub enable: bool,
    #[serde(deserialize_with = "deserialize_addr")]
    pub addr: SocketAddr,
    pub backlog: i32,
    pub nodelay: bool,
    pub reuseaddr: bool,
    pub reuseport: bool,
    /// Bound for the TLS/WebSocket handshake and for receiving CONNECT.
    #[serde(deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    /// Inbound packet limit, further capped by `mqtt.maximum_packet_size`.
    pub max_packet_size: Bytesize,
    /// PEM certificate chain and private key, tls and wss only.
    pub cert: Option<String>,
    pub key: Option<String>,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            name: String::new(),
            enable: true,
            addr: ([0, 0, 0, 0], 1883).into(),
            backlog: 1024,
            nodelay: false,
            reuseaddr: true,
            reuseport: false,
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            max_packet_size: Bytesize::from(1024 * 1024),
            cert: None,
            key: None,
        }
    }
}
