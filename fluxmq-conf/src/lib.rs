#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use rmqtt_codec::types::QoS;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use fluxmq_utils::{deserialize_addr, deserialize_addrs, deserialize_duration, Bytesize};

use self::listener::Listeners;
use self::logging::Log;

pub use self::listener::{Kind as ListenerKind, Listener};
pub use self::options::Options;

pub mod listener;
pub mod logging;
pub mod options;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Largest datagram the discovery transport can carry.
const UDP_MAX_PACKET_SIZE: usize = 65535;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(rename = "listener")]
    #[serde(default)]
    pub listeners: Listeners,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub cluster: Cluster,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/fluxmq/fluxmq").required(false))
            .add_source(File::with_name("fluxmq").required(false))
            .add_source(
                config::Environment::with_prefix("fluxmq")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("cluster.peers"),
            );

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        let inner: Inner = builder.build()?.try_deserialize()?;
        Self::from_inner(inner, opts)
    }

    /// Builds settings from an already deserialized configuration, applying command line
    /// overrides and start-up validation.
    pub fn from_inner(mut inner: Inner, opts: Options) -> Result<Self> {
        inner.listeners.init()?;

        //Command line configuration overriding file configuration
        if let Some(name) = opts.node_name.as_ref() {
            inner.cluster.name.clone_from(name);
        }
        if let Some(peers) = opts.cluster_peers.as_ref() {
            inner.cluster.peers.clone_from(peers);
        }

        if inner.cluster.enable
            && inner.cluster.discovery
            && inner.mqtt.maximum_packet_size.as_usize() > UDP_MAX_PACKET_SIZE
        {
            return Err(anyhow!(
                "mqtt.maximum_packet_size {:?} exceeds the UDP limit of {} bytes required by cluster discovery",
                inner.mqtt.maximum_packet_size,
                UDP_MAX_PACKET_SIZE
            ));
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() -> Result<()> {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("node name is {}", cfg.cluster.name);
        log::info!("mqtt config is: {:?}", cfg.mqtt);
        log::info!("storage is {:?}", cfg.storage.typ);
        if cfg.cluster.enable {
            log::info!(
                "cluster {} on {}, discovery: {}, peers: {:?}",
                cfg.cluster.cluster_name,
                cfg.cluster.addr,
                cfg.cluster.discovery,
                cfg.cluster.peers
            );
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    ///Upper bound for a client's session expiry interval in seconds, 0xFFFFFFFF means never expire
    #[serde(default = "Mqtt::max_session_expiry_interval_default")]
    pub max_session_expiry_interval: u32,
    #[serde(default = "Mqtt::receive_maximum_default")]
    pub receive_maximum: u16,
    #[serde(default = "Mqtt::maximum_qos_default", deserialize_with = "Mqtt::deserialize_qos")]
    pub maximum_qos: QoS,
    #[serde(default = "Mqtt::enabled_default")]
    pub retain_available: bool,
    #[serde(default = "Mqtt::maximum_packet_size_default")]
    pub maximum_packet_size: Bytesize,
    #[serde(default)]
    pub maximum_topic_alias: u16,
    #[serde(default = "Mqtt::enabled_default")]
    pub wildcard_subscription_available: bool,
    #[serde(default = "Mqtt::enabled_default")]
    pub subscription_identifiers_available: bool,
    #[serde(default = "Mqtt::enabled_default")]
    pub shared_subscription_available: bool,
    ///Overrides the keep alive requested by clients
    #[serde(default)]
    pub server_keep_alive: Option<u16>,
    ///Maintenance tick period
    #[serde(
        default = "Mqtt::min_keep_alive_check_interval_default",
        deserialize_with = "deserialize_duration"
    )]
    pub min_keep_alive_check_interval: Duration,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            max_session_expiry_interval: Self::max_session_expiry_interval_default(),
            receive_maximum: Self::receive_maximum_default(),
            maximum_qos: Self::maximum_qos_default(),
            retain_available: true,
            maximum_packet_size: Self::maximum_packet_size_default(),
            maximum_topic_alias: 0,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscription_available: true,
            server_keep_alive: None,
            min_keep_alive_check_interval: Self::min_keep_alive_check_interval_default(),
        }
    }
}

impl Mqtt {
    fn max_session_expiry_interval_default() -> u32 {
        u32::MAX
    }
    fn receive_maximum_default() -> u16 {
        1024
    }
    fn maximum_qos_default() -> QoS {
        QoS::ExactlyOnce
    }
    fn enabled_default() -> bool {
        true
    }
    fn maximum_packet_size_default() -> Bytesize {
        Bytesize::from(32 * 1024)
    }
    fn min_keep_alive_check_interval_default() -> Duration {
        Duration::from_secs(1)
    }

    fn deserialize_qos<'de, D>(deserializer: D) -> std::result::Result<QoS, D::Error>
    where
        D: Deserializer<'de>,
    {
        let qos = match u8::deserialize(deserializer)? {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(de::Error::custom("QoS configuration error, only values (0,1,2) are supported")),
        };
        Ok(qos)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub enable: bool,
    ///Nodes only link with nodes announcing the same cluster name
    #[serde(default = "Cluster::cluster_name_default")]
    pub cluster_name: String,
    ///Node identity, unique within the cluster
    #[serde(default = "Cluster::name_default")]
    pub name: String,
    #[serde(default = "Cluster::addr_default", deserialize_with = "deserialize_addr")]
    pub addr: SocketAddr,
    ///UDP broadcast discovery
    #[serde(default = "Cluster::discovery_default")]
    pub discovery: bool,
    #[serde(default = "Cluster::discovery_port_default")]
    pub discovery_port: u16,
    #[serde(default = "Cluster::discovery_interval_default", deserialize_with = "deserialize_duration")]
    pub discovery_interval: Duration,
    #[serde(default, deserialize_with = "deserialize_addrs")]
    pub peers: Vec<SocketAddr>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            enable: false,
            cluster_name: Self::cluster_name_default(),
            name: Self::name_default(),
            addr: Self::addr_default(),
            discovery: Self::discovery_default(),
            discovery_port: Self::discovery_port_default(),
            discovery_interval: Self::discovery_interval_default(),
            peers: Vec::new(),
        }
    }
}

impl Cluster {
    fn cluster_name_default() -> String {
        "fluxmq".into()
    }
    fn name_default() -> String {
        uuid::Uuid::new_v4().as_simple().to_string()
    }
    fn addr_default() -> SocketAddr {
        ([0, 0, 0, 0], 5363).into()
    }
    fn discovery_default() -> bool {
        true
    }
    fn discovery_port_default() -> u16 {
        22000
    }
    fn discovery_interval_default() -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    None,
    Memory,
    Sled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    #[serde(default, rename = "type")]
    pub typ: StorageType,
    #[serde(default = "Storage::dir_default")]
    pub dir: String,
}

impl Default for Storage {
    fn default() -> Self {
        Self { typ: StorageType::None, dir: Self::dir_default() }
    }
}

impl Storage {
    fn dir_default() -> String {
        "./fluxmq-data".into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Publish,
    Subscribe,
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    ///Applies to every user when unset
    #[serde(default)]
    pub username: Option<String>,
    pub topic_filter: String,
    #[serde(default = "AclRule::action_default")]
    pub action: AclAction,
    #[serde(default)]
    pub allow: bool,
}

impl AclRule {
    fn action_default() -> AclAction {
        AclAction::All
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    #[serde(default = "Auth::allow_anonymous_default")]
    pub allow_anonymous: bool,
    ///username -> password
    #[serde(default)]
    pub users: HashMap<String, String>,
    ///Evaluated in order, the first matching rule decides; no match allows
    #[serde(default)]
    pub acl: Vec<AclRule>,
}

impl Default for Auth {
    fn default() -> Self {
        Self { allow_anonymous: true, users: HashMap::default(), acl: Vec::new() }
    }
}

impl Auth {
    fn allow_anonymous_default() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::To;

    fn parse(toml: &str) -> Inner {
        Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize::<Inner>())
            .expect("config parse failed")
    }

    #[test]
    fn defaults() {
        let settings = Settings::from_inner(Inner::default(), Options::default()).unwrap();
        assert_eq!(settings.mqtt.receive_maximum, 1024);
        assert_eq!(settings.mqtt.max_session_expiry_interval, u32::MAX);
        assert_eq!(settings.mqtt.maximum_qos, QoS::ExactlyOnce);
        assert_eq!(settings.mqtt.maximum_packet_size.as_usize(), 32768);
        assert_eq!(settings.mqtt.min_keep_alive_check_interval, Duration::from_secs(1));
        assert_eq!(settings.storage.typ, StorageType::None);
        assert!(!settings.cluster.enable);
        assert!(settings.auth.allow_anonymous);
        let (kind, l) = settings.listeners.get(1883).expect("default listener");
        assert_eq!(kind, ListenerKind::Tcp);
        assert_eq!(l.backlog, 1024);
        assert_eq!(l.name, "external/tcp");
        assert_eq!(settings.log.level, slog::Level::Info);
        assert!(settings.log.file_path().is_none());
    }

    #[test]
    fn listeners_and_sections() {
        let inner = parse(
            r#"
            [listener.tcp.external]
            addr = "0.0.0.0:2883"
            nodelay = true
            handshake_timeout = "5s"

            [listener.tcp.disabled]
            addr = "0.0.0.0:2884"
            enable = false

            [listener.ws.web]
            addr = "0.0.0.0:8080"

            [log]
            to = "both"
            level = "debug"
            dir = "/tmp/fluxmq-log"

            [mqtt]
            maximum_qos = 1
            receive_maximum = 16
            retain_available = false
            maximum_packet_size = "64K"
            server_keep_alive = 30

            [cluster]
            enable = true
            name = "n1"
            peers = ["127.0.0.1:5364"]
            discovery_interval = "2s"

            [storage]
            type = "sled"
            dir = "/tmp/fluxmq"

            [auth]
            allow_anonymous = false
            users = { alice = "secret" }

            [[auth.acl]]
            topic_filter = "private/#"
            action = "subscribe"
            allow = false
            "#,
        );
        let settings = Settings::from_inner(inner, Options::default()).unwrap();
        let (_, l) = settings.listeners.get(2883).expect("listener");
        assert_eq!(l.name, "external/tcp");
        assert!(l.nodelay);
        assert_eq!(l.handshake_timeout, Duration::from_secs(5));
        assert!(settings.listeners.get(2884).is_none());
        assert!(settings.listeners.get(1883).is_none());
        assert!(matches!(settings.listeners.get(8080), Some((ListenerKind::Ws, l)) if l.name == "web/ws"));
        assert_eq!(settings.listeners.enabled().count(), 2);

        assert_eq!(settings.log.to, To::Both);
        assert_eq!(settings.log.level, slog::Level::Debug);
        assert_eq!(settings.log.file_path(), Some(std::path::PathBuf::from("/tmp/fluxmq-log/fluxmq.log")));

        assert_eq!(settings.mqtt.maximum_qos, QoS::AtLeastOnce);
        assert_eq!(settings.mqtt.receive_maximum, 16);
        assert!(!settings.mqtt.retain_available);
        assert_eq!(settings.mqtt.maximum_packet_size.as_usize(), 65536);
        assert_eq!(settings.mqtt.server_keep_alive, Some(30));

        assert_eq!(settings.cluster.name, "n1");
        assert_eq!(settings.cluster.peers, vec!["127.0.0.1:5364".parse::<SocketAddr>().unwrap()]);
        assert_eq!(settings.cluster.discovery_interval, Duration::from_secs(2));
        assert_eq!(settings.storage.typ, StorageType::Sled);
        assert!(!settings.auth.allow_anonymous);
        assert_eq!(settings.auth.users.get("alice").map(|s| s.as_str()), Some("secret"));
        assert_eq!(settings.auth.acl[0].action, AclAction::Subscribe);
        assert!(!settings.auth.acl[0].allow);
    }

    #[test]
    fn listeners_sharing_a_port() {
        let inner = parse(
            r#"
            [listener.tcp.a]
            addr = "0.0.0.0:1883"
            [listener.ws.b]
            addr = "0.0.0.0:1883"
            "#,
        );
        assert!(Settings::from_inner(inner, Options::default()).is_err());
    }

    #[test]
    fn options_override() {
        let opts = Options {
            node_name: Some("node-9".into()),
            cluster_peers: Some(vec!["10.0.0.2:5363".parse().unwrap()]),
            ..Default::default()
        };
        let settings = Settings::from_inner(Inner::default(), opts).unwrap();
        assert_eq!(settings.cluster.name, "node-9");
        assert_eq!(settings.cluster.peers.len(), 1);
    }

    #[test]
    fn udp_discovery_limits_packet_size() {
        let inner = parse(
            r#"
            [mqtt]
            maximum_packet_size = "1M"
            [cluster]
            enable = true
            discovery = true
            "#,
        );
        assert!(Settings::from_inner(inner, Options::default()).is_err());
    }
}
