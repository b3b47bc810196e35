#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//! use fluxmq::conf::{Options, Settings};
//! use fluxmq::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> fluxmq::Result<()> {
//!     let settings = Settings::init(Options::default())?;
//!     fluxmq::logger::logger_init(&settings.log)?;
//!     Server::new(settings.clone())?.listen().await
//! }
//! ```

/// Core broker
pub mod broker; // Routing, session registry and retained messages
pub mod session; // Per-client QoS state machine
pub mod inflight; // Outbound in-flight window
pub mod retain; // Retained message store
pub mod topic; // Topic parsing and validation
pub mod trie; // Subscription trie

/// Connections and protocols
pub mod connection; // One task per client connection
pub mod packet; // Protocol-neutral packets
pub mod server; // Event loop and listeners
pub mod v3; // MQTT v3.1 / v3.1.1 framing
pub mod v5; // MQTT v5.0 framing

/// Cluster, storage and access control
pub mod acl;
pub mod cluster;
pub mod persistence;

pub mod error;
pub mod logger;
pub mod types;

pub use fluxmq_conf as conf;
pub use fluxmq_net as net;
pub use rmqtt_codec as codec;

pub use broker::Broker;
pub use error::{BrokerError, ReasonCode};
pub use server::{Server, ServerHandle};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
