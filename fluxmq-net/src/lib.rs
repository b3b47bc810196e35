#![deny(unsafe_code)]

//! Network front end of the broker: socket listeners (TCP, optionally TLS and WebSocket),
//! protocol version probing and framed MQTT v3/v5 packet streams.

mod builder;
mod error;
mod stream;
#[cfg(feature = "ws")]
mod ws;

pub use builder::{Acceptor, Builder, Listener, ListenerType};
pub use error::MqttError;
pub use stream::{v3, v5, Dispatcher, MqttStream};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
