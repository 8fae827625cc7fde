#![deny(unsafe_code)]

//! Network plumbing shared by the gateway transports.
//!
//! [`Builder`] binds a listening socket with `socket2`, optionally upgrades it to TLS
//! from in-memory PEM material, and hands out [`Acceptor`]s for each accepted
//! connection. An accepted connection is either used raw ([`Dispatcher::into_inner`])
//! or wrapped into a framed MQTT v3 stream ([`Dispatcher::mqtt`]).

mod builder;
mod error;
mod stream;

pub use builder::{Acceptor, Builder, Listener, ListenerType, TlsCertificate};
pub use error::MqttError;
pub use stream::{v3, Dispatcher};

#[cfg(feature = "tls")]
pub use tokio_rustls::server::TlsStream;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
