//! MQTT v3.1/v3.1.1 device broker.
//!
//! A [`Broker`] owns the listener and the registry of live [`Client`]s, one per
//! client id. Every client is attached to a [`Session`], which holds the
//! subscriptions and the QoS 1 in-flight window and may outlive the client
//! when the device asked for a persistent session.

mod broker;
mod client;
mod session;

pub use broker::Broker;
pub use client::{Client, ClientInfo};
pub use session::{Message, Session, SessionInfo};
