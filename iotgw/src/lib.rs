#![deny(unsafe_code)]

//! # iotgw
//!
//! Device connectivity core of the gateway: an MQTT v3.1/v3.1.1 broker and a
//! framed raw-TCP server, both handing decoded device messages to a pluggable
//! [`codec::Codec`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use iotgw::codec::LogCodec;
//! use iotgw::conf::{MqttNetwork, Network};
//! use iotgw::context::ServerContext;
//! use iotgw::mqtt::Broker;
//! use iotgw::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scx = ServerContext::new().build();
//!     let network = Network::new(MqttNetwork { name: "external/mqtt".into(), ..Default::default() });
//!     Broker::start(scx.clone(), network, Arc::new(LogCodec)).await?;
//!     tokio::signal::ctrl_c().await?;
//!     scx.servers.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod codec; // Device codec hooks
pub mod context; // Shared gateway state
pub mod device; // Devices, products and live device sessions
pub mod error;
pub mod framer; // Byte stream segmentation for raw TCP
pub mod logger;
pub mod mqtt; // MQTT v3 broker
pub mod server; // Named server registry
pub mod tcp; // Raw TCP server
pub mod utils;

pub use error::GatewayError;
pub use iotgw_codec as mqtt_codec;
pub use iotgw_conf as conf;
pub use iotgw_net as net;
pub use net::{Error, Result};
