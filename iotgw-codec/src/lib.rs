#![deny(unsafe_code)]

//! MQTT v3.1 / v3.1.1 wire codec used by the gateway broker.
//!
//! ## Contents:
//! - [`Packet`]: every v3 control packet as one enum, tagged by the 4-bit wire type
//!   ([`Packet::packet_type`]), so callers can route packets through a table
//!   instead of matching on runtime types
//! - [`Codec`]: a `tokio_util::codec` `Decoder`/`Encoder` with an optional inbound size limit
//! - [`error`]: `DecodeError` / `EncodeError`
//!
//! Protocol level checks are left to the server: a CONNECT with an unknown
//! level decodes fine so that the server can answer with the proper CONNACK code.
//!
//! ```
//! use bytes::BytesMut;
//! use iotgw_codec::{Codec, Packet};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut codec = Codec::new(1024 * 1024);
//! let mut buf = BytesMut::new();
//! codec.encode(Packet::PingRequest, &mut buf).unwrap();
//! assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingRequest));
//! ```

#[macro_use]
mod utils;

mod codec;
mod decode;
mod encode;
mod packet;

/// Error types for encoding/decoding operations
pub mod error;

/// Shared protocol types and constants
pub mod types;

pub use self::codec::Codec;
pub use self::packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, SubscribeReturnCode};
pub use self::types::{packet_type, ConnectAckFlags, ConnectFlags, Protocol, Publish, QoS};
