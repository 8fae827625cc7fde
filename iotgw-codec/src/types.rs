use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub(crate) const MQTT: &[u8] = b"MQTT";
pub(crate) const MQISDP: &[u8] = b"MQIsdp";
pub const MQTT_LEVEL_31: u8 = 3;
pub const MQTT_LEVEL_311: u8 = 4;
pub(crate) const WILL_QOS_SHIFT: u8 = 3;

/// Protocol level carried by CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Protocol(pub u8);

impl Protocol {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Protocol(MQTT_LEVEL_31) => "MQIsdp",
            Protocol(_) => "MQTT",
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self.0
    }

    /// Only 3.1 and 3.1.1 are served.
    #[inline]
    pub fn is_supported(self) -> bool {
        matches!(self.0, MQTT_LEVEL_31 | MQTT_LEVEL_311)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol(MQTT_LEVEL_311)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MQTT {}", self.0)
    }
}

prim_enum! {
    /// Quality of Service
    #[derive(Serialize, Deserialize, PartialOrd, Ord, Hash, Default)]
    pub enum QoS {
        /// At most once delivery, no acknowledgment.
        #[default]
        AtMostOnce = 0,
        /// At least once delivery, acknowledged by PUBACK.
        AtLeastOnce = 1,
        /// Exactly once delivery. Decoded but never served by the gateway.
        ExactlyOnce = 2
    }
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        u8::from(*self)
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ConnectFlags: u8 {
        const USERNAME    = 0b1000_0000;
        const PASSWORD    = 0b0100_0000;
        const WILL_RETAIN = 0b0010_0000;
        const WILL_QOS    = 0b0001_1000;
        const WILL        = 0b0000_0100;
        const CLEAN_START = 0b0000_0010;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ConnectAckFlags: u8 {
        const SESSION_PRESENT = 0b0000_0001;
    }
}

/// Packet type numbers, the high nibble of the first header byte.
pub mod packet_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const PUBREC: u8 = 5;
    pub const PUBREL: u8 = 6;
    pub const PUBCOMP: u8 = 7;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const UNSUBSCRIBE: u8 = 10;
    pub const UNSUBACK: u8 = 11;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;

    /// Flags PUBREL, SUBSCRIBE and UNSUBSCRIBE must carry in the low nibble.
    pub(crate) const REQUIRED_FLAGS: u8 = 0b0010;

    #[inline]
    pub(crate) fn first_byte(typ: u8, flags: u8) -> u8 {
        (typ << 4) | (flags & 0b0000_1111)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FixedHeader {
    pub(crate) first_byte: u8,
    pub(crate) remaining_length: u32,
}

impl FixedHeader {
    #[inline]
    pub(crate) fn packet_type(&self) -> u8 {
        self.first_byte >> 4
    }

    #[inline]
    pub(crate) fn flags(&self) -> u8 {
        self.first_byte & 0b0000_1111
    }
}

#[derive(PartialEq, Eq, Clone, Serialize, Deserialize)]
/// Publish message
pub struct Publish {
    /// this might be re-delivery of an earlier attempt to send the Packet.
    pub dup: bool,
    pub retain: bool,
    /// the level of assurance for delivery of an Application Message.
    pub qos: QoS,
    /// the information channel to which payload data is published.
    pub topic: ByteString,
    /// only present in PUBLISH Packets where the QoS level is 1 or 2.
    pub packet_id: Option<NonZeroU16>,
    /// the Application Message that is being published.
    pub payload: Bytes,
}

impl Publish {
    #[inline]
    pub fn new(topic: ByteString, payload: Bytes, qos: QoS, packet_id: Option<NonZeroU16>) -> Self {
        Self { dup: false, retain: false, qos, topic, packet_id, payload }
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publish")
            .field("packet_id", &self.packet_id)
            .field("topic", &self.topic)
            .field("dup", &self.dup)
            .field("retain", &self.retain)
            .field("qos", &self.qos)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
