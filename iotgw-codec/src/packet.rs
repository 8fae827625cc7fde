use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{packet_type, Protocol, Publish, QoS};

prim_enum! {
    /// Connect Return Code
    #[derive(Deserialize, Serialize)]
    pub enum ConnectAckReason {
        /// Connection accepted
        ConnectionAccepted = 0,
        /// Connection Refused, unacceptable protocol version
        UnacceptableProtocolVersion = 1,
        /// Connection Refused, identifier rejected
        IdentifierRejected = 2,
        /// Connection Refused, Server unavailable
        ServiceUnavailable = 3,
        /// Connection Refused, bad user name or password
        BadUserNameOrPassword = 4,
        /// Connection Refused, not authorized
        NotAuthorized = 5
    }
}

impl ConnectAckReason {
    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "Connection Accepted",
            ConnectAckReason::UnacceptableProtocolVersion => {
                "Connection Refused, unacceptable protocol version"
            }
            ConnectAckReason::IdentifierRejected => "Connection Refused, identifier rejected",
            ConnectAckReason::ServiceUnavailable => "Connection Refused, Server unavailable",
            ConnectAckReason::BadUserNameOrPassword => "Connection Refused, bad user name or password",
            ConnectAckReason::NotAuthorized => "Connection Refused, not authorized",
        }
    }

    #[inline]
    pub fn success(self) -> bool {
        matches!(self, ConnectAckReason::ConnectionAccepted)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
/// Message the broker publishes on the client's behalf when it drops without DISCONNECT
pub struct LastWill {
    /// requested delivery level, QoS 2 is carried but never honoured
    pub qos: QoS,
    pub retain: bool,
    /// topic handed to the codec as the message topic
    pub topic: ByteString,
    pub message: Bytes,
}

#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
/// CONNECT payload and flags
pub struct Connect {
    /// protocol name and level, 3.1 (`MQIsdp`, 3) or 3.1.1 (`MQTT`, 4)
    pub protocol: Protocol,
    /// `false` asks the broker to keep the session across connections
    pub clean_session: bool,
    /// seconds, `0` disables the idle check
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    /// may be empty, the broker then assigns one when `clean_session` is set
    pub client_id: ByteString,
    pub username: Option<ByteString>,
    /// only valid together with `username`
    pub password: Option<Bytes>,
}

impl Connect {
    /// Replaces the client identifier.
    pub fn client_id<T>(mut self, client_id: T) -> Self
    where
        ByteString: From<T>,
    {
        self.client_id = client_id.into();
        self
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
/// CONNACK content
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    /// set when a stored session was resumed, always `false` on refusal
    pub session_present: bool,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
/// Per-filter result in a SUBACK, `Failure` is encoded as `0x80`
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// MQTT v3 control packets
pub enum Packet {
    /// CONNECT, first packet of every connection
    Connect(Box<Connect>),
    /// CONNACK
    ConnectAck(ConnectAck),
    /// PUBLISH, in either direction
    Publish(Publish),
    /// PUBACK, ends a QoS 1 exchange
    PublishAck {
        packet_id: NonZeroU16,
    },
    /// PUBREC, first reply of a QoS 2 exchange
    PublishReceived {
        packet_id: NonZeroU16,
    },
    /// PUBREL, always sent with flags `0b0010`
    PublishRelease {
        packet_id: NonZeroU16,
    },
    /// PUBCOMP, last packet of a QoS 2 exchange
    PublishComplete {
        packet_id: NonZeroU16,
    },
    /// SUBSCRIBE, at least one filter
    Subscribe {
        packet_id: NonZeroU16,
        /// filters with the maximum QoS requested for each
        topic_filters: Vec<(ByteString, QoS)>,
    },
    /// SUBACK
    SubscribeAck {
        packet_id: NonZeroU16,
        /// one return code per requested topic filter, in request order
        status: Vec<SubscribeReturnCode>,
    },
    /// UNSUBSCRIBE, at least one filter
    Unsubscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<ByteString>,
    },
    /// UNSUBACK
    UnsubscribeAck {
        packet_id: NonZeroU16,
    },
    /// PINGREQ, keeps an idle connection alive
    PingRequest,
    /// PINGRESP
    PingResponse,
    /// DISCONNECT, clean close that discards the will
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

impl Packet {
    /// The 4-bit packet type number as carried on the wire, `1..=14`.
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => packet_type::CONNECT,
            Packet::ConnectAck { .. } => packet_type::CONNACK,
            Packet::Publish(_) => packet_type::PUBLISH,
            Packet::PublishAck { .. } => packet_type::PUBACK,
            Packet::PublishReceived { .. } => packet_type::PUBREC,
            Packet::PublishRelease { .. } => packet_type::PUBREL,
            Packet::PublishComplete { .. } => packet_type::PUBCOMP,
            Packet::Subscribe { .. } => packet_type::SUBSCRIBE,
            Packet::SubscribeAck { .. } => packet_type::SUBACK,
            Packet::Unsubscribe { .. } => packet_type::UNSUBSCRIBE,
            Packet::UnsubscribeAck { .. } => packet_type::UNSUBACK,
            Packet::PingRequest => packet_type::PINGREQ,
            Packet::PingResponse => packet_type::PINGRESP,
            Packet::Disconnect => packet_type::DISCONNECT,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck { .. } => "PUBACK",
            Packet::PublishReceived { .. } => "PUBREC",
            Packet::PublishRelease { .. } => "PUBREL",
            Packet::PublishComplete { .. } => "PUBCOMP",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubscribeAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubscribeAck { .. } => "UNSUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
