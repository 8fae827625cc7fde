use std::num::NonZeroU16;

use bytes::{Buf, Bytes};
use bytestring::ByteString;

use crate::error::DecodeError;
use crate::packet::{Connect, ConnectAck, LastWill, Packet, SubscribeReturnCode};
use crate::types::{
    packet_type, ConnectAckFlags, ConnectFlags, FixedHeader, Protocol, Publish, QoS, MQISDP, MQTT,
    WILL_QOS_SHIFT,
};
use crate::utils::Decode;

/// Decodes the variable header and payload of one packet. Reserved flag bits
/// are checked here, the level is left to the broker so it can answer CONNACK 1.
pub(crate) fn decode_packet(mut src: Bytes, header: FixedHeader) -> Result<Packet, DecodeError> {
    let flags = header.flags();
    match header.packet_type() {
        packet_type::PUBLISH => decode_publish_packet(&mut src, flags),
        packet_type::PUBREL | packet_type::SUBSCRIBE | packet_type::UNSUBSCRIBE => {
            ensure!(flags == packet_type::REQUIRED_FLAGS, DecodeError::MalformedPacket);
            match header.packet_type() {
                packet_type::PUBREL => decode_ack(src, |packet_id| Packet::PublishRelease { packet_id }),
                packet_type::SUBSCRIBE => decode_subscribe_packet(&mut src),
                _ => decode_unsubscribe_packet(&mut src),
            }
        }
        typ => {
            ensure!(flags == 0, DecodeError::MalformedPacket);
            match typ {
                packet_type::CONNECT => decode_connect_packet(&mut src),
                packet_type::CONNACK => decode_connect_ack_packet(&mut src),
                packet_type::PUBACK => decode_ack(src, |packet_id| Packet::PublishAck { packet_id }),
                packet_type::PUBREC => decode_ack(src, |packet_id| Packet::PublishReceived { packet_id }),
                packet_type::PUBCOMP => decode_ack(src, |packet_id| Packet::PublishComplete { packet_id }),
                packet_type::SUBACK => decode_subscribe_ack_packet(&mut src),
                packet_type::UNSUBACK => decode_ack(src, |packet_id| Packet::UnsubscribeAck { packet_id }),
                packet_type::PINGREQ => decode_empty(src, Packet::PingRequest),
                packet_type::PINGRESP => decode_empty(src, Packet::PingResponse),
                packet_type::DISCONNECT => decode_empty(src, Packet::Disconnect),
                _ => Err(DecodeError::UnsupportedPacketType),
            }
        }
    }
}

#[inline]
fn decode_empty(src: Bytes, packet: Packet) -> Result<Packet, DecodeError> {
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(packet)
}

#[inline]
fn decode_ack(mut src: Bytes, f: impl Fn(NonZeroU16) -> Packet) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(&mut src)?;
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(f(packet_id))
}

fn decode_connect_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let name = Bytes::decode(src)?;
    ensure!(name.as_ref() == MQTT || name.as_ref() == MQISDP, DecodeError::InvalidProtocol);

    ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
    // unsupported levels are refused after decoding, with a CONNACK
    let level = src.get_u8();
    let flags = ConnectFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnectReservedFlagSet)?;
    let keep_alive = src.get_u16();
    let client_id = ByteString::decode(src)?;

    let last_will = if flags.contains(ConnectFlags::WILL) {
        let topic = ByteString::decode(src)?;
        let message = Bytes::decode(src)?;
        Some(LastWill {
            qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
            topic,
            message,
        })
    } else {
        ensure!(
            !flags.intersects(ConnectFlags::WILL_QOS | ConnectFlags::WILL_RETAIN),
            DecodeError::MalformedPacket
        );
        None
    };
    let username = if flags.contains(ConnectFlags::USERNAME) { Some(ByteString::decode(src)?) } else { None };
    let password = if flags.contains(ConnectFlags::PASSWORD) { Some(Bytes::decode(src)?) } else { None };
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);

    Ok(Connect {
        protocol: Protocol(level),
        clean_session: flags.contains(ConnectFlags::CLEAN_START),
        keep_alive,
        client_id,
        last_will,
        username,
        password,
    }
    .into())
}

fn decode_connect_ack_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() == 2, DecodeError::InvalidLength);
    let flags = ConnectAckFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnAckReservedFlagSet)?;
    let return_code = src.get_u8().try_into()?;
    Ok(Packet::ConnectAck(ConnectAck {
        return_code,
        session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
    }))
}

fn decode_publish_packet(src: &mut Bytes, packet_flags: u8) -> Result<Packet, DecodeError> {
    let topic = ByteString::decode(src)?;
    let qos = QoS::try_from((packet_flags & 0b0110) >> 1)?;
    let packet_id = if qos == QoS::AtMostOnce { None } else { Some(NonZeroU16::decode(src)?) };

    Ok(Packet::Publish(Publish {
        dup: (packet_flags & 0b1000) == 0b1000,
        qos,
        retain: (packet_flags & 0b0001) == 0b0001,
        topic,
        packet_id,
        // rest of the body, zero-copy
        payload: src.split_off(0),
    }))
}

fn decode_subscribe_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        let topic = ByteString::decode(src)?;
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        let qos = (src.get_u8() & 0b0000_0011).try_into()?;
        topic_filters.push((topic, qos));
    }
    ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);

    Ok(Packet::Subscribe { packet_id, topic_filters })
}

fn decode_subscribe_ack_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let status = src
        .iter()
        .map(|code| {
            if *code == 0x80 {
                Ok(SubscribeReturnCode::Failure)
            } else {
                QoS::try_from(*code).map(SubscribeReturnCode::Success)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Packet::SubscribeAck { packet_id, status })
}

fn decode_unsubscribe_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        topic_filters.push(ByteString::decode(src)?);
    }
    ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
    Ok(Packet::Unsubscribe { packet_id, topic_filters })
}
