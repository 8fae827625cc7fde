use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::packet::{Connect, LastWill, Packet, SubscribeReturnCode};
use crate::types::{packet_type, ConnectFlags, QoS, WILL_QOS_SHIFT};
use crate::utils::{write_variable_length, Encode};

/// Size of the variable header plus payload, without the fixed header.
pub(crate) fn get_encoded_size(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(connect) => {
            let Connect { protocol, last_will, client_id, username, password, .. } = &**connect;
            // name + level + flags + keep alive + client id
            let mut n = 2 + protocol.name().len() + 1 + 1 + 2 + client_id.encoded_size();
            if let Some(LastWill { topic, message, .. }) = last_will {
                n += topic.encoded_size() + message.encoded_size();
            }
            n += username.as_ref().map(|s| s.encoded_size()).unwrap_or_default();
            n += password.as_ref().map(|s| s.encoded_size()).unwrap_or_default();
            n
        }
        Packet::Publish(publish) => {
            let packet_id_len = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
            publish.topic.encoded_size() + packet_id_len + publish.payload.len()
        }
        Packet::ConnectAck(_)
        | Packet::PublishAck { .. }
        | Packet::PublishReceived { .. }
        | Packet::PublishRelease { .. }
        | Packet::PublishComplete { .. }
        | Packet::UnsubscribeAck { .. } => 2,
        Packet::Subscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|(filter, _)| filter.encoded_size() + 1).sum::<usize>()
        }
        Packet::SubscribeAck { status, .. } => 2 + status.len(),
        Packet::Unsubscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|filter| filter.encoded_size()).sum::<usize>()
        }
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
    }
}

pub(crate) fn encode(packet: &Packet, dst: &mut BytesMut, content_size: u32) -> Result<(), EncodeError> {
    let flags = match packet {
        Packet::Publish(p) => (u8::from(p.dup) << 3) | (u8::from(p.qos) << 1) | u8::from(p.retain),
        Packet::PublishRelease { .. } | Packet::Subscribe { .. } | Packet::Unsubscribe { .. } => {
            packet_type::REQUIRED_FLAGS
        }
        _ => 0,
    };
    dst.put_u8(packet_type::first_byte(packet.packet_type(), flags));
    write_variable_length(content_size, dst)?;

    match packet {
        Packet::Connect(connect) => encode_connect(connect, dst)?,
        Packet::ConnectAck(ack) => {
            dst.put_slice(&[u8::from(ack.session_present), u8::from(ack.return_code)]);
        }
        Packet::Publish(publish) => {
            publish.topic.encode(dst)?;
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, None) => {}
                (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::MalformedPacket),
                (_, Some(packet_id)) => packet_id.encode(dst)?,
                (_, None) => return Err(EncodeError::PacketIdRequired),
            }
            dst.put_slice(publish.payload.as_ref());
        }
        Packet::PublishAck { packet_id }
        | Packet::PublishReceived { packet_id }
        | Packet::PublishRelease { packet_id }
        | Packet::PublishComplete { packet_id }
        | Packet::UnsubscribeAck { packet_id } => packet_id.encode(dst)?,
        Packet::Subscribe { packet_id, topic_filters } => {
            packet_id.encode(dst)?;
            for (filter, qos) in topic_filters {
                filter.encode(dst)?;
                dst.put_u8(u8::from(*qos));
            }
        }
        Packet::SubscribeAck { packet_id, status } => {
            packet_id.encode(dst)?;
            for s in status {
                dst.put_u8(match s {
                    SubscribeReturnCode::Success(qos) => u8::from(*qos),
                    SubscribeReturnCode::Failure => 0x80,
                });
            }
        }
        Packet::Unsubscribe { packet_id, topic_filters } => {
            packet_id.encode(dst)?;
            for filter in topic_filters {
                filter.encode(dst)?;
            }
        }
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => {}
    }
    Ok(())
}

fn encode_connect(connect: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let Connect { protocol, clean_session, keep_alive, last_will, client_id, username, password } = connect;

    protocol.name().as_bytes().encode(dst)?;

    let mut flags = ConnectFlags::empty();
    if username.is_some() {
        flags |= ConnectFlags::USERNAME;
    }
    if password.is_some() {
        flags |= ConnectFlags::PASSWORD;
    }
    if let Some(LastWill { qos, retain, .. }) = last_will {
        flags |= ConnectFlags::WILL;
        if *retain {
            flags |= ConnectFlags::WILL_RETAIN;
        }
        flags |= ConnectFlags::from_bits_truncate(u8::from(*qos) << WILL_QOS_SHIFT);
    }
    if *clean_session {
        flags |= ConnectFlags::CLEAN_START;
    }

    dst.put_slice(&[protocol.level(), flags.bits()]);
    dst.put_u16(*keep_alive);
    client_id.encode(dst)?;
    if let Some(LastWill { topic, message, .. }) = last_will {
        topic.encode(dst)?;
        message.encode(dst)?;
    }
    if let Some(s) = username {
        s.encode(dst)?;
    }
    if let Some(s) = password {
        s.encode(dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::packet::{ConnectAck, ConnectAckReason};
    use crate::types::{Protocol, Publish};

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn assert_encode_packet(packet: Packet, expected: &[u8]) {
        let mut v = BytesMut::with_capacity(1024);
        encode(&packet, &mut v, get_encoded_size(&packet) as u32).unwrap();
        assert_eq!(expected.len(), v.len());
        assert_eq!(expected, &v[..]);
    }

    #[test]
    fn test_encode_fixed_header() {
        let mut v = BytesMut::with_capacity(271);
        let p = Packet::PingRequest;
        assert_eq!(get_encoded_size(&p), 0);
        encode(&p, &mut v, 0).unwrap();
        assert_eq!(&v[..2], b"\xc0\x00".as_ref());

        v.clear();
        let p = Packet::Publish(Publish::new(
            ByteString::from_static("topic"),
            Bytes::from(vec![b'x'; 256]),
            QoS::AtMostOnce,
            None,
        ));
        assert_eq!(get_encoded_size(&p), 263);
        encode(&p, &mut v, get_encoded_size(&p) as u32).unwrap();
        assert_eq!(&v[..3], b"\x30\x87\x02".as_ref());
    }

    #[test]
    fn test_encode_connect_packets() {
        assert_encode_packet(
            Packet::Connect(Box::new(Connect {
                protocol: Protocol(4),
                clean_session: false,
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                last_will: None,
                username: Some(ByteString::from_static("user")),
                password: Some(Bytes::from_static(b"pass")),
            })),
            &b"\x10\x1D\x00\x04MQTT\x04\xC0\x00\x3C\x00\x0512345\x00\x04user\x00\x04pass"[..],
        );

        assert_encode_packet(
            Packet::ConnectAck(ConnectAck {
                session_present: false,
                return_code: ConnectAckReason::IdentifierRejected,
            }),
            b"\x20\x02\x00\x02",
        );
        assert_encode_packet(
            Packet::ConnectAck(ConnectAck {
                session_present: true,
                return_code: ConnectAckReason::ConnectionAccepted,
            }),
            b"\x20\x02\x01\x00",
        );
    }

    #[test]
    fn test_encode_publish_packets() {
        let mut publish = Publish::new(
            ByteString::from_static("topic"),
            Bytes::from_static(b"data"),
            QoS::AtLeastOnce,
            Some(packet_id(0x4321)),
        );
        publish.dup = true;
        assert_encode_packet(Packet::Publish(publish), b"\x3a\x0D\x00\x05topic\x43\x21data");

        assert_encode_packet(Packet::PublishAck { packet_id: packet_id(0x4321) }, b"\x40\x02\x43\x21");
        assert_encode_packet(Packet::PublishRelease { packet_id: packet_id(0x4321) }, b"\x62\x02\x43\x21");
    }

    #[test]
    fn test_encode_publish_requires_packet_id() {
        let p = Packet::Publish(Publish::new(
            ByteString::from_static("topic"),
            Bytes::from_static(b"data"),
            QoS::AtLeastOnce,
            None,
        ));
        let mut v = BytesMut::new();
        assert!(matches!(
            encode(&p, &mut v, get_encoded_size(&p) as u32),
            Err(EncodeError::PacketIdRequired)
        ));
    }

    #[test]
    fn test_encode_subscribe_packets() {
        assert_encode_packet(
            Packet::Subscribe {
                packet_id: packet_id(0x1234),
                topic_filters: vec![
                    (ByteString::from_static("test"), QoS::AtLeastOnce),
                    (ByteString::from_static("filter"), QoS::ExactlyOnce),
                ],
            },
            b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02",
        );
        assert_encode_packet(
            Packet::SubscribeAck {
                packet_id: packet_id(0x1234),
                status: vec![
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                    SubscribeReturnCode::Failure,
                    SubscribeReturnCode::Success(QoS::ExactlyOnce),
                ],
            },
            b"\x90\x05\x12\x34\x01\x80\x02",
        );
        assert_encode_packet(Packet::UnsubscribeAck { packet_id: packet_id(0x4321) }, b"\xb0\x02\x43\x21");
    }

    #[test]
    fn test_encode_ping_packets() {
        assert_encode_packet(Packet::PingRequest, b"\xc0\x00");
        assert_encode_packet(Packet::PingResponse, b"\xd0\x00");
        assert_encode_packet(Packet::Disconnect, b"\xe0\x00");
    }
}
