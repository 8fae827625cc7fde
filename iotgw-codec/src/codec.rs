use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::decode::decode_packet;
use crate::encode::{encode, get_encoded_size};
use crate::error::{DecodeError, EncodeError};
use crate::packet::Packet;
use crate::types::FixedHeader;
use crate::utils::decode_variable_length;

#[derive(Debug, Clone)]
/// Mqtt v3.1 / v3.1.1 protocol codec
pub struct Codec {
    state: DecodeState,
    max_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

impl Codec {
    /// Create `Codec` instance, `0` disables the inbound size limit.
    pub fn new(max_packet_size: u32) -> Self {
        Codec { state: DecodeState::FrameHeader, max_size: max_packet_size }
    }

    pub fn set_max_size(&mut self, size: u32) {
        self.max_size = size;
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first_byte = src[0];
                    let Some((remaining_length, consumed)) = decode_variable_length(&src[1..])? else {
                        return Ok(None);
                    };
                    if self.max_size != 0 && self.max_size < remaining_length {
                        return Err(DecodeError::MaxSizeExceeded(remaining_length));
                    }
                    src.advance(consumed + 1);
                    self.state = DecodeState::Frame(FixedHeader { first_byte, remaining_length });
                    if src.len() < remaining_length as usize {
                        src.reserve(remaining_length as usize - src.len());
                        return Ok(None);
                    }
                }
                DecodeState::Frame(header) => {
                    if src.len() < header.remaining_length as usize {
                        return Ok(None);
                    }
                    let packet_buf = src.split_to(header.remaining_length as usize);
                    self.state = DecodeState::FrameHeader;
                    return decode_packet(packet_buf.freeze(), header).map(Some);
                }
            }
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let content_size = get_encoded_size(&item);
        dst.reserve(content_size + 5);
        encode(&item, dst, u32::try_from(content_size).map_err(|_| EncodeError::OverMaxPacketSize)?)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::types::{Publish, QoS};

    #[test]
    fn test_max_size() {
        let mut codec = Codec::new(5);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\x30\x09");
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded(9))));
    }

    #[test]
    fn test_large_publish() {
        let mut codec = Codec::default();
        let mut buf = BytesMut::new();

        let pkt = Publish::new(
            ByteString::from_static("/test"),
            Bytes::from("a".repeat(260 * 1024)),
            QoS::AtLeastOnce,
            NonZeroU16::new(7),
        );
        codec.encode(Packet::Publish(pkt.clone()), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::Publish(pkt)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames() {
        let mut codec = Codec::default();
        let wire = b"\x40\x02\x00\x07\xc0\x00";

        let mut buf = BytesMut::new();
        let mut packets = Vec::new();
        for b in wire.iter() {
            buf.extend_from_slice(&[*b]);
            while let Some(p) = codec.decode(&mut buf).unwrap() {
                packets.push(p);
            }
        }
        assert_eq!(
            packets,
            vec![Packet::PublishAck { packet_id: NonZeroU16::new(7).unwrap() }, Packet::PingRequest]
        );
    }
}
