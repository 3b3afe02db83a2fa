//! Packet encoding and decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Encoded header length.
pub const HEADER_SIZE: usize = 2 + 8 + 4 + 8 + 8 + 8;

/// Largest body a packet may carry.
pub const MAX_BODY_SIZE: u64 = 6000;

/// Fixed packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub status: u16,
    pub session: u64,
    pub offset: u32,
    pub body_size: u64,
    pub send_at: u64,
    pub dummy: u64,
}

/// A decoded packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub body: Bytes,
}

impl Packet {
    /// Build a packet whose header matches `body`, stamped with the current time.
    pub fn new(status: u16, session: u64, offset: u32, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Packet {
            header: Header {
                status,
                session,
                offset,
                body_size: body.len() as u64,
                send_at: chrono::Utc::now().timestamp().max(0) as u64,
                dummy: 0,
            },
            body,
        }
    }

    /// Length of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Packet protocol errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("header declares {declared} body bytes but body has {actual}")]
    BodySizeMismatch { declared: u64, actual: usize },
    #[error("body of {0} bytes exceeds the maximum of {MAX_BODY_SIZE}")]
    BodyTooLarge(u64),
}

/// Encode `packet` into a single frame.
pub fn marshal(packet: &Packet) -> Result<Bytes, PacketError> {
    let header = &packet.header;
    if header.body_size != packet.body.len() as u64 {
        return Err(PacketError::BodySizeMismatch {
            declared: header.body_size,
            actual: packet.body.len(),
        });
    }
    if header.body_size > MAX_BODY_SIZE {
        return Err(PacketError::BodyTooLarge(header.body_size));
    }

    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    buf.put_u16_le(header.status);
    buf.put_u64_le(header.session);
    buf.put_u32_le(header.offset);
    buf.put_u64_le(header.body_size);
    buf.put_u64_le(header.send_at);
    buf.put_u64_le(header.dummy);
    buf.put_slice(&packet.body);

    Ok(buf.freeze())
}

/// Decode the frame at the front of `input`.
///
/// Returns the packet and the number of bytes it occupied, or `None` while
/// `input` is still short of a complete frame. Bytes past the frame are
/// ignored. A header announcing an oversized body is rejected immediately,
/// before its body arrives.
pub fn unmarshal(input: &[u8]) -> Result<Option<(Packet, usize)>, PacketError> {
    if input.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut cursor = &input[..HEADER_SIZE];
    let header = Header {
        status: cursor.get_u16_le(),
        session: cursor.get_u64_le(),
        offset: cursor.get_u32_le(),
        body_size: cursor.get_u64_le(),
        send_at: cursor.get_u64_le(),
        dummy: cursor.get_u64_le(),
    };

    if header.body_size > MAX_BODY_SIZE {
        return Err(PacketError::BodyTooLarge(header.body_size));
    }

    let frame_len = HEADER_SIZE + header.body_size as usize;
    if input.len() < frame_len {
        return Ok(None);
    }

    let body = Bytes::copy_from_slice(&input[HEADER_SIZE..frame_len]);
    Ok(Some((Packet { header, body }, frame_len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packet(header: Header, body: &[u8]) -> Packet {
        Packet {
            header,
            body: Bytes::copy_from_slice(body),
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 38);
    }

    #[test]
    fn test_marshal_unmarshal() {
        let oversized = vec![0u8; MAX_BODY_SIZE as usize + 1];
        let cases: Vec<(&str, Packet, &[u8], Option<PacketError>)> = vec![
            (
                "small body",
                packet(
                    Header {
                        status: 1,
                        session: 123456789,
                        offset: 42,
                        body_size: 6,
                        send_at: 987654321,
                        dummy: 5555,
                    },
                    b"abcdef",
                ),
                &b"test"[..],
                None,
            ),
            (
                "empty body",
                packet(
                    Header {
                        status: 2,
                        session: 987654321,
                        offset: 84,
                        body_size: 0,
                        send_at: 123456789,
                        dummy: 0,
                    },
                    b"",
                ),
                &b""[..],
                None,
            ),
            (
                "body size mismatch",
                packet(
                    Header {
                        status: 3,
                        session: 111111111,
                        offset: 999,
                        body_size: 5,
                        send_at: 333333333,
                        dummy: 7777,
                    },
                    b"123456",
                ),
                &b"test-test"[..],
                Some(PacketError::BodySizeMismatch {
                    declared: 5,
                    actual: 6,
                }),
            ),
            (
                "oversized body",
                packet(
                    Header {
                        status: 4,
                        session: 222222222,
                        offset: 111,
                        body_size: MAX_BODY_SIZE + 1,
                        send_at: 444444444,
                        dummy: 8888,
                    },
                    &oversized,
                ),
                &b"hello-world"[..],
                Some(PacketError::BodyTooLarge(MAX_BODY_SIZE + 1)),
            ),
        ];

        for (name, packet, padding, want_err) in cases {
            let encoded = match (marshal(&packet), want_err) {
                (Ok(encoded), None) => encoded,
                (Err(err), Some(want)) => {
                    assert_eq!(err, want, "{name}");
                    continue;
                }
                (result, want) => panic!("{name}: got {result:?}, want error {want:?}"),
            };
            assert_eq!(encoded.len(), packet.encoded_len(), "{name}");

            let mut padded = encoded.to_vec();
            padded.extend_from_slice(padding);

            let (decoded, used) = unmarshal(&padded).unwrap().unwrap();
            assert_eq!(used, encoded.len(), "{name}");
            assert_eq!(decoded, packet, "{name}");
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let encoded = marshal(&packet(
            Header {
                status: 0x0102,
                session: 3,
                offset: 4,
                body_size: 1,
                send_at: 5,
                dummy: 6,
            },
            b"z",
        ))
        .unwrap();

        assert_eq!(&encoded[0..2], &[0x02, 0x01]);
        assert_eq!(encoded[2], 3);
        assert_eq!(encoded[10], 4);
        assert_eq!(encoded[14], 1);
        assert_eq!(encoded[22], 5);
        assert_eq!(encoded[30], 6);
        assert_eq!(&encoded[38..], b"z");
    }

    #[test]
    fn test_incomplete_input() {
        let encoded = marshal(&Packet::new(0, 7, 1, &b"payload"[..])).unwrap();

        assert_eq!(unmarshal(&[]).unwrap(), None);
        assert_eq!(unmarshal(&encoded[..HEADER_SIZE - 1]).unwrap(), None);
        assert_eq!(unmarshal(&encoded[..HEADER_SIZE]).unwrap(), None);
        assert_eq!(unmarshal(&encoded[..encoded.len() - 1]).unwrap(), None);
        assert!(unmarshal(&encoded).unwrap().is_some());
    }

    #[test]
    fn test_oversized_header_rejected_before_body() {
        let mut header = BytesMut::new();
        header.put_u16_le(0);
        header.put_u64_le(1);
        header.put_u32_le(0);
        header.put_u64_le(u64::MAX);
        header.put_u64_le(0);
        header.put_u64_le(0);

        assert_eq!(
            unmarshal(&header).unwrap_err(),
            PacketError::BodyTooLarge(u64::MAX)
        );
    }

    #[test]
    fn test_new_stamps_header() {
        let before = chrono::Utc::now().timestamp() as u64;
        let packet = Packet::new(9, 10, 11, &b"body"[..]);

        assert_eq!(packet.header.status, 9);
        assert_eq!(packet.header.session, 10);
        assert_eq!(packet.header.offset, 11);
        assert_eq!(packet.header.body_size, 4);
        assert_eq!(packet.header.dummy, 0);
        assert!(packet.header.send_at >= before);
    }

    fn arb_packet() -> impl Strategy<Value = Packet> {
        (
            any::<u16>(),
            any::<u64>(),
            any::<u32>(),
            any::<u64>(),
            proptest::collection::vec(any::<u8>(), 0..=256),
        )
            .prop_map(|(status, session, offset, send_at, body)| {
                let mut packet = Packet::new(status, session, offset, body);
                packet.header.send_at = send_at;
                packet
            })
    }

    proptest! {
        /// A stream of packets decodes back to the same packets no matter
        /// where it is cut into chunks.
        #[test]
        fn prop_stream_reassembly(
            packets in proptest::collection::vec(arb_packet(), 1..8),
            chunk in 1usize..64,
        ) {
            let mut stream = Vec::new();
            for packet in &packets {
                stream.extend_from_slice(&marshal(packet).unwrap());
            }

            let mut pending = Vec::new();
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                pending.extend_from_slice(piece);
                while let Some((packet, used)) = unmarshal(&pending).unwrap() {
                    decoded.push(packet);
                    pending.drain(..used);
                }
            }

            prop_assert!(pending.is_empty());
            prop_assert_eq!(decoded, packets);
        }
    }
}
