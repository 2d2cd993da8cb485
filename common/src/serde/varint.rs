//! Variable-length integer serialization for the wire protocol.
//!
//! Unsigned integers are encoded in base-128 groups of seven bits, least
//! significant group first, with the high bit of each byte marking a
//! continuation. Small values therefore take a single byte and a full
//! `u64` takes at most ten.
//!
//! | Value range       | Encoded bytes |
//! |-------------------|---------------|
//! | 0 – 127           | 1             |
//! | 128 – 16,383      | 2             |
//! | 16,384 – 2²¹-1    | 3             |
//! | ...               | ...           |
//! | 2⁶³ – 2⁶⁴-1       | 10            |
//!
//! This encoding is not order-preserving; it is used for message framing,
//! never for storage keys.

/// Variable-length u64 serialization.
pub mod var_u64 {
    use bytes::{BufMut, BytesMut};

    use crate::serde::DeserializeError;

    /// Maximum encoded size of a u64.
    pub const MAX_ENCODED_LEN: usize = 10;

    /// Appends a varint-encoded u64 to `buf`.
    pub fn serialize(value: u64, buf: &mut BytesMut) {
        let mut value = value;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                buf.put_u8(byte);
                return;
            }
            buf.put_u8(byte | 0x80);
        }
    }

    /// Number of bytes `value` occupies when encoded.
    pub fn encoded_len(value: u64) -> usize {
        let mut len = 1;
        let mut value = value >> 7;
        while value != 0 {
            len += 1;
            value >>= 7;
        }
        len
    }

    /// Deserializes a varint u64 from a buffer, advancing past the
    /// consumed bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer ends mid-varint or the encoding
    /// exceeds ten bytes (overflowing a u64).
    pub fn deserialize(buf: &mut &[u8]) -> Result<u64, DeserializeError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        for (i, &byte) in buf.iter().enumerate() {
            if i >= MAX_ENCODED_LEN {
                break;
            }
            let group = (byte & 0x7F) as u64;
            if shift == 63 && group > 1 {
                return Err(DeserializeError {
                    message: "varint overflows u64".to_string(),
                });
            }
            value |= group << shift;
            if byte & 0x80 == 0 {
                *buf = &buf[i + 1..];
                return Ok(value);
            }
            shift += 7;
        }
        Err(DeserializeError {
            message: "unexpected end of input in varint".to_string(),
        })
    }

    #[cfg(test)]
    mod tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn should_roundtrip_any_value(value: u64) {
                let mut buf = BytesMut::new();
                serialize(value, &mut buf);

                let mut slice = buf.as_ref();
                let decoded = deserialize(&mut slice).unwrap();

                prop_assert_eq!(decoded, value);
                prop_assert!(slice.is_empty());
                prop_assert_eq!(buf.len(), encoded_len(value));
            }
        }

        #[test]
        fn should_encode_boundary_values_correctly() {
            let cases: &[(u64, &[u8])] = &[
                (0, &[0x00]),
                (1, &[0x01]),
                (127, &[0x7F]),
                (128, &[0x80, 0x01]),
                (300, &[0xAC, 0x02]),
                (16_383, &[0xFF, 0x7F]),
                (16_384, &[0x80, 0x80, 0x01]),
                (
                    u64::MAX,
                    &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01],
                ),
            ];

            for &(value, expected) in cases {
                let mut buf = BytesMut::new();
                serialize(value, &mut buf);
                assert_eq!(buf.as_ref(), expected, "encoding mismatch for {value}");
            }
        }

        #[test]
        fn should_fail_deserialize_empty_buffer() {
            let mut slice: &[u8] = &[];
            assert!(deserialize(&mut slice).is_err());
        }

        #[test]
        fn should_fail_deserialize_unterminated_varint() {
            // every byte has the continuation bit set
            let data = [0x80u8; 3];
            let mut slice = &data[..];
            assert!(deserialize(&mut slice).is_err());
        }

        #[test]
        fn should_fail_deserialize_overflowing_varint() {
            // eleven continuation groups cannot fit in a u64
            let data = [
                0xFFu8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F,
            ];
            let mut slice = &data[..];
            assert!(deserialize(&mut slice).is_err());
        }

        #[test]
        fn should_advance_buffer_past_consumed_bytes() {
            let data = &[0x05, 0xDE, 0xAD];
            let mut slice = &data[..];

            let decoded = deserialize(&mut slice).unwrap();

            assert_eq!(decoded, 5);
            assert_eq!(slice, &[0xDE, 0xAD]);
        }
    }
}
