//! Binary encoding primitives for the wire protocol.
//!
//! All multi-byte scalar fields on the wire are either fixed-width
//! little-endian or variable-length (see [`varint`]). Variable-length
//! byte strings are length-prefixed with a [`varint::var_u64`] length
//! followed by the raw bytes ([`lp_bytes`]).

pub mod varint;

use bytes::{BufMut, Bytes, BytesMut};

/// Error raised when decoding malformed input.
///
/// Carries a human-readable description of what went wrong; callers map
/// this into their own error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeserializeError {
    pub message: String,
}

impl std::fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deserialize error: {}", self.message)
    }
}

impl std::error::Error for DeserializeError {}

/// Length-prefixed byte strings.
///
/// ```text
/// | len (var_u64) | bytes... |
/// ```
pub mod lp_bytes {
    use super::*;

    /// Appends a length-prefixed byte string to `buf`.
    pub fn serialize(value: &[u8], buf: &mut BytesMut) {
        varint::var_u64::serialize(value.len() as u64, buf);
        buf.put_slice(value);
    }

    /// Reads a length-prefixed byte string, advancing `buf` past it.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Bytes, DeserializeError> {
        let len = varint::var_u64::deserialize(buf)?;
        let len = usize::try_from(len).map_err(|_| DeserializeError {
            message: format!("length prefix {} does not fit in memory", len),
        })?;
        if buf.len() < len {
            return Err(DeserializeError {
                message: format!(
                    "unexpected end of input: length prefix {} but {} bytes remain",
                    len,
                    buf.len()
                ),
            });
        }
        let value = Bytes::copy_from_slice(&buf[..len]);
        *buf = &buf[len..];
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn should_roundtrip_length_prefixed_bytes() {
        // given
        let value = b"control-tower";

        // when
        let mut buf = BytesMut::new();
        lp_bytes::serialize(value, &mut buf);
        let mut slice = buf.as_ref();
        let decoded = lp_bytes::deserialize(&mut slice).unwrap();

        // then
        assert_eq!(decoded.as_ref(), value);
        assert!(slice.is_empty());
    }

    #[test]
    fn should_roundtrip_empty_bytes() {
        let mut buf = BytesMut::new();
        lp_bytes::serialize(b"", &mut buf);

        let mut slice = buf.as_ref();
        let decoded = lp_bytes::deserialize(&mut slice).unwrap();

        assert!(decoded.is_empty());
        assert!(slice.is_empty());
    }

    #[test]
    fn should_fail_deserialize_truncated_bytes() {
        // length prefix says 5 bytes but only 2 follow
        let mut buf = BytesMut::new();
        varint::var_u64::serialize(5, &mut buf);
        buf.extend_from_slice(b"ab");

        let mut slice = buf.as_ref();
        assert!(lp_bytes::deserialize(&mut slice).is_err());
    }

    proptest! {
        #[test]
        fn should_roundtrip_arbitrary_bytes(value in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = BytesMut::new();
            lp_bytes::serialize(&value, &mut buf);

            let mut slice = buf.as_ref();
            let decoded = lp_bytes::deserialize(&mut slice).unwrap();

            prop_assert_eq!(decoded.as_ref(), value.as_slice());
            prop_assert!(slice.is_empty());
        }
    }
}
