//! Datagram codec for fragments and acknowledgments.
//!
//! Both datagram kinds share one layout: a four byte magic marker, a
//! big-endian `u16` length of the encoded body, the body itself encoded with
//! fixed-width big-endian `bincode`, and, for fragments only, the raw payload
//! bytes. Datagrams that carry neither marker are reported as foreign so the
//! transport can hand them to another protocol.

use std::num::NonZeroUsize;

use bincode::{
    Decode,
    Encode,
    config::{self, BigEndian, Configuration, Fixint},
    decode_from_slice,
    encode_to_vec,
    error::{DecodeError, EncodeError},
};

use super::{AckBitmap, AckMessage, FragmentFlags, FragmentHeader, FragmentIndex, MessageId};

/// Magic prefix that marks a fragment datagram.
pub const FRAGMENT_MAGIC: &[u8; 4] = b"FRAG";

/// Magic prefix that marks an acknowledgment datagram.
pub const ACK_MAGIC: &[u8; 4] = b"FACK";

const LENGTH_PREFIX: usize = std::mem::size_of::<u16>();

/// A decoded datagram borrowing its payload from the receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// One fragment of an oversized message.
    Fragment {
        /// Decoded fragment header.
        header: FragmentHeader,
        /// Payload bytes following the header.
        payload: &'a [u8],
    },
    /// A cumulative acknowledgment.
    Ack(AckMessage),
}

fn wire_config() -> Configuration<BigEndian, Fixint> {
    config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Fixed bytes required to wrap a fragment, excluding the fragment body.
///
/// # Panics
///
/// Panics if encoding a constant [`FragmentHeader`] fails, which would
/// indicate a programmer error in the header definition.
#[must_use]
pub fn fragment_overhead() -> NonZeroUsize {
    // Fixed-width encoding makes every header the same size.
    let header = FragmentHeader::new(
        MessageId::new(0),
        FragmentIndex::zero(),
        0,
        0,
        0,
        FragmentFlags::NONE,
    );
    let header_bytes = encode_to_vec(header, wire_config()).unwrap_or_else(|err| {
        panic!("fragment header encoding must be infallible for constants: {err}")
    });
    let overhead = FRAGMENT_MAGIC.len() + LENGTH_PREFIX + header_bytes.len();
    NonZeroUsize::new(overhead).unwrap_or_else(|| {
        panic!("fragment overhead must be non-zero (computed {overhead})");
    })
}

/// Size in bytes of an encoded acknowledgment datagram.
///
/// # Panics
///
/// Panics if encoding a constant [`AckMessage`] fails.
#[must_use]
pub fn ack_datagram_len() -> usize {
    let ack = AckMessage::new(MessageId::new(0), AckBitmap::empty());
    let body = encode_to_vec(ack, wire_config())
        .unwrap_or_else(|err| panic!("ack encoding must be infallible for constants: {err}"));
    ACK_MAGIC.len() + LENGTH_PREFIX + body.len()
}

fn frame<T: Encode>(magic: &[u8; 4], body: T, trailer: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let body = encode_to_vec(body, wire_config())?;
    let body_len = u16::try_from(body.len())
        .map_err(|_| EncodeError::Other("datagram body length must fit within u16::MAX"))?;

    let mut buf = Vec::with_capacity(magic.len() + LENGTH_PREFIX + body.len() + trailer.len());
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&body_len.to_be_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(trailer);
    Ok(buf)
}

/// Encode a fragment for transport.
///
/// The returned buffer layout is:
/// `[FRAGMENT_MAGIC][u16 header_len][header bytes][fragment payload]`.
///
/// # Errors
///
/// Returns an [`EncodeError`] if the header cannot be encoded.
pub fn encode_fragment_payload(
    header: FragmentHeader,
    payload: &[u8],
) -> Result<Vec<u8>, EncodeError> {
    frame(FRAGMENT_MAGIC, header, payload)
}

/// Encode an acknowledgment for transport.
///
/// # Errors
///
/// Returns an [`EncodeError`] if the ack cannot be encoded.
pub fn encode_ack_payload(ack: AckMessage) -> Result<Vec<u8>, EncodeError> {
    frame(ACK_MAGIC, ack, &[])
}

fn split_body(datagram: &[u8]) -> Result<(&[u8], &[u8]), DecodeError> {
    let len_start = FRAGMENT_MAGIC.len();
    let Some(len_bytes) = datagram.get(len_start..len_start + LENGTH_PREFIX) else {
        return Err(DecodeError::UnexpectedEnd {
            additional: len_start + LENGTH_PREFIX - datagram.len(),
        });
    };
    let body_len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
    let body_start = len_start + LENGTH_PREFIX;
    let body_end = body_start + body_len;
    let Some(body) = datagram.get(body_start..body_end) else {
        return Err(DecodeError::UnexpectedEnd {
            additional: body_end.saturating_sub(datagram.len()),
        });
    };
    let rest = datagram.get(body_end..).unwrap_or_default();
    Ok((body, rest))
}

fn decode_exact<T: Decode<()>>(body: &[u8], what: &'static str) -> Result<T, DecodeError> {
    let (value, consumed) = decode_from_slice::<T, _>(body, wire_config())?;
    if consumed != body.len() {
        return Err(DecodeError::OtherString(format!("{what} length mismatch")));
    }
    Ok(value)
}

/// Attempt to decode a datagram.
///
/// Returns `Ok(Some(_))` for fragment and ack datagrams, `Ok(None)` when no
/// known marker is present, or an error when a marker is present but the
/// remainder is truncated or inconsistent. Header invariants that depend on
/// the payload are checked separately by [`FragmentHeader::validate`].
///
/// # Errors
///
/// Returns a [`DecodeError`] when the marker is present but the body cannot
/// be decoded.
pub fn decode_datagram(datagram: &[u8]) -> Result<Option<Datagram<'_>>, DecodeError> {
    let Some(prefix) = datagram.get(..FRAGMENT_MAGIC.len()) else {
        return Ok(None);
    };

    if prefix == FRAGMENT_MAGIC {
        let (body, payload) = split_body(datagram)?;
        let header = decode_exact::<FragmentHeader>(body, "fragment header")?;
        return Ok(Some(Datagram::Fragment { header, payload }));
    }

    if prefix == ACK_MAGIC {
        let (body, trailer) = split_body(datagram)?;
        if !trailer.is_empty() {
            return Err(DecodeError::OtherString(
                "trailing bytes after acknowledgment".to_string(),
            ));
        }
        let ack = decode_exact::<AckMessage>(body, "acknowledgment")?;
        return Ok(Some(Datagram::Ack(ack)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FragmentHeader {
        FragmentHeader::new(
            MessageId::new(9),
            FragmentIndex::new(2),
            10,
            6,
            4,
            FragmentFlags::LAST,
        )
    }

    #[test]
    fn round_trip_fragment_payload() {
        let header = sample_header();
        let payload = [1_u8, 2, 3, 4];

        let encoded = encode_fragment_payload(header, &payload).expect("encode fragment");
        assert_eq!(encoded.len(), fragment_overhead().get() + payload.len());
        let decoded = decode_datagram(&encoded)
            .expect("decode fragment")
            .expect("fragment marker present");
        assert_eq!(
            decoded,
            Datagram::Fragment {
                header,
                payload: &payload
            }
        );
    }

    #[test]
    fn ack_round_trip_has_fixed_size() {
        let ack = AckMessage::new(MessageId::new(77), AckBitmap::from_bits(0b1011));
        let encoded = encode_ack_payload(ack).expect("encode ack");
        assert_eq!(encoded.len(), ack_datagram_len());
        assert_eq!(
            decode_datagram(&encoded).expect("decode ack"),
            Some(Datagram::Ack(ack))
        );
    }

    #[test]
    fn header_encoding_is_big_endian() {
        let encoded = encode_fragment_payload(sample_header(), &[]).expect("encode fragment");
        // Message id is the first header field.
        let id_start = FRAGMENT_MAGIC.len() + LENGTH_PREFIX;
        assert_eq!(&encoded[id_start..id_start + 4], &[0, 0, 0, 9]);
    }

    #[test]
    fn decode_returns_none_for_foreign_payloads() {
        assert!(decode_datagram(&[0_u8, 1, 2, 3]).expect("decode ok").is_none());
        assert!(decode_datagram(b"FR").expect("decode ok").is_none());
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let encoded = encode_fragment_payload(sample_header(), &[]).expect("encode fragment");
        let truncated = &encoded[..encoded.len() - 3];

        let err = decode_datagram(truncated).expect_err("expected decode failure");
        match err {
            DecodeError::UnexpectedEnd { .. } => {}
            other => panic!("expected UnexpectedEnd, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_marker_without_length() {
        let err = decode_datagram(b"FRAG\x00").expect_err("expected decode failure");
        assert!(matches!(err, DecodeError::UnexpectedEnd { .. }));
    }

    #[test]
    fn decode_rejects_padded_header() {
        let mut body = encode_to_vec(sample_header(), wire_config()).expect("encode header");
        body.extend_from_slice(&[0_u8, 1]);
        let advertised = u16::try_from(body.len()).expect("header fits in u16");

        let mut datagram = Vec::new();
        datagram.extend_from_slice(FRAGMENT_MAGIC);
        datagram.extend_from_slice(&advertised.to_be_bytes());
        datagram.extend_from_slice(&body);

        let err = decode_datagram(&datagram).expect_err("expected decode failure");
        match err {
            DecodeError::OtherString(msg) => assert_eq!(msg, "fragment header length mismatch"),
            other => panic!("expected length mismatch error, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_trailing_ack_bytes() {
        let mut encoded =
            encode_ack_payload(AckMessage::new(MessageId::new(1), AckBitmap::empty()))
                .expect("encode ack");
        encoded.push(0);
        assert!(decode_datagram(&encoded).is_err());
    }
}
