//! Wire codec: type-length-value elements.
//!
//! Every message is a sequence of elements with a one-byte type and a
//! three-tier length: below 253 in one byte, up to 65535 behind a 253
//! marker, and wider values behind a 254 marker. One header reader
//! serves stream framing, element decoding, and the packet layer, so
//! there is exactly one place that understands the tiers.

use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};

/// Top-level message types
pub const TLV_CCN_PDU: u8 = 0x04;
pub const TLV_INTEREST: u8 = 0x05;
pub const TLV_CONTENT_OBJECT: u8 = 0x06;

/// Name encoding
pub const TLV_NAME: u8 = 0x07;
pub const TLV_COMPONENT: u8 = 0x08;

/// Interest elements, in canonical emission order
pub const TLV_MIN_SUFFIX_COMPONENTS: u8 = 0x0D;
pub const TLV_MAX_SUFFIX_COMPONENTS: u8 = 0x0E;
pub const TLV_PUBLISHER_KEY_DIGEST: u8 = 0x0F;
pub const TLV_EXCLUDE: u8 = 0x10;
pub const TLV_CHILD_SELECTOR: u8 = 0x11;
pub const TLV_ANSWER_ORIGIN_KIND: u8 = 0x14;
pub const TLV_SCOPE: u8 = 0x16;
pub const TLV_FACE_ID: u8 = 0x17;
pub const TLV_NONCE: u8 = 0x0A;
pub const TLV_INTEREST_LIFETIME: u8 = 0x0C;

/// Exclude sub-elements
pub const TLV_ANY: u8 = 0x13;

/// ContentObject elements
pub const TLV_CONTENT_TYPE: u8 = 0x18;
pub const TLV_FRESHNESS_SECONDS: u8 = 0x19;
pub const TLV_CONTENT: u8 = 0x15;

/// Link-layer trailer
pub const TLV_SEQUENCE_NUMBER: u8 = 0x1A;

/// Management bodies
pub const TLV_FACE_INSTANCE: u8 = 0x20;
pub const TLV_FORWARDING_ENTRY: u8 = 0x21;
pub const TLV_STRATEGY_SELECTION: u8 = 0x22;
pub const TLV_STATUS_RESPONSE: u8 = 0x23;
pub const TLV_ACTION: u8 = 0x24;
pub const TLV_IP_PROTO: u8 = 0x25;
pub const TLV_HOST: u8 = 0x26;
pub const TLV_PORT: u8 = 0x27;
pub const TLV_FORWARDING_FLAGS: u8 = 0x28;
pub const TLV_LIFETIME_SECONDS: u8 = 0x29;
pub const TLV_STRATEGY_ID: u8 = 0x2A;
pub const TLV_STRATEGY_PARAMETERS: u8 = 0x2B;
pub const TLV_STATUS_CODE: u8 = 0x2C;
pub const TLV_STATUS_TEXT: u8 = 0x2D;
pub const TLV_CCNDID: u8 = 0x2E;

/// Decoded element header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tlv_type: u8,
    /// Bytes occupied by the type and length fields together.
    pub header_len: usize,
    /// Bytes occupied by the value.
    pub value_len: usize,
}

impl Header {
    /// Full encoded size of the element this header introduces.
    pub fn total_len(&self) -> usize {
        self.header_len + self.value_len
    }
}

/// Reads an element header from the front of `buf`.
///
/// `Ok(None)` means the buffer ends mid-header and more bytes are
/// needed; only an unrepresentable length marker is an error. The value
/// itself is not required to be present yet.
pub fn read_header(buf: &[u8]) -> Result<Option<Header>, Error> {
    let (&tlv_type, rest) = match buf.split_first() {
        Some(split) => split,
        None => return Ok(None),
    };
    let Some(&marker) = rest.first() else {
        return Ok(None);
    };
    let (value_len, header_len) = match marker {
        255 => return Err(Error::Parse("length marker 255 is reserved".into())),
        254 => {
            let Some(raw) = rest.get(1..5) else {
                return Ok(None);
            };
            (u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize, 6)
        }
        253 => {
            let Some(raw) = rest.get(1..3) else {
                return Ok(None);
            };
            (u16::from_be_bytes([raw[0], raw[1]]) as usize, 4)
        }
        short => (short as usize, 2),
    };
    Ok(Some(Header {
        tlv_type,
        header_len,
        value_len,
    }))
}

/// Writes the type and length fields for a value of `value_len` bytes.
pub fn put_header(buf: &mut BytesMut, tlv_type: u8, value_len: usize) {
    buf.put_u8(tlv_type);
    match value_len {
        0..=252 => buf.put_u8(value_len as u8),
        253..=65535 => {
            buf.put_u8(253);
            buf.put_u16(value_len as u16);
        }
        _ => {
            buf.put_u8(254);
            buf.put_u32(value_len as u32);
        }
    }
}

/// Encoded header size for a value of `value_len` bytes.
pub fn header_size(value_len: usize) -> usize {
    match value_len {
        0..=252 => 2,
        253..=65535 => 4,
        _ => 6,
    }
}

/// A single element: a type and its raw value bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TlvElement {
    pub tlv_type: u8,
    pub value: Bytes,
}

impl TlvElement {
    pub fn new(tlv_type: u8, value: impl Into<Bytes>) -> Self {
        Self {
            tlv_type,
            value: value.into(),
        }
    }

    /// Total encoded size of this element.
    pub fn len(&self) -> usize {
        header_size(self.value.len()) + self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_header(buf, self.tlv_type, self.value.len());
        buf.extend_from_slice(&self.value);
    }

    /// Splits one complete element off the front of `buf` without
    /// copying the value.
    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let header = read_header(buf)?
            .ok_or_else(|| Error::Parse("truncated element header".into()))?;
        if buf.len() < header.total_len() {
            return Err(Error::Parse(format!(
                "element value wants {} bytes, {} present",
                header.value_len,
                buf.len().saturating_sub(header.header_len)
            )));
        }
        let mut element = buf.split_to(header.total_len());
        let value = element.split_off(header.header_len);
        Ok(Self {
            tlv_type: header.tlv_type,
            value,
        })
    }

    /// The value as a big-endian non-negative integer.
    pub fn as_uint(&self) -> Result<u64, Error> {
        if self.value.len() > 8 {
            return Err(Error::Parse("integer element wider than 8 bytes".into()));
        }
        Ok(self
            .value
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }
}

/// Appends an element holding a minimally-encoded big-endian integer.
pub fn encode_uint(tlv_type: u8, value: u64, buf: &mut BytesMut) {
    let width = (8 - value.leading_zeros() as usize / 8).max(1);
    put_header(buf, tlv_type, width);
    buf.extend_from_slice(&value.to_be_bytes()[8 - width..]);
}

/// Size of the message at the front of `buf`, once it is whole.
///
/// Returns `Ok(None)` while bytes are still missing; the stream reader
/// uses this to delimit messages across partial reads.
pub fn frame_size(buf: &[u8]) -> Result<Option<usize>, Error> {
    match read_header(buf).map_err(|_| Error::Protocol("bad framing header".into()))? {
        Some(h) if buf.len() >= h.total_len() => Ok(Some(h.total_len())),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_roundtrip() {
        let mut buf = BytesMut::new();
        let e = TlvElement::new(TLV_NONCE, Bytes::from_static(b"abc"));
        e.encode(&mut buf);
        assert_eq!(&buf[..], &[TLV_NONCE, 3, b'a', b'b', b'c']);

        let mut rd = buf.freeze();
        assert_eq!(TlvElement::decode(&mut rd).unwrap(), e);
        assert!(rd.is_empty());
    }

    #[test]
    fn header_tiers() {
        for (len, want_hdr) in [(0, 2), (252, 2), (253, 4), (65535, 4), (65536, 6)] {
            let mut buf = BytesMut::new();
            put_header(&mut buf, TLV_CONTENT, len);
            assert_eq!(buf.len(), want_hdr);
            assert_eq!(header_size(len), want_hdr);
            let h = read_header(&buf).unwrap().unwrap();
            assert_eq!(h.tlv_type, TLV_CONTENT);
            assert_eq!(h.value_len, len);
            assert_eq!(h.header_len, want_hdr);
        }
    }

    #[test]
    fn reserved_marker_rejected() {
        assert!(read_header(&[TLV_CONTENT, 255]).is_err());
    }

    #[test]
    fn uint_minimal_encoding() {
        let mut buf = BytesMut::new();
        encode_uint(TLV_SCOPE, 2, &mut buf);
        assert_eq!(&buf[..], &[TLV_SCOPE, 1, 2]);

        for value in [0u64, 255, 256, 300, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_uint(TLV_LIFETIME_SECONDS, value, &mut buf);
            let mut rd = buf.freeze();
            let e = TlvElement::decode(&mut rd).unwrap();
            assert_eq!(e.as_uint().unwrap(), value);
        }
    }

    #[test]
    fn frame_size_partial_and_complete() {
        let mut buf = BytesMut::new();
        let e = TlvElement::new(TLV_INTEREST, Bytes::from(vec![0u8; 300]));
        e.encode(&mut buf);
        let whole = buf.freeze();
        assert_eq!(frame_size(&whole).unwrap(), Some(whole.len()));
        // mid-header and mid-value are both "not yet"
        assert_eq!(frame_size(&whole[..1]).unwrap(), None);
        assert_eq!(frame_size(&whole[..3]).unwrap(), None);
        assert_eq!(frame_size(&whole[..whole.len() - 1]).unwrap(), None);
    }
}
