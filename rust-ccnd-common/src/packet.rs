//! Interest and ContentObject messages.
//!
//! Messages are single TLV elements. Interest sub-elements are emitted in a
//! fixed order with InterestLifetime, Nonce, and FaceID trailing, so the
//! PIT can key entries on the encoded Interest truncated just before the
//! lifetime element (plus a zero sentinel byte to keep the key out of the
//! prefix space of longer keys). The truncation drops the nonce as well:
//! the same question from two requesters lands on one entry.

use crate::error::Error;
use crate::name::{component_cmp, flat_component, flat_count, flatname_compare, FlatName};
use crate::tlv::{self, TlvElement};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifetime units per second (CCN wire units).
pub const LIFETIME_HZ: u32 = 4096;

/// Default Interest lifetime: 4 seconds.
pub const DEFAULT_LIFETIME: u32 = 4 * LIFETIME_HZ;

/// Lifetime floor: 1/8 second.
pub const MIN_LIFETIME: u32 = LIFETIME_HZ / 8;

/// Lifetime ceiling: one week.
pub const MAX_LIFETIME: u32 = 7 * 24 * 3600 * LIFETIME_HZ;

/// AnswerOriginKind bits.
pub const AOK_CS: u8 = 1;
pub const AOK_NEW: u8 = 2;
pub const AOK_STALE: u8 = 4;
pub const AOK_EXPIRE: u8 = 0x10;
pub const AOK_DEFAULT: u8 = AOK_CS | AOK_NEW;

/// Clamp a lifetime to `[1/8 s, 1 week]` and round up to the 1/8 s grid.
pub fn normalize_lifetime(lifetime: u32) -> u32 {
    let clamped = lifetime.clamp(MIN_LIFETIME, MAX_LIFETIME);
    ((clamped + 511) >> 9) << 9
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChildSelector {
    #[default]
    Leftmost,
    Rightmost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExcludeItem {
    Any,
    Component(Vec<u8>),
}

/// An Interest Exclude: components in increasing order, with `Any` marking
/// open ranges between, before, or after them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Exclude {
    pub items: Vec<ExcludeItem>,
}

impl Exclude {
    /// True when `comp` is ruled out by this exclude.
    pub fn excludes(&self, comp: &[u8]) -> bool {
        let mut any_pending = false;
        for item in &self.items {
            match item {
                ExcludeItem::Any => any_pending = true,
                ExcludeItem::Component(c) => {
                    match component_cmp(comp, c) {
                        std::cmp::Ordering::Equal => return true,
                        std::cmp::Ordering::Less => return any_pending,
                        std::cmp::Ordering::Greater => any_pending = false,
                    }
                }
            }
        }
        any_pending
    }

    /// The component of a leading `<Any/><Component>` pair, if present.
    /// The content-store walk uses it to start the seek past the excluded
    /// range.
    pub fn leading_any_component(&self) -> Option<&[u8]> {
        match self.items.as_slice() {
            [ExcludeItem::Any, ExcludeItem::Component(c), ..] => Some(c),
            _ => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut inner = BytesMut::new();
        for item in &self.items {
            match item {
                ExcludeItem::Any => TlvElement::new(tlv::TLV_ANY, Bytes::new()).encode(&mut inner),
                ExcludeItem::Component(c) => {
                    TlvElement::new(tlv::TLV_COMPONENT, Bytes::from(c.clone())).encode(&mut inner)
                }
            }
        }
        TlvElement::new(tlv::TLV_EXCLUDE, inner.freeze()).encode(buf);
    }

    fn decode(value: &Bytes) -> Result<Self, Error> {
        let mut items = Vec::new();
        let mut buf = value.clone();
        while !buf.is_empty() {
            let e = TlvElement::decode(&mut buf)?;
            match e.tlv_type {
                tlv::TLV_ANY => items.push(ExcludeItem::Any),
                tlv::TLV_COMPONENT => items.push(ExcludeItem::Component(e.value.to_vec())),
                other => {
                    return Err(Error::Parse(format!("unexpected element {other} in Exclude")))
                }
            }
        }
        Ok(Self { items })
    }
}

/* ---------------------------------------------------------------- *\
 * Interest
\* ---------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub name: FlatName,
    pub min_suffix_components: Option<u32>,
    pub max_suffix_components: Option<u32>,
    pub publisher_digest: Option<Vec<u8>>,
    pub exclude: Option<Exclude>,
    pub child_selector: ChildSelector,
    pub answer_origin_kind: u8,
    pub scope: Option<u8>,
    /// Explicit outbound face, honored only for trusted local senders.
    pub faceid_hint: Option<u32>,
    pub nonce: Option<Vec<u8>>,
    /// Lifetime in 1/4096 s units; None means the 4 s default.
    pub lifetime: Option<u32>,
}

impl Interest {
    pub fn new(name: FlatName) -> Self {
        Self {
            name,
            min_suffix_components: None,
            max_suffix_components: None,
            publisher_digest: None,
            exclude: None,
            child_selector: ChildSelector::Leftmost,
            answer_origin_kind: AOK_DEFAULT,
            scope: None,
            faceid_hint: None,
            nonce: None,
            lifetime: None,
        }
    }

    pub fn with_scope(mut self, scope: u8) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_nonce(mut self, nonce: Vec<u8>) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_lifetime(mut self, lifetime: u32) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn lifetime_or_default(&self) -> u32 {
        self.lifetime.unwrap_or(DEFAULT_LIFETIME)
    }

    /// True when the answer may come from the content store.
    pub fn answer_from_cs(&self) -> bool {
        self.answer_origin_kind & AOK_CS != 0
    }

    pub fn stale_ok(&self) -> bool {
        self.answer_origin_kind & AOK_STALE != 0
    }

    pub fn marks_stale(&self) -> bool {
        self.answer_origin_kind & AOK_EXPIRE != 0
    }

    /// Encodes the full Interest message.
    pub fn encode(&self) -> Bytes {
        let mut inner = BytesMut::new();
        TlvElement::new(tlv::TLV_NAME, Bytes::from(self.name.as_flat().to_vec()))
            .encode(&mut inner);
        if let Some(v) = self.min_suffix_components {
            tlv::encode_uint(tlv::TLV_MIN_SUFFIX_COMPONENTS, v as u64, &mut inner);
        }
        if let Some(v) = self.max_suffix_components {
            tlv::encode_uint(tlv::TLV_MAX_SUFFIX_COMPONENTS, v as u64, &mut inner);
        }
        if let Some(p) = &self.publisher_digest {
            TlvElement::new(tlv::TLV_PUBLISHER_KEY_DIGEST, Bytes::from(p.clone()))
                .encode(&mut inner);
        }
        if let Some(x) = &self.exclude {
            x.encode(&mut inner);
        }
        if self.child_selector == ChildSelector::Rightmost {
            tlv::encode_uint(tlv::TLV_CHILD_SELECTOR, 1, &mut inner);
        }
        if self.answer_origin_kind != AOK_DEFAULT {
            tlv::encode_uint(tlv::TLV_ANSWER_ORIGIN_KIND, self.answer_origin_kind as u64, &mut inner);
        }
        if let Some(s) = self.scope {
            tlv::encode_uint(tlv::TLV_SCOPE, s as u64, &mut inner);
        }
        if let Some(l) = self.lifetime {
            tlv::encode_uint(tlv::TLV_INTEREST_LIFETIME, l as u64, &mut inner);
        }
        if let Some(n) = &self.nonce {
            TlvElement::new(tlv::TLV_NONCE, Bytes::from(n.clone())).encode(&mut inner);
        }
        if let Some(f) = self.faceid_hint {
            tlv::encode_uint(tlv::TLV_FACE_ID, f as u64, &mut inner);
        }
        let mut out = BytesMut::new();
        TlvElement::new(tlv::TLV_INTEREST, inner.freeze()).encode(&mut out);
        out.freeze()
    }
}

/// A parsed Interest together with its wire bytes and the byte offset of
/// the InterestLifetime element (end of message when absent).
#[derive(Debug, Clone)]
pub struct WireInterest {
    pub wire: Bytes,
    pub interest: Interest,
    lifetime_off: usize,
}

impl WireInterest {
    pub fn parse(wire: Bytes) -> Result<Self, Error> {
        let buf = wire.as_ref();
        let (t, value_start, value_len) = read_outer(buf)?;
        if t != tlv::TLV_INTEREST {
            return Err(Error::Parse(format!("expected Interest, got type {t}")));
        }
        let mut interest = Interest::new(FlatName::new());
        // Offset where the trailing (lifetime, nonce, faceid) section
        // begins; the PIT key is everything before it.
        let mut lifetime_off = wire.len();
        let mut saw_name = false;
        let mut pos = value_start;
        let end = value_start + value_len;
        while pos < end {
            let (t, vstart, vlen) = read_outer(&buf[pos..end])?;
            let abs_vstart = pos + vstart;
            let value = wire.slice(abs_vstart..abs_vstart + vlen);
            match t {
                tlv::TLV_NAME => {
                    interest.name = FlatName::from_flat(value.to_vec())?;
                    saw_name = true;
                }
                tlv::TLV_MIN_SUFFIX_COMPONENTS => {
                    interest.min_suffix_components =
                        Some(TlvElement::new(t, value).as_uint()? as u32)
                }
                tlv::TLV_MAX_SUFFIX_COMPONENTS => {
                    interest.max_suffix_components =
                        Some(TlvElement::new(t, value).as_uint()? as u32)
                }
                tlv::TLV_PUBLISHER_KEY_DIGEST => {
                    interest.publisher_digest = Some(value.to_vec())
                }
                tlv::TLV_EXCLUDE => interest.exclude = Some(Exclude::decode(&value)?),
                tlv::TLV_CHILD_SELECTOR => {
                    interest.child_selector = if TlvElement::new(t, value).as_uint()? & 1 != 0 {
                        ChildSelector::Rightmost
                    } else {
                        ChildSelector::Leftmost
                    }
                }
                tlv::TLV_ANSWER_ORIGIN_KIND => {
                    interest.answer_origin_kind = TlvElement::new(t, value).as_uint()? as u8
                }
                tlv::TLV_SCOPE => interest.scope = Some(TlvElement::new(t, value).as_uint()? as u8),
                tlv::TLV_FACE_ID => {
                    lifetime_off = lifetime_off.min(pos);
                    interest.faceid_hint = Some(TlvElement::new(t, value).as_uint()? as u32)
                }
                tlv::TLV_NONCE => {
                    lifetime_off = lifetime_off.min(pos);
                    interest.nonce = Some(value.to_vec())
                }
                tlv::TLV_INTEREST_LIFETIME => {
                    lifetime_off = lifetime_off.min(pos);
                    interest.lifetime = Some(TlvElement::new(t, value).as_uint()? as u32);
                }
                other => {
                    return Err(Error::Parse(format!("unexpected element {other} in Interest")))
                }
            }
            pos = abs_vstart + vlen;
        }
        if !saw_name || interest.name.is_empty() {
            return Err(Error::Parse("Interest without a name".into()));
        }
        Ok(Self {
            wire,
            interest,
            lifetime_off,
        })
    }

    /// The PIT key: wire bytes truncated just before the lifetime element,
    /// with a reserved zero suffix byte so truncated keys never collide
    /// with the prefix of an untruncated one.
    pub fn pit_key(&self) -> Vec<u8> {
        let mut key = self.wire[..self.lifetime_off].to_vec();
        key.push(0);
        key
    }
}

/* ---------------------------------------------------------------- *\
 * ContentObject
\* ---------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentObject {
    pub name: FlatName,
    pub content_type: Option<u32>,
    pub freshness_seconds: Option<u32>,
    pub publisher_digest: Option<Vec<u8>>,
    pub content: Bytes,
}

impl ContentObject {
    pub fn new(name: FlatName, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            content_type: None,
            freshness_seconds: None,
            publisher_digest: None,
            content: content.into(),
        }
    }

    pub fn with_freshness_seconds(mut self, secs: u32) -> Self {
        self.freshness_seconds = Some(secs);
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut inner = BytesMut::new();
        TlvElement::new(tlv::TLV_NAME, Bytes::from(self.name.as_flat().to_vec()))
            .encode(&mut inner);
        if let Some(t) = self.content_type {
            tlv::encode_uint(tlv::TLV_CONTENT_TYPE, t as u64, &mut inner);
        }
        if let Some(f) = self.freshness_seconds {
            tlv::encode_uint(tlv::TLV_FRESHNESS_SECONDS, f as u64, &mut inner);
        }
        if let Some(p) = &self.publisher_digest {
            TlvElement::new(tlv::TLV_PUBLISHER_KEY_DIGEST, Bytes::from(p.clone()))
                .encode(&mut inner);
        }
        TlvElement::new(tlv::TLV_CONTENT, self.content.clone()).encode(&mut inner);
        let mut out = BytesMut::new();
        TlvElement::new(tlv::TLV_CONTENT_OBJECT, inner.freeze()).encode(&mut out);
        out.freeze()
    }
}

/// A parsed ContentObject with its wire bytes, implicit digest, and the
/// flat name extended by the digest component (the content-store key).
#[derive(Debug, Clone)]
pub struct WireContentObject {
    pub wire: Bytes,
    pub object: ContentObject,
    pub digest: [u8; 32],
    flat_with_digest: Vec<u8>,
}

impl WireContentObject {
    pub fn parse(wire: Bytes) -> Result<Self, Error> {
        let buf = wire.as_ref();
        let (t, value_start, value_len) = read_outer(buf)?;
        if t != tlv::TLV_CONTENT_OBJECT {
            return Err(Error::Parse(format!("expected ContentObject, got type {t}")));
        }
        let mut object = ContentObject::new(FlatName::new(), Bytes::new());
        let mut saw_name = false;
        let mut pos = value_start;
        let end = value_start + value_len;
        while pos < end {
            let (t, vstart, vlen) = read_outer(&buf[pos..end])?;
            let abs_vstart = pos + vstart;
            let value = wire.slice(abs_vstart..abs_vstart + vlen);
            match t {
                tlv::TLV_NAME => {
                    object.name = FlatName::from_flat(value.to_vec())?;
                    saw_name = true;
                }
                tlv::TLV_CONTENT_TYPE => {
                    object.content_type = Some(TlvElement::new(t, value).as_uint()? as u32)
                }
                tlv::TLV_FRESHNESS_SECONDS => {
                    object.freshness_seconds = Some(TlvElement::new(t, value).as_uint()? as u32)
                }
                tlv::TLV_PUBLISHER_KEY_DIGEST => object.publisher_digest = Some(value.to_vec()),
                tlv::TLV_CONTENT => object.content = value,
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected element {other} in ContentObject"
                    )))
                }
            }
            pos = abs_vstart + vlen;
        }
        if !saw_name {
            return Err(Error::Parse("ContentObject without a name".into()));
        }
        let digest: [u8; 32] = Sha256::digest(&wire).into();
        let mut keyed = object.name.clone();
        keyed.push(&digest);
        Ok(Self {
            wire,
            object,
            digest,
            flat_with_digest: keyed.into_flat(),
        })
    }

    /// The content-store key: `name || implicit digest component`.
    pub fn flat_with_digest(&self) -> &[u8] {
        &self.flat_with_digest
    }

    /// Component count including the implicit digest component.
    pub fn ncomps(&self) -> usize {
        self.object.name.count() + 1
    }
}

/// Whether a stored content entry satisfies an Interest's predicate.
///
/// `content_flat` is the name-with-digest key, `ncomps` its component count
/// including the digest. Staleness and child-selector ordering are handled
/// by the content-store walk, not here.
pub fn content_matches_interest(
    content_flat: &[u8],
    ncomps: usize,
    content_publisher: Option<&[u8]>,
    interest: &Interest,
) -> bool {
    if !flatname_compare(interest.name.as_flat(), content_flat).is_prefix() {
        return false;
    }
    let prefix_count = interest.name.count();
    let suffix = ncomps.saturating_sub(prefix_count) as u32;
    if suffix < interest.min_suffix_components.unwrap_or(0) {
        return false;
    }
    if let Some(max) = interest.max_suffix_components {
        if suffix > max {
            return false;
        }
    }
    if let Some(want) = &interest.publisher_digest {
        match content_publisher {
            Some(have) if have == want.as_slice() => {}
            _ => return false,
        }
    }
    if let Some(exclude) = &interest.exclude {
        if let Some(next_comp) = flat_component(content_flat, prefix_count) {
            if exclude.excludes(next_comp) {
                return false;
            }
        }
    }
    debug_assert!(flat_count(content_flat) == ncomps);
    true
}

/* ---------------------------------------------------------------- *\
 * Link-layer grouping and probes
\* ---------------------------------------------------------------- */

/// Wraps one or more encoded messages into a CCNProtocolDataUnit.
pub fn wrap_pdu(messages: &[Bytes]) -> Bytes {
    let mut inner = BytesMut::new();
    for m in messages {
        inner.extend_from_slice(m);
    }
    let mut out = BytesMut::new();
    TlvElement::new(tlv::TLV_CCN_PDU, inner.freeze()).encode(&mut out);
    out.freeze()
}

/// Encodes a trailing SequenceNumber element.
pub fn encode_sequence_number(seq: u64) -> Bytes {
    let mut out = BytesMut::new();
    tlv::encode_uint(tlv::TLV_SEQUENCE_NUMBER, seq, &mut out);
    out.freeze()
}

/// One element header at the front of `buf`, which must be whole.
/// Returns `(type, value offset, value length)`.
fn read_outer(buf: &[u8]) -> Result<(u8, usize, usize), Error> {
    let header = tlv::read_header(buf)?
        .ok_or_else(|| Error::Parse("message too short".into()))?;
    if buf.len() < header.total_len() {
        return Err(Error::Parse("message truncated".into()));
    }
    Ok((header.tlv_type, header.header_len, header.value_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_interest() -> Interest {
        Interest::new(FlatName::from_uri("/test/interest").unwrap())
            .with_nonce(vec![1, 2, 3, 4])
            .with_lifetime(4000)
            .with_scope(2)
    }

    #[test]
    fn interest_roundtrip() {
        let interest = sample_interest();
        let wire = interest.encode();
        let parsed = WireInterest::parse(wire).unwrap();
        assert_eq!(parsed.interest, interest);
    }

    #[test]
    fn pit_key_elides_lifetime_and_nonce() {
        let a = sample_interest();
        let mut b = a.clone();
        b.lifetime = Some(40_000);
        b.nonce = Some(vec![9, 9, 9, 9]);
        let ka = WireInterest::parse(a.encode()).unwrap().pit_key();
        let kb = WireInterest::parse(b.encode()).unwrap().pit_key();
        assert_eq!(ka, kb, "lifetime and nonce do not distinguish entries");
        assert_eq!(*ka.last().unwrap(), 0);

        let mut c = a.clone();
        c.name = FlatName::from_uri("/test/other").unwrap();
        let kc = WireInterest::parse(c.encode()).unwrap().pit_key();
        assert_ne!(ka, kc);

        // an interest with no trailing section at all still keys the same
        let mut d = a.clone();
        d.nonce = None;
        d.lifetime = None;
        let kd = WireInterest::parse(d.encode()).unwrap().pit_key();
        assert_eq!(ka, kd);
    }

    #[test]
    fn content_roundtrip_and_digest() {
        let obj = ContentObject::new(FlatName::from_uri("/a/b").unwrap(), &b"Hello, CCN!"[..])
            .with_freshness_seconds(60);
        let wire = obj.encode();
        let parsed = WireContentObject::parse(wire.clone()).unwrap();
        assert_eq!(parsed.object, obj);
        assert_eq!(parsed.ncomps(), 3);
        let again = WireContentObject::parse(wire).unwrap();
        assert_eq!(parsed.digest, again.digest);
        assert_eq!(
            flat_component(parsed.flat_with_digest(), 2).unwrap(),
            &parsed.digest[..]
        );
    }

    #[test]
    fn exclude_semantics() {
        let x = Exclude {
            items: vec![
                ExcludeItem::Component(b"b".to_vec()),
                ExcludeItem::Any,
                ExcludeItem::Component(b"d".to_vec()),
            ],
        };
        assert!(!x.excludes(b"a"));
        assert!(x.excludes(b"b"));
        assert!(x.excludes(b"c"));
        assert!(x.excludes(b"d"));
        assert!(!x.excludes(b"e"));

        let leading = Exclude {
            items: vec![ExcludeItem::Any, ExcludeItem::Component(b"m".to_vec())],
        };
        assert!(leading.excludes(b"a"));
        assert!(leading.excludes(b"m"));
        assert!(!leading.excludes(b"z"));
        assert_eq!(leading.leading_any_component().unwrap(), b"m");
    }

    #[test]
    fn predicate_suffix_counts() {
        let obj = ContentObject::new(FlatName::from_uri("/a/b").unwrap(), &b"x"[..]);
        let parsed = WireContentObject::parse(obj.encode()).unwrap();

        // /a/b + digest = 3 components; interest /a/b leaves suffix 1
        let mut interest = Interest::new(FlatName::from_uri("/a/b").unwrap());
        assert!(content_matches_interest(
            parsed.flat_with_digest(),
            parsed.ncomps(),
            None,
            &interest
        ));
        interest.min_suffix_components = Some(2);
        assert!(!content_matches_interest(
            parsed.flat_with_digest(),
            parsed.ncomps(),
            None,
            &interest
        ));
        interest.min_suffix_components = None;
        interest.max_suffix_components = Some(0);
        assert!(!content_matches_interest(
            parsed.flat_with_digest(),
            parsed.ncomps(),
            None,
            &interest
        ));
    }

    #[test]
    fn lifetime_normalization() {
        assert_eq!(normalize_lifetime(1), MIN_LIFETIME);
        assert_eq!(normalize_lifetime(513), 1024);
        assert_eq!(normalize_lifetime(u32::MAX), MAX_LIFETIME);
        // already on the 1/8 s grid
        assert_eq!(normalize_lifetime(4096), 4096);
    }
}
