//! Management request and reply bodies.
//!
//! These ride inside the Content of management exchanges: a request names a
//! verb under the daemon's control prefix and carries one of these encoded
//! bodies; the reply echoes the (updated) body, or a [`StatusResponse`]
//! NACK on failure.

use crate::error::Error;
use crate::name::FlatName;
use crate::tlv::{self, TlvElement};
use bytes::{Bytes, BytesMut};

/// Description of a face for `newface` / `destroyface`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaceInstance {
    pub action: Option<String>,
    pub ccndid: Option<Vec<u8>>,
    pub faceid: Option<u32>,
    /// 6 for TCP, 17 for UDP.
    pub ipproto: Option<u8>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub lifetime: Option<u32>,
}

impl FaceInstance {
    pub fn encode(&self) -> Bytes {
        let mut inner = BytesMut::new();
        if let Some(a) = &self.action {
            TlvElement::new(tlv::TLV_ACTION, Bytes::from(a.clone().into_bytes()))
                .encode(&mut inner);
        }
        if let Some(id) = &self.ccndid {
            TlvElement::new(tlv::TLV_CCNDID, Bytes::from(id.clone())).encode(&mut inner);
        }
        if let Some(f) = self.faceid {
            tlv::encode_uint(tlv::TLV_FACE_ID, f as u64, &mut inner);
        }
        if let Some(p) = self.ipproto {
            tlv::encode_uint(tlv::TLV_IP_PROTO, p as u64, &mut inner);
        }
        if let Some(h) = &self.host {
            TlvElement::new(tlv::TLV_HOST, Bytes::from(h.clone().into_bytes())).encode(&mut inner);
        }
        if let Some(p) = self.port {
            tlv::encode_uint(tlv::TLV_PORT, p as u64, &mut inner);
        }
        if let Some(l) = self.lifetime {
            tlv::encode_uint(tlv::TLV_LIFETIME_SECONDS, l as u64, &mut inner);
        }
        let mut out = BytesMut::new();
        TlvElement::new(tlv::TLV_FACE_INSTANCE, inner.freeze()).encode(&mut out);
        out.freeze()
    }

    pub fn decode(bytes: &Bytes) -> Result<Self, Error> {
        let outer = decode_body(bytes, tlv::TLV_FACE_INSTANCE)?;
        let mut fi = FaceInstance::default();
        let mut buf = outer;
        while !buf.is_empty() {
            let e = TlvElement::decode(&mut buf)?;
            match e.tlv_type {
                tlv::TLV_ACTION => fi.action = Some(string_value(&e)?),
                tlv::TLV_CCNDID => fi.ccndid = Some(e.value.to_vec()),
                tlv::TLV_FACE_ID => fi.faceid = Some(e.as_uint()? as u32),
                tlv::TLV_IP_PROTO => fi.ipproto = Some(e.as_uint()? as u8),
                tlv::TLV_HOST => fi.host = Some(string_value(&e)?),
                tlv::TLV_PORT => fi.port = Some(e.as_uint()? as u16),
                tlv::TLV_LIFETIME_SECONDS => fi.lifetime = Some(e.as_uint()? as u32),
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected element {other} in FaceInstance"
                    )))
                }
            }
        }
        Ok(fi)
    }
}

/// Description of a FIB entry for `prefixreg` / `selfreg` / `unreg`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingEntry {
    pub action: Option<String>,
    pub ccndid: Option<Vec<u8>>,
    pub prefix: FlatName,
    pub faceid: Option<u32>,
    pub flags: Option<u32>,
    pub lifetime: Option<u32>,
}

impl ForwardingEntry {
    pub fn encode(&self) -> Bytes {
        let mut inner = BytesMut::new();
        if let Some(a) = &self.action {
            TlvElement::new(tlv::TLV_ACTION, Bytes::from(a.clone().into_bytes()))
                .encode(&mut inner);
        }
        if let Some(id) = &self.ccndid {
            TlvElement::new(tlv::TLV_CCNDID, Bytes::from(id.clone())).encode(&mut inner);
        }
        TlvElement::new(tlv::TLV_NAME, Bytes::from(self.prefix.as_flat().to_vec()))
            .encode(&mut inner);
        if let Some(f) = self.faceid {
            tlv::encode_uint(tlv::TLV_FACE_ID, f as u64, &mut inner);
        }
        if let Some(f) = self.flags {
            tlv::encode_uint(tlv::TLV_FORWARDING_FLAGS, f as u64, &mut inner);
        }
        if let Some(l) = self.lifetime {
            tlv::encode_uint(tlv::TLV_LIFETIME_SECONDS, l as u64, &mut inner);
        }
        let mut out = BytesMut::new();
        TlvElement::new(tlv::TLV_FORWARDING_ENTRY, inner.freeze()).encode(&mut out);
        out.freeze()
    }

    pub fn decode(bytes: &Bytes) -> Result<Self, Error> {
        let outer = decode_body(bytes, tlv::TLV_FORWARDING_ENTRY)?;
        let mut fe = ForwardingEntry::default();
        let mut buf = outer;
        while !buf.is_empty() {
            let e = TlvElement::decode(&mut buf)?;
            match e.tlv_type {
                tlv::TLV_ACTION => fe.action = Some(string_value(&e)?),
                tlv::TLV_CCNDID => fe.ccndid = Some(e.value.to_vec()),
                tlv::TLV_NAME => fe.prefix = FlatName::from_flat(e.value.to_vec())?,
                tlv::TLV_FACE_ID => fe.faceid = Some(e.as_uint()? as u32),
                tlv::TLV_FORWARDING_FLAGS => fe.flags = Some(e.as_uint()? as u32),
                tlv::TLV_LIFETIME_SECONDS => fe.lifetime = Some(e.as_uint()? as u32),
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected element {other} in ForwardingEntry"
                    )))
                }
            }
        }
        Ok(fe)
    }
}

/// Strategy attachment for `setstrategy` / `getstrategy` / `removestrategy`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategySelection {
    pub ccndid: Option<Vec<u8>>,
    pub prefix: FlatName,
    pub strategyid: Option<String>,
    pub parameters: Option<String>,
}

impl StrategySelection {
    pub fn encode(&self) -> Bytes {
        let mut inner = BytesMut::new();
        if let Some(id) = &self.ccndid {
            TlvElement::new(tlv::TLV_CCNDID, Bytes::from(id.clone())).encode(&mut inner);
        }
        TlvElement::new(tlv::TLV_NAME, Bytes::from(self.prefix.as_flat().to_vec()))
            .encode(&mut inner);
        if let Some(s) = &self.strategyid {
            TlvElement::new(tlv::TLV_STRATEGY_ID, Bytes::from(s.clone().into_bytes()))
                .encode(&mut inner);
        }
        if let Some(p) = &self.parameters {
            TlvElement::new(tlv::TLV_STRATEGY_PARAMETERS, Bytes::from(p.clone().into_bytes()))
                .encode(&mut inner);
        }
        let mut out = BytesMut::new();
        TlvElement::new(tlv::TLV_STRATEGY_SELECTION, inner.freeze()).encode(&mut out);
        out.freeze()
    }

    pub fn decode(bytes: &Bytes) -> Result<Self, Error> {
        let outer = decode_body(bytes, tlv::TLV_STRATEGY_SELECTION)?;
        let mut ss = StrategySelection::default();
        let mut buf = outer;
        while !buf.is_empty() {
            let e = TlvElement::decode(&mut buf)?;
            match e.tlv_type {
                tlv::TLV_CCNDID => ss.ccndid = Some(e.value.to_vec()),
                tlv::TLV_NAME => ss.prefix = FlatName::from_flat(e.value.to_vec())?,
                tlv::TLV_STRATEGY_ID => ss.strategyid = Some(string_value(&e)?),
                tlv::TLV_STRATEGY_PARAMETERS => ss.parameters = Some(string_value(&e)?),
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected element {other} in StrategySelection"
                    )))
                }
            }
        }
        Ok(ss)
    }
}

/// NACK body: a 3-digit status code and human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub code: u16,
    pub text: String,
}

impl StatusResponse {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut inner = BytesMut::new();
        tlv::encode_uint(tlv::TLV_STATUS_CODE, self.code as u64, &mut inner);
        TlvElement::new(tlv::TLV_STATUS_TEXT, Bytes::from(self.text.clone().into_bytes()))
            .encode(&mut inner);
        let mut out = BytesMut::new();
        TlvElement::new(tlv::TLV_STATUS_RESPONSE, inner.freeze()).encode(&mut out);
        out.freeze()
    }

    pub fn decode(bytes: &Bytes) -> Result<Self, Error> {
        let outer = decode_body(bytes, tlv::TLV_STATUS_RESPONSE)?;
        let mut code = 0u16;
        let mut text = String::new();
        let mut buf = outer;
        while !buf.is_empty() {
            let e = TlvElement::decode(&mut buf)?;
            match e.tlv_type {
                tlv::TLV_STATUS_CODE => code = e.as_uint()? as u16,
                tlv::TLV_STATUS_TEXT => text = string_value(&e)?,
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected element {other} in StatusResponse"
                    )))
                }
            }
        }
        Ok(Self { code, text })
    }
}

fn decode_body(bytes: &Bytes, expected: u8) -> Result<Bytes, Error> {
    let mut buf = bytes.clone();
    let e = TlvElement::decode(&mut buf)?;
    if e.tlv_type != expected {
        return Err(Error::Parse(format!(
            "expected body type {expected}, got {}",
            e.tlv_type
        )));
    }
    Ok(e.value)
}

fn string_value(e: &TlvElement) -> Result<String, Error> {
    String::from_utf8(e.value.to_vec())
        .map_err(|_| Error::Parse("non-UTF8 string element".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_instance_roundtrip() {
        let fi = FaceInstance {
            action: Some("newface".into()),
            ccndid: Some(vec![0xAB; 8]),
            faceid: None,
            ipproto: Some(17),
            host: Some("203.0.113.7".into()),
            port: Some(9695),
            lifetime: None,
        };
        let wire = fi.encode();
        assert_eq!(FaceInstance::decode(&wire).unwrap(), fi);
    }

    #[test]
    fn forwarding_entry_roundtrip() {
        let fe = ForwardingEntry {
            action: Some("prefixreg".into()),
            ccndid: None,
            prefix: FlatName::from_uri("/example").unwrap(),
            faceid: Some(7),
            flags: Some(0x3),
            lifetime: Some(300),
        };
        let wire = fe.encode();
        assert_eq!(ForwardingEntry::decode(&wire).unwrap(), fe);
    }

    #[test]
    fn status_response_roundtrip() {
        let sr = StatusResponse::new(430, "not authorized");
        let wire = sr.encode();
        assert_eq!(StatusResponse::decode(&wire).unwrap(), sr);
    }
}
