//! The internal client: management verbs served on face 0.
//!
//! Requests arrive as Interests named `/ccnx/<ccndid>/<verb>/<body>`,
//! where the body component carries an encoded request. Replies are
//! ContentObjects named by the full request name; failures come back as
//! a NACK-typed StatusResponse with a 3-digit code.

use crate::engine::{Ccnd, IoAction};
use crate::face::{flags, Face, FaceOutput};
use crate::fib::forw;
use bytes::Bytes;
use log::{debug, warn};
use rust_ccnd_common::mgmt::{FaceInstance, ForwardingEntry, StatusResponse, StrategySelection};
use rust_ccnd_common::packet::{ContentObject, WireInterest};
use rust_ccnd_common::{Error, FlatName};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// ContentType marking a NACK reply.
pub const CONTENT_TYPE_NACK: u32 = 2;

/// Registration lifetime clamp, seconds.
const REG_LIFETIME_MIN: u32 = 300;
const REG_LIFETIME_MAX: u32 = 2_000_000_000;

/// Handle one request that reached face 0. `from` is the face the
/// Interest arrived on (the one being authorized). Returns the encoded
/// reply ContentObject, or None for requests that deserve no reply.
pub fn handle_request(ccnd: &mut Ccnd, wire: &Bytes, from: u32) -> Option<Bytes> {
    let wi = WireInterest::parse(wire.clone()).ok()?;
    let name = &wi.interest.name;
    if name.count() < 3 {
        return None;
    }
    if name.get(0)? != b"ccnx" {
        return None;
    }
    let verb = String::from_utf8(name.get(2)?.to_vec()).ok()?;
    let body = name.get(3).map(|b| Bytes::from(b.to_vec()));
    let result = dispatch(ccnd, &verb, body, from);

    let content = match result {
        Ok(body) => ContentObject::new(name.clone(), body).with_freshness_seconds(1),
        Err(e) => {
            let code = e.admin_code();
            let reason = match &e {
                Error::Admin { reason, .. } => reason.clone(),
                other => other.to_string(),
            };
            warn!("mgmt {} from face {}: {} {}", verb, from, code, reason);
            let mut nack = ContentObject::new(
                name.clone(),
                StatusResponse::new(code, reason).encode(),
            )
            .with_freshness_seconds(1);
            nack.content_type = Some(CONTENT_TYPE_NACK);
            nack
        }
    };
    Some(content.encode())
}

fn dispatch(ccnd: &mut Ccnd, verb: &str, body: Option<Bytes>, from: u32) -> Result<Bytes, Error> {
    let body = body.ok_or(Error::Admin {
        code: 501,
        reason: "missing request body".into(),
    })?;
    match verb {
        "newface" => req_newface(ccnd, &body, from),
        "destroyface" => req_destroyface(ccnd, &body, from),
        "prefixreg" => req_prefixreg(ccnd, &body, from, false),
        "selfreg" => req_prefixreg(ccnd, &body, from, true),
        "unreg" => req_unreg(ccnd, &body, from),
        "setstrategy" => req_setstrategy(ccnd, &body, from),
        "getstrategy" => req_getstrategy(ccnd, &body, from),
        "removestrategy" => req_removestrategy(ccnd, &body, from),
        _ => Err(Error::Admin {
            code: 501,
            reason: format!("unknown verb {verb}"),
        }),
    }
}

fn require_gg(ccnd: &Ccnd, from: u32) -> Result<(), Error> {
    match ccnd.faces.get(from) {
        Some(f) if f.has(flags::GG) => Ok(()),
        _ => Err(Error::Admin {
            code: 430,
            reason: "not authorized".into(),
        }),
    }
}

fn require_regok(ccnd: &Ccnd, from: u32) -> Result<(), Error> {
    match ccnd.faces.get(from) {
        Some(f) if f.has(flags::GG | flags::REGOK) => Ok(()),
        _ => Err(Error::Admin {
            code: 430,
            reason: "not authorized".into(),
        }),
    }
}

fn parse_err(code: u16) -> impl FnOnce(Error) -> Error {
    move |e| Error::Admin {
        code,
        reason: e.to_string(),
    }
}

/// Request bodies must name this daemon.
fn check_ccndid(ccnd: &Ccnd, id: Option<&Vec<u8>>) -> Result<(), Error> {
    match id {
        Some(id) if id.as_slice() == ccnd.ccndid.as_slice() => Ok(()),
        _ => Err(Error::Admin {
            code: 531,
            reason: "missing ccndid".into(),
        }),
    }
}

/* ---------------------------------------------------------------- *
 * Faces
 * ---------------------------------------------------------------- */

fn req_newface(ccnd: &mut Ccnd, body: &Bytes, from: u32) -> Result<Bytes, Error> {
    require_gg(ccnd, from)?;
    let mut fi = FaceInstance::decode(body).map_err(parse_err(501))?;
    check_ccndid(ccnd, fi.ccndid.as_ref())?;
    let ipproto = fi.ipproto.ok_or(param_err("missing ipproto"))?;
    if ipproto != 6 && ipproto != 17 {
        return Err(param_err("ipproto must be TCP or UDP"));
    }
    let host = fi.host.clone().ok_or(param_err("missing host"))?;
    let port = fi.port.ok_or(param_err("missing port"))?;
    let ip: IpAddr = host
        .parse()
        .map_err(|_| Error::Admin {
            code: 501,
            reason: "syntax error in address".into(),
        })?;
    let addr = SocketAddr::new(ip, port);

    let faceid = if ipproto == 17 {
        if ip.is_multicast() {
            setup_multicast(ccnd, addr)?
        } else {
            let socket = match ip {
                IpAddr::V4(_) => ccnd.udp4.clone(),
                IpAddr::V6(_) => ccnd.udp6.clone(),
            }
            .ok_or(Error::Admin {
                code: 450,
                reason: "no datagram listener bound".into(),
            })?;
            ccnd.dgram_source(&socket, addr, 0)
                .map_err(|_| op_failed())?
        }
    } else {
        // stream connection completes in the background
        let face = Face::new(
            flags::STREAM | flags::CONNECTING,
            Some(addr),
            FaceOutput::Discard,
        );
        let faceid = ccnd.enroll_face(face).map_err(|_| op_failed())?;
        ccnd.push_io_action(IoAction::ConnectStream { faceid, addr });
        faceid
    };

    let connecting = ccnd
        .faces
        .get_mut(faceid)
        .map(|f| {
            f.flags |= flags::PERMANENT;
            f.has(flags::CONNECTING)
        })
        .ok_or(op_failed())?;
    fi.action = None;
    fi.ccndid = Some(ccnd.ccndid.to_vec());
    fi.faceid = Some(faceid);
    // a short lifetime is a clue that the connection is not complete yet
    fi.lifetime = Some(if connecting { 1 } else { 0x7FFF_FFFF });
    Ok(fi.encode())
}

fn setup_multicast(ccnd: &mut Ccnd, addr: SocketAddr) -> Result<u32, Error> {
    let mcast_err = |e: std::io::Error| {
        debug!("multicast setup: {}", e);
        Error::Admin {
            code: 453,
            reason: "could not set up multicast".into(),
        }
    };
    let std_sock = match addr {
        SocketAddr::V4(v4) => {
            let s = std::net::UdpSocket::bind(("0.0.0.0", v4.port())).map_err(mcast_err)?;
            s.join_multicast_v4(v4.ip(), &std::net::Ipv4Addr::UNSPECIFIED)
                .map_err(mcast_err)?;
            s
        }
        SocketAddr::V6(v6) => {
            let s = std::net::UdpSocket::bind(("::", v6.port())).map_err(mcast_err)?;
            s.join_multicast_v6(v6.ip(), 0).map_err(mcast_err)?;
            s
        }
    };
    std_sock.set_nonblocking(true).map_err(mcast_err)?;
    let socket = Arc::new(
        tokio::net::UdpSocket::from_std(std_sock).map_err(mcast_err)?,
    );
    let face = Face::new(
        flags::DGRAM | flags::MCAST,
        Some(addr),
        FaceOutput::Dgram {
            socket: Arc::clone(&socket),
            peer: addr,
        },
    );
    let faceid = ccnd.enroll_face(face).map_err(|_| op_failed())?;
    ccnd.push_io_action(IoAction::RecvDgram { faceid, socket });
    Ok(faceid)
}

fn req_destroyface(ccnd: &mut Ccnd, body: &Bytes, from: u32) -> Result<Bytes, Error> {
    require_gg(ccnd, from)?;
    let mut fi = FaceInstance::decode(body).map_err(parse_err(501))?;
    check_ccndid(ccnd, fi.ccndid.as_ref())?;
    let faceid = fi.faceid.ok_or(param_err("missing faceid"))?;
    ccnd.destroy_face(faceid).map_err(|_| op_failed())?;
    fi.action = None;
    fi.ccndid = Some(ccnd.ccndid.to_vec());
    Ok(fi.encode())
}

/* ---------------------------------------------------------------- *
 * Prefix registration
 * ---------------------------------------------------------------- */

fn req_prefixreg(ccnd: &mut Ccnd, body: &Bytes, from: u32, selfreg: bool) -> Result<Bytes, Error> {
    require_regok(ccnd, from)?;
    let mut fe = ForwardingEntry::decode(body).map_err(parse_err(501))?;
    check_ccndid(ccnd, fe.ccndid.as_ref())?;
    let faceid = if selfreg {
        from
    } else {
        match fe.faceid {
            Some(f) => f,
            None => from,
        }
    };
    let lifetime = fe
        .lifetime
        .unwrap_or(REG_LIFETIME_MAX)
        .clamp(REG_LIFETIME_MIN, REG_LIFETIME_MAX);
    let res = ccnd
        .reg_prefix(&fe.prefix, faceid, fe.flags, lifetime as i32)
        .map_err(|e| match e {
            Error::Admin { code, reason } => Error::Admin { code, reason },
            _ => op_failed(),
        })?;
    fe.action = None;
    fe.ccndid = Some(ccnd.ccndid.to_vec());
    fe.faceid = Some(faceid);
    fe.flags = Some(res & forw::PUBMASK);
    fe.lifetime = Some(lifetime);
    Ok(fe.encode())
}

fn req_unreg(ccnd: &mut Ccnd, body: &Bytes, from: u32) -> Result<Bytes, Error> {
    require_gg(ccnd, from)?;
    let mut fe = ForwardingEntry::decode(body).map_err(parse_err(501))?;
    check_ccndid(ccnd, fe.ccndid.as_ref())?;
    let faceid = fe.faceid.ok_or(param_err("missing faceid"))?;
    if !ccnd.prefixes.unregister(&fe.prefix, faceid) {
        return Err(op_failed());
    }
    fe.action = None;
    fe.ccndid = Some(ccnd.ccndid.to_vec());
    Ok(fe.encode())
}

/* ---------------------------------------------------------------- *
 * Strategy
 * ---------------------------------------------------------------- */

fn req_setstrategy(ccnd: &mut Ccnd, body: &Bytes, from: u32) -> Result<Bytes, Error> {
    require_regok(ccnd, from)?;
    let ss = StrategySelection::decode(body).map_err(parse_err(501))?;
    check_ccndid(ccnd, ss.ccndid.as_ref())?;
    let id = ss.strategyid.clone().ok_or(param_err("missing strategy id"))?;
    let si = crate::strategy::StrategyInstance::create(&id, ss.parameters.as_deref())?;
    let npe = ccnd.prefixes.seek(&ss.prefix);
    if let Some(node) = ccnd.prefixes.node_mut(npe) {
        node.strategy = Some(si);
    }
    strategy_reply(ccnd, &ss.prefix)
}

fn req_getstrategy(ccnd: &mut Ccnd, body: &Bytes, from: u32) -> Result<Bytes, Error> {
    require_regok(ccnd, from)?;
    let ss = StrategySelection::decode(body).map_err(parse_err(501))?;
    check_ccndid(ccnd, ss.ccndid.as_ref())?;
    strategy_reply(ccnd, &ss.prefix)
}

fn req_removestrategy(ccnd: &mut Ccnd, body: &Bytes, from: u32) -> Result<Bytes, Error> {
    require_regok(ccnd, from)?;
    let ss = StrategySelection::decode(body).map_err(parse_err(501))?;
    check_ccndid(ccnd, ss.ccndid.as_ref())?;
    if let Some(npe) = ccnd.prefixes.lookup_exact(&ss.prefix) {
        if let Some(node) = ccnd.prefixes.node_mut(npe) {
            node.strategy = None;
        }
    }
    strategy_reply(ccnd, &ss.prefix)
}

/// Report the strategy in effect at `prefix`, trimmed to the node where
/// the governing instance actually lives.
fn strategy_reply(ccnd: &mut Ccnd, prefix: &FlatName) -> Result<Bytes, Error> {
    let npe = ccnd.prefixes.lookup_longest(prefix);
    let (owner, si) = ccnd.prefixes.effective_strategy(npe);
    let effective_prefix = ccnd
        .prefixes
        .node(owner)
        .map(|n| FlatName::from_flat(n.flat.clone()))
        .transpose()
        .map_err(|_| op_failed())?
        .unwrap_or_default();
    let reply = StrategySelection {
        ccndid: Some(ccnd.ccndid.to_vec()),
        prefix: effective_prefix,
        strategyid: Some(si.class.id().to_string()),
        parameters: if si.parameters.is_empty() {
            None
        } else {
            Some(si.parameters)
        },
    };
    Ok(reply.encode())
}

fn param_err(reason: &str) -> Error {
    Error::Admin {
        code: 504,
        reason: reason.into(),
    }
}

fn op_failed() -> Error {
    Error::Admin {
        code: 450,
        reason: "operation failed".into(),
    }
}
