//! End-to-end scenarios driven against a synchronous engine.
//!
//! Test faces are channel-backed, so every byte the daemon emits can be
//! inspected, and time is advanced manually through the scheduler.

use bytes::Bytes;
use rust_ccnd_fwd::face::{flags, Face, FaceOutput};
use rust_ccnd_fwd::fib::forw;
use rust_ccnd_fwd::pit::pfi;
use rust_ccnd_fwd::sendq::{CQ_NORMAL, CQ_N};
use rust_ccnd_fwd::{Ccnd, Config};
use rust_ccnd_common::mgmt::{ForwardingEntry, StatusResponse};
use rust_ccnd_common::packet::{
    ContentObject, Interest, WireContentObject, WireInterest,
};
use rust_ccnd_common::FlatName;
use tokio::sync::mpsc;

fn engine() -> Ccnd {
    Ccnd::new(Config::default())
}

fn add_face(ccnd: &mut Ccnd, fl: u32) -> (u32, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let faceid = ccnd
        .enroll_face(Face::new(fl, None, FaceOutput::Channel(tx)))
        .unwrap();
    (faceid, rx)
}

fn recv_all(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
    let mut out = Vec::new();
    while let Ok(b) = rx.try_recv() {
        out.push(b);
    }
    out
}

fn name(uri: &str) -> FlatName {
    FlatName::from_uri(uri).unwrap()
}

fn content(uri: &str, body: &[u8], freshness: u32) -> Bytes {
    ContentObject::new(name(uri), body.to_vec())
        .with_freshness_seconds(freshness)
        .encode()
}

/// The quiescent-point invariant: face counters match the PFI flags.
fn check_counters(ccnd: &Ccnd) {
    for faceid in ccnd.faces.faceids() {
        let mut pending = 0;
        let mut outstanding = 0;
        for serial in ccnd.pit.serials() {
            let ie = ccnd.pit.entry(serial).unwrap();
            for p in &ie.pfl {
                if p.faceid != faceid {
                    continue;
                }
                if p.has(pfi::PENDING) {
                    pending += 1;
                }
                if p.has(pfi::UPENDING) {
                    outstanding += 1;
                }
                assert!(
                    p.has(pfi::DNSTREAM) != p.has(pfi::UPSTREAM),
                    "exactly one direction bit per PFI"
                );
                assert!(!p.has(pfi::ATTENTION), "ATTENTION cleared after UPDATE");
            }
        }
        let face = ccnd.faces.get(faceid).unwrap();
        assert_eq!(face.pending_interests, pending, "face {faceid} pending");
        assert_eq!(
            face.outstanding_interests, outstanding,
            "face {faceid} outstanding"
        );
    }
}

#[test]
fn exact_hit_answers_from_store() {
    let mut ccnd = engine();
    let (feeder, _frx) = add_face(&mut ccnd, flags::GG | flags::LOCAL);
    let (app, mut arx) = add_face(&mut ccnd, flags::GG | flags::LOCAL);

    ccnd.process_input(feeder, content("/a/b", b"payload", 60));
    assert_eq!(ccnd.cs.len(), 1);

    ccnd.process_input(app, Interest::new(name("/a/b")).encode());
    assert!(ccnd.pit.is_empty(), "store hit creates no PIT entry");

    ccnd.advance(2);
    let got = recv_all(&mut arx);
    assert_eq!(got.len(), 1);
    let obj = WireContentObject::parse(got[0].clone()).unwrap();
    assert_eq!(obj.object.name, name("/a/b"));
    assert_eq!(&obj.object.content[..], b"payload");
    assert_eq!(ccnd.cs.len(), 1, "store still holds the object");
    check_counters(&ccnd);
}

#[test]
fn miss_creates_pit_and_forwards() {
    let mut ccnd = engine();
    let (up, mut uprx) = add_face(&mut ccnd, flags::STREAM);
    let (app, _arx) = add_face(&mut ccnd, flags::STREAM);
    ccnd.reg_prefix(&name("/a"), up, Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
        .unwrap();

    let interest = Interest::new(name("/a/x")).with_nonce(vec![1, 2, 3, 4]);
    ccnd.process_input(app, interest.encode());

    assert_eq!(ccnd.pit.len(), 1);
    let serial = ccnd.pit.serials()[0];
    {
        let ie = ccnd.pit.entry(serial).unwrap();
        let down = ie.pfi_get(app, pfi::DNSTREAM).unwrap();
        assert!(down.has(pfi::PENDING));
        assert!(ie.pfi_get(up, pfi::UPSTREAM).is_some());
    }
    assert_eq!(ccnd.faces.get(app).unwrap().pending_interests, 1);

    // the propagation pass transmits upstream
    ccnd.advance(2);
    let sent = recv_all(&mut uprx);
    assert_eq!(sent.len(), 1);
    let fwd = WireInterest::parse(sent[0].clone()).unwrap();
    assert_eq!(fwd.interest.name, name("/a/x"));
    assert_eq!(fwd.interest.nonce.as_deref(), Some(&[1u8, 2, 3, 4][..]));
    {
        let ie = ccnd.pit.entry(serial).unwrap();
        assert!(ie.pfi_get(up, pfi::UPSTREAM).unwrap().has(pfi::UPENDING));
    }
    assert_eq!(ccnd.faces.get(up).unwrap().outstanding_interests, 1);
    check_counters(&ccnd);
}

#[test]
fn duplicate_nonce_is_dropped() {
    let mut ccnd = engine();
    let (up, mut uprx) = add_face(&mut ccnd, flags::STREAM);
    let (b, _brx) = add_face(&mut ccnd, flags::STREAM);
    let (c, _crx) = add_face(&mut ccnd, flags::STREAM);
    ccnd.reg_prefix(&name("/a"), up, Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
        .unwrap();

    let interest = Interest::new(name("/a/x")).with_nonce(vec![7, 7, 7, 7]);
    ccnd.process_input(b, interest.encode());
    ccnd.advance(2);
    assert_eq!(recv_all(&mut uprx).len(), 1, "first copy is forwarded");

    let dropped_before = ccnd.metrics.interests_dropped.value();
    ccnd.process_input(c, interest.encode());
    assert_eq!(ccnd.metrics.interests_dropped.value(), dropped_before + 1);

    let serial = ccnd.pit.serials()[0];
    let ie = ccnd.pit.entry(serial).unwrap();
    assert!(
        ie.pfi_get(c, pfi::DNSTREAM).is_none(),
        "duplicate adds no downstream for the second face"
    );
    assert_eq!(ccnd.faces.get(c).unwrap().pending_interests, 0);
    check_counters(&ccnd);
}

#[test]
fn multicast_coalesce_suppresses_own_copy() {
    let mut ccnd = engine();
    let (feeder, _frx) = add_face(&mut ccnd, flags::GG | flags::LOCAL);
    let (mcast, _mrx) = add_face(&mut ccnd, flags::DGRAM | flags::MCAST | flags::PERMANENT);

    let wire = content("/a/b", b"payload", 60);
    ccnd.process_input(feeder, wire.clone());
    let cookie = ccnd
        .cs
        .match_interest(&Interest::new(name("/a/b")), ccnd.sec)
        .unwrap();

    assert!(ccnd.face_send_queue_insert(mcast, cookie));
    assert_eq!(ccnd.cs.entry(cookie).unwrap().refs, 1);
    {
        let q = ccnd.faces.get(mcast).unwrap().q[CQ_NORMAL].as_ref().unwrap();
        assert!(q.contains(cookie));
    }

    // before the jittered send fires, the peer's copy arrives
    ccnd.process_input(mcast, wire);
    assert_eq!(
        ccnd.cs.entry(cookie).unwrap().refs,
        0,
        "queued reference released"
    );
    let q = ccnd.faces.get(mcast).unwrap().q[CQ_NORMAL].as_ref().unwrap();
    assert!(!q.contains(cookie), "queued cookie zeroed in place");
    assert_eq!(q.send_queue, vec![0]);
    check_counters(&ccnd);
}

#[test]
fn scope_one_from_untrusted_face_stays_local() {
    let mut ccnd = engine();
    let (feeder, _frx) = add_face(&mut ccnd, flags::GG | flags::LOCAL);
    let (up, mut uprx) = add_face(&mut ccnd, flags::STREAM);
    let (b, mut brx) = add_face(&mut ccnd, flags::STREAM);
    ccnd.reg_prefix(&name("/a"), up, Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
        .unwrap();
    ccnd.process_input(feeder, content("/a/b", b"payload", 60));

    // a store hit is still served
    ccnd.process_input(b, Interest::new(name("/a/b")).with_scope(1).encode());
    ccnd.advance(2);
    assert_eq!(recv_all(&mut brx).len(), 1);

    // a miss selects no outbound faces
    ccnd.process_input(b, Interest::new(name("/a/zzz")).with_scope(1).encode());
    assert_eq!(ccnd.pit.len(), 1);
    let serial = ccnd.pit.serials()[0];
    let ie = ccnd.pit.entry(serial).unwrap();
    assert!(
        ie.pfl.iter().all(|p| !p.has(pfi::UPSTREAM)),
        "scope 1 from a non-GG face reaches no upstreams"
    );
    ccnd.advance(10);
    assert!(recv_all(&mut uprx).is_empty());
    check_counters(&ccnd);
}

#[test]
fn unanswered_interest_is_reaped_after_lifetime() {
    let mut ccnd = engine();
    let (up, mut uprx) = add_face(&mut ccnd, flags::STREAM);
    let (app, _arx) = add_face(&mut ccnd, flags::STREAM);
    ccnd.reg_prefix(&name("/a"), up, Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
        .unwrap();

    // one-second lifetime, wire units of 1/4096 s
    let interest = Interest::new(name("/a/x"))
        .with_nonce(vec![5, 5, 5, 5])
        .with_lifetime(4096);
    ccnd.process_input(app, interest.encode());
    ccnd.advance(2);
    assert_eq!(recv_all(&mut uprx).len(), 1);
    assert_eq!(ccnd.pit.len(), 1);

    // no reply: after the lifetime plus scheduler slack, the entry is gone
    ccnd.advance(1500);
    assert!(ccnd.pit.is_empty());
    assert_eq!(ccnd.faces.get(app).unwrap().pending_interests, 0);
    assert_eq!(ccnd.faces.get(up).unwrap().outstanding_interests, 0);
    check_counters(&ccnd);
}

#[test]
fn content_satisfies_all_pending_downstreams() {
    let mut ccnd = engine();
    let (up, mut uprx) = add_face(&mut ccnd, flags::STREAM);
    let (b, mut brx) = add_face(&mut ccnd, flags::STREAM);
    let (c, mut crx) = add_face(&mut ccnd, flags::STREAM);
    ccnd.reg_prefix(&name("/a"), up, Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
        .unwrap();

    ccnd.process_input(
        b,
        Interest::new(name("/a/x")).with_nonce(vec![1, 1, 1, 1]).encode(),
    );
    ccnd.process_input(
        c,
        Interest::new(name("/a/x")).with_nonce(vec![2, 2, 2, 2]).encode(),
    );
    ccnd.advance(2);
    assert!(!recv_all(&mut uprx).is_empty());

    ccnd.process_input(up, content("/a/x", b"answer", 30));
    assert!(ccnd.pit.is_empty(), "satisfaction consumes the entry");
    ccnd.advance(5);
    assert_eq!(recv_all(&mut brx).len(), 1);
    assert_eq!(recv_all(&mut crx).len(), 1);
    assert!(
        recv_all(&mut uprx).is_empty(),
        "the arrival face gets no echo"
    );
    assert_eq!(ccnd.cs.len(), 1, "satisfying content is cached");
    check_counters(&ccnd);
}

#[test]
fn queue_references_match_occurrences() {
    let mut ccnd = engine();
    let (feeder, _frx) = add_face(&mut ccnd, flags::GG | flags::LOCAL);
    let (x, _xrx) = add_face(&mut ccnd, flags::STREAM | flags::PERMANENT);
    let (y, _yrx) = add_face(&mut ccnd, flags::DGRAM | flags::MCAST | flags::PERMANENT);

    ccnd.process_input(feeder, content("/a/b", b"payload", 60));
    let cookie = ccnd
        .cs
        .match_interest(&Interest::new(name("/a/b")), ccnd.sec)
        .unwrap();
    assert!(ccnd.face_send_queue_insert(x, cookie));
    assert!(ccnd.face_send_queue_insert(y, cookie));
    // set-like: a second insert on the same face adds no reference
    assert!(ccnd.face_send_queue_insert(y, cookie));

    let mut occurrences = 0;
    for faceid in [x, y] {
        let face = ccnd.faces.get(faceid).unwrap();
        for class in 0..CQ_N {
            if let Some(q) = &face.q[class] {
                occurrences += q.send_queue.iter().filter(|&&c| c == cookie).count() as u32;
            }
        }
    }
    assert_eq!(occurrences, 2);
    assert!(ccnd.cs.entry(cookie).unwrap().refs >= occurrences);
}

/* ---------------------------------------------------------------- *
 * Management round trips
 * ---------------------------------------------------------------- */

fn mgmt_interest(ccnd: &Ccnd, verb: &str, body: &[u8]) -> Bytes {
    let mut n = ccnd.control_prefix();
    n.push(verb.as_bytes());
    n.push(body);
    Interest::new(n).encode()
}

#[test]
fn selfreg_round_trip() {
    let mut ccnd = engine();
    let (app, mut arx) = add_face(&mut ccnd, flags::GG | flags::LOCAL);

    let fe = ForwardingEntry {
        action: Some("selfreg".into()),
        ccndid: Some(ccnd.ccndid.to_vec()),
        prefix: name("/example"),
        faceid: None,
        flags: Some(forw::ACTIVE | forw::CHILD_INHERIT),
        lifetime: Some(300),
    };
    ccnd.process_input(app, mgmt_interest(&ccnd, "selfreg", &fe.encode()));
    ccnd.advance(3);

    let got = recv_all(&mut arx);
    assert_eq!(got.len(), 1, "reply content arrives on the requesting face");
    let obj = WireContentObject::parse(got[0].clone()).unwrap();
    assert_eq!(obj.object.content_type, None, "not a NACK");
    let echo = ForwardingEntry::decode(&obj.object.content).unwrap();
    assert_eq!(echo.faceid, Some(app));
    assert_eq!(echo.lifetime, Some(300));

    // the FIB now carries the prefix toward the requester
    let npe = ccnd.prefixes.lookup_exact(&name("/example")).unwrap();
    let node = ccnd.prefixes.node(npe).unwrap();
    assert!(node.forwarding.iter().any(|f| f.faceid == app));
}

#[test]
fn management_requires_authorization() {
    let mut ccnd = engine();
    let (outsider, mut orx) = add_face(&mut ccnd, flags::STREAM);

    let fe = ForwardingEntry {
        action: Some("unreg".into()),
        ccndid: Some(ccnd.ccndid.to_vec()),
        prefix: name("/example"),
        faceid: Some(1),
        flags: None,
        lifetime: None,
    };
    ccnd.process_input(outsider, mgmt_interest(&ccnd, "unreg", &fe.encode()));
    ccnd.advance(3);

    let got = recv_all(&mut orx);
    assert_eq!(got.len(), 1);
    let obj = WireContentObject::parse(got[0].clone()).unwrap();
    assert_eq!(
        obj.object.content_type,
        Some(rust_ccnd_fwd::mgmt::CONTENT_TYPE_NACK)
    );
    let status = StatusResponse::decode(&obj.object.content).unwrap();
    assert_eq!(status.code, 430);
}

#[test]
fn wrong_ccndid_nacks_531() {
    let mut ccnd = engine();
    let (app, mut arx) = add_face(&mut ccnd, flags::GG | flags::LOCAL);

    // the body names no daemon at all
    let fe = ForwardingEntry {
        action: Some("selfreg".into()),
        ccndid: None,
        prefix: name("/example"),
        faceid: None,
        flags: None,
        lifetime: None,
    };
    ccnd.process_input(app, mgmt_interest(&ccnd, "selfreg", &fe.encode()));
    ccnd.advance(3);

    let got = recv_all(&mut arx);
    assert_eq!(got.len(), 1);
    let obj = WireContentObject::parse(got[0].clone()).unwrap();
    let status = StatusResponse::decode(&obj.object.content).unwrap();
    assert_eq!(status.code, 531);
}
