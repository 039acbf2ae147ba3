//! Daemon-level round trip over the real unix-domain listener.

use bytes::BytesMut;
use rust_ccnd_fwd::fib::forw;
use rust_ccnd_fwd::{io, Ccnd, Config};
use rust_ccnd_common::mgmt::ForwardingEntry;
use rust_ccnd_common::packet::{Interest, WireContentObject};
use rust_ccnd_common::{tlv, FlatName};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[tokio::test]
async fn selfreg_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("ccnd.sock");
    let mut cfg = Config::default();
    cfg.sockname = sock.clone();
    cfg.port = 0; // ephemeral wildcard binds keep tests independent

    let ccnd = Ccnd::new(cfg);
    let ccndid = ccnd.ccndid;
    let daemon = tokio::spawn(io::run(ccnd));

    // wait for the listener to appear
    for _ in 0..200 {
        if sock.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut stream = UnixStream::connect(&sock).await.unwrap();

    let fe = ForwardingEntry {
        action: Some("selfreg".into()),
        ccndid: Some(ccndid.to_vec()),
        prefix: FlatName::from_uri("/example").unwrap(),
        faceid: None,
        flags: Some(forw::ACTIVE | forw::CHILD_INHERIT),
        lifetime: Some(300),
    };
    let mut name = FlatName::new();
    name.push(b"ccnx");
    name.push(&ccndid);
    name.push(b"selfreg");
    name.push(&fe.encode());
    stream
        .write_all(&Interest::new(name).encode())
        .await
        .unwrap();

    // read one framed reply
    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = BytesMut::new();
        loop {
            stream.read_buf(&mut buf).await.unwrap();
            if let Ok(Some(n)) = tlv::frame_size(&buf) {
                return buf.split_to(n).freeze();
            }
        }
    })
    .await
    .expect("daemon answers within the timeout");

    let obj = WireContentObject::parse(reply).unwrap();
    assert_eq!(obj.object.content_type, None, "not a NACK");
    let echo = ForwardingEntry::decode(&obj.object.content).unwrap();
    assert!(echo.faceid.is_some());
    assert_eq!(echo.lifetime, Some(300));

    daemon.abort();
}
