//! The asynchronous shell around the engine.
//!
//! Listeners, per-face reader/writer tasks, and signal handling live
//! here; everything funnels into one channel so the engine stays single
//! owner of its tables. The engine's timers are pumped between channel
//! receipts.

use crate::config::{Config, MAX_MESSAGE_BYTES};
use crate::engine::{Ccnd, IoAction};
use crate::face::{flags, Face, FaceOutput};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use rust_ccnd_common::tlv;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixListener, UnixStream};
use tokio::sync::mpsc;

/// Messages from the socket tasks to the engine loop.
pub enum IoMsg {
    /// One framed message arrived on an established face.
    Input { faceid: u32, msg: Bytes },
    /// The face's transport is gone or misbehaved.
    FaceGone { faceid: u32 },
    /// A datagram arrived on a bound socket.
    Dgram {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        data: Bytes,
    },
    /// A stream connection was accepted on a listener.
    AcceptedUnix(UnixStream),
    AcceptedTcp(TcpStream, SocketAddr),
    /// An outbound connection initiated by management completed.
    Connected { faceid: u32, stream: TcpStream },
    ConnectFailed { faceid: u32 },
}

/// Run the daemon until shutdown.
pub async fn run(mut ccnd: Ccnd) -> Result<()> {
    let cfg = ccnd.cfg.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<IoMsg>();

    bind_local_listener(&cfg, &tx)?;
    ccnd.comm_file = Some(cfg.sockname.clone());
    bind_wildcards(&mut ccnd, &cfg, &tx)?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    info!("ccnd listening on {}", cfg.sockname.display());

    while ccnd.running {
        ccnd.sync_clock();
        ccnd.run_due();
        for action in ccnd.take_io_actions() {
            start_io_action(action, &tx);
        }
        let sleep_ticks = ccnd
            .next_deadline_ticks()
            .map(|d| d.saturating_sub(ccnd.now_ticks))
            .unwrap_or(1000)
            .min(1000);
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(m) => handle_msg(&mut ccnd, m, &tx),
                None => break,
            },
            _ = tokio::time::sleep(Duration::from_millis(sleep_ticks.max(1))) => {}
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sighup.recv() => break,
        }
    }

    let _ = std::fs::remove_file(&cfg.sockname);
    info!("ccnd exiting");
    Ok(())
}

fn handle_msg(ccnd: &mut Ccnd, msg: IoMsg, tx: &mpsc::UnboundedSender<IoMsg>) {
    match msg {
        IoMsg::Input { faceid, msg } => ccnd.process_input(faceid, msg),
        IoMsg::FaceGone { faceid } => {
            let _ = ccnd.destroy_face(faceid);
        }
        IoMsg::Dgram { socket, peer, data } => {
            match ccnd.dgram_source(&socket, peer, 0) {
                Ok(faceid) => deliver_datagram(ccnd, faceid, data),
                Err(e) => debug!("datagram face for {}: {}", peer, e),
            }
        }
        IoMsg::AcceptedUnix(stream) => {
            let face = Face::new(
                flags::STREAM | flags::LOCAL | flags::UNDECIDED,
                None,
                FaceOutput::Discard,
            );
            match ccnd.enroll_face(face) {
                Ok(faceid) => attach_unix(ccnd, faceid, stream, tx.clone()),
                Err(e) => warn!("accept: {}", e),
            }
        }
        IoMsg::AcceptedTcp(stream, peer) => {
            let mut fl = flags::STREAM | flags::UNDECIDED;
            fl |= if peer.is_ipv6() {
                flags::INET6
            } else {
                flags::INET
            };
            if peer.ip().is_loopback() {
                fl |= flags::LOOPBACK;
            }
            let face = Face::new(fl, Some(peer), FaceOutput::Discard);
            match ccnd.enroll_face(face) {
                Ok(faceid) => attach_tcp(ccnd, faceid, stream, tx.clone()),
                Err(e) => warn!("accept: {}", e),
            }
        }
        IoMsg::Connected { faceid, stream } => {
            if let Some(face) = ccnd.faces.get_mut(faceid) {
                face.flags &= !flags::CONNECTING;
            }
            attach_tcp(ccnd, faceid, stream, tx.clone());
        }
        IoMsg::ConnectFailed { faceid } => {
            let _ = ccnd.destroy_face(faceid);
        }
    }
}

/// A datagram may carry several messages back to back.
fn deliver_datagram(ccnd: &mut Ccnd, faceid: u32, data: Bytes) {
    let mut rest = data;
    while !rest.is_empty() {
        match tlv::frame_size(&rest) {
            Ok(Some(n)) => {
                let one = rest.split_to(n);
                ccnd.process_input(faceid, one);
            }
            Ok(None) | Err(_) => {
                // framing violation on a datagram: drop the buffer
                debug!("dropping malformed datagram tail on face {}", faceid);
                break;
            }
        }
    }
}

fn start_io_action(action: IoAction, tx: &mpsc::UnboundedSender<IoMsg>) {
    match action {
        IoAction::ConnectStream { faceid, addr } => {
            let tx = tx.clone();
            tokio::spawn(async move {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        let _ = tx.send(IoMsg::Connected { faceid, stream });
                    }
                    Err(e) => {
                        debug!("connect {} for face {}: {}", addr, faceid, e);
                        let _ = tx.send(IoMsg::ConnectFailed { faceid });
                    }
                }
            });
        }
        IoAction::RecvDgram { faceid, socket } => {
            let _ = faceid;
            spawn_dgram_recv(socket, tx.clone());
        }
    }
}

/* ---------------------------------------------------------------- *
 * Listeners
 * ---------------------------------------------------------------- */

fn bind_local_listener(cfg: &Config, tx: &mpsc::UnboundedSender<IoMsg>) -> Result<()> {
    let path = &cfg.sockname;
    if path.exists() {
        info!("unlinking old {}", path.display());
        let _ = std::fs::remove_file(path);
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding {}", path.display()))?;
    let tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if tx.send(IoMsg::AcceptedUnix(stream)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("unix accept: {}", e);
                    break;
                }
            }
        }
    });
    Ok(())
}

fn bind_wildcards(ccnd: &mut Ccnd, cfg: &Config, tx: &mpsc::UnboundedSender<IoMsg>) -> Result<()> {
    // CCND_LISTEN_ON replaces the wildcards when present
    let addrs: Vec<SocketAddr> = if cfg.listen_on.is_empty() {
        vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, cfg.port)),
        ]
    } else {
        cfg.listen_on
            .iter()
            .map(|&ip| SocketAddr::new(ip, cfg.port))
            .collect()
    };
    for &addr in &addrs {
        match bind_tcp(addr) {
            Ok(listener) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                if tx.send(IoMsg::AcceptedTcp(stream, peer)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("tcp accept: {}", e);
                                break;
                            }
                        }
                    }
                });
            }
            Err(e) => warn!("tcp bind {}: {}", addr, e),
        }
        match bind_udp(addr) {
            Ok(socket) => {
                let socket = Arc::new(socket);
                if addr.is_ipv6() {
                    if ccnd.udp6.is_none() {
                        ccnd.udp6 = Some(Arc::clone(&socket));
                    }
                } else if ccnd.udp4.is_none() {
                    ccnd.udp4 = Some(Arc::clone(&socket));
                }
                spawn_dgram_recv(socket, tx.clone());
            }
            Err(e) => warn!("udp bind {}: {}", addr, e),
        }
    }
    Ok(())
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(42)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn spawn_dgram_recv(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<IoMsg>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    let data = Bytes::from(buf[..n].to_vec());
                    if tx
                        .send(IoMsg::Dgram {
                            socket: Arc::clone(&socket),
                            peer,
                            data,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("udp recv: {}", e);
                    break;
                }
            }
        }
    });
}

/* ---------------------------------------------------------------- *
 * Stream faces
 * ---------------------------------------------------------------- */

fn attach_unix(ccnd: &mut Ccnd, faceid: u32, stream: UnixStream, tx: mpsc::UnboundedSender<IoMsg>) {
    let (rd, wr) = stream.into_split();
    spawn_stream_reader(faceid, rd, tx);
    spawn_stream_writer(ccnd, faceid, wr);
}

fn attach_tcp(ccnd: &mut Ccnd, faceid: u32, stream: TcpStream, tx: mpsc::UnboundedSender<IoMsg>) {
    let (rd, wr) = stream.into_split();
    spawn_stream_reader(faceid, rd, tx);
    spawn_stream_writer(ccnd, faceid, wr);
}

fn spawn_stream_reader<R>(faceid: u32, mut rd: R, tx: mpsc::UnboundedSender<IoMsg>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            match rd.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(IoMsg::FaceGone { faceid });
                    break;
                }
                Ok(_) => loop {
                    match tlv::frame_size(&buf) {
                        Ok(Some(n)) if n <= MAX_MESSAGE_BYTES => {
                            let msg = buf.split_to(n).freeze();
                            if tx.send(IoMsg::Input { faceid, msg }).is_err() {
                                return;
                            }
                        }
                        Ok(Some(_)) | Err(_) => {
                            // protocol violation on a stream closes the face
                            let _ = tx.send(IoMsg::FaceGone { faceid });
                            return;
                        }
                        Ok(None) => break,
                    }
                },
                Err(e) => {
                    debug!("read on face {}: {}", faceid, e);
                    let _ = tx.send(IoMsg::FaceGone { faceid });
                    break;
                }
            }
        }
    });
}

fn spawn_stream_writer<W>(ccnd: &mut Ccnd, faceid: u32, mut wr: W)
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (tx_bytes, mut rx_bytes) = mpsc::unbounded_channel::<Bytes>();
    if let Some(face) = ccnd.faces.get_mut(faceid) {
        face.output = FaceOutput::Channel(tx_bytes);
    }
    tokio::spawn(async move {
        while let Some(chunk) = rx_bytes.recv().await {
            if let Err(e) = wr.write_all(&chunk).await {
                // broken pipe latches NOSEND via the dropped channel
                debug!("write on face {}: {}", faceid, e);
                break;
            }
        }
        let _ = wr.shutdown().await;
    });
}
