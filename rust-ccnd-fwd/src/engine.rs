//! The forwarding engine.
//!
//! One `Ccnd` owns every table. All methods are synchronous; the I/O
//! shell feeds framed messages in and pumps the timer queue. Nothing in
//! here blocks, and nothing here is fatal to the process.

use crate::config::Config;
use crate::cs::{ContentStore, InsertOutcome};
use crate::face::{flags, Face, FaceOutput, FaceTable, NO_FACEID};
use crate::fib::{forw, NamePrefixTable, NpeId};
use crate::nametree::Cookie;
use crate::nonce::{NonceTable, NonceVerdict};
use crate::pit::{pfi, Pit, TYPICAL_NONCE_SIZE};
use crate::sched::{Event, Scheduler};
use crate::sendq::{
    choose_content_delay_class, randomize_content_delay, ContentQueue, BURST_BUDGET_NSEC,
    BURST_MAX, CQ_N,
};
use crate::strategy::{StrategyClass, StrategyOp};
use bytes::Bytes;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_ccnd_common::metrics::CcndMetrics;
use rust_ccnd_common::packet::{
    encode_sequence_number, wrap_pdu, WireContentObject, WireInterest,
};
use rust_ccnd_common::time::{ticks_from_lifetime, ticks_from_micros, TickClock, WTHZ, WT_START};
use rust_ccnd_common::tlv;
use rust_ccnd_common::{Error, FlatName, WTime};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Default Interest lifetime in seconds, which also paces the reaper.
pub const INTEREST_LIFETIME_SEC: u32 = 4;

/// Name used by stuffed link-check interests.
pub const NEIGHBOR_URI: &str = "ccnx:/ccnx/neighborhood";

/// Requests the engine cannot satisfy synchronously, handed to the shell.
#[derive(Debug)]
pub enum IoAction {
    /// Open a stream connection for a face created CONNECTING.
    ConnectStream { faceid: u32, addr: SocketAddr },
    /// Start a receive loop on a freshly joined multicast socket.
    RecvDgram { faceid: u32, socket: Arc<tokio::net::UdpSocket> },
}

pub struct Ccnd {
    pub cfg: Config,
    clock: TickClock,
    /// Ticks since start, refreshed once per loop iteration.
    pub now_ticks: u64,
    pub wtnow: WTime,
    /// Whole seconds since start; the staleness clock.
    pub sec: u32,

    pub faces: FaceTable,
    pub cs: ContentStore,
    pub prefixes: NamePrefixTable,
    pub pit: Pit,
    pub nonces: NonceTable,
    pub sched: Scheduler,
    pub metrics: Arc<CcndMetrics>,

    pub ccndid: [u8; 32],
    pub face0: u32,
    pub running: bool,

    rng: StdRng,
    /// Downstream face relevant to a request reaching the internal client.
    interest_faceid: u32,
    /// Interests delivered to face 0, awaiting the internal client.
    internal_queue: VecDeque<(Bytes, u32)>,
    /// Work for the I/O shell.
    io_actions: VecDeque<IoAction>,
    /// Datagram faces by peer address.
    dgram_by_addr: HashMap<SocketAddr, u32>,
    /// The wildcard datagram sockets, once the shell has bound them.
    pub udp4: Option<Arc<tokio::net::UdpSocket>>,
    pub udp6: Option<Arc<tokio::net::UdpSocket>>,
    /// Unlinked socket path whose disappearance stops the daemon.
    pub comm_file: Option<PathBuf>,
}

impl Ccnd {
    pub fn new(cfg: Config) -> Self {
        let mut rng = StdRng::from_entropy();
        let ccndid: [u8; 32] = rng.gen();
        let cs = ContentStore::new(cfg.capacity, cfg.tts_default, cfg.tts_limit);
        let mut ccnd = Self {
            clock: TickClock::new(),
            now_ticks: 0,
            wtnow: WTime(WT_START),
            sec: 0,
            faces: FaceTable::new(),
            cs,
            prefixes: NamePrefixTable::new(),
            pit: Pit::new(),
            nonces: NonceTable::new(),
            sched: Scheduler::new(),
            metrics: Arc::new(CcndMetrics::new()),
            ccndid,
            face0: NO_FACEID,
            running: true,
            rng,
            interest_faceid: NO_FACEID,
            internal_queue: VecDeque::new(),
            io_actions: VecDeque::new(),
            dgram_by_addr: HashMap::new(),
            udp4: None,
            udp6: None,
            comm_file: None,
            cfg,
        };
        let face0 = ccnd
            .faces
            .enroll(Face::new(flags::GG, None, FaceOutput::Internal))
            .expect("empty table accepts face 0");
        ccnd.face0 = face0;
        let ctl = ccnd.control_prefix();
        ccnd.prefixes
            .register(&ctl, face0, Some(forw::ACTIVE | forw::CHILD_INHERIT), i32::MAX)
            .expect("control prefix registration");
        ccnd.sched
            .schedule(0, ticks_from_micros(55_000), Event::Reap);
        ccnd.sched
            .schedule(0, crate::fib::FWU_SECS as u32 * WTHZ, Event::AgeForwarding);
        ccnd
    }

    /// `/ccnx/<ccndid>`: the management namespace served by face 0.
    pub fn control_prefix(&self) -> FlatName {
        let mut name = FlatName::new();
        name.push(b"ccnx");
        name.push(&self.ccndid);
        name
    }

    /* ------------------------------------------------------------ *
     * Clock and timers
     * ------------------------------------------------------------ */

    fn set_now(&mut self, ticks: u64) {
        self.now_ticks = ticks;
        self.wtnow = WTime(WT_START.wrapping_add(ticks as u32));
        self.sec = (ticks / WTHZ as u64) as u32;
    }

    /// Refresh the clock from wall time; the I/O shell calls this once
    /// per loop iteration.
    pub fn sync_clock(&mut self) {
        self.set_now(self.clock.ticks());
    }

    /// Advance the clock manually and run what comes due. Embedding and
    /// tests drive time through here.
    pub fn advance(&mut self, ticks: u64) {
        let target = self.now_ticks + ticks;
        // step through intermediate deadlines so event order is honest
        while let Some(d) = self.sched.next_deadline() {
            if d > target {
                break;
            }
            self.set_now(d);
            self.run_due();
        }
        self.set_now(target);
        self.run_due();
    }

    pub fn next_deadline_ticks(&mut self) -> Option<u64> {
        self.sched.next_deadline()
    }

    /// Run every due timer, then let the internal client catch up.
    pub fn run_due(&mut self) {
        for event in self.sched.pop_due(self.now_ticks) {
            self.handle_event(event);
        }
        self.drain_internal();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Propagate(serial) => self.do_propagate(serial),
            Event::StrategyTimer(serial, op) => {
                if let Some(ie) = self.pit.entry_mut(serial) {
                    ie.stev = None;
                }
                self.strategy_callout(serial, op, NO_FACEID);
            }
            Event::ContentSender(faceid, class) => self.content_sender(faceid, class),
            Event::Reap => {
                self.reap();
                self.sched.schedule(
                    self.now_ticks,
                    2 * INTEREST_LIFETIME_SEC * WTHZ,
                    Event::Reap,
                );
            }
            Event::AgeForwarding => {
                self.prefixes.age_forwarding(&self.faces);
                self.sched.schedule(
                    self.now_ticks,
                    crate::fib::FWU_SECS as u32 * WTHZ,
                    Event::AgeForwarding,
                );
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Faces
     * ------------------------------------------------------------ */

    pub fn enroll_face(&mut self, face: Face) -> Result<u32, Error> {
        let undecided = face.has(flags::UNDECIDED);
        let faceid = self.faces.enroll(face)?;
        if let Some(addr) = self.faces.get(faceid).and_then(|f| f.addr) {
            if self.faces.get(faceid).map_or(false, |f| f.has(flags::DGRAM)) {
                self.dgram_by_addr.insert(addr, faceid);
            }
        }
        self.link_state_init(faceid);
        if !undecided {
            self.register_new_face(faceid);
        }
        Ok(faceid)
    }

    /// First-contact housekeeping once a face is known to speak the
    /// protocol: apply the auto-registration list to non-local faces.
    fn register_new_face(&mut self, faceid: u32) {
        let Some(face) = self.faces.get(faceid) else {
            return;
        };
        if faceid == self.face0 || face.has(flags::GG | flags::LOCAL | flags::PASSIVE) {
            return;
        }
        let autoreg = self.cfg.autoreg.clone();
        for prefix in autoreg {
            let res = self.reg_prefix(
                &prefix,
                faceid,
                Some(forw::ACTIVE | forw::CHILD_INHERIT),
                0x7FFF_FFFF,
            );
            if let Err(e) = res {
                warn!("autoreg {} on face {}: {}", prefix.to_uri(), faceid, e);
            }
        }
    }

    /// Start the link-probe exchange on a fresh unicast datagram face.
    fn link_state_init(&mut self, faceid: u32) {
        let Some(face) = self.faces.get_mut(faceid) else {
            return;
        };
        let check = flags::DGRAM | flags::MCAST | flags::GG | flags::SEQOK | flags::PASSIVE;
        if face.flags & check != flags::DGRAM {
            return;
        }
        // send one sequence number to see if the other side wants to play
        face.pktseq = self.rng.gen::<u16>() as u64;
        face.flags |= flags::SEQPROBE;
    }

    pub fn destroy_face(&mut self, faceid: u32) -> Result<(), Error> {
        let Some(mut face) = self.faces.release(faceid) else {
            return Err(Error::FaceGone(faceid));
        };
        for class in 0..CQ_N {
            if let Some(q) = face.q[class].take() {
                if let Some(h) = q.sender {
                    self.sched.cancel(h);
                }
                for cookie in q.send_queue {
                    if cookie != 0 {
                        self.cs.release(cookie);
                    }
                }
            }
        }
        if let Some(addr) = face.addr {
            if self.dgram_by_addr.get(&addr) == Some(&faceid) {
                self.dgram_by_addr.remove(&addr);
            }
        }
        // forwarding entries referring to this face die lazily; make the
        // caches rebuild
        self.prefixes.forward_to_gen += 1;
        info!("destroyed face {}", faceid);
        Ok(())
    }

    /// Face for a datagram source address, created on first sight.
    pub fn dgram_source(
        &mut self,
        socket: &Arc<tokio::net::UdpSocket>,
        peer: SocketAddr,
        extra_flags: u32,
    ) -> Result<u32, Error> {
        if let Some(&faceid) = self.dgram_by_addr.get(&peer) {
            if self.faces.get(faceid).is_some() {
                return Ok(faceid);
            }
        }
        let mut fl = flags::DGRAM | extra_flags;
        fl |= if peer.is_ipv6() {
            flags::INET6
        } else {
            flags::INET
        };
        if peer.ip().is_loopback() {
            fl |= flags::LOOPBACK;
        }
        let face = Face::new(
            fl,
            Some(peer),
            FaceOutput::Dgram {
                socket: Arc::clone(socket),
                peer,
            },
        );
        self.enroll_face(face)
    }

    pub fn take_io_actions(&mut self) -> Vec<IoAction> {
        self.io_actions.drain(..).collect()
    }

    pub(crate) fn push_io_action(&mut self, action: IoAction) {
        self.io_actions.push_back(action);
    }

    pub(crate) fn random_bytes(&mut self, n: usize) -> Vec<u8> {
        (0..n).map(|_| self.rng.gen()).collect()
    }

    /* ------------------------------------------------------------ *
     * Input dispatch
     * ------------------------------------------------------------ */

    /// Entry point for one framed message received on a face.
    pub fn process_input(&mut self, faceid: u32, msg: Bytes) {
        let Some(face) = self.faces.get_mut(faceid) else {
            return;
        };
        face.recvcount += 1;
        face.bytes_in += msg.len() as u64;
        self.metrics.bytes_received.add(msg.len() as u64);
        if face.has(flags::UNDECIDED) {
            face.flags &= !flags::UNDECIDED;
            if face.has(flags::LOOPBACK | flags::LOCAL) {
                face.flags |= flags::GG;
            }
            // first proof that this face speaks the protocol
            self.register_new_face(faceid);
        }
        self.dispatch_message(faceid, msg, true);
        self.drain_internal();
    }

    fn dispatch_message(&mut self, faceid: u32, msg: Bytes, pdu_ok: bool) {
        let Some(&kind) = msg.first() else {
            return;
        };
        match kind {
            tlv::TLV_CCN_PDU if pdu_ok => {
                if let Some(face) = self.faces.get_mut(faceid) {
                    face.flags |= flags::LINK;
                }
                // unwrap and process the grouped messages
                let mut rd = msg.clone();
                let Ok(e) = tlv::TlvElement::decode(&mut rd) else {
                    self.metrics.interests_dropped.increment();
                    return;
                };
                let mut inner = e.value;
                while !inner.is_empty() {
                    match tlv::frame_size(&inner) {
                        Ok(Some(n)) => {
                            let one = inner.split_to(n);
                            self.dispatch_message(faceid, one, false);
                        }
                        _ => break,
                    }
                }
            }
            tlv::TLV_INTEREST => self.process_incoming_interest(faceid, msg),
            tlv::TLV_CONTENT_OBJECT => self.process_incoming_content(faceid, msg),
            tlv::TLV_SEQUENCE_NUMBER => self.process_incoming_link_message(faceid, msg),
            other => {
                debug!("discarding unknown message type {} on face {}", other, faceid);
            }
        }
    }

    fn process_incoming_link_message(&mut self, faceid: u32, msg: Bytes) {
        let mut rd = msg;
        let Ok(e) = tlv::TlvElement::decode(&mut rd) else {
            return;
        };
        let Ok(s) = e.as_uint() else { return };
        let Some(face) = self.faces.get_mut(faceid) else {
            return;
        };
        // a unicast peer that sends sequence numbers may receive them too
        let check = flags::DGRAM | flags::MCAST | flags::SEQOK;
        if face.flags & check == flags::DGRAM {
            face.flags |= flags::SEQOK;
        }
        if face.rrun == 0 {
            face.rseq = s;
            face.rrun = 1;
            return;
        }
        if s == face.rseq + 1 {
            face.rseq = s;
            if face.rrun < 255 {
                face.rrun += 1;
            }
            return;
        }
        if s > face.rseq && s - face.rseq < 255 {
            debug!("seq_gap {} {} to {}", faceid, face.rseq, s);
            face.rseq = s;
            face.rrun = 1;
            return;
        }
        if s <= face.rseq {
            if face.rseq - s < face.rrun as u64 {
                debug!("seq_dup {} {}", faceid, s);
                return;
            }
            if face.rseq - s < 255 {
                // received out of order
                debug!("seq_ooo {} {}", faceid, s);
                if s == face.rseq - face.rrun as u64 {
                    face.rrun += 1;
                    return;
                }
            }
        }
        face.rseq = s;
        face.rrun = 1;
    }

    /* ------------------------------------------------------------ *
     * Interest path
     * ------------------------------------------------------------ */

    fn process_incoming_interest(&mut self, faceid: u32, msg: Bytes) {
        let wi = match WireInterest::parse(msg) {
            Ok(wi) => wi,
            Err(e) => {
                debug!("error parsing Interest from face {}: {}", faceid, e);
                self.metrics.interests_dropped.increment();
                return;
            }
        };
        if let Some(face) = self.faces.get_mut(faceid) {
            face.interests_in += 1;
        } else {
            return;
        }
        // Scope limits are enforced by the outbound filter; a scoped
        // interest can still be answered from the store.
        self.metrics.interests_accepted.increment();

        if let Some(nonce) = wi.interest.nonce.clone() {
            if self.nonces.observe(&nonce, faceid, self.wtnow) == NonceVerdict::Duplicate {
                debug!("interest_dupnonce on face {}", faceid);
                self.metrics.interests_dropped.increment();
                return;
            }
        }

        let key = wi.pit_key();
        if let Some(serial) = self.pit.lookup(&key) {
            // already in the PIT, so the store cannot have satisfied it
            let npe = self.pit.entry(serial).map(|ie| ie.npe).expect("live entry");
            if self.drop_nonlocal_interest(npe, faceid) {
                return;
            }
            self.propagate_interest(faceid, &wi, npe);
            return;
        }

        let npe = self.prefixes.seek(&wi.interest.name);
        self.metrics.nameprefix_count.set(self.prefixes.len() as u64);
        if self.drop_nonlocal_interest(npe, faceid) {
            return;
        }

        let mut matched = false;
        if wi.interest.answer_from_cs() {
            if let Some(cookie) = self.cs.match_interest(&wi.interest, self.sec) {
                self.metrics.cs_hits.increment();
                // already planning to send it on this face?
                let planned = self.faces.get(faceid).map_or(false, |f| {
                    f.q.iter()
                        .flatten()
                        .any(|q| q.contains(cookie))
                });
                if !planned {
                    self.face_send_queue_insert(faceid, cookie);
                    // any other matched interests need to be consumed, too
                    self.match_interests(cookie, Some(faceid), None);
                }
                if wi.interest.marks_stale() {
                    self.cs.mark_stale(cookie, self.sec);
                }
                matched = true;
            } else {
                self.metrics.cs_misses.increment();
            }
        }
        if !matched && !wi.interest.marks_stale() {
            self.propagate_interest(faceid, &wi, npe);
        }
        self.metrics.cs_size.set(self.cs.len() as u64);
    }

    /// An Interest for a LOCAL namespace from an untrusted face is dropped.
    fn drop_nonlocal_interest(&mut self, npe: NpeId, faceid: u32) -> bool {
        let local = self
            .prefixes
            .node(npe)
            .map_or(false, |n| n.flags & forw::LOCAL != 0);
        let gg = self.faces.get(faceid).map_or(false, |f| f.has(flags::GG));
        if local && !gg {
            debug!("nonlocal interest dropped on face {}", faceid);
            self.metrics.interests_dropped.increment();
            true
        } else {
            false
        }
    }

    /// PIT insert for an arriving Interest, per-face item bookkeeping,
    /// and scheduling of the propagation pass.
    fn propagate_interest(&mut self, faceid: u32, wi: &WireInterest, npe: NpeId) {
        let now = self.wtnow;
        let key = wi.pit_key();
        let (serial, is_new) = self.pit.seek(&key, &wi.interest, &wi.wire, npe, now);
        if is_new {
            if let Some(node) = self.prefixes.node_mut(npe) {
                node.ies.push(serial);
            }
            self.metrics.pit_size.set(self.pit.len() as u64);
        }

        let from = self.faces.get(faceid).map(|f| (faceid, f.flags));
        let outbound =
            self.prefixes
                .outbound_faces(from, &wi.interest, npe, &self.faces);

        let (nonce, generated) = match wi.interest.nonce.clone() {
            Some(n) => (n, false),
            None => {
                // no nonce; make one before going on
                let n = self.random_bytes(TYPICAL_NONCE_SIZE);
                self.nonces.observe(&n, faceid, now);
                (n, true)
            }
        };

        let lifetime =
            rust_ccnd_common::packet::normalize_lifetime(wi.interest.lifetime_or_default());
        let expiry = now + ticks_from_lifetime(lifetime);

        let mut newly_pending = false;
        let mut refresh_callout = false;
        {
            let ie = self.pit.entry_mut(serial).expect("entry just sought");
            let down_idx = {
                let p = ie.pfi_seek(faceid, pfi::DNSTREAM, now);
                p.set_nonce(&nonce);
                p.renewed = now;
                p.expiry = expiry;
                ie.pfl
                    .iter()
                    .position(|p| p.faceid == faceid && p.has(pfi::DNSTREAM))
                    .expect("just sought")
            };
            if generated || ie.nonce_unique(down_idx) {
                ie.renewed = now;
                ie.renewals += 1;
                let p = &mut ie.pfl[down_idx];
                if !p.has(pfi::PENDING) {
                    p.flags |= pfi::PENDING;
                    newly_pending = true;
                }
                refresh_callout = !is_new;
            } else {
                // nonce seen on another item of this entry; feed strategy
                // data but do not forward
                ie.pfl[down_idx].flags |= pfi::SUPDATA;
            }
            for up in &outbound {
                let p = ie.pfi_seek(*up, pfi::UPSTREAM, now);
                if !p.has(pfi::UPENDING) {
                    p.expiry = now;
                    p.flags &= !pfi::UPHUNGRY;
                }
            }
        }
        if newly_pending {
            if let Some(face) = self.faces.get_mut(faceid) {
                face.pending_interests += 1;
            }
        }
        if refresh_callout {
            self.strategy_callout(serial, StrategyOp::Refresh, faceid);
        }
        if is_new {
            self.send_tap_interests(serial);
            self.strategy_callout(serial, StrategyOp::First, faceid);
        }
        self.ie_schedule_propagate(serial);
    }

    /// Send observation copies of a fresh interest to the tap faces.
    fn send_tap_interests(&mut self, serial: u64) {
        let Some(ie) = self.pit.entry(serial) else { return };
        let fib_node = self.prefixes.nearest_forwarding(ie.npe);
        let Some(tap) = self
            .prefixes
            .node(fib_node)
            .and_then(|n| n.tap.clone())
        else {
            return;
        };
        // there should be just one downstream at this point
        let Some(x_faceid) = ie
            .pfl
            .iter()
            .find(|p| p.has(pfi::DNSTREAM) && p.has(pfi::PENDING))
            .map(|p| p.faceid)
        else {
            return;
        };
        let ups: Vec<u32> = ie
            .pfl
            .iter()
            .filter(|p| p.has(pfi::UPSTREAM) && tap.contains(&p.faceid))
            .map(|p| p.faceid)
            .collect();
        for up in ups {
            self.send_interest(serial, x_faceid, up);
        }
    }

    /// Schedule (or advance) the entry's propagation event for the
    /// earliest PFI expiry, with a six-second lateness horizon.
    fn ie_schedule_propagate(&mut self, serial: u64) {
        let horizon = 6 * WTHZ;
        let base = WTime(self.wtnow.0.wrapping_sub(horizon));
        let Some(ie) = self.pit.entry(serial) else { return };
        let mut mn = 600 * WTHZ + horizon;
        for p in &ie.pfl {
            let delta = p.expiry.0.wrapping_sub(base.0);
            if delta < mn {
                mn = delta;
            }
        }
        let delay = mn.saturating_sub(horizon);
        let prior = ie.ev;
        if let Some(h) = prior {
            self.sched.cancel(h);
        }
        let h = self
            .sched
            .schedule(self.now_ticks, delay, Event::Propagate(serial));
        if let Some(ie) = self.pit.entry_mut(serial) {
            ie.ev = Some(h);
        }
    }

    /// Remove the `(faceid, direction)` item, restoring face counters.
    fn pfi_destroy(&mut self, serial: u64, faceid: u32, direction: u32) {
        let Some(ie) = self.pit.entry_mut(serial) else { return };
        let Some(idx) = ie
            .pfl
            .iter()
            .position(|p| p.faceid == faceid && p.has(direction))
        else {
            return;
        };
        let p = ie.pfl.remove(idx);
        let pending = p.has(pfi::PENDING);
        let upending = p.has(pfi::UPENDING);
        if let Some(face) = self.faces.get_mut(faceid) {
            if pending {
                face.pending_interests = face.pending_interests.saturating_sub(1);
            }
            if upending {
                face.outstanding_interests = face.outstanding_interests.saturating_sub(1);
            }
        }
    }

    /// Execute the next timed action on a propagating interest.
    fn do_propagate(&mut self, serial: u64) {
        let now = self.wtnow;
        {
            let Some(ie) = self.pit.entry_mut(serial) else { return };
            ie.ev = None;
        }

        // expire downstreams
        let expired: Vec<u32> = self
            .pit
            .entry(serial)
            .map(|ie| {
                ie.pfl
                    .iter()
                    .filter(|p| p.has(pfi::DNSTREAM) && p.expiry.delta(now) <= 0)
                    .map(|p| p.faceid)
                    .collect()
            })
            .unwrap_or_default();
        for faceid in expired {
            self.strategy_callout(serial, StrategyOp::ExpDn, faceid);
            debug!("interest_expiry for face {}", faceid);
            self.pfi_destroy(serial, faceid, pfi::DNSTREAM);
        }

        // survey the remaining downstreams; keep the 2 longest-lasting
        // as eligible nonce sources
        let mut mn: u32 = 600 * WTHZ;
        let mut pending = 0usize;
        let mut d: Vec<(u32, WTime)> = Vec::new();
        if let Some(ie) = self.pit.entry(serial) {
            for p in &ie.pfl {
                if !p.has(pfi::DNSTREAM) || !p.has(pfi::PENDING) {
                    continue;
                }
                let rem = p.expiry.delta(now).max(0) as u32;
                mn = mn.min(rem);
                pending += 1;
                // a downstream about to expire is not worth feeding
                let life = p.expiry.delta(p.renewed).max(0) as u32;
                if rem * 8 <= life {
                    continue;
                }
                d.push((p.faceid, p.expiry));
                d.sort_by(|a, b| b.1.delta(a.1).cmp(&0));
                d.truncate(2);
            }
        } else {
            return;
        }

        // check the upstreams
        let upstreams: Vec<u32> = self
            .pit
            .entry(serial)
            .map(|ie| {
                ie.pfl
                    .iter()
                    .filter(|p| p.has(pfi::UPSTREAM))
                    .map(|p| p.faceid)
                    .collect()
            })
            .unwrap_or_default();
        let mut changes = 0;
        for faceid in upstreams {
            let face_state = self
                .faces
                .get(faceid)
                .map(|f| (f.has(flags::NOSEND), f.has(flags::DC), f.has(flags::DGRAM), f.recvcount));
            let Some((nosend, dc, dgram, recvcount)) = face_state else {
                self.pfi_destroy(serial, faceid, pfi::UPSTREAM);
                continue;
            };
            if nosend {
                self.pfi_destroy(serial, faceid, pfi::UPSTREAM);
                continue;
            }
            let mut expup = false;
            {
                let Some(ie) = self.pit.entry_mut(serial) else { return };
                let Some(p) = ie
                    .pfl
                    .iter_mut()
                    .find(|p| p.faceid == faceid && p.has(pfi::UPSTREAM))
                else {
                    continue;
                };
                if dc && !p.has(pfi::DCFACE) {
                    // extra delay before bothering a direct-control face
                    p.expiry += (60 * WTHZ + 999) / 1000;
                    p.flags |= pfi::DCFACE;
                }
                if (now + 1).delta(p.expiry) < 0 {
                    // not expired yet
                    let rem = p.expiry.delta(now).max(0) as u32;
                    mn = mn.min(rem);
                    continue;
                }
                if p.has(pfi::UPENDING) {
                    p.flags &= !pfi::UPENDING;
                    expup = true;
                }
            }
            if expup {
                if let Some(face) = self.faces.get_mut(faceid) {
                    face.outstanding_interests = face.outstanding_interests.saturating_sub(1);
                }
                self.strategy_callout(serial, StrategyOp::ExpUp, faceid);
            }
            let Some(ie) = self.pit.entry_mut(serial) else { return };
            let Some(p) = ie
                .pfl
                .iter_mut()
                .find(|p| p.faceid == faceid && p.has(pfi::UPSTREAM))
            else {
                continue;
            };
            if p.has(pfi::SENDUPST) {
                continue; // strategy has already asked to send
            }
            if d.iter().any(|(f, _)| *f != faceid) {
                // the strategy needs to make the decision, so mark it
                changes += 1;
                p.flags |= pfi::ATTENTION;
                p.flags &= !(pfi::UPHUNGRY | pfi::INACTIVE);
                if dgram && recvcount == 0 {
                    p.flags |= pfi::INACTIVE;
                }
            } else {
                // expired, but there is nothing to feed it
                p.flags |= pfi::UPHUNGRY;
            }
        }
        if changes != 0 {
            self.strategy_callout(serial, StrategyOp::Update, NO_FACEID);
        }
        if let Some(ie) = self.pit.entry_mut(serial) {
            for p in ie.pfl.iter_mut() {
                if p.has(pfi::ATTENTION) {
                    warn!("strategy failed to clear ATTENTION");
                    p.flags &= !pfi::ATTENTION;
                }
            }
        }

        // transmit what the strategy selected
        let sendables: Vec<u32> = self
            .pit
            .entry(serial)
            .map(|ie| {
                ie.pfl
                    .iter()
                    .filter(|p| p.has(pfi::UPSTREAM) && p.has(pfi::SENDUPST))
                    .map(|p| p.faceid)
                    .collect()
            })
            .unwrap_or_default();
        for up in sendables {
            let Some(&(down, _)) = d.iter().find(|(f, _)| *f != up) else {
                continue;
            };
            self.send_interest(serial, down, up);
            if let Some(p) = self
                .pit
                .entry(serial)
                .and_then(|ie| ie.pfi_get(up, pfi::UPSTREAM))
            {
                let rem = p.expiry.delta(now).max(1) as u32;
                mn = mn.min(rem);
            }
        }

        // stick around while any upstream is still outstanding
        let upending = self
            .pit
            .entry(serial)
            .map(|ie| ie.pfl.iter().any(|p| p.has(pfi::UPENDING)))
            .unwrap_or(false);
        if pending == 0 && !upending {
            self.strategy_callout(serial, StrategyOp::Timeout, NO_FACEID);
            self.consume_interest(serial);
            return;
        }
        let mn = mn.max(1);
        let h = self
            .sched
            .schedule(self.now_ticks, mn, Event::Propagate(serial));
        if let Some(ie) = self.pit.entry_mut(serial) {
            ie.ev = Some(h);
        }
    }

    /// Forward the interest to upstream `up`, using downstream `down` as
    /// the nonce source and lifetime reference.
    fn send_interest(&mut self, serial: u64, down: u32, up: u32) {
        let now = self.wtnow;
        if self.faces.get(up).is_none() {
            return;
        }
        let prepared = {
            let Some(ie) = self.pit.entry_mut(serial) else { return };
            let Some((nonce, lifetime)) = ie.pfi_get(down, pfi::DNSTREAM).map(|x| {
                let delta = x.expiry.delta(x.renewed).max(0) as u64;
                let lifetime = ((delta * 4096 / WTHZ as u64) as u32 + 511) >> 9 << 9;
                (x.nonce().to_vec(), lifetime)
            }) else {
                return;
            };
            let Some(p) = ie
                .pfl
                .iter_mut()
                .find(|p| p.faceid == up && p.has(pfi::UPSTREAM))
            else {
                return;
            };
            p.set_nonce(&nonce);
            p.renewed = now;
            p.expiry = now + ticks_from_lifetime(lifetime);
            let newly = !p.has(pfi::UPENDING);
            p.flags |= pfi::UPENDING;
            p.flags &= !(pfi::SENDUPST | pfi::UPHUNGRY);
            let mut interest = ie.interest.clone();
            interest.nonce = Some(nonce);
            interest.lifetime = Some(lifetime);
            (interest.encode(), newly)
        };
        let (wire, newly) = prepared;
        // relevant if the upstream is the internal client
        self.interest_faceid = down;
        if newly {
            if let Some(face) = self.faces.get_mut(up) {
                face.outstanding_interests += 1;
            }
        }
        self.metrics.interests_sent.increment();
        if let Some(face) = self.faces.get_mut(up) {
            face.interests_out += 1;
        }
        self.stuff_and_send(up, wire);
    }

    /// Drop a consumed or dead interest entry, settling every counter.
    fn consume_interest(&mut self, serial: u64) {
        let Some(ie) = self.pit.consume(serial) else { return };
        if let Some(h) = ie.ev {
            self.sched.cancel(h);
        }
        if let Some(h) = ie.stev {
            self.sched.cancel(h);
        }
        for p in &ie.pfl {
            if let Some(face) = self.faces.get_mut(p.faceid) {
                if p.has(pfi::PENDING) {
                    face.pending_interests = face.pending_interests.saturating_sub(1);
                }
                if p.has(pfi::UPENDING) {
                    face.outstanding_interests = face.outstanding_interests.saturating_sub(1);
                }
            }
        }
        if let Some(node) = self.prefixes.node_mut(ie.npe) {
            node.ies.retain(|&s| s != serial);
        }
        self.metrics.pit_size.set(self.pit.len() as u64);
    }

    /// A FIB change can accelerate forwarding of existing interests.
    pub(crate) fn update_npe_children(&mut self, npe: NpeId, faceid: u32) {
        let mut usec: u64 = 6000; // a bit of time for prefix reg
        for serial in self.pit.serials() {
            let Some(ie) = self.pit.entry(serial) else { continue };
            if !self.prefixes.is_descendant(ie.npe, npe) {
                continue;
            }
            // pick a downstream to masquerade as, preferring trusted ones;
            // skip entries that already track this upstream
            let mut fface: Option<u32> = None;
            let mut skip = false;
            for p in &ie.pfl {
                if p.faceid == faceid && p.has(pfi::UPSTREAM) {
                    skip = true;
                    break;
                }
                if p.has(pfi::DNSTREAM) {
                    let cur_gg = fface
                        .and_then(|f| self.faces.get(f))
                        .map_or(false, |f| f.has(flags::GG));
                    if !cur_gg && self.faces.get(p.faceid).is_some() {
                        fface = Some(p.faceid);
                    }
                }
            }
            if skip {
                continue;
            }
            let Some(ff) = fface else { continue };
            let from = self.faces.get(ff).map(|f| (ff, f.flags));
            let interest = ie.interest.clone();
            let ie_npe = ie.npe;
            let ob = self
                .prefixes
                .outbound_faces(from, &interest, ie_npe, &self.faces);
            if !ob.contains(&faceid) {
                continue;
            }
            let now = self.wtnow;
            let expiry = now + ticks_from_micros(usec);
            {
                let Some(ie) = self.pit.entry_mut(serial) else { continue };
                let p = ie.pfi_seek(faceid, pfi::UPSTREAM, now);
                if p.has(pfi::UPENDING) {
                    continue;
                }
                p.expiry = expiry;
            }
            usec += 200;
            self.ie_schedule_propagate(serial);
        }
    }

    /* ------------------------------------------------------------ *
     * Content path
     * ------------------------------------------------------------ */

    fn process_incoming_content(&mut self, faceid: u32, msg: Bytes) {
        let obj = match WireContentObject::parse(msg) {
            Ok(o) => o,
            Err(e) => {
                debug!("error parsing ContentObject from face {}: {}", faceid, e);
                return;
            }
        };
        if let Some(face) = self.faces.get_mut(faceid) {
            face.data_in += 1;
        } else {
            return;
        }
        self.metrics.content_items_received.increment();

        let sec = self.sec;
        let faces = &self.faces;
        let outcome = self
            .cs
            .insert(&obj, faceid, sec, |old| faces.get(old).is_some());
        let (cookie, is_new) = match outcome {
            Ok(InsertOutcome::New(c)) => (c, true),
            Ok(InsertOutcome::Freshened(c)) => (c, false),
            Ok(InsertOutcome::Duplicate(c)) => {
                self.metrics.content_dups_received.increment();
                debug!("content_dup on face {}", faceid);
                (c, false)
            }
            Err(e) => {
                debug!("content_dropped: {}", e);
                return;
            }
        };

        let n_matches = self.match_interests(cookie, None, Some(faceid));
        if is_new {
            if n_matches < 0 {
                self.cs.remove(cookie);
                return;
            }
            let from_gg = self
                .faces
                .get(faceid)
                .map_or(false, |f| f.has(flags::GG));
            if n_matches == 0 && !from_gg {
                debug!("content_unsolicited on face {}", faceid);
                self.cs.mark_unsolicited(cookie);
            }
        }

        // if our own copy is still queued toward this face, let the
        // peer's transmission stand in for it
        let mut released = 0;
        if let Some(face) = self.faces.get_mut(faceid) {
            for q in face.q.iter_mut().flatten() {
                if q.clear_in_place(cookie) {
                    released += 1;
                    debug!("content_nosend on face {}", faceid);
                }
            }
        }
        for _ in 0..released {
            self.cs.release(cookie);
        }

        self.cs.trim(sec);
        self.metrics.cs_size.set(self.cs.len() as u64);
    }

    /// Find and consume interests matching stored content.
    ///
    /// With `only_face` set, only items pending on that face count. The
    /// arrival face (`from_face`) is reported to the strategy once per
    /// entry. Returns matches, or -1 when content arriving from an
    /// untrusted face hit a local namespace and must be dropped.
    fn match_interests(
        &mut self,
        cookie: Cookie,
        only_face: Option<u32>,
        from_face: Option<u32>,
    ) -> i32 {
        let Some(entry) = self.cs.entry(cookie) else {
            return 0;
        };
        let key = self.cs.key_of(cookie).cloned().unwrap_or_default();
        let ncomps = entry.ncomps;
        let publisher = entry.publisher_digest.clone();
        let Ok(name) = FlatName::from_flat(key.clone()) else {
            return 0;
        };
        // the digest component never names a prefix node
        let name_comps = ncomps.saturating_sub(1);

        let mut matches = 0;
        for level in (0..=name_comps).rev() {
            let prefix = name.prefix(level);
            let Some(npe) = self.prefixes.lookup_exact(&prefix) else {
                continue;
            };
            if let (Some(ff), Some(node)) = (from_face, self.prefixes.node(npe)) {
                if node.flags & forw::LOCAL != 0 {
                    let gg = self.faces.get(ff).map_or(false, |f| f.has(flags::GG));
                    if !gg {
                        return -1;
                    }
                }
            }
            let serials: Vec<u64> = self
                .prefixes
                .node(npe)
                .map(|n| n.ies.clone())
                .unwrap_or_default();
            for serial in serials {
                let Some(ie) = self.pit.entry(serial) else { continue };
                if let Some(of) = only_face {
                    if !ie.is_pending_on(of) {
                        continue;
                    }
                }
                if !rust_ccnd_common::packet::content_matches_interest(
                    &key,
                    ncomps,
                    publisher.as_deref(),
                    &ie.interest,
                ) {
                    continue;
                }
                if let Some(ff) = from_face {
                    self.strategy_callout(serial, StrategyOp::Satisfied, ff);
                }
                let downstreams: Vec<u32> = self
                    .pit
                    .entry(serial)
                    .map(|ie| {
                        ie.pfl
                            .iter()
                            .filter(|p| p.has(pfi::PENDING))
                            .map(|p| p.faceid)
                            .collect()
                    })
                    .unwrap_or_default();
                for dn in downstreams {
                    self.face_send_queue_insert(dn, cookie);
                }
                matches += 1;
                self.consume_interest(serial);
            }
        }
        matches
    }

    /* ------------------------------------------------------------ *
     * Send queues
     * ------------------------------------------------------------ */

    /// Queue a ContentObject to be sent on a face. Returns false when the
    /// face is unusable or the object was already on its way.
    pub fn face_send_queue_insert(&mut self, faceid: u32, cookie: Cookie) -> bool {
        let content_flags = match self.cs.entry(cookie) {
            Some(e) => e.flags,
            None => return false,
        };
        let data_pause = self.cfg.data_pause_microsec;
        let class = {
            let face = self.faces.get(faceid);
            if face.map_or(true, |f| f.has(flags::NOSEND)) {
                return false;
            }
            choose_content_delay_class(face, content_flags)
        };
        // it might already be in one of the other queues on this face
        let other_hit = self.faces.get(faceid).map_or(false, |f| {
            f.q.iter()
                .enumerate()
                .any(|(k, q)| k != class && q.as_ref().map_or(false, |q| q.contains(cookie)))
        });
        if other_hit {
            debug!("content_otherq face {}", faceid);
            return true;
        }
        let mut delay_and_event = None;
        {
            let Some(face) = self.faces.get_mut(faceid) else {
                return false;
            };
            if face.q[class].is_none() {
                let q = ContentQueue::new(&*face, class, data_pause);
                face.q[class] = Some(q);
            }
            let q = face.q[class].as_mut().expect("created above");
            if q.insert(cookie) {
                self.cs.hold(cookie);
            }
            if q.sender.is_none() {
                let delay = randomize_content_delay(&mut self.rng, q);
                q.ready = q.send_queue.len();
                delay_and_event = Some(delay);
            }
        }
        if let Some(delay) = delay_and_event {
            let h = self.sched.schedule(
                self.now_ticks,
                ticks_from_micros(delay as u64),
                Event::ContentSender(faceid, class),
            );
            if let Some(q) = self
                .faces
                .get_mut(faceid)
                .and_then(|f| f.q[class].as_mut())
            {
                q.sender = Some(h);
            }
            debug!("face {} q {} delay {} usec", faceid, class, delay);
        }
        true
    }

    /// Scheduled release from one face's delay-class queue.
    fn content_sender(&mut self, faceid: u32, class: usize) {
        let mut q = {
            let Some(face) = self.faces.get_mut(faceid) else { return };
            let Some(mut q) = face.q[class].take() else { return };
            q.sender = None;
            if face.has(flags::NOSEND) {
                face.q[class] = Some(q);
                return;
            }
            q
        };
        let n = q.send_queue.len();
        if q.ready > n || (q.ready == 0 && q.nrun >= 12 && q.nrun < 120) {
            q.ready = n;
        }
        let mut nsec: u64 = 0;
        let burst_nsec = q.burst_nsec as u64;
        let burst_max = BURST_MAX.min(q.ready);
        if burst_max == 0 {
            q.nrun = 0;
        }
        let mut i = 0;
        while i < burst_max && nsec < BURST_BUDGET_NSEC {
            let cookie = q.send_queue[i];
            match self.cs.entry(cookie).map(|e| e.size) {
                None => q.nrun = 0,
                Some(size) => {
                    self.send_content(faceid, cookie);
                    self.cs.release(cookie);
                    if self.faces.get(faceid).is_none() {
                        // face vanished mid-burst; abandon silently
                        for &c in q.send_queue.iter().skip(i + 1) {
                            if c != 0 {
                                self.cs.release(c);
                            }
                        }
                        return;
                    }
                    nsec += burst_nsec * ((size as u64 + 1023) / 1024);
                    q.nrun += 1;
                }
            }
            i += 1;
        }
        q.ready -= i;
        q.send_queue.drain(..i);
        // a short pause lets others preempt the send
        let mut delay_usec = (nsec + 499) / 1000 + 1;
        let reschedule = if q.ready > 0 {
            true
        } else {
            q.ready = q.send_queue.len();
            if q.nrun >= 12 && q.nrun < 120 {
                // we seem to be a preferred provider; forgo the jitter
                if q.send_queue.is_empty() {
                    delay_usec += burst_nsec / 50;
                }
                true
            } else if q
                .send_queue
                .iter()
                .any(|&c| self.cs.entry(c).is_some())
            {
                q.nrun = 0;
                delay_usec = randomize_content_delay(&mut self.rng, &q) as u64;
                true
            } else {
                q.send_queue.clear();
                q.ready = 0;
                false
            }
        };
        if reschedule {
            let h = self.sched.schedule(
                self.now_ticks,
                ticks_from_micros(delay_usec),
                Event::ContentSender(faceid, class),
            );
            q.sender = Some(h);
        }
        if let Some(face) = self.faces.get_mut(faceid) {
            face.q[class] = Some(q);
        }
    }

    /// Send a ContentObject after its trip through the queue.
    fn send_content(&mut self, faceid: u32, cookie: Cookie) {
        let Some(wire) = self.cs.entry(cookie).map(|e| e.wire.clone()) else {
            return;
        };
        let Some(face) = self.faces.get_mut(faceid) else {
            return;
        };
        if face.has(flags::NOSEND) {
            return;
        }
        face.data_out += 1;
        self.metrics.content_items_sent.increment();
        self.stuff_and_send(faceid, wire);
    }

    /* ------------------------------------------------------------ *
     * Outbound framing
     * ------------------------------------------------------------ */

    /// Frame and transmit one message on a face, applying PDU grouping,
    /// interest stuffing, and the link-probe trailer as appropriate.
    fn stuff_and_send(&mut self, faceid: u32, msg: Bytes) {
        let Some(face) = self.faces.get(faceid) else { return };
        if face.has(flags::NOSEND) {
            return;
        }
        let link = face.has(flags::LINK);
        let seqish = face.has(flags::SEQOK | flags::SEQPROBE);
        let recv_quiet = face.recvcount <= 1;
        let mtu_room = self.cfg.mtu > msg.len();
        if link {
            let mut parts = vec![msg];
            self.stuff_parts(faceid, &mut parts);
            let pdu = wrap_pdu(&parts);
            self.deliver_bytes(faceid, pdu);
        } else if seqish || recv_quiet || mtu_room {
            let mut parts = vec![msg];
            self.stuff_parts(faceid, &mut parts);
            if parts.len() == 1 {
                let only = parts.pop().expect("one part");
                self.deliver_bytes(faceid, only);
            } else {
                let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
                for p in &parts {
                    buf.extend_from_slice(p);
                }
                self.deliver_bytes(faceid, Bytes::from(buf));
            }
        } else {
            self.deliver_bytes(faceid, msg);
        }
    }

    /// Append a link-check interest and the sequence-number trailer when
    /// the face calls for them.
    fn stuff_parts(&mut self, faceid: u32, parts: &mut Vec<Bytes>) {
        if let Some(probe) = self.stuff_link_check(faceid) {
            parts.push(probe);
        }
        let Some(face) = self.faces.get_mut(faceid) else { return };
        if face.has(flags::SEQOK | flags::SEQPROBE) {
            parts.push(encode_sequence_number(face.pktseq & 0xFFFF));
            face.pktseq += 1;
            face.flags &= !flags::SEQPROBE;
        }
    }

    /// A quiet unicast datagram face earns one link-check interest per
    /// reap period.
    fn stuff_link_check(&mut self, faceid: u32) -> Option<Bytes> {
        {
            let face = self.faces.get(faceid)?;
            if face.recvcount > 1 {
                return None;
            }
            let check = flags::DGRAM | flags::MCAST | flags::GG | flags::LC;
            if face.flags & check != flags::DGRAM {
                return None;
            }
        }
        let name = FlatName::from_uri(NEIGHBOR_URI).ok()?;
        let nonce = self.random_bytes(TYPICAL_NONCE_SIZE);
        let interest = rust_ccnd_common::packet::Interest::new(name)
            .with_scope(2)
            .with_nonce(nonce);
        let face = self.faces.get_mut(faceid)?;
        face.flags |= flags::LC;
        face.interests_out += 1;
        self.metrics.interests_stuffed.increment();
        debug!("stuff_interest_to face {}", faceid);
        Some(interest.encode())
    }

    fn deliver_bytes(&mut self, faceid: u32, bytes: Bytes) {
        if faceid == self.face0 {
            // requests for the internal client
            self.metrics.bytes_sent.add(bytes.len() as u64);
            let from = self.interest_faceid;
            self.internal_queue.push_back((bytes, from));
            return;
        }
        let Some(face) = self.faces.get_mut(faceid) else { return };
        self.metrics.bytes_sent.add(bytes.len() as u64);
        match face.deliver(bytes) {
            Ok(()) => {}
            Err(Error::SendDeferred) => {}
            Err(e) => {
                debug!("send failed on face {}: {}", faceid, e);
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Internal client
     * ------------------------------------------------------------ */

    /// Process requests that reached face 0, injecting replies as if they
    /// had arrived on the internal face.
    pub fn drain_internal(&mut self) {
        while let Some((wire, from)) = self.internal_queue.pop_front() {
            if wire.first() != Some(&tlv::TLV_INTEREST) {
                continue;
            }
            let reply = crate::mgmt::handle_request(self, &wire, from);
            if let Some(reply) = reply {
                let face0 = self.face0;
                self.dispatch_message(face0, reply, false);
            }
        }
    }

    /* ------------------------------------------------------------ *
     * Strategy
     * ------------------------------------------------------------ */

    pub(crate) fn strategy_callout(&mut self, serial: u64, op: StrategyOp, faceid: u32) {
        let Some(npe) = self.pit.entry(serial).map(|ie| ie.npe) else {
            return;
        };
        let (_, si) = self.prefixes.effective_strategy(npe);
        match si.class {
            StrategyClass::Default => self.default_strategy(serial, op, faceid),
        }
    }

    /// The default strategy: forward to every eligible upstream.
    fn default_strategy(&mut self, serial: u64, op: StrategyOp, _faceid: u32) {
        if op == StrategyOp::Update {
            if let Some(ie) = self.pit.entry_mut(serial) {
                for p in ie.pfl.iter_mut() {
                    if p.has(pfi::ATTENTION) {
                        p.flags &= !pfi::ATTENTION;
                        p.flags |= pfi::SENDUPST;
                    }
                }
            }
        }
    }

    /// Schedule a strategy wakeup, replacing any previous one.
    pub fn strategy_settimer(&mut self, serial: u64, usec: u64, op: StrategyOp) {
        let Some(ie) = self.pit.entry_mut(serial) else { return };
        let prior = ie.stev.take();
        if let Some(h) = prior {
            self.sched.cancel(h);
        }
        let h = self.sched.schedule(
            self.now_ticks,
            ticks_from_micros(usec),
            Event::StrategyTimer(serial, op),
        );
        if let Some(ie) = self.pit.entry_mut(serial) {
            ie.stev = Some(h);
        }
    }

    /* ------------------------------------------------------------ *
     * Housekeeping
     * ------------------------------------------------------------ */

    /// Periodic retirement of idle structures.
    fn reap(&mut self) {
        self.check_dgram_faces();
        self.prefixes.check_entries(&self.faces);
        self.check_comm_file();
    }

    /// Idle datagram faces go away after two quiet periods; the
    /// link-check rate limit resets each period.
    fn check_dgram_faces(&mut self) -> usize {
        let mut doomed = Vec::new();
        for face in self.faces.iter_mut() {
            if !face.has(flags::DGRAM) || face.addr.is_none() {
                continue;
            }
            face.flags &= !flags::LC; // rate limit link check interests
            if face.recvcount == 0 {
                if !face.has(flags::PERMANENT | flags::MCAST) {
                    doomed.push(face.faceid);
                }
            } else if face.recvcount == 1 {
                face.recvcount = 0;
            } else {
                face.recvcount = 1; // go around twice
            }
        }
        let count = doomed.len();
        for faceid in doomed {
            let _ = self.destroy_face(faceid);
        }
        count
    }

    /// The unix-domain socket file vanishing is the graceful-shutdown
    /// trigger.
    fn check_comm_file(&mut self) {
        if let Some(path) = &self.comm_file {
            if !path.exists() {
                info!("stopping ({} gone)", path.display());
                self.running = false;
            }
        }
    }

    /// Register a prefix, including the engine-level side effects the
    /// bare table call does not see.
    pub fn reg_prefix(
        &mut self,
        prefix: &FlatName,
        faceid: u32,
        fwd_flags: Option<u32>,
        expires: i32,
    ) -> Result<u32, Error> {
        if self.faces.get(faceid).is_none() {
            return Err(Error::FaceGone(faceid));
        }
        // a LAST registration marks the face direct-control
        if let Some(fl) = fwd_flags {
            if fl & forw::LAST != 0 {
                if let Some(face) = self.faces.get_mut(faceid) {
                    face.flags |= flags::DC;
                }
            }
        }
        let res = self.prefixes.register(prefix, faceid, fwd_flags, expires)?;
        let npe = self
            .prefixes
            .lookup_exact(prefix)
            .expect("registered prefix exists");
        self.update_npe_children(npe, faceid);
        Ok(res)
    }
}
