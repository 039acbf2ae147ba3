//! Faces and the face table.
//!
//! A face is an addressing-neutral endpoint: one side of a stream
//! connection, one datagram peer, a multicast group membership, or the
//! internal client. The table addresses faces by `slot | generation` so a
//! 32-bit faceid can be handed around without dangling.

use crate::sendq::{ContentQueue, CQ_N};
use bytes::Bytes;
use log::debug;
use rust_ccnd_common::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Slot mask; generations advance in units of `MAXFACES + 1`.
pub const MAXFACES: u32 = 0xFFFF;

/// Sentinel meaning "no face".
pub const NO_FACEID: u32 = u32::MAX;

/// Face flag bits.
pub mod flags {
    pub const LOCAL: u32 = 1 << 0;
    pub const INET: u32 = 1 << 1;
    pub const INET6: u32 = 1 << 2;
    pub const LOOPBACK: u32 = 1 << 3;
    pub const MCAST: u32 = 1 << 4;
    pub const DGRAM: u32 = 1 << 5;
    pub const STREAM: u32 = 1 << 6;
    pub const PASSIVE: u32 = 1 << 7;
    pub const UNDECIDED: u32 = 1 << 8;
    /// Good guy: trusted local peer, may manage and cross scope limits.
    pub const GG: u32 = 1 << 9;
    pub const PERMANENT: u32 = 1 << 10;
    pub const NOSEND: u32 = 1 << 11;
    pub const NORECV: u32 = 1 << 12;
    pub const CONNECTING: u32 = 1 << 13;
    pub const CLOSING: u32 = 1 << 14;
    /// Direct control face; gets a grace delay before interests.
    pub const DC: u32 = 1 << 15;
    /// Messages on this face ride inside CCNProtocolDataUnit framing.
    pub const LINK: u32 = 1 << 16;
    /// Peer reciprocates sequence numbers; scope-2 forwarding is allowed.
    pub const SEQOK: u32 = 1 << 17;
    /// A probe sequence number is owed on the next send.
    pub const SEQPROBE: u32 = 1 << 18;
    /// Link-check interest already stuffed this reap period.
    pub const LC: u32 = 1 << 19;
    /// SO_BROADCAST has been set on the socket.
    pub const BC: u32 = 1 << 20;
    /// SO_BROADCAST could not be set; don't retry.
    pub const NBC: u32 = 1 << 21;
    /// Allowed to register prefixes without GG.
    pub const REGOK: u32 = 1 << 22;
}

/// Where bytes handed to a face go.
#[derive(Debug, Clone)]
pub enum FaceOutput {
    /// Stream faces: a writer task drains this channel.
    Channel(mpsc::UnboundedSender<Bytes>),
    /// Datagram faces: sent directly on the shared socket.
    Dgram { socket: Arc<UdpSocket>, peer: SocketAddr },
    /// Face 0: requests are queued for the internal client.
    Internal,
    /// Listeners and tests.
    Discard,
}

#[derive(Debug)]
pub struct Face {
    pub faceid: u32,
    pub flags: u32,
    pub addr: Option<SocketAddr>,
    pub output: FaceOutput,

    /// Count of PENDING downstream items on this face.
    pub pending_interests: u32,
    /// Count of UPENDING upstream items on this face.
    pub outstanding_interests: u32,

    /// Messages received; drives datagram idle expiry and link checks.
    pub recvcount: u32,

    /// Per-class output queues, created on first use.
    pub q: [Option<ContentQueue>; CQ_N],

    /// Link-probe state: next sequence to send, last received, run length.
    pub pktseq: u64,
    pub rseq: u64,
    pub rrun: u8,

    /// Length-prefixed face guid; the first byte is the length.
    pub guid: Option<Vec<u8>>,

    // meters
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub interests_in: u64,
    pub interests_out: u64,
    pub data_in: u64,
    pub data_out: u64,
}

impl Face {
    pub fn new(flags: u32, addr: Option<SocketAddr>, output: FaceOutput) -> Self {
        Self {
            faceid: NO_FACEID,
            flags,
            addr,
            output,
            pending_interests: 0,
            outstanding_interests: 0,
            recvcount: 0,
            q: Default::default(),
            pktseq: 0,
            rseq: 0,
            rrun: 0,
            guid: None,
            bytes_in: 0,
            bytes_out: 0,
            interests_in: 0,
            interests_out: 0,
            data_in: 0,
            data_out: 0,
        }
    }

    pub fn has(&self, bits: u32) -> bool {
        self.flags & bits != 0
    }

    pub fn has_all(&self, bits: u32) -> bool {
        self.flags & bits == bits
    }

    /// Sets a length-prefixed guid; rejects raw buffers without the
    /// leading length byte.
    pub fn set_guid(&mut self, guid: Vec<u8>) -> Result<(), Error> {
        match guid.first() {
            Some(&len) if guid.len() == len as usize + 1 => {
                self.guid = Some(guid);
                Ok(())
            }
            _ => Err(Error::Parse("face guid must be length-prefixed".into())),
        }
    }

    /// Hands bytes to the face's transport. Delivery troubles latch
    /// `NOSEND`; a vanished channel peer is reported as broken.
    pub fn deliver(&mut self, bytes: Bytes) -> Result<(), Error> {
        if self.has(flags::NOSEND) {
            return Ok(());
        }
        self.bytes_out += bytes.len() as u64;
        match &self.output {
            FaceOutput::Channel(tx) => {
                if tx.send(bytes).is_err() {
                    self.flags |= flags::NOSEND;
                    return Err(Error::SendBroken("writer gone".into()));
                }
                Ok(())
            }
            FaceOutput::Dgram { socket, peer } => {
                let socket = Arc::clone(socket);
                let peer = *peer;
                match socket.try_send_to(&bytes, peer) {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // Datagram faces get no outbuf; the message is lost.
                        Err(Error::SendDeferred)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied
                        && !self.has(flags::BC | flags::NBC) =>
                    {
                        // One-shot SO_BROADCAST retry for broadcast peers.
                        match socket.set_broadcast(true) {
                            Ok(()) => {
                                self.flags |= flags::BC;
                                socket
                                    .try_send_to(&bytes, peer)
                                    .map(|_| ())
                                    .map_err(Error::Io)
                            }
                            Err(e) => {
                                self.flags |= flags::NBC;
                                Err(Error::Io(e))
                            }
                        }
                    }
                    Err(e) => {
                        self.flags |= flags::NOSEND;
                        Err(Error::SendBroken(e.to_string()))
                    }
                }
            }
            FaceOutput::Internal | FaceOutput::Discard => Ok(()),
        }
    }
}

/// Registry of faces addressed by `slot | generation` ids.
#[derive(Debug, Default)]
pub struct FaceTable {
    slots: Vec<Option<Face>>,
    face_gen: u32,
    face_rover: usize,
}

impl FaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a faceid and stores the face.
    ///
    /// Slots are reused only after a full pass; the generation counter is
    /// bumped on wrap so a recycled slot yields a different faceid.
    pub fn enroll(&mut self, mut face: Face) -> Result<u32, Error> {
        let n = self.slots.len();
        let mut slot = None;
        for i in self.face_rover..n {
            if self.slots[i].is_none() {
                slot = Some(i);
                break;
            }
        }
        if slot.is_none() {
            for i in 0..n {
                if self.slots[i].is_none() {
                    // bump gen only when the second pass succeeds
                    self.face_gen = self.face_gen.wrapping_add(MAXFACES + 1);
                    slot = Some(i);
                    break;
                }
            }
        }
        let i = match slot {
            Some(i) => i,
            None => {
                let grown = ((n + 1) * 3 / 2).min(MAXFACES as usize + 1);
                if grown <= n {
                    return Err(Error::NoCapacity);
                }
                self.slots.resize_with(grown, || None);
                n
            }
        };
        self.face_rover = i + 1;
        face.faceid = i as u32 | self.face_gen;
        let faceid = face.faceid;
        debug!("enrolled face {} (slot {})", faceid, i);
        self.slots[i] = Some(face);
        Ok(faceid)
    }

    /// Validates both slot and generation.
    pub fn get(&self, faceid: u32) -> Option<&Face> {
        if faceid == NO_FACEID {
            return None;
        }
        let slot = (faceid & MAXFACES) as usize;
        match self.slots.get(slot)?.as_ref() {
            Some(f) if f.faceid == faceid => Some(f),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, faceid: u32) -> Option<&mut Face> {
        if faceid == NO_FACEID {
            return None;
        }
        let slot = (faceid & MAXFACES) as usize;
        match self.slots.get_mut(slot)?.as_mut() {
            Some(f) if f.faceid == faceid => Some(f),
            _ => None,
        }
    }

    /// Removes a face from the table, applying the safe-reuse rule: an
    /// undecided stream connection that never spoke the protocol gives its
    /// slot straight back without burning a generation.
    pub fn release(&mut self, faceid: u32) -> Option<Face> {
        let slot = (faceid & MAXFACES) as usize;
        let found = self
            .slots
            .get(slot)?
            .as_ref()
            .map_or(false, |f| f.faceid == faceid);
        if !found {
            return None;
        }
        let face = self.slots[slot].take()?;
        if face.has(flags::UNDECIDED)
            && self.face_rover > 0
            && faceid == ((self.face_rover as u32 - 1) | self.face_gen)
        {
            self.face_rover -= 1;
            debug!("recycling face id {} (slot {})", faceid, slot);
        } else {
            debug!("releasing face id {} (slot {})", faceid, slot);
        }
        Some(face)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Face> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Face> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn faceids(&self) -> Vec<u32> {
        self.iter().map(|f| f.faceid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_face() -> Face {
        Face::new(flags::STREAM, None, FaceOutput::Discard)
    }

    #[test]
    fn lookup_validates_generation() {
        let mut t = FaceTable::new();
        let id = t.enroll(plain_face()).unwrap();
        assert!(t.get(id).is_some());
        t.release(id).unwrap();
        assert!(t.get(id).is_none());
    }

    #[test]
    fn slot_reuse_changes_faceid() {
        let mut t = FaceTable::new();
        let first = t.enroll(plain_face()).unwrap();
        // fill a second slot so the rover moves past slot 0
        let _second = t.enroll(plain_face()).unwrap();
        t.release(first).unwrap();
        // rover continues forward; wrap-around pass reuses slot 0 with a
        // bumped generation
        let mut last = 0;
        loop {
            let id = t.enroll(plain_face()).unwrap();
            if id & MAXFACES == first & MAXFACES {
                last = id;
                break;
            }
        }
        assert_ne!(last, first);
        assert!(t.get(first).is_none());
        assert!(t.get(last).is_some());
    }

    #[test]
    fn undecided_slot_is_recycled_without_gen_bump() {
        let mut t = FaceTable::new();
        let _a = t.enroll(plain_face()).unwrap();
        let b = t
            .enroll(Face::new(flags::STREAM | flags::UNDECIDED, None, FaceOutput::Discard))
            .unwrap();
        t.release(b).unwrap();
        let c = t.enroll(plain_face()).unwrap();
        assert_eq!(b, c);
    }

    #[test]
    fn guid_requires_length_prefix() {
        let mut f = plain_face();
        assert!(f.set_guid(vec![3, 1, 2, 3]).is_ok());
        assert!(f.set_guid(vec![9, 1, 2]).is_err());
    }
}
