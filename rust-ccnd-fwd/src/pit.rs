//! The Pending Interest Table.
//!
//! An interest entry is keyed by the encoded Interest with the lifetime
//! element elided, and owns a list of per-face items (PFIs) by value: one
//! per direction per face, carrying the nonce, flags, and expiry. Faces
//! hold only counters, never pointers into the PIT; a vanished face is
//! discovered lazily by faceid lookup during the propagation pass.

use crate::fib::NpeId;
use crate::sched::EvHandle;
use bytes::Bytes;
use rust_ccnd_common::packet::Interest;
use rust_ccnd_common::WTime;
use std::collections::HashMap;

/// Inline nonce bound; longer nonces are truncated at the wire parser.
pub const TYPICAL_NONCE_SIZE: usize = 12;

/// PFI flag bits. The low byte is the inlined nonce length.
pub mod pfi {
    pub const NONCESZ: u32 = 0x00FF;
    pub const DNSTREAM: u32 = 0x0100;
    pub const UPSTREAM: u32 = 0x0200;
    /// Downstream is waiting for an answer.
    pub const PENDING: u32 = 0x0400;
    /// Upstream has an outstanding request.
    pub const UPENDING: u32 = 0x0800;
    /// Strategy ordered a transmit on this upstream.
    pub const SENDUPST: u32 = 0x1000;
    /// Upstream expired with nothing to feed it.
    pub const UPHUNGRY: u32 = 0x2000;
    /// Datagram face with no receives yet.
    pub const INACTIVE: u32 = 0x4000;
    /// Duplicate-nonce arrival; do not propagate for this downstream.
    pub const SUPDATA: u32 = 0x8000;
    /// Needs a strategy decision in the current pass.
    pub const ATTENTION: u32 = 0x1_0000;
    /// Direct-control grace delay already applied.
    pub const DCFACE: u32 = 0x2_0000;
}

/// Per-face item of a PIT entry: one direction on one face.
#[derive(Debug, Clone)]
pub struct PitFaceItem {
    pub faceid: u32,
    pub flags: u32,
    nonce: [u8; TYPICAL_NONCE_SIZE],
    pub renewed: WTime,
    pub expiry: WTime,
}

impl PitFaceItem {
    pub fn new(faceid: u32, direction: u32, now: WTime) -> Self {
        Self {
            faceid,
            flags: direction,
            nonce: [0; TYPICAL_NONCE_SIZE],
            renewed: now,
            expiry: now,
        }
    }

    pub fn has(&self, bits: u32) -> bool {
        self.flags & bits != 0
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce[..(self.flags & pfi::NONCESZ) as usize]
    }

    pub fn set_nonce(&mut self, nonce: &[u8]) {
        let n = nonce.len().min(TYPICAL_NONCE_SIZE);
        self.nonce[..n].copy_from_slice(&nonce[..n]);
        self.flags = (self.flags & !pfi::NONCESZ) | n as u32;
    }

    pub fn nonce_matches(&self, nonce: &[u8]) -> bool {
        self.nonce() == nonce
    }
}

/// One pending Interest and its per-face state.
#[derive(Debug)]
pub struct InterestEntry {
    pub serial: u64,
    /// The truncated-encoding key this entry is registered under.
    pub key: Vec<u8>,
    /// Parsed form of the first arrival; nonce and lifetime are
    /// re-derived per send.
    pub interest: Interest,
    /// First arrival's wire bytes.
    pub wire: Bytes,
    pub npe: NpeId,
    pub pfl: Vec<PitFaceItem>,
    pub birth: WTime,
    pub renewed: WTime,
    pub renewals: u32,
    /// Scheduled propagation event.
    pub ev: Option<EvHandle>,
    /// Scheduled strategy wakeup.
    pub stev: Option<EvHandle>,
}

impl InterestEntry {
    /// Finds or creates the PFI for `(faceid, direction)`.
    pub fn pfi_seek(&mut self, faceid: u32, direction: u32, now: WTime) -> &mut PitFaceItem {
        let idx = self
            .pfl
            .iter()
            .position(|p| p.faceid == faceid && p.has(direction));
        let idx = match idx {
            Some(i) => i,
            None => {
                self.pfl.push(PitFaceItem::new(faceid, direction, now));
                self.pfl.len() - 1
            }
        };
        &mut self.pfl[idx]
    }

    pub fn pfi_get(&self, faceid: u32, direction: u32) -> Option<&PitFaceItem> {
        self.pfl.iter().find(|p| p.faceid == faceid && p.has(direction))
    }

    /// True iff `p`'s nonce occurs in none of the entry's other items.
    pub fn nonce_unique(&self, index: usize) -> bool {
        let nonce = self.pfl[index].nonce().to_vec();
        self.pfl
            .iter()
            .enumerate()
            .all(|(i, q)| i == index || !q.nonce_matches(&nonce))
    }

    /// True when the interest is pending for the given downstream face.
    pub fn is_pending_on(&self, faceid: u32) -> bool {
        self.pfl
            .iter()
            .any(|p| p.faceid == faceid && p.has(pfi::PENDING))
    }

    /// Earliest PFI expiry; drives the propagation timer.
    pub fn next_expiry(&self) -> Option<WTime> {
        self.pfl
            .iter()
            .map(|p| p.expiry)
            .reduce(|a, b| if b.delta(a) < 0 { b } else { a })
    }
}

/// Map from interest key to entry, with stable serial handles.
#[derive(Debug, Default)]
pub struct Pit {
    by_key: HashMap<Vec<u8>, u64>,
    entries: HashMap<u64, InterestEntry>,
    next_serial: u64,
}

impl Pit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        self.by_key.get(key).copied()
    }

    pub fn entry(&self, serial: u64) -> Option<&InterestEntry> {
        self.entries.get(&serial)
    }

    pub fn entry_mut(&mut self, serial: u64) -> Option<&mut InterestEntry> {
        self.entries.get_mut(&serial)
    }

    pub fn serials(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// Looks up or creates the entry for `key`; true in the result marks
    /// a new entry.
    pub fn seek(
        &mut self,
        key: &[u8],
        interest: &Interest,
        wire: &Bytes,
        npe: NpeId,
        now: WTime,
    ) -> (u64, bool) {
        if let Some(&serial) = self.by_key.get(key) {
            return (serial, false);
        }
        self.next_serial += 1;
        let serial = self.next_serial;
        self.by_key.insert(key.to_vec(), serial);
        self.entries.insert(
            serial,
            InterestEntry {
                serial,
                key: key.to_vec(),
                interest: interest.clone(),
                wire: wire.clone(),
                npe,
                pfl: Vec::new(),
                birth: now,
                renewed: now,
                renewals: 0,
                ev: None,
                stev: None,
            },
        );
        (serial, true)
    }

    /// Removes the entry, returning it so the engine can settle counters
    /// and cancel its events.
    pub fn consume(&mut self, serial: u64) -> Option<InterestEntry> {
        let entry = self.entries.remove(&serial)?;
        self.by_key.remove(&entry.key);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_ccnd_common::FlatName;

    fn entry() -> InterestEntry {
        let interest = Interest::new(FlatName::from_uri("/a").unwrap());
        InterestEntry {
            serial: 1,
            key: vec![1, 2, 3, 0],
            interest,
            wire: Bytes::new(),
            npe: 1,
            pfl: Vec::new(),
            birth: WTime(0),
            renewed: WTime(0),
            renewals: 0,
            ev: None,
            stev: None,
        }
    }

    #[test]
    fn pfi_directions_are_distinct() {
        let mut ie = entry();
        let now = WTime(10);
        ie.pfi_seek(5, pfi::DNSTREAM, now);
        ie.pfi_seek(5, pfi::UPSTREAM, now);
        assert_eq!(ie.pfl.len(), 2);
        // seeking again returns the existing item
        ie.pfi_seek(5, pfi::DNSTREAM, now).flags |= pfi::PENDING;
        assert_eq!(ie.pfl.len(), 2);
        assert!(ie.is_pending_on(5));
        assert!(!ie.is_pending_on(6));
    }

    #[test]
    fn nonce_inline_and_uniqueness() {
        let mut ie = entry();
        let now = WTime(0);
        ie.pfi_seek(1, pfi::DNSTREAM, now).set_nonce(b"abcd");
        ie.pfi_seek(2, pfi::UPSTREAM, now).set_nonce(b"abcd");
        assert!(!ie.nonce_unique(1));
        ie.pfi_seek(2, pfi::UPSTREAM, now).set_nonce(b"efgh");
        assert!(ie.nonce_unique(1));
        assert_eq!(ie.pfl[0].nonce(), b"abcd");
    }

    #[test]
    fn next_expiry_is_earliest() {
        let mut ie = entry();
        ie.pfi_seek(1, pfi::DNSTREAM, WTime(0)).expiry = WTime(500);
        ie.pfi_seek(2, pfi::UPSTREAM, WTime(0)).expiry = WTime(100);
        assert_eq!(ie.next_expiry(), Some(WTime(100)));
    }

    #[test]
    fn seek_and_consume() {
        let mut pit = Pit::new();
        let interest = Interest::new(FlatName::from_uri("/a").unwrap());
        let wire = Bytes::from_static(b"xx");
        let (s1, new1) = pit.seek(&[1, 0], &interest, &wire, 1, WTime(0));
        let (s2, new2) = pit.seek(&[1, 0], &interest, &wire, 1, WTime(5));
        assert!(new1 && !new2);
        assert_eq!(s1, s2);
        assert_eq!(pit.len(), 1);
        let e = pit.consume(s1).unwrap();
        assert_eq!(e.serial, s1);
        assert!(pit.lookup(&[1, 0]).is_none());
    }
}
