//! The FIB and the name-prefix tree that indexes it.
//!
//! Every registered prefix (and every prefix of every pending interest)
//! gets a node with a parent link. Nodes carry the forwarding records,
//! the interest entries anchored at the prefix, the strategy attachment,
//! and a lazily rebuilt `forward_to` cache versioned against the global
//! `forward_to_gen`.

use crate::face::{flags as fflags, FaceTable};
use crate::strategy::{StrategyInstance, StrategyState};
use log::debug;
use rust_ccnd_common::packet::Interest;
use rust_ccnd_common::{Error, FlatName};
use std::collections::{BTreeMap, HashMap};

/// Forwarding entry flag bits (the public mask plus REFRESHED).
pub mod forw {
    pub const ACTIVE: u32 = 0x01;
    pub const CHILD_INHERIT: u32 = 0x02;
    pub const ADVERTISE: u32 = 0x04;
    /// Last-resort entry; moved to the end of `forward_to`.
    pub const LAST: u32 = 0x08;
    /// Stop inheritance from ancestors above this node.
    pub const CAPTURE: u32 = 0x10;
    /// The prefix is local; only trusted faces may consume it.
    pub const LOCAL: u32 = 0x20;
    /// Observation copies only; never consumes the interest.
    pub const TAP: u32 = 0x40;
    /// Sense-inverted escape from CAPTURE.
    pub const CAPTURE_OK: u32 = 0x80;
    pub const PUBMASK: u32 = 0xFF;
    /// Private: entry renewed since the last ageing pass.
    pub const REFRESHED: u32 = 0x100;
}

/// Seconds between forwarding ageing passes.
pub const FWU_SECS: i32 = 5;

pub type NpeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forwarding {
    pub faceid: u32,
    pub flags: u32,
    pub expires: i32,
}

#[derive(Debug)]
pub struct Npe {
    pub id: NpeId,
    pub flat: Vec<u8>,
    pub parent: Option<NpeId>,
    pub children: u32,
    /// Serials of PIT entries whose longest matching prefix is this node.
    pub ies: Vec<u64>,
    pub forwarding: Vec<Forwarding>,
    /// Materialized outbound faces, valid while `fgen` matches.
    pub forward_to: Option<Vec<u32>>,
    pub tap: Option<Vec<u32>>,
    pub fgen: u64,
    /// Union of flags seen on the ancestor path (namespace flags).
    pub flags: u32,
    pub strategy: Option<StrategyInstance>,
    pub sst: StrategyState,
    /// Set by the reaper; a node aged twice with nothing on it retires.
    pub aged: bool,
}

#[derive(Debug, Default)]
pub struct NamePrefixTable {
    by_name: BTreeMap<Vec<u8>, NpeId>,
    nodes: HashMap<NpeId, Npe>,
    next_id: NpeId,
    pub forward_to_gen: u64,
}

impl NamePrefixTable {
    pub fn new() -> Self {
        let mut t = Self {
            by_name: BTreeMap::new(),
            nodes: HashMap::new(),
            next_id: 0,
            forward_to_gen: 1,
        };
        t.alloc(Vec::new(), None);
        t
    }

    fn alloc(&mut self, flat: Vec<u8>, parent: Option<NpeId>) -> NpeId {
        self.next_id += 1;
        let id = self.next_id;
        let (flags, sst) = match parent.and_then(|p| self.nodes.get(&p)) {
            Some(p) => (p.flags, p.sst),
            None => (0, StrategyState::default()),
        };
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children += 1;
        }
        self.nodes.insert(
            id,
            Npe {
                id,
                flat: flat.clone(),
                parent,
                children: 0,
                ies: Vec::new(),
                forwarding: Vec::new(),
                forward_to: None,
                tap: None,
                fgen: self.forward_to_gen - 1,
                flags,
                strategy: None,
                sst,
                aged: false,
            },
        );
        self.by_name.insert(flat, id);
        id
    }

    pub fn node(&self, id: NpeId) -> Option<&Npe> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NpeId) -> Option<&mut Npe> {
        self.nodes.get_mut(&id)
    }

    pub fn root(&self) -> NpeId {
        *self.by_name.get(&Vec::new()).expect("root always exists")
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> Vec<NpeId> {
        self.nodes.keys().copied().collect()
    }

    /// Node for an exact prefix, if present.
    pub fn lookup_exact(&self, name: &FlatName) -> Option<NpeId> {
        self.by_name.get(name.as_flat()).copied()
    }

    /// Node for the longest existing prefix of `name`.
    pub fn lookup_longest(&self, name: &FlatName) -> NpeId {
        let count = name.count();
        for i in (0..=count).rev() {
            let p = name.prefix(i);
            if let Some(&id) = self.by_name.get(p.as_flat()) {
                return id;
            }
        }
        self.root()
    }

    /// Creates the node for `name` (and all its ancestors) if missing.
    pub fn seek(&mut self, name: &FlatName) -> NpeId {
        let count = name.count();
        let mut parent = None;
        let mut id = self.root();
        for i in 0..=count {
            let p = name.prefix(i);
            id = match self.by_name.get(p.as_flat()) {
                Some(&id) => id,
                None => self.alloc(p.into_flat(), parent),
            };
            parent = Some(id);
        }
        id
    }

    /// Walks up from `id` to the nearest node carrying forwarding.
    pub fn nearest_forwarding(&self, mut id: NpeId) -> NpeId {
        loop {
            let Some(node) = self.nodes.get(&id) else {
                return id;
            };
            if !node.forwarding.is_empty() || node.parent.is_none() {
                return id;
            }
            id = node.parent.expect("checked above");
        }
    }

    /// True when `id` is `ancestor` or below it.
    pub fn is_descendant(&self, mut id: NpeId, ancestor: NpeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes.get(&id).and_then(|n| n.parent) {
                Some(p) => id = p,
                None => return false,
            }
        }
    }

    /// Registers or refreshes a forwarding entry.
    ///
    /// Returns the resulting flags; `forw::REFRESHED` in the result marks
    /// an idempotent re-registration of an existing entry.
    pub fn register(
        &mut self,
        prefix: &FlatName,
        faceid: u32,
        flags: Option<u32>,
        expires: i32,
    ) -> Result<u32, Error> {
        if let Some(f) = flags {
            if f & forw::PUBMASK != f {
                return Err(Error::Admin {
                    code: 504,
                    reason: "bad forwarding flags".into(),
                });
            }
        }
        let id = self.seek(prefix);
        self.forward_to_gen += 1;
        let node = self.nodes.get_mut(&id).expect("seek created node");
        let idx = node.forwarding.iter().position(|f| f.faceid == faceid);
        let (idx, refreshed) = match idx {
            Some(i) => (i, forw::REFRESHED),
            None => {
                node.forwarding.push(Forwarding {
                    faceid,
                    flags: forw::CHILD_INHERIT | forw::ACTIVE,
                    expires: i32::MAX,
                });
                (node.forwarding.len() - 1, 0)
            }
        };
        let entry = &mut node.forwarding[idx];
        entry.expires = expires;
        let flags = flags.unwrap_or(entry.flags & forw::PUBMASK);
        entry.flags = forw::REFRESHED | flags;
        debug!(
            "prefix {} -> face {} flags {:#x}",
            prefix.to_uri(),
            faceid,
            flags
        );
        Ok(refreshed | flags)
    }

    /// Removes one forwarding entry; true when something was removed.
    pub fn unregister(&mut self, prefix: &FlatName, faceid: u32) -> bool {
        let Some(&id) = self.by_name.get(prefix.as_flat()) else {
            return false;
        };
        let node = self.nodes.get_mut(&id).expect("indexed node");
        let before = node.forwarding.len();
        node.forwarding.retain(|f| f.faceid != faceid);
        if node.forwarding.len() != before {
            self.forward_to_gen += 1;
            true
        } else {
            false
        }
    }

    /// Rebuilds the materialized `forward_to`/`tap` lists for a node from
    /// its ancestors' forwarding entries.
    pub fn update_forward_to(&mut self, id: NpeId, faces: &FaceTable) {
        let mut x: Vec<u32> = Vec::new();
        let mut tap: Vec<u32> = Vec::new();
        let mut wantflags = forw::ACTIVE;
        let mut lastfaceid = None;
        let mut namespace_flags = 0;

        let mut walk = Some(id);
        while let Some(pid) = walk {
            let Some(p) = self.nodes.get(&pid) else { break };
            let mut moreflags = forw::CHILD_INHERIT;
            for f in &p.forwarding {
                if faces.get(f.faceid).is_none() {
                    continue;
                }
                // the sense of CAPTURE_OK is inverted for this test
                let tflags = f.flags ^ forw::CAPTURE_OK;
                if tflags & wantflags == wantflags {
                    if !x.contains(&f.faceid) {
                        x.push(f.faceid);
                    }
                    if f.flags & forw::TAP != 0 && !tap.contains(&f.faceid) {
                        tap.push(f.faceid);
                    }
                    if f.flags & forw::LAST != 0 {
                        lastfaceid = Some(f.faceid);
                    }
                }
                namespace_flags |= f.flags;
                if f.flags & forw::CAPTURE != 0 {
                    moreflags |= forw::CAPTURE_OK;
                }
            }
            wantflags |= moreflags;
            walk = p.parent;
        }
        if let Some(last) = lastfaceid {
            x.retain(|&f| f != last);
            x.push(last);
        }
        let gen = self.forward_to_gen;
        let node = self.nodes.get_mut(&id).expect("node exists");
        node.flags = namespace_flags;
        node.forward_to = if x.is_empty() { None } else { Some(x) };
        node.tap = if tap.is_empty() { None } else { Some(tap) };
        node.fgen = gen;
    }

    /// Consults the FIB for the outbound faces of an Interest.
    ///
    /// `from` is the arrival face `(faceid, flags)`; the result never
    /// includes it.
    pub fn outbound_faces(
        &mut self,
        from: Option<(u32, u32)>,
        interest: &Interest,
        npe_id: NpeId,
        faces: &FaceTable,
    ) -> Vec<u32> {
        let id = self.nearest_forwarding(npe_id);
        if self.nodes.get(&id).map(|n| n.fgen) != Some(self.forward_to_gen) {
            self.update_forward_to(id, faces);
        }
        if interest.scope == Some(0) {
            return Vec::new();
        }
        let from_gg = from.map_or(false, |(_, fl)| fl & fflags::GG != 0);
        if from_gg {
            if let Some(hint) = interest.faceid_hint {
                return vec![hint];
            }
        }
        let node = self.nodes.get(&id).expect("node exists");
        let Some(forward_to) = node.forward_to.as_ref() else {
            return Vec::new();
        };
        let mut checkmask: u32 = 0;
        if node.flags & forw::LOCAL != 0 {
            checkmask = if from_gg { fflags::GG } else { u32::MAX };
        } else if interest.scope == Some(1) {
            checkmask = fflags::GG;
        } else if interest.scope == Some(2) {
            checkmask = match from {
                Some((_, fl)) => fflags::GG & !fl,
                None => u32::MAX,
            };
        }
        let wantmask = checkmask;
        if wantmask == fflags::GG {
            checkmask |= fflags::DC;
        }
        let from_id = from.map(|(id, _)| id);
        let mut out = Vec::new();
        for &faceid in forward_to {
            if Some(faceid) == from_id {
                continue;
            }
            let Some(face) = faces.get(faceid) else {
                continue;
            };
            if face.flags & checkmask == wantmask {
                out.push(faceid);
            }
        }
        out
    }

    /// Ages the forwarding entries: entries not refreshed within their
    /// lifetime are dropped, as are entries whose face has vanished.
    pub fn age_forwarding(&mut self, faces: &FaceTable) {
        for node in self.nodes.values_mut() {
            node.forwarding.retain_mut(|f| {
                if f.flags & forw::REFRESHED == 0 || faces.get(f.faceid).is_none() {
                    return false;
                }
                f.expires = f.expires.saturating_sub(FWU_SECS);
                if f.expires <= 0 {
                    f.flags &= !forw::REFRESHED;
                }
                true
            });
        }
        self.forward_to_gen += 1;
    }

    /// Reap pass: drops vanished faces from the caches and retires nodes
    /// that have sat idle for two passes with nothing attached.
    pub fn check_entries(&mut self, faces: &FaceTable) -> usize {
        let mut removed = 0;
        let ids: Vec<NpeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let retire = {
                let node = self.nodes.get(&id).expect("listed node");
                node.aged
                    && node.parent.is_some()
                    && node.children == 0
                    && node.forwarding.is_empty()
                    && node.strategy.is_none()
                    && node.ies.is_empty()
            };
            if retire {
                let node = self.nodes.remove(&id).expect("listed node");
                self.by_name.remove(&node.flat);
                if let Some(p) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
                    p.children -= 1;
                }
                removed += 1;
                continue;
            }
            let node = self.nodes.get_mut(&id).expect("listed node");
            if let Some(ft) = node.forward_to.as_mut() {
                ft.retain(|&f| faces.get(f).is_some());
                if ft.is_empty() {
                    node.forward_to = None;
                }
            }
            if let Some(tap) = node.tap.as_mut() {
                tap.retain(|&f| faces.get(f).is_some());
                if tap.is_empty() {
                    node.tap = None;
                }
            }
            node.aged = true;
        }
        removed
    }

    /// The strategy instance in effect at a node, walking up ancestors;
    /// installs the default on the root when nothing is attached.
    pub fn effective_strategy(&mut self, id: NpeId) -> (NpeId, StrategyInstance) {
        let mut walk = Some(id);
        while let Some(pid) = walk {
            let node = self.nodes.get(&pid).expect("walked node");
            if let Some(si) = &node.strategy {
                return (pid, si.clone());
            }
            walk = node.parent;
        }
        let root = self.root();
        let si = StrategyInstance::create("default", None).expect("default strategy exists");
        let node = self.nodes.get_mut(&root).expect("root exists");
        node.strategy = Some(si.clone());
        (root, si)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::{Face, FaceOutput};

    fn faces_with(n: usize, bits: u32) -> (FaceTable, Vec<u32>) {
        let mut t = FaceTable::new();
        let ids = (0..n)
            .map(|_| t.enroll(Face::new(bits, None, FaceOutput::Discard)).unwrap())
            .collect();
        (t, ids)
    }

    fn name(uri: &str) -> FlatName {
        FlatName::from_uri(uri).unwrap()
    }

    #[test]
    fn seek_builds_ancestors() {
        let mut t = NamePrefixTable::new();
        let abc = t.seek(&name("/a/b/c"));
        assert_eq!(t.len(), 4); // root, /a, /a/b, /a/b/c
        let ab = t.lookup_exact(&name("/a/b")).unwrap();
        assert_eq!(t.node(abc).unwrap().parent, Some(ab));
        assert_eq!(t.node(ab).unwrap().children, 1);
        assert_eq!(t.lookup_longest(&name("/a/b/c/d/e")), abc);
        assert_eq!(t.lookup_longest(&name("/z")), t.root());
    }

    #[test]
    fn registration_is_idempotent() {
        let (faces, ids) = faces_with(1, fflags::STREAM);
        let mut t = NamePrefixTable::new();
        let flags = Some(forw::ACTIVE | forw::CHILD_INHERIT);
        let r1 = t.register(&name("/a"), ids[0], flags, 300).unwrap();
        assert_eq!(r1 & forw::REFRESHED, 0);
        let r2 = t.register(&name("/a"), ids[0], flags, 300).unwrap();
        assert_ne!(r2 & forw::REFRESHED, 0);
        let id = t.lookup_exact(&name("/a")).unwrap();
        assert_eq!(t.node(id).unwrap().forwarding.len(), 1);
        let _ = faces;
    }

    #[test]
    fn child_inherit_and_capture() {
        let (faces, ids) = faces_with(3, fflags::STREAM);
        let mut t = NamePrefixTable::new();
        t.register(&name("/a"), ids[0], Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
            .unwrap();
        t.register(&name("/a/b"), ids[1], Some(forw::ACTIVE), 300).unwrap();

        let interest = Interest::new(name("/a/b/x"));
        let nid = t.seek(&name("/a/b/x"));
        let out = t.outbound_faces(None, &interest, nid, &faces);
        // /a/b has forwarding; inherits face 0 from /a, adds its own
        assert!(out.contains(&ids[0]) && out.contains(&ids[1]));

        // mark the ancestor entry preemptible
        t.register(
            &name("/a"),
            ids[0],
            Some(forw::ACTIVE | forw::CHILD_INHERIT | forw::CAPTURE_OK),
            300,
        )
        .unwrap();
        let out = t.outbound_faces(None, &interest, nid, &faces);
        assert!(out.contains(&ids[0]), "no capture below, entry still usable");

        // CAPTURE on /a/b preempts the CAPTURE_OK ancestor entry
        t.register(
            &name("/a/b"),
            ids[1],
            Some(forw::ACTIVE | forw::CAPTURE),
            300,
        )
        .unwrap();
        let out = t.outbound_faces(None, &interest, nid, &faces);
        assert!(!out.contains(&ids[0]) && out.contains(&ids[1]));
    }

    #[test]
    fn tap_and_last_handling() {
        let (faces, ids) = faces_with(3, fflags::STREAM);
        let mut t = NamePrefixTable::new();
        t.register(
            &name("/a"),
            ids[0],
            Some(forw::ACTIVE | forw::CHILD_INHERIT | forw::LAST),
            300,
        )
        .unwrap();
        t.register(&name("/a"), ids[1], Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
            .unwrap();
        t.register(
            &name("/a"),
            ids[2],
            Some(forw::ACTIVE | forw::CHILD_INHERIT | forw::TAP),
            300,
        )
        .unwrap();
        let id = t.lookup_exact(&name("/a")).unwrap();
        t.update_forward_to(id, &faces);
        let node = t.node(id).unwrap();
        let ft = node.forward_to.as_ref().unwrap();
        assert_eq!(*ft.last().unwrap(), ids[0], "LAST entry moved to the end");
        assert_eq!(node.tap.as_deref(), Some(&[ids[2]][..]));
    }

    #[test]
    fn scope_filtering() {
        let (mut faces, ids) = faces_with(2, fflags::STREAM);
        faces.get_mut(ids[1]).unwrap().flags |= fflags::GG;
        let mut t = NamePrefixTable::new();
        for &f in &ids {
            t.register(&name("/a"), f, Some(forw::ACTIVE | forw::CHILD_INHERIT), 300)
                .unwrap();
        }
        let nid = t.seek(&name("/a/x"));
        let from = Some((9999, 0));

        // scope 0: nothing
        let i0 = Interest::new(name("/a/x")).with_scope(0);
        assert!(t.outbound_faces(from, &i0, nid, &faces).is_empty());

        // scope 1: GG faces only
        let i1 = Interest::new(name("/a/x")).with_scope(1);
        assert_eq!(t.outbound_faces(from, &i1, nid, &faces), vec![ids[1]]);

        // scope 3: everything except the source
        let i3 = Interest::new(name("/a/x")).with_scope(3);
        let out = t.outbound_faces(Some((ids[0], 0)), &i3, nid, &faces);
        assert_eq!(out, vec![ids[1]]);
    }

    #[test]
    fn ageing_drops_unrefreshed() {
        let (faces, ids) = faces_with(1, fflags::STREAM);
        let mut t = NamePrefixTable::new();
        t.register(&name("/a"), ids[0], Some(forw::ACTIVE), FWU_SECS).unwrap();
        let id = t.lookup_exact(&name("/a")).unwrap();
        // first pass: expires hits zero, REFRESHED is cleared
        t.age_forwarding(&faces);
        assert_eq!(t.node(id).unwrap().forwarding.len(), 1);
        // second pass: no longer refreshed, dropped
        t.age_forwarding(&faces);
        assert!(t.node(id).unwrap().forwarding.is_empty());
    }

    #[test]
    fn reap_retires_idle_nodes() {
        let (faces, _ids) = faces_with(1, fflags::STREAM);
        let mut t = NamePrefixTable::new();
        t.seek(&name("/a/b"));
        assert_eq!(t.len(), 3);
        t.check_entries(&faces); // marks aged
        let removed = t.check_entries(&faces);
        assert!(removed >= 1);
        assert!(t.lookup_exact(&name("/a/b")).is_none());
    }
}
