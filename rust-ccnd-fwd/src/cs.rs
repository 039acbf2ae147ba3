//! The Content Store.
//!
//! A bounded cache of ContentObjects keyed by `name || implicit digest`,
//! indexed by the ordered name tree. A staleness queue ordered by
//! staletime drives both freshness checks and capacity reclaim. The
//! reference count on an entry is the sole authoritative hold; only the
//! send queues take references in normal operation.

use crate::nametree::{Cookie, Enrolled, NameTree};
use bytes::Bytes;
use log::debug;
use rust_ccnd_common::name::flatname_compare;
use rust_ccnd_common::packet::{
    content_matches_interest, ChildSelector, Interest, WireContentObject,
};
use rust_ccnd_common::{Error, FlatName};
use std::collections::BTreeSet;

/// Headroom kept above the soft capacity before a grow.
pub const CACHE_MARGIN: usize = 10;

/// Probe budget for one interest match walk.
pub const MAX_MATCH_PROBES: usize = 50_000;

/// Reclaim probes before giving up and forcing staleness.
const TRIM_TRIES: usize = 30;

#[derive(Debug)]
pub struct ContentEntry {
    pub cookie: Cookie,
    pub wire: Bytes,
    pub size: usize,
    pub arrival_faceid: u32,
    /// Component count including the implicit digest.
    pub ncomps: usize,
    /// Queue occurrences holding this entry live.
    pub refs: u32,
    /// Seconds-since-start at which the entry goes stale.
    pub staletime: u32,
    pub flags: u8,
    pub publisher_digest: Option<Vec<u8>>,
}

/// Outcome of offering an arriving ContentObject to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    New(Cookie),
    /// Already present and fresh.
    Duplicate(Cookie),
    /// Already present but stale; made fresh again.
    Freshened(Cookie),
}

#[derive(Debug)]
pub struct ContentStore {
    tree: NameTree<Vec<u8>, ContentEntry>,
    /// Every entry, ordered by (staletime, cookie); the reclaim queue.
    stale_queue: BTreeSet<(u32, Cookie)>,
    /// Soft capacity: above this, trim runs.
    capacity: usize,
    tts_default: u32,
    tts_limit: u32,
}

impl ContentStore {
    pub fn new(capacity: usize, tts_default: u32, tts_limit: u32) -> Self {
        // Don't preallocate an insanely large tree for an unbounded cap.
        let initial = capacity.min(100_000).max(1);
        Self {
            tree: NameTree::new(initial + CACHE_MARGIN),
            stale_queue: BTreeSet::new(),
            capacity,
            tts_default,
            tts_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn entry(&self, cookie: Cookie) -> Option<&ContentEntry> {
        self.tree.from_cookie(cookie)
    }

    pub fn entry_mut(&mut self, cookie: Cookie) -> Option<&mut ContentEntry> {
        self.tree.from_cookie_mut(cookie)
    }

    pub fn key_of(&self, cookie: Cookie) -> Option<&Vec<u8>> {
        self.tree.key_of(cookie)
    }

    pub fn is_stale(&self, entry: &ContentEntry, sec: u32) -> bool {
        entry.staletime <= sec
    }

    /// Take one queue reference on an entry.
    pub fn hold(&mut self, cookie: Cookie) {
        if let Some(e) = self.tree.from_cookie_mut(cookie) {
            e.refs += 1;
        }
    }

    /// Drop one queue reference.
    pub fn release(&mut self, cookie: Cookie) {
        if let Some(e) = self.tree.from_cookie_mut(cookie) {
            debug_assert!(e.refs > 0);
            e.refs = e.refs.saturating_sub(1);
        }
    }

    /// Offer an arriving object. A present-and-stale duplicate is
    /// freshened; the arrival faceid moves over only when the old
    /// arrival face is gone (`old_face_alive` reports that).
    pub fn insert(
        &mut self,
        obj: &WireContentObject,
        faceid: u32,
        sec: u32,
        old_face_alive: impl Fn(u32) -> bool,
    ) -> Result<InsertOutcome, Error> {
        if self.tree.len() >= self.tree.limit() && self.tree.limit() < self.capacity + CACHE_MARGIN
        {
            self.tree.grow();
        }
        let key = obj.flat_with_digest().to_vec();
        let staletime = self.staletime_for(obj.object.freshness_seconds, sec);
        match self.tree.enroll(
            key,
            ContentEntry {
                cookie: 0,
                wire: obj.wire.clone(),
                size: obj.wire.len(),
                arrival_faceid: faceid,
                ncomps: obj.ncomps(),
                refs: 0,
                staletime,
                flags: 0,
                publisher_digest: obj.object.publisher_digest.clone(),
            },
        )? {
            Enrolled::New(cookie) => {
                let e = self.tree.from_cookie_mut(cookie).expect("just enrolled");
                e.cookie = cookie;
                self.stale_queue.insert((staletime, cookie));
                Ok(InsertOutcome::New(cookie))
            }
            Enrolled::Existing(cookie) => {
                let stale = {
                    let e = self.tree.from_cookie(cookie).expect("existing cookie");
                    self.is_stale(e, sec)
                };
                if stale {
                    // Old content arriving after going stale: freshen it.
                    self.retime(cookie, staletime);
                    let e = self.tree.from_cookie_mut(cookie).expect("existing cookie");
                    if !old_face_alive(e.arrival_faceid) {
                        e.arrival_faceid = faceid;
                    }
                    Ok(InsertOutcome::Freshened(cookie))
                } else {
                    Ok(InsertOutcome::Duplicate(cookie))
                }
            }
        }
    }

    fn staletime_for(&self, freshness: Option<u32>, sec: u32) -> u32 {
        if self.capacity == 0 {
            return sec; // force zero freshness
        }
        let seconds = match freshness {
            Some(f) if f <= self.tts_limit => f,
            Some(_) => self.tts_limit,
            None => self.tts_default,
        };
        sec.saturating_add(seconds)
    }

    fn retime(&mut self, cookie: Cookie, staletime: u32) {
        if let Some(e) = self.tree.from_cookie_mut(cookie) {
            let old = e.staletime;
            e.staletime = staletime;
            self.stale_queue.remove(&(old, cookie));
            self.stale_queue.insert((staletime, cookie));
        }
    }

    /// Mark an entry stale as of now.
    pub fn mark_stale(&mut self, cookie: Cookie, sec: u32) {
        let Some(e) = self.tree.from_cookie(cookie) else {
            return;
        };
        if self.is_stale(e, sec) {
            return;
        }
        self.retime(cookie, sec);
    }

    /// Demote unsolicited content so it drains before anything else.
    pub fn mark_unsolicited(&mut self, cookie: Cookie) {
        self.retime(cookie, 0);
    }

    /// Remove an entry outright.
    pub fn remove(&mut self, cookie: Cookie) {
        if let Some(e) = self.tree.from_cookie(cookie) {
            if e.refs != 0 {
                debug!("removing queued content, cookie {}", cookie);
            }
            let st = e.staletime;
            self.stale_queue.remove(&(st, cookie));
            self.tree.remove(cookie);
        }
    }

    /// Number of stale entries; status reporting only.
    pub fn stale_count(&self, sec: u32) -> usize {
        self.stale_queue
            .iter()
            .take_while(|(st, _)| *st <= sec)
            .count()
    }

    /// Discard content as needed to enforce the capacity limit.
    ///
    /// Prefer unreferenced queued entries, oldest staletime first. If a
    /// fresh entry blocks the scan, force it stale and stop (it will
    /// drain later). If the scan finds nothing and the hard limit is
    /// exceeded, the oldest queued entry goes even while referenced.
    pub fn trim(&mut self, sec: u32) {
        if self.tree.len() <= self.capacity {
            return;
        }
        let mut tries = TRIM_TRIES;
        let queued: Vec<(u32, Cookie)> = self.stale_queue.iter().copied().collect();
        for (staletime, cookie) in queued {
            let Some(e) = self.tree.from_cookie(cookie) else {
                continue;
            };
            if e.refs == 0 {
                self.remove(cookie);
                if self.tree.len() <= self.capacity {
                    return;
                }
            } else if staletime > sec {
                // Add to no new queues so it drains eventually.
                self.mark_stale(cookie, sec);
                debug!("force_stale cookie {}", cookie);
                break;
            } else {
                tries -= 1;
                if tries == 0 {
                    break;
                }
            }
        }
        if self.tree.len() > self.tree.limit() {
            // Tried and failed to preserve queued content.
            if let Some(&(_, cookie)) = self.stale_queue.iter().next() {
                self.remove(cookie);
            }
        }
    }

    /// Find the first candidate that might match the given interest.
    fn first_match_candidate(&self, interest: &Interest) -> Option<Cookie> {
        let mut seek = interest.name.as_flat().to_vec();
        if let Some(exclude) = &interest.exclude {
            // <Exclude><Any/><Component>... fast case: start past it
            if let Some(comp) = exclude.leading_any_component() {
                let mut name = interest.name.clone();
                name.push(comp);
                seek = name.into_flat();
            }
        }
        self.tree.lookup_ge(&seek)
    }

    fn matches_prefix(&self, cookie: Cookie, prefix_flat: &[u8]) -> bool {
        let Some(key) = self.tree.key_of(cookie) else {
            return false;
        };
        flatname_compare(prefix_flat, key).is_prefix()
    }

    /// Successor probe for the rightmost walk: the smallest key after
    /// every extension of the candidate's component at `level`.
    fn next_child_at_level(&self, cookie: Cookie, level: usize) -> Option<Cookie> {
        let e = self.tree.from_cookie(cookie)?;
        if e.ncomps <= level + 1 {
            return None;
        }
        let key = self.tree.key_of(cookie)?;
        let name = FlatName::from_flat(key.clone()).ok()?;
        let mut probe = name.prefix(level + 1);
        probe.next_sibling();
        self.tree.lookup_ge(&probe.into_flat())
    }

    /// The interest match walk over the ordered index.
    ///
    /// Splices out stale unreferenced entries it passes when the interest
    /// refuses stale answers; reports the matched cookie.
    pub fn match_interest(&mut self, interest: &Interest, sec: u32) -> Option<Cookie> {
        let prefix_flat = interest.name.as_flat().to_vec();
        let prefix_comps = interest.name.count();
        let stale_ok = interest.stale_ok();
        let mut last_match = None;

        let mut content = self.first_match_candidate(interest);
        if let Some(c) = content {
            if !self.matches_prefix(c, &prefix_flat) {
                content = None;
            }
        }
        let mut probes: usize = 0;
        while let Some(cookie) = content {
            let state = match (self.tree.from_cookie(cookie), self.tree.key_of(cookie)) {
                (Some(e), Some(key)) => Some((
                    content_matches_interest(
                        key,
                        e.ncomps,
                        e.publisher_digest.as_deref(),
                        interest,
                    ),
                    self.is_stale(e, sec),
                    e.refs,
                )),
                _ => None,
            };
            let Some((is_match, is_stale, refs)) = state else {
                break;
            };
            let mut next = None;
            if !stale_ok && is_stale {
                next = self.tree.next(cookie);
                if refs == 0 {
                    self.remove(cookie);
                } else {
                    // skipped without consuming a probe
                    probes = probes.saturating_sub(1);
                }
            } else if is_match {
                if interest.child_selector == ChildSelector::Leftmost {
                    return Some(cookie);
                }
                last_match = Some(cookie);
                next = self.next_child_at_level(cookie, prefix_comps);
            } else {
                next = self.tree.next(cookie);
            }
            probes += 1;
            if probes >= MAX_MATCH_PROBES {
                break;
            }
            content = match next {
                Some(n) if self.matches_prefix(n, &prefix_flat) => Some(n),
                _ => None,
            };
        }
        last_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_ccnd_common::packet::{ContentObject, Exclude, ExcludeItem};

    fn store() -> ContentStore {
        ContentStore::new(100, 3600, 86_400)
    }

    fn put(cs: &mut ContentStore, uri: &str, body: &[u8], sec: u32) -> Cookie {
        let obj = ContentObject::new(FlatName::from_uri(uri).unwrap(), body.to_vec())
            .with_freshness_seconds(60);
        let wire = WireContentObject::parse(obj.encode()).unwrap();
        match cs.insert(&wire, 9, sec, |_| true).unwrap() {
            InsertOutcome::New(c) => c,
            other => panic!("expected new insert, got {other:?}"),
        }
    }

    #[test]
    fn exact_hit_leftmost() {
        let mut cs = store();
        let c = put(&mut cs, "/a/b", b"one", 0);
        let interest = Interest::new(FlatName::from_uri("/a/b").unwrap());
        assert_eq!(cs.match_interest(&interest, 0), Some(c));
        // still cached afterwards
        assert_eq!(cs.len(), 1);
    }

    #[test]
    fn prefix_scope_is_respected() {
        let mut cs = store();
        put(&mut cs, "/a/b", b"one", 0);
        let interest = Interest::new(FlatName::from_uri("/z").unwrap());
        assert_eq!(cs.match_interest(&interest, 0), None);
    }

    #[test]
    fn stale_entries_are_spliced_out() {
        let mut cs = store();
        put(&mut cs, "/a/b", b"one", 0);
        // advance past the 60 s freshness
        let interest = Interest::new(FlatName::from_uri("/a").unwrap());
        assert_eq!(cs.match_interest(&interest, 120), None);
        assert_eq!(cs.len(), 0, "stale unreferenced entry reclaimed");

        // stale-ok interests still see it
        let c = put(&mut cs, "/a/c", b"two", 0);
        let mut stale_ok = Interest::new(FlatName::from_uri("/a").unwrap());
        stale_ok.answer_origin_kind |= rust_ccnd_common::packet::AOK_STALE;
        assert_eq!(cs.match_interest(&stale_ok, 120), Some(c));
    }

    #[test]
    fn rightmost_returns_last_sibling() {
        let mut cs = store();
        let _c1 = put(&mut cs, "/a/1", b"one", 0);
        let _c2 = put(&mut cs, "/a/2", b"two", 0);
        let c3 = put(&mut cs, "/a/3", b"three", 0);
        let mut interest = Interest::new(FlatName::from_uri("/a").unwrap());
        interest.child_selector = ChildSelector::Rightmost;
        assert_eq!(cs.match_interest(&interest, 0), Some(c3));
    }

    #[test]
    fn exclude_fast_path_skips_range() {
        let mut cs = store();
        let _c1 = put(&mut cs, "/a/1", b"one", 0);
        let c2 = put(&mut cs, "/a/2", b"two", 0);
        let mut interest = Interest::new(FlatName::from_uri("/a").unwrap());
        interest.exclude = Some(Exclude {
            items: vec![
                ExcludeItem::Any,
                ExcludeItem::Component(b"1".to_vec()),
            ],
        });
        assert_eq!(cs.match_interest(&interest, 0), Some(c2));
    }

    #[test]
    fn freshen_keeps_live_arrival_face() {
        let mut cs = store();
        let obj = ContentObject::new(FlatName::from_uri("/a/b").unwrap(), &b"x"[..])
            .with_freshness_seconds(1);
        let wire = WireContentObject::parse(obj.encode()).unwrap();
        let InsertOutcome::New(c) = cs.insert(&wire, 5, 0, |_| true).unwrap() else {
            panic!("expected new");
        };
        // same object again, stale now, old face still alive: keep face 5
        let out = cs.insert(&wire, 7, 10, |_| true).unwrap();
        assert_eq!(out, InsertOutcome::Freshened(c));
        assert_eq!(cs.entry(c).unwrap().arrival_faceid, 5);
        // stale again, old face gone: adopt the new arrival face
        let out = cs.insert(&wire, 7, 100, |_| false).unwrap();
        assert_eq!(out, InsertOutcome::Freshened(c));
        assert_eq!(cs.entry(c).unwrap().arrival_faceid, 7);
    }

    #[test]
    fn trim_prefers_unreferenced() {
        let mut cs = ContentStore::new(2, 1, 86_400);
        let a = put(&mut cs, "/a", b"a", 0);
        let b = put(&mut cs, "/b", b"b", 0);
        cs.hold(b);
        put(&mut cs, "/c", b"c", 10);
        cs.trim(10);
        assert!(cs.entry(a).is_none(), "unreferenced oldest dropped");
        assert!(cs.entry(b).is_some(), "referenced entry survives");
        assert_eq!(cs.len(), 2);
    }

    #[test]
    fn refcounted_entries_only_reclaimed_at_hard_limit() {
        let mut cs = ContentStore::new(1, 1, 86_400);
        let a = put(&mut cs, "/a", b"a", 0);
        cs.hold(a);
        // grow the tree artificially small: limit is 1 + margin, so fill
        // past the soft capacity but under the hard limit
        let b = put(&mut cs, "/b", b"b", 5);
        cs.trim(5);
        // a is referenced; b was just inserted fresh then forced stale
        assert!(cs.entry(a).is_some());
        assert!(cs.entry(b).is_some());
    }
}
