//! Per-face content send queues.
//!
//! Content goes out through one of three delay classes per face. Queues
//! hold content cookies, not pointers; each queued occurrence owns one
//! reference on the content entry. The randomized release delay is what
//! lets a multicast listener suppress its own copy when a peer answers
//! first.

use crate::face::{flags, Face};
use crate::nametree::Cookie;
use crate::sched::EvHandle;
use rand::Rng;

pub const CQ_ASAP: usize = 0;
pub const CQ_NORMAL: usize = 1;
pub const CQ_SLOW: usize = 2;
pub const CQ_N: usize = 3;

/// Content entry flag requesting the slow class on link faces.
pub const CONTENT_SLOWSEND: u8 = 1;

/// Maximum items transmitted per timer firing.
pub const BURST_MAX: usize = 2;

/// Nanosecond budget per firing before the timer yields.
pub const BURST_BUDGET_NSEC: u64 = 1_000_000;

#[derive(Debug)]
pub struct ContentQueue {
    /// Queued content cookies, oldest first. Insertion is set-like.
    pub send_queue: Vec<Cookie>,
    /// Items eligible to send before re-randomizing the delay.
    pub ready: usize,
    /// Consecutive sends without the queue draining.
    pub nrun: u32,
    pub min_usec: u32,
    pub rand_usec: u32,
    pub burst_nsec: u32,
    /// Scheduled sender event, if armed.
    pub sender: Option<EvHandle>,
}

impl ContentQueue {
    pub fn new(face: &Face, class: usize, data_pause_usec: u32) -> Self {
        let usec = choose_face_delay(face, class, data_pause_usec);
        Self {
            send_queue: Vec::new(),
            ready: 0,
            nrun: 0,
            min_usec: usec,
            rand_usec: 2 * usec,
            burst_nsec: if usec <= 500 { 500 } else { 150_000 },
            sender: None,
        }
    }

    /// Set-like insert; true when the cookie was not already queued.
    pub fn insert(&mut self, cookie: Cookie) -> bool {
        if self.send_queue.contains(&cookie) {
            return false;
        }
        self.send_queue.push(cookie);
        true
    }

    pub fn contains(&self, cookie: Cookie) -> bool {
        self.send_queue.contains(&cookie)
    }

    /// Zeroes a queued occurrence in place, keeping positions stable.
    /// Returns true when an occurrence was cleared.
    pub fn clear_in_place(&mut self, cookie: Cookie) -> bool {
        if cookie == 0 {
            return false;
        }
        for slot in self.send_queue.iter_mut() {
            if *slot == cookie {
                *slot = 0;
                return true;
            }
        }
        false
    }
}

/// Select the output queue class for a piece of content on a face.
pub fn choose_content_delay_class(face: Option<&Face>, content_flags: u8) -> usize {
    let Some(face) = face else {
        return CQ_ASAP; // going nowhere, get it over with
    };
    if face.has(flags::LINK | flags::MCAST) {
        // udplink or such, delay more
        return if content_flags & CONTENT_SLOWSEND != 0 {
            CQ_SLOW
        } else {
            CQ_NORMAL
        };
    }
    if face.has(flags::DGRAM) {
        return CQ_NORMAL; // udp, delay just a little
    }
    if face.has(flags::GG | flags::LOCAL) {
        return CQ_ASAP; // localhost, answer quickly
    }
    CQ_NORMAL
}

/// Base delay in microseconds for a face and class.
fn choose_face_delay(face: &Face, class: usize, data_pause_usec: u32) -> u32 {
    if class == CQ_ASAP {
        return 1;
    }
    if face.has(flags::MCAST) {
        let shift = if class == CQ_SLOW { 2 } else { 0 };
        return data_pause_usec << shift; // multicast, delay more
    }
    1
}

/// Pick the randomized delay before the queue's next release.
///
/// Small values are not worth randomizing; otherwise the delay is
/// `min_usec + U[0, rand_usec)`.
pub fn randomize_content_delay(rng: &mut impl Rng, q: &ContentQueue) -> u32 {
    let usec = q.min_usec + q.rand_usec;
    if usec < 2 {
        return 1;
    }
    if usec <= 20 || q.rand_usec < 2 {
        return usec;
    }
    let usec = q.min_usec + rng.gen_range(0..q.rand_usec);
    usec.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::FaceOutput;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn face_with(bits: u32) -> Face {
        Face::new(bits, None, FaceOutput::Discard)
    }

    #[test]
    fn class_selection() {
        assert_eq!(choose_content_delay_class(None, 0), CQ_ASAP);
        assert_eq!(
            choose_content_delay_class(Some(&face_with(flags::GG)), 0),
            CQ_ASAP
        );
        assert_eq!(
            choose_content_delay_class(Some(&face_with(flags::DGRAM)), 0),
            CQ_NORMAL
        );
        assert_eq!(
            choose_content_delay_class(Some(&face_with(flags::MCAST | flags::DGRAM)), 0),
            CQ_NORMAL
        );
        assert_eq!(
            choose_content_delay_class(
                Some(&face_with(flags::MCAST | flags::DGRAM)),
                CONTENT_SLOWSEND
            ),
            CQ_SLOW
        );
        assert_eq!(
            choose_content_delay_class(Some(&face_with(flags::STREAM)), 0),
            CQ_NORMAL
        );
    }

    #[test]
    fn multicast_queues_delay_more() {
        let mcast = face_with(flags::MCAST | flags::DGRAM);
        let q = ContentQueue::new(&mcast, CQ_NORMAL, 10_000);
        assert_eq!(q.min_usec, 10_000);
        assert_eq!(q.rand_usec, 20_000);
        let slow = ContentQueue::new(&mcast, CQ_SLOW, 10_000);
        assert_eq!(slow.min_usec, 40_000);

        let gg = face_with(flags::GG | flags::LOCAL);
        let q = ContentQueue::new(&gg, CQ_ASAP, 10_000);
        assert_eq!(q.min_usec, 1);
        assert_eq!(q.burst_nsec, 500);
    }

    #[test]
    fn insert_is_set_like() {
        let f = face_with(flags::STREAM);
        let mut q = ContentQueue::new(&f, CQ_NORMAL, 10_000);
        assert!(q.insert(7));
        assert!(!q.insert(7));
        assert_eq!(q.send_queue.len(), 1);
        assert!(q.clear_in_place(7));
        assert!(!q.clear_in_place(7));
        assert_eq!(q.send_queue, vec![0]);
    }

    #[test]
    fn jitter_stays_in_range() {
        let f = face_with(flags::MCAST | flags::DGRAM);
        let q = ContentQueue::new(&f, CQ_NORMAL, 10_000);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = randomize_content_delay(&mut rng, &q);
            assert!(d >= q.min_usec && d < q.min_usec + q.rand_usec);
        }
    }
}
