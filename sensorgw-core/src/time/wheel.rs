//! ## sensorgw-core::time::wheel
//! **Hierarchical timing wheel**
//!
//! Five levels of buckets with millisecond resolution. Level 1 has 256
//! buckets of 1 ms; levels 2-5 have 64 buckets each, every level 64x coarser
//! than the one below. A timer is filed in the finest level whose span covers
//! its distance from the wheel's current time and is cascaded one level down
//! whenever the lower level completes the corresponding revolution.
//!
//! Timer nodes live in a slab and are linked through indices, so buckets are
//! intrusive singly linked lists and cancellation is a flag flip. Cancelled
//! nodes are reclaimed when their bucket is next drained.

use tracing::trace;

use super::Clock;
use crate::error::TimerError;

/// Longest accepted delay.
pub const MAX_DELAY_MS: u64 = u32::MAX as u64;

const LEVELS: usize = 5;
const L1_BITS: u32 = 8;
const LN_BITS: u32 = 6;
const L1_SIZE: usize = 1 << L1_BITS;
const LN_SIZE: usize = 1 << LN_BITS;
const L1_MASK: u64 = L1_SIZE as u64 - 1;
const LN_MASK: u64 = LN_SIZE as u64 - 1;
const NIL: u32 = u32::MAX;

/// Bit offset of a level's bucket index inside an expiry time. Levels are
/// 1-based.
const fn level_shift(level: usize) -> u32 {
    if level == 1 {
        0
    } else {
        L1_BITS + (level as u32 - 2) * LN_BITS
    }
}

/// Milliseconds covered by one full revolution of a level.
const fn level_span(level: usize) -> u64 {
    1 << (L1_BITS + (level as u32 - 1) * LN_BITS)
}

/// Bucket indices strictly after `begin` up to and including `end`, wrapping
/// modulo `size`. Empty when `begin == end`.
fn crossed(begin: usize, end: usize, size: usize) -> impl Iterator<Item = usize> {
    let steps = (end + size - begin) % size;
    (1..=steps).map(move |step| (begin + step) % size)
}

/// Handle to a pending timer. Stale handles never match a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    slot: u32,
    generation: u32,
}

/// Outcome of [`Wheel::add_timer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Scheduled<T> {
    /// Zero delay: the payload is handed straight back to be run now.
    Now(T),
    Pending(TimerId),
}

impl<T> Scheduled<T> {
    pub fn id(&self) -> Option<TimerId> {
        match self {
            Scheduled::Pending(id) => Some(*id),
            Scheduled::Now(_) => None,
        }
    }
}

struct Node<T> {
    payload: Option<T>,
    expire: u64,
    active: bool,
    next: u32,
    generation: u32,
}

pub struct Wheel<T, C> {
    clock: C,
    l1: [u32; L1_SIZE],
    ln: [[u32; LN_SIZE]; LEVELS - 1],
    nodes: Vec<Node<T>>,
    free_head: u32,
    /// Wheel time: the clock reading of the last tick that advanced.
    time: u64,
    live: usize,
}

impl<T, C: Clock> Wheel<T, C> {
    pub fn new(clock: C) -> Self {
        let time = clock.now_ms();
        Self {
            clock,
            l1: [NIL; L1_SIZE],
            ln: [[NIL; LN_SIZE]; LEVELS - 1],
            nodes: Vec::new(),
            free_head: NIL,
            time,
            live: 0,
        }
    }

    /// Current wheel time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.time
    }

    /// Nodes still held by the wheel, including cancelled ones not yet
    /// reclaimed.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Schedules `payload` to fire `delay_ms` after the current clock reading.
    pub fn add_timer(&mut self, delay_ms: u64, payload: T) -> Result<Scheduled<T>, TimerError> {
        if delay_ms > MAX_DELAY_MS {
            return Err(TimerError::DelayTooLong {
                delay_ms,
                max_ms: MAX_DELAY_MS,
            });
        }
        if delay_ms == 0 {
            return Ok(Scheduled::Now(payload));
        }

        let expire = self.clock.now_ms().saturating_add(delay_ms);
        let slot = self.alloc_node(expire, payload);
        // Filed relative to wheel time, which may lag the clock; the distance
        // is then at least `delay_ms`.
        self.place(slot, self.time);

        trace!(slot, delay_ms, expire, "Timer scheduled");
        Ok(Scheduled::Pending(TimerId {
            slot,
            generation: self.nodes[slot as usize].generation,
        }))
    }

    /// Marks a pending timer inactive. Returns `false` for stale handles and
    /// timers that already fired or were cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.nodes.get_mut(id.slot as usize) {
            Some(node) if node.generation == id.generation && node.active => {
                node.active = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.nodes
            .get(id.slot as usize)
            .is_some_and(|node| node.generation == id.generation && node.active)
    }

    /// Advances wheel time to the clock and fires every active timer whose
    /// expiry is at or before it. Returns the number fired.
    pub fn tick(&mut self, mut on_fire: impl FnMut(T)) -> usize {
        let now = self.clock.now_ms();
        if now <= self.time {
            return 0;
        }
        let last = self.time;

        for level in (2..=LEVELS).rev() {
            self.cascade(level, last, now);
        }
        let fired = self.expire_l1(last, now, &mut on_fire);

        self.time = now;
        fired
    }

    fn alloc_node(&mut self, expire: u64, payload: T) -> u32 {
        self.live += 1;
        if self.free_head != NIL {
            let slot = self.free_head;
            let node = &mut self.nodes[slot as usize];
            self.free_head = node.next;
            node.payload = Some(payload);
            node.expire = expire;
            node.active = true;
            node.next = NIL;
            return slot;
        }

        let slot = self.nodes.len() as u32;
        self.nodes.push(Node {
            payload: Some(payload),
            expire,
            active: true,
            next: NIL,
            generation: 0,
        });
        slot
    }

    fn reclaim(&mut self, slot: u32) {
        let node = &mut self.nodes[slot as usize];
        node.payload = None;
        node.active = false;
        node.generation = node.generation.wrapping_add(1);
        node.next = self.free_head;
        self.free_head = slot;
        self.live -= 1;
    }

    /// Files a node by its distance from `reference`. Overdue nodes land in
    /// the level-1 bucket for `reference` itself.
    fn place(&mut self, slot: u32, reference: u64) {
        let at = self.nodes[slot as usize].expire.max(reference);
        let distance = at - reference;

        let head = if distance < level_span(1) {
            &mut self.l1[(at & L1_MASK) as usize]
        } else {
            let level = (2..LEVELS)
                .find(|&level| distance < level_span(level))
                .unwrap_or(LEVELS);
            let idx = ((at >> level_shift(level)) & LN_MASK) as usize;
            &mut self.ln[level - 2][idx]
        };

        let previous = std::mem::replace(head, slot);
        self.nodes[slot as usize].next = previous;
    }

    fn cascade(&mut self, level: usize, last: u64, now: u64) {
        let shift = level_shift(level);
        // A full revolution of bucket indices wraps begin onto end.
        if (now >> shift) - (last >> shift) >= LN_SIZE as u64 {
            for idx in 0..LN_SIZE {
                self.cascade_bucket(level, idx, now);
            }
            return;
        }

        let begin = ((last >> shift) & LN_MASK) as usize;
        let end = ((now >> shift) & LN_MASK) as usize;
        for idx in crossed(begin, end, LN_SIZE) {
            self.cascade_bucket(level, idx, now);
        }
    }

    fn cascade_bucket(&mut self, level: usize, idx: usize, now: u64) {
        let mut cursor = std::mem::replace(&mut self.ln[level - 2][idx], NIL);
        while cursor != NIL {
            let next = self.nodes[cursor as usize].next;
            if self.nodes[cursor as usize].active {
                self.place(cursor, now);
            } else {
                self.reclaim(cursor);
            }
            cursor = next;
        }
    }

    fn expire_l1(&mut self, last: u64, now: u64, on_fire: &mut impl FnMut(T)) -> usize {
        let mut fired = 0;
        if now - last >= level_span(1) {
            for idx in 0..L1_SIZE {
                fired += self.expire_bucket(idx, now, on_fire);
            }
        } else {
            let begin = (last & L1_MASK) as usize;
            let end = (now & L1_MASK) as usize;
            for idx in crossed(begin, end, L1_SIZE) {
                fired += self.expire_bucket(idx, now, on_fire);
            }
        }
        fired
    }

    /// Fires and unlinks due nodes of one level-1 bucket. Nodes not yet due
    /// stay where they are.
    fn expire_bucket(&mut self, idx: usize, now: u64, on_fire: &mut impl FnMut(T)) -> usize {
        let mut fired = 0;
        let mut prev = NIL;
        let mut cursor = self.l1[idx];

        while cursor != NIL {
            let node = &mut self.nodes[cursor as usize];
            let next = node.next;

            if node.expire > now {
                prev = cursor;
                cursor = next;
                continue;
            }

            if prev == NIL {
                self.l1[idx] = next;
            } else {
                self.nodes[prev as usize].next = next;
            }

            let node = &mut self.nodes[cursor as usize];
            let payload = if node.active { node.payload.take() } else { None };
            self.reclaim(cursor);
            if let Some(payload) = payload {
                on_fire(payload);
                fired += 1;
            }
            cursor = next;
        }
        fired
    }
}

impl<T, C> std::fmt::Debug for Wheel<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wheel")
            .field("time", &self.time)
            .field("live", &self.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use proptest::prelude::*;

    fn wheel_at(start: u64) -> (ManualClock, Wheel<u32, ManualClock>) {
        let clock = ManualClock::new(start);
        let wheel = Wheel::new(clock.clone());
        (clock, wheel)
    }

    fn pending(scheduled: Scheduled<u32>) -> TimerId {
        scheduled.id().expect("timer should be pending")
    }

    fn collect(wheel: &mut Wheel<u32, ManualClock>) -> Vec<u32> {
        let mut fired = Vec::new();
        wheel.tick(|payload| fired.push(payload));
        fired
    }

    #[test]
    fn test_level_geometry() {
        assert_eq!(level_span(1), 256);
        assert_eq!(level_span(2), 1 << 14);
        assert_eq!(level_span(5), 1 << 32);
        assert_eq!(level_shift(2), 8);
        assert_eq!(level_shift(5), 26);
        assert_eq!(crossed(3, 3, 64).count(), 0);
        assert_eq!(crossed(62, 1, 64).collect::<Vec<_>>(), vec![63, 0, 1]);
    }

    #[test]
    fn test_zero_delay_runs_now() {
        let (_, mut wheel) = wheel_at(0);
        assert_eq!(wheel.add_timer(0, 7).unwrap(), Scheduled::Now(7));
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_delay_beyond_max_rejected() {
        let (_, mut wheel) = wheel_at(0);
        assert!(matches!(
            wheel.add_timer(MAX_DELAY_MS + 1, 1),
            Err(TimerError::DelayTooLong { .. })
        ));
        assert!(wheel.add_timer(MAX_DELAY_MS, 1).is_ok());
    }

    #[test]
    fn test_fires_exactly_at_expiry() {
        let (clock, mut wheel) = wheel_at(1_000);
        pending(wheel.add_timer(50, 1).unwrap());

        clock.advance(49);
        assert!(collect(&mut wheel).is_empty());
        clock.advance(1);
        assert_eq!(collect(&mut wheel), vec![1]);
        clock.advance(1_000);
        assert!(collect(&mut wheel).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_tick_without_progress_is_noop() {
        let (clock, mut wheel) = wheel_at(10);
        pending(wheel.add_timer(1, 1).unwrap());
        assert_eq!(wheel.tick(|_| {}), 0);
        assert_eq!(wheel.now_ms(), 10);
        clock.advance(1);
        assert_eq!(wheel.tick(|_| {}), 1);
        assert_eq!(wheel.now_ms(), 11);
        assert_eq!(wheel.tick(|_| {}), 0);
    }

    #[test]
    fn test_cascade_from_second_level() {
        let (clock, mut wheel) = wheel_at(0);
        pending(wheel.add_timer(300, 3).unwrap());

        for _ in 0..299 {
            clock.advance(1);
            assert!(collect(&mut wheel).is_empty(), "fired early at {}", clock.now_ms());
        }
        clock.advance(1);
        assert_eq!(collect(&mut wheel), vec![3]);
    }

    #[test]
    fn test_heartbeat_interval_with_coarse_ticks() {
        let (clock, mut wheel) = wheel_at(0);
        pending(wheel.add_timer(60_000, 9).unwrap());

        let mut fired_at = None;
        while clock.now_ms() < 70_000 {
            clock.advance(100);
            if !collect(&mut wheel).is_empty() {
                fired_at = Some(clock.now_ms());
                break;
            }
        }
        assert_eq!(fired_at, Some(60_000));
    }

    #[test]
    fn test_large_jump_fires_everything_due() {
        let (clock, mut wheel) = wheel_at(0);
        for (i, delay) in [5u64, 700, 20_000, 2_000_000].into_iter().enumerate() {
            pending(wheel.add_timer(delay, i as u32).unwrap());
        }

        clock.advance(1_999_999);
        let mut fired = collect(&mut wheel);
        fired.sort_unstable();
        assert_eq!(fired, vec![0, 1, 2]);

        clock.advance(1);
        assert_eq!(collect(&mut wheel), vec![3]);
    }

    #[test]
    fn test_jump_just_under_a_revolution_from_unaligned_time() {
        let (clock, mut wheel) = wheel_at(255);
        pending(wheel.add_timer(300, 1).unwrap());

        // Level 2 index moves by exactly 64 buckets although less than
        // one level-2 span of time passed.
        clock.advance(16_383);
        assert_eq!(collect(&mut wheel), vec![1]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_cancel_prevents_firing_and_reclaims() {
        let (clock, mut wheel) = wheel_at(0);
        let id = pending(wheel.add_timer(500, 1).unwrap());
        pending(wheel.add_timer(500, 2).unwrap());

        assert!(wheel.is_pending(id));
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
        assert!(!wheel.is_pending(id));

        clock.advance(500);
        assert_eq!(collect(&mut wheel), vec![2]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_cancel_reused_slot() {
        let (clock, mut wheel) = wheel_at(0);
        let old = pending(wheel.add_timer(1, 1).unwrap());
        clock.advance(1);
        assert_eq!(collect(&mut wheel), vec![1]);

        let fresh = pending(wheel.add_timer(10, 2).unwrap());
        assert_ne!(old, fresh);
        assert!(!wheel.cancel(old));
        assert!(wheel.is_pending(fresh));

        clock.advance(10);
        assert_eq!(collect(&mut wheel), vec![2]);
    }

    #[test]
    fn test_timer_added_while_wheel_lags_clock() {
        let (clock, mut wheel) = wheel_at(0);
        clock.advance(300);
        pending(wheel.add_timer(100, 1).unwrap());

        clock.advance(99);
        assert!(collect(&mut wheel).is_empty());
        clock.advance(1);
        assert_eq!(collect(&mut wheel), vec![1]);
    }

    #[test]
    fn test_bucket_wraparound() {
        let (clock, mut wheel) = wheel_at(250);
        pending(wheel.add_timer(10, 1).unwrap());
        clock.advance(5);
        assert!(collect(&mut wheel).is_empty());
        clock.advance(5);
        assert_eq!(collect(&mut wheel), vec![1]);
    }

    proptest! {
        #[test]
        fn prop_fires_once_on_first_tick_at_or_after_expiry(
            start in 0u64..100_000,
            delays in prop::collection::vec(1u64..200_000, 1..20),
            steps in prop::collection::vec(1u64..5_000, 1..400),
        ) {
            let (clock, mut wheel) = wheel_at(start);
            let expiries: Vec<u64> = delays.iter().map(|d| start + d).collect();
            for (i, delay) in delays.iter().enumerate() {
                prop_assert!(wheel.add_timer(*delay, i as u32).unwrap().id().is_some());
            }

            let mut fired_at = vec![None; delays.len()];
            for step in steps {
                let before = clock.now_ms();
                clock.advance(step);
                let now = clock.now_ms();
                let mut fired = Vec::new();
                wheel.tick(|i| fired.push(i));

                for i in fired {
                    let i = i as usize;
                    prop_assert!(fired_at[i].is_none(), "timer {} fired twice", i);
                    prop_assert!(expiries[i] <= now, "timer {} fired early", i);
                    prop_assert!(expiries[i] > before, "timer {} fired late", i);
                    fired_at[i] = Some(now);
                }
            }

            let end = clock.now_ms();
            for (i, expire) in expiries.iter().enumerate() {
                prop_assert_eq!(fired_at[i].is_some(), *expire <= end);
            }
        }
    }
}
