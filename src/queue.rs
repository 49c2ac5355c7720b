use std::{cell::RefCell, cmp::Ordering, mem, rc::Rc, time::Instant};

use crate::timer::Timer;

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

const NONE: u32 = u32::MAX;
const IN_FLIGHT: u32 = u32::MAX - 1;

/// Keys of entries whose timer changed (fire date moved, or invalidated)
/// since the last [`TimerQueue::sync`]. Timers mark; the queue drains.
///
/// Each key appears at most once, so a queue that is never synced holds at
/// most one pending key per entry.
#[derive(Default)]
pub(crate) struct PendingSet {
    keys: Vec<u32>,
    marked: Vec<bool>,
}

impl PendingSet {
    pub(crate) fn mark(&mut self, key: u32) {
        let idx = key as usize;
        if idx >= self.marked.len() {
            self.marked.resize(idx + 1, false);
        }
        if !mem::replace(&mut self.marked[idx], true) {
            self.keys.push(key);
        }
    }

    fn drain(&mut self) -> Vec<u32> {
        for &key in &self.keys {
            self.marked[key as usize] = false;
        }
        mem::take(&mut self.keys)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys.len()
    }
}

pub(crate) type PendingKeys = Rc<RefCell<PendingSet>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timer queue key space exhausted")]
pub struct QueueFull;

/// Key for a new slab slot at index `len`. Keys must stay below the heap
/// position sentinels.
#[inline]
fn slot_key(len: usize) -> Result<u32, QueueFull> {
    u32::try_from(len)
        .ok()
        .filter(|&key| key < IN_FLIGHT)
        .ok_or(QueueFull)
}

/// Stable key of a timer inside one [`TimerQueue`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct QueueKey(pub(crate) u32);

struct Entry {
    timer: Timer,
    fire_at: Instant,
    seq: u64,
}

/// Pending timers of one run loop mode, ordered by fire date.
///
/// A growable slab plus an index min-heap:
/// - Keys are stable across re-sorts and reschedules
/// - Equal fire dates fire in the order they were (re)queued
/// - O(1) peek, O(log n) insert/remove/re-sort
///
/// The heap caches each timer's fire date. Timers report changes through
/// a shared pending list, which [`sync`](TimerQueue::sync) applies before
/// any ordering decision.
pub struct TimerQueue {
    entries: Vec<Option<Entry>>,
    free_stack: Vec<u32>,
    heap: Vec<u32>,
    heap_pos: Vec<u32>,
    in_flight: usize,
    pending: PendingKeys,
    sequence: u64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_stack: Vec::new(),
            heap: Vec::with_capacity(capacity),
            heap_pos: Vec::with_capacity(capacity),
            in_flight: 0,
            pending: Rc::new(RefCell::new(PendingSet::default())),
            sequence: 0,
        }
    }

    /// Number of timers held, including any currently firing.
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len() + self.in_flight
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, timer: &Timer) -> bool {
        timer.key_in(&self.pending).is_some()
    }

    /// Adds a strong reference to `timer`. Inserting a timer that is already
    /// queued returns its existing key.
    ///
    /// # Errors
    ///
    /// [`QueueFull`] once every `u32` key below the internal sentinels is
    /// taken. The timer is left untouched.
    pub fn insert(&mut self, timer: &Timer) -> Result<QueueKey, QueueFull> {
        if let Some(key) = timer.key_in(&self.pending) {
            return Ok(QueueKey(key));
        }

        let entry_idx = match self.free_stack.pop() {
            Some(idx) => idx,
            None => {
                let idx = slot_key(self.entries.len())?;
                self.entries.push(None);
                self.heap_pos.push(NONE);
                idx
            }
        };

        let seq = self.next_sequence();
        self.entries[entry_idx as usize] = Some(Entry {
            timer: timer.share(),
            fire_at: timer.fire_date(),
            seq,
        });
        timer.attach(&self.pending, entry_idx);
        self.push_heap(entry_idx);

        Ok(QueueKey(entry_idx))
    }

    /// Drops the queue's reference. Returns it if the key was live.
    pub fn remove(&mut self, key: QueueKey) -> Option<Timer> {
        let entry_idx = key.0 as usize;
        let entry = self.entries.get_mut(entry_idx)?.take()?;

        match self.heap_pos[entry_idx] {
            IN_FLIGHT => self.in_flight -= 1,
            NONE => {}
            pos => self.unlink(pos),
        }

        self.heap_pos[entry_idx] = NONE;
        self.free_stack.push(key.0);
        entry.timer.detach(&self.pending, key.0);

        Some(entry.timer)
    }

    /// Applies pending timer changes: re-sorts moved timers and drops
    /// invalidated ones.
    pub fn sync(&mut self) {
        let keys = self.pending.borrow_mut().drain();

        for key in keys {
            let entry_idx = key as usize;
            let Some(Some(entry)) = self.entries.get_mut(entry_idx) else {
                continue;
            };

            if !entry.timer.is_valid() {
                tracing::trace!(key, "dropping invalidated timer");
                self.remove(QueueKey(key));
                continue;
            }

            let pos = self.heap_pos[entry_idx];
            if pos == IN_FLIGHT || pos == NONE {
                continue;
            }

            let fire_date = entry.timer.fire_date();
            if fire_date != entry.fire_at {
                entry.fire_at = fire_date;
                tracing::trace!(key, "re-sorting timer");
                self.reposition(pos);
            }
        }
    }

    /// Earliest fire date among valid timers.
    pub fn next_fire_date(&mut self) -> Option<Instant> {
        self.sync();

        while let Some(&top) = self.heap.first() {
            let entry = self.entries[top as usize].as_ref()?;
            if entry.timer.is_valid() {
                return Some(entry.fire_at);
            }
            self.remove(QueueKey(top));
        }

        None
    }

    /// Takes every valid timer due at `now` out of the heap, earliest first.
    ///
    /// The entries stay in the queue as in flight. Each must be handed back
    /// through [`restore`](TimerQueue::restore) once fired.
    pub fn take_due(&mut self, now: Instant) -> Vec<(QueueKey, Timer)> {
        self.sync();

        let mut due = Vec::new();
        while let Some(&top) = self.heap.first() {
            let Some(entry) = self.entries[top as usize].as_ref() else {
                break;
            };

            if !entry.timer.is_valid() {
                self.remove(QueueKey(top));
                continue;
            }

            if entry.fire_at > now {
                break;
            }

            due.push((QueueKey(top), entry.timer.share()));
            self.unlink(0);
            self.heap_pos[top as usize] = IN_FLIGHT;
            self.in_flight += 1;
        }

        due
    }

    /// Whether `timer` is still queued under `key` and waiting to be restored.
    pub fn is_in_flight(&self, key: QueueKey, timer: &Timer) -> bool {
        let entry_idx = key.0 as usize;
        matches!(self.entries.get(entry_idx), Some(Some(entry)) if entry.timer.ptr_eq(timer))
            && self.heap_pos[entry_idx] == IN_FLIGHT
    }

    /// Returns a fired timer to the heap, or drops it if it is no longer
    /// valid. Missed repeats are skipped so the timer lands after `now`.
    ///
    /// No-op if the timer was removed while it was firing.
    pub fn restore(&mut self, key: QueueKey, timer: &Timer, now: Instant) {
        if !self.is_in_flight(key, timer) {
            return;
        }

        let entry_idx = key.0 as usize;
        self.heap_pos[entry_idx] = NONE;
        self.in_flight -= 1;

        if !timer.is_valid() {
            self.remove(key);
            return;
        }

        timer.skip_missed(now);
        let seq = self.next_sequence();
        if let Some(entry) = self.entries[entry_idx].as_mut() {
            entry.fire_at = timer.fire_date();
            entry.seq = seq;
        }
        self.push_heap(key.0);
    }

    #[inline]
    fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    #[inline]
    fn push_heap(&mut self, entry_idx: u32) {
        let pos = self.heap.len() as u32;
        self.heap.push(entry_idx);
        self.heap_pos[entry_idx as usize] = pos;
        self.swim(pos);
    }

    #[inline]
    fn unlink(&mut self, pos: u32) {
        let last = self.heap.len() as u32 - 1;
        self.heap.swap_remove(pos as usize);

        if pos < last {
            self.heap_pos[self.heap[pos as usize] as usize] = pos;
            self.reposition(pos);
        }
    }

    #[inline]
    fn reposition(&mut self, pos: u32) {
        let entry_idx = self.heap[pos as usize] as usize;
        self.swim(pos);
        self.sink(self.heap_pos[entry_idx]);
    }

    #[inline]
    fn swim(&mut self, mut pos: u32) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.compare(pos, parent).is_lt() {
                self.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    #[inline]
    fn sink(&mut self, mut pos: u32) {
        let len = self.heap.len() as u32;
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;

            if left < len && self.compare(left, smallest).is_lt() {
                smallest = left;
            }
            if right < len && self.compare(right, smallest).is_lt() {
                smallest = right;
            }

            if smallest == pos {
                break;
            }

            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    #[inline]
    fn swap(&mut self, a: u32, b: u32) {
        let a_idx = a as usize;
        let b_idx = b as usize;
        self.heap.swap(a_idx, b_idx);
        self.heap_pos[self.heap[a_idx] as usize] = a;
        self.heap_pos[self.heap[b_idx] as usize] = b;
    }

    #[inline]
    fn compare(&self, a: u32, b: u32) -> Ordering {
        self.sort_key(a).cmp(&self.sort_key(b))
    }

    #[inline]
    fn sort_key(&self, pos: u32) -> Option<(Instant, u64)> {
        let entry_idx = self.heap[pos as usize] as usize;
        self.entries[entry_idx]
            .as_ref()
            .map(|entry| (entry.fire_at, entry.seq))
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        for (idx, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                entry.timer.detach(&self.pending, idx as u32);
            }
        }
    }
}
