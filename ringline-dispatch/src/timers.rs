//! Deadline tracking for connect, headers, body and keep-alive timeouts.
//!
//! A [`TimerWheel`] is owned by one dispatcher and is advanced explicitly
//! with the current time, so tests drive it from a [`ManualClock`]. Timers
//! live in a slot pool with per-slot generation counters: a stale
//! [`TimerHandle`] for a recycled slot is ignored instead of touching the
//! new occupant.
//!
//! Delays of [`COALESCE_THRESHOLD`] or more are rounded up onto
//! [`FAST_TICK`] boundaries so that many long timers share one wakeup;
//! shorter delays fire at their exact deadline.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Tick granularity for coalesced timers.
pub const FAST_TICK: Duration = Duration::from_millis(500);

/// Delays at or above this are coalesced onto ticks.
pub const COALESCE_THRESHOLD: Duration = Duration::from_secs(1);

/// Source of the current time.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    slot: u32,
    generation: u32,
}

struct Entry<T> {
    /// `None` if the deadline is past what `Instant` can represent.
    fire_at: Option<Instant>,
    delay: Duration,
    payload: T,
}

/// Slot-pool timer set keyed by [`TimerHandle`].
pub struct TimerWheel<T> {
    epoch: Instant,
    entries: Vec<Option<Entry<T>>>,
    generations: Vec<u32>,
    free_list: Vec<u32>,
}

impl<T> TimerWheel<T> {
    /// `epoch` anchors tick boundaries.
    pub fn new(epoch: Instant) -> Self {
        TimerWheel {
            epoch,
            entries: Vec::new(),
            generations: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arms a timer that fires `delay` after `now`.
    pub fn schedule(&mut self, now: Instant, delay: Duration, payload: T) -> TimerHandle {
        let entry = Entry {
            fire_at: self.fire_at(now, delay),
            delay,
            payload,
        };
        let slot = match self.free_list.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                slot
            }
            None => {
                self.entries.push(Some(entry));
                self.generations.push(0);
                (self.entries.len() - 1) as u32
            }
        };
        TimerHandle {
            slot,
            generation: self.generations[slot as usize],
        }
    }

    /// Restarts the timer's full delay from `now`. Returns false for a stale
    /// handle.
    pub fn refresh(&mut self, handle: TimerHandle, now: Instant) -> bool {
        if !self.is_active(handle) {
            return false;
        }
        let Some(delay) = self.entries[handle.slot as usize].as_ref().map(|e| e.delay) else {
            return false;
        };
        let fire_at = self.fire_at(now, delay);
        if let Some(entry) = self.entries[handle.slot as usize].as_mut() {
            entry.fire_at = fire_at;
        }
        true
    }

    /// Disarms the timer, returning its payload if it was still armed.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        if !self.is_active(handle) {
            return None;
        }
        self.release(handle.slot)
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        let idx = handle.slot as usize;
        idx < self.entries.len()
            && self.generations[idx] == handle.generation
            && self.entries[idx].is_some()
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub fn expired(&mut self, now: Instant) -> Vec<T> {
        let mut due: Vec<(Instant, u32)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Some(Entry {
                    fire_at: Some(fire_at),
                    ..
                }) if *fire_at <= now => Some((*fire_at, slot as u32)),
                _ => None,
            })
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, slot)| self.release(slot))
            .collect()
    }

    /// Earliest instant at which a timer fires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|entry| entry.as_ref().and_then(|e| e.fire_at))
            .min()
    }

    fn release(&mut self, slot: u32) -> Option<T> {
        let idx = slot as usize;
        let entry = self.entries.get_mut(idx)?.take()?;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_list.push(slot);
        Some(entry.payload)
    }

    fn fire_at(&self, now: Instant, delay: Duration) -> Option<Instant> {
        let deadline = now.checked_add(delay)?;
        if delay < COALESCE_THRESHOLD {
            return Some(deadline);
        }
        let offset = deadline.saturating_duration_since(self.epoch).as_nanos();
        let tick = FAST_TICK.as_nanos();
        let rounded = u64::try_from(offset.div_ceil(tick) * tick).ok()?;
        self.epoch.checked_add(Duration::from_nanos(rounded))
    }
}
