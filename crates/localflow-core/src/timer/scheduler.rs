//! Durable timer scheduler.
//!
//! Pending timers live in a binary min-heap keyed by `(fire_at, seq)`, where
//! `seq` is a monotonically increasing insertion counter that breaks ties
//! between equal fire times. Cancellation is lazy: `remove_timer` flips the
//! entry's tombstone and the heap drops it when it surfaces, so removal is
//! O(1) instead of an O(n) heap rebuild.
//!
//! The scheduler is volatile. Durability comes from the store: every timer
//! handed out here is also persisted, and `restore` puts it back after a
//! restart with its original ID and fire time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use localflow_types::timer::Timer;
use uuid::Uuid;

use super::clock::Clock;

// ---------------------------------------------------------------------------
// Heap entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    fire_at: DateTime<Utc>,
    seq: u64,
    timer_id: Uuid,
}

impl Ord for HeapEntry {
    // Reversed so that `BinaryHeap` (a max-heap) yields the earliest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Slot {
    timer: Timer,
    seq: u64,
    live: bool,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<HeapEntry>,
    /// Every timer still in the heap, live or tombstoned.
    slots: HashMap<Uuid, Slot>,
    next_seq: u64,
    live: usize,
}

impl SchedulerState {
    fn push(&mut self, timer: Timer) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            fire_at: timer.fire_at,
            seq,
            timer_id: timer.id,
        });
        self.slots.insert(
            timer.id,
            Slot {
                timer,
                seq,
                live: true,
            },
        );
        self.live += 1;
    }

    /// Drop tombstoned entries sitting at the top of the heap.
    fn discard_dead_top(&mut self) {
        while let Some(top) = self.heap.peek() {
            match self.slots.get(&top.timer_id) {
                Some(slot) if slot.live => break,
                _ => {
                    let entry = self.heap.pop().expect("peeked entry");
                    self.slots.remove(&entry.timer_id);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TimerScheduler
// ---------------------------------------------------------------------------

/// Thread-safe scheduler for durable workflow timers.
pub struct TimerScheduler {
    state: Mutex<SchedulerState>,
    clock: Arc<dyn Clock>,
}

impl TimerScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            clock,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("timer scheduler lock poisoned")
    }

    /// Register a timer firing `seconds` from now.
    ///
    /// Negative durations (and ones too large to represent) are rejected
    /// without touching the heap.
    pub fn schedule_timer(&self, workflow_id: Uuid, seconds: i64) -> Result<Timer, TimerError> {
        if seconds < 0 {
            return Err(TimerError::InvalidDuration(seconds));
        }
        let now = self.clock.now();
        let fire_at = TimeDelta::try_seconds(seconds)
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or(TimerError::InvalidDuration(seconds))?;

        let timer = Timer {
            id: Uuid::now_v7(),
            workflow_id,
            fire_at,
            duration_secs: seconds,
            created_at: now,
        };
        self.state().push(timer.clone());

        tracing::debug!(
            timer_id = %timer.id,
            workflow_id = %workflow_id,
            fire_at = %fire_at,
            "scheduled timer"
        );
        Ok(timer)
    }

    /// Re-register a persisted timer, keeping its ID and fire time.
    ///
    /// Returns `false` (and does nothing) if the ID is already known.
    pub fn restore(&self, timer: Timer) -> bool {
        let mut state = self.state();
        if state.slots.contains_key(&timer.id) {
            return false;
        }
        tracing::debug!(timer_id = %timer.id, workflow_id = %timer.workflow_id, "restored timer");
        state.push(timer);
        true
    }

    /// Pop every live timer with `fire_at <= now`.
    ///
    /// Ordered by fire time, ties in insertion order. Returned timers are
    /// forgotten, so no timer is ever reported ready twice.
    pub fn get_ready_timers(&self, now: DateTime<Utc>) -> Vec<Timer> {
        let mut state = self.state();
        let mut ready = Vec::new();

        while let Some(top) = state.heap.peek() {
            if top.fire_at > now {
                break;
            }
            let entry = state.heap.pop().expect("peeked entry");
            if let Some(slot) = state.slots.remove(&entry.timer_id) {
                if slot.live {
                    state.live -= 1;
                    ready.push(slot.timer);
                }
            }
        }
        ready
    }

    /// Cancel a pending timer.
    ///
    /// Unknown or already-fired IDs are a no-op and return `false`.
    pub fn remove_timer(&self, timer_id: &Uuid) -> bool {
        let mut state = self.state();
        let removed = match state.slots.get_mut(timer_id) {
            Some(slot) if slot.live => {
                slot.live = false;
                true
            }
            _ => false,
        };
        if removed {
            state.live -= 1;
            tracing::debug!(timer_id = %timer_id, "removed timer");
        }
        removed
    }

    /// Cancel every pending timer belonging to a workflow.
    pub fn remove_workflow_timers(&self, workflow_id: &Uuid) -> Vec<Uuid> {
        let mut state = self.state();
        let mut removed = Vec::new();
        for (id, slot) in state.slots.iter_mut() {
            if slot.live && slot.timer.workflow_id == *workflow_id {
                slot.live = false;
                removed.push(*id);
            }
        }
        state.live -= removed.len();
        removed
    }

    /// Earliest pending fire time.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        let mut state = self.state();
        state.discard_dead_top();
        state.heap.peek().map(|entry| entry.fire_at)
    }

    /// Whether a timer with this ID is still pending.
    pub fn contains(&self, timer_id: &Uuid) -> bool {
        self.state()
            .slots
            .get(timer_id)
            .is_some_and(|slot| slot.live)
    }

    /// Snapshot of pending timers in firing order.
    pub fn pending(&self) -> Vec<Timer> {
        let state = self.state();
        let mut live: Vec<&Slot> = state.slots.values().filter(|slot| slot.live).collect();
        live.sort_by(|a, b| {
            a.timer
                .fire_at
                .cmp(&b.timer.fire_at)
                .then(a.seq.cmp(&b.seq))
        });
        live.into_iter().map(|slot| slot.timer.clone()).collect()
    }

    /// Number of pending (live) timers.
    pub fn len(&self) -> usize {
        self.state().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("invalid timer duration: {0}s")]
    InvalidDuration(i64),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::timer::clock::ManualClock;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn scheduler() -> (Arc<ManualClock>, TimerScheduler) {
        let clock = Arc::new(ManualClock::at_epoch());
        let scheduler = TimerScheduler::new(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn negative_duration_is_rejected() {
        let (_, scheduler) = scheduler();
        let err = scheduler.schedule_timer(Uuid::now_v7(), -5).unwrap_err();
        assert!(matches!(err, TimerError::InvalidDuration(-5)));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn overflowing_duration_is_rejected() {
        let (_, scheduler) = scheduler();
        let err = scheduler.schedule_timer(Uuid::now_v7(), i64::MAX).unwrap_err();
        assert!(matches!(err, TimerError::InvalidDuration(_)));
    }

    #[test]
    fn ready_timers_come_out_in_fire_order() {
        let (_, scheduler) = scheduler();
        let wf = Uuid::now_v7();
        let late = scheduler.schedule_timer(wf, 300).unwrap();
        let early = scheduler.schedule_timer(wf, 10).unwrap();
        let middle = scheduler.schedule_timer(wf, 60).unwrap();

        let ready = scheduler.get_ready_timers(at(100));
        let ids: Vec<_> = ready.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![early.id, middle.id]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_fire_at(), Some(late.fire_at));
    }

    #[test]
    fn equal_fire_times_break_ties_by_insertion_order() {
        let (_, scheduler) = scheduler();
        let t1 = scheduler.schedule_timer(Uuid::now_v7(), 100).unwrap();
        let t2 = scheduler.schedule_timer(Uuid::now_v7(), 100).unwrap();

        let ready = scheduler.get_ready_timers(at(101));
        assert_eq!(ready, vec![t1, t2]);
    }

    #[test]
    fn fire_time_equal_to_now_is_ready() {
        let (_, scheduler) = scheduler();
        let timer = scheduler.schedule_timer(Uuid::now_v7(), 0).unwrap();
        assert_eq!(scheduler.get_ready_timers(at(0)), vec![timer]);
    }

    #[test]
    fn a_timer_is_reported_ready_once() {
        let (_, scheduler) = scheduler();
        scheduler.schedule_timer(Uuid::now_v7(), 5).unwrap();
        assert_eq!(scheduler.get_ready_timers(at(10)).len(), 1);
        assert!(scheduler.get_ready_timers(at(20)).is_empty());
    }

    #[test]
    fn removed_timer_is_never_returned() {
        let (_, scheduler) = scheduler();
        let wf = Uuid::now_v7();
        let keep = scheduler.schedule_timer(wf, 10).unwrap();
        let drop = scheduler.schedule_timer(wf, 5).unwrap();

        assert!(scheduler.remove_timer(&drop.id));
        assert!(!scheduler.contains(&drop.id));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_fire_at(), Some(keep.fire_at));
        assert_eq!(scheduler.get_ready_timers(at(60)), vec![keep]);
    }

    #[test]
    fn removing_a_fired_or_unknown_timer_is_a_noop() {
        let (_, scheduler) = scheduler();
        let timer = scheduler.schedule_timer(Uuid::now_v7(), 1).unwrap();
        let fired = scheduler.get_ready_timers(at(1));
        assert_eq!(fired.len(), 1);

        assert!(!scheduler.remove_timer(&timer.id));
        assert!(!scheduler.remove_timer(&Uuid::now_v7()));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn remove_workflow_timers_only_touches_that_workflow() {
        let (_, scheduler) = scheduler();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        scheduler.schedule_timer(a, 10).unwrap();
        scheduler.schedule_timer(a, 20).unwrap();
        let other = scheduler.schedule_timer(b, 15).unwrap();

        assert_eq!(scheduler.remove_workflow_timers(&a).len(), 2);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.pending(), vec![other]);
    }

    #[test]
    fn restore_keeps_id_and_is_idempotent() {
        let (clock, scheduler) = scheduler();
        let timer = scheduler.schedule_timer(Uuid::now_v7(), 3600).unwrap();

        let restarted = TimerScheduler::new(clock.clone());
        assert!(restarted.restore(timer.clone()));
        assert!(!restarted.restore(timer.clone()));
        assert_eq!(restarted.len(), 1);

        clock.advance(Duration::seconds(3600));
        assert_eq!(restarted.get_ready_timers(clock.now()), vec![timer]);
    }

    #[test]
    fn schedules_relative_to_clock() {
        let (clock, scheduler) = scheduler();
        clock.advance(Duration::seconds(50));
        let timer = scheduler.schedule_timer(Uuid::now_v7(), 10).unwrap();
        assert_eq!(timer.fire_at, at(60));
        assert_eq!(timer.created_at, at(50));
        assert_eq!(timer.duration_secs, 10);
    }
}
