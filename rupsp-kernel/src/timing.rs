// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cycle-based timed event queue.
//!
//! Events are identified by a registered event type and a 64-bit userdata
//! value (thread IDs for the thread manager's wakeups and timeouts).
//! Handlers run from [`KernelCore::advance_timing`](crate::KernelCore).

use log::{debug, warn};
use rupsp_common::{Persist, PointerWrap};

use crate::kernel::KernelCore;

/// Handler for a fired event: `(kernel, userdata, cycles_late)`.
pub type TimedCallback = fn(&mut KernelCore, u64, i64);

/// Registered event type ID.
pub type EventType = i32;

struct EventTypeEntry {
    name: String,
    callback: Option<TimedCallback>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Event {
    time: u64,
    /// Insertion order, keeps equal-time events FIFO.
    seq: u64,
    event_type: EventType,
    userdata: u64,
}

impl Persist for Event {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.sync(&mut self.time);
        p.sync(&mut self.seq);
        p.sync(&mut self.event_type);
        p.sync(&mut self.userdata);
    }
}

pub struct CoreTiming {
    ticks: u64,
    next_seq: u64,
    /// Pending events, sorted by (time, seq).
    events: Vec<Event>,
    event_types: Vec<EventTypeEntry>,
}

impl CoreTiming {
    pub fn new() -> Self {
        Self {
            ticks: 0,
            next_seq: 0,
            events: Vec::new(),
            event_types: Vec::new(),
        }
    }

    /// Register a new event type.
    pub fn register_event(&mut self, name: &str, callback: TimedCallback) -> EventType {
        self.event_types.push(EventTypeEntry {
            name: name.to_string(),
            callback: Some(callback),
        });
        (self.event_types.len() - 1) as EventType
    }

    /// Re-bind a saved event type ID to its handler after a state load.
    pub fn restore_register_event(&mut self, id: EventType, name: &str, callback: TimedCallback) {
        if id < 0 {
            warn!("Ignoring restore of invalid event type {} ({})", id, name);
            return;
        }
        let idx = id as usize;
        while self.event_types.len() <= idx {
            self.event_types.push(EventTypeEntry {
                name: String::new(),
                callback: None,
            });
        }
        self.event_types[idx] = EventTypeEntry {
            name: name.to_string(),
            callback: Some(callback),
        };
    }

    pub fn event_name(&self, id: EventType) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.event_types.get(i))
            .map(|e| e.name.as_str())
            .unwrap_or("?")
    }

    pub fn callback(&self, id: EventType) -> Option<TimedCallback> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.event_types.get(i))
            .and_then(|e| e.callback)
    }

    #[inline]
    pub fn get_ticks(&self) -> u64 {
        self.ticks
    }

    /// Consume cycles (HLE call cost, context switch cost).
    pub fn add_ticks(&mut self, cycles: u64) {
        self.ticks = self.ticks.saturating_add(cycles);
    }

    /// Schedule `event_type` to fire `cycles_into_future` cycles from now.
    pub fn schedule_event(&mut self, cycles_into_future: i64, event_type: EventType, userdata: u64) {
        let time = self.ticks.saturating_add(cycles_into_future.max(0) as u64);
        let seq = self.next_seq;
        self.next_seq += 1;
        let event = Event {
            time,
            seq,
            event_type,
            userdata,
        };
        let idx = self.events.partition_point(|e| (e.time, e.seq) <= (time, seq));
        self.events.insert(idx, event);
    }

    /// Remove the first pending event matching type and userdata.
    /// Returns the cycles that were left until it would have fired (0 if
    /// nothing was scheduled).
    pub fn unschedule_event(&mut self, event_type: EventType, userdata: u64) -> i64 {
        match self
            .events
            .iter()
            .position(|e| e.event_type == event_type && e.userdata == userdata)
        {
            Some(idx) => {
                let event = self.events.remove(idx);
                event.time as i64 - self.ticks as i64
            }
            None => 0,
        }
    }

    /// Absolute time of a pending event.
    pub fn event_time(&self, event_type: EventType, userdata: u64) -> Option<u64> {
        self.events
            .iter()
            .find(|e| e.event_type == event_type && e.userdata == userdata)
            .map(|e| e.time)
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.events.first().map(|e| e.time)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Pop the earliest event that is due. Returns `(type, userdata, late)`.
    pub fn pop_due(&mut self) -> Option<(EventType, u64, i64)> {
        let first = self.events.first()?;
        if first.time > self.ticks {
            return None;
        }
        let event = self.events.remove(0);
        let late = (self.ticks - event.time) as i64;
        Some((event.event_type, event.userdata, late))
    }

    /// Skip ahead to the next scheduled event, as an idle CPU would.
    pub fn idle(&mut self) {
        if let Some(next) = self.next_event_time() {
            if next > self.ticks {
                debug!("Idle: skipping {} cycles", next - self.ticks);
                self.ticks = next;
            }
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.event_types.clear();
        self.ticks = 0;
        self.next_seq = 0;
    }
}

impl Default for CoreTiming {
    fn default() -> Self {
        Self::new()
    }
}

impl Persist for CoreTiming {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.section("CoreTiming", 1, 1, |p, _| {
            p.sync(&mut self.ticks);
            p.sync(&mut self.next_seq);
            p.sync(&mut self.events);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &mut KernelCore, _: u64, _: i64) {}

    #[test]
    fn test_schedule_and_pop_in_order() {
        let mut t = CoreTiming::new();
        let ev = t.register_event("Test", nop);
        t.schedule_event(300, ev, 3);
        t.schedule_event(100, ev, 1);
        t.schedule_event(100, ev, 2);
        assert!(t.pop_due().is_none());

        t.add_ticks(150);
        assert_eq!(t.pop_due(), Some((ev, 1, 50)));
        assert_eq!(t.pop_due(), Some((ev, 2, 50)));
        assert!(t.pop_due().is_none());

        t.idle();
        assert_eq!(t.get_ticks(), 300);
        assert_eq!(t.pop_due(), Some((ev, 3, 0)));
    }

    #[test]
    fn test_unschedule_returns_cycles_left() {
        let mut t = CoreTiming::new();
        let ev = t.register_event("Test", nop);
        t.schedule_event(1000, ev, 7);
        t.add_ticks(400);
        assert_eq!(t.unschedule_event(ev, 7), 600);
        assert_eq!(t.unschedule_event(ev, 7), 0);
        assert!(!t.has_pending_events());
    }

    #[test]
    fn test_restore_register_event() {
        let mut t = CoreTiming::new();
        t.restore_register_event(2, "Late", nop);
        assert_eq!(t.event_name(2), "Late");
        assert!(t.callback(1).is_none());
        assert!(t.callback(2).is_some());
    }
}
