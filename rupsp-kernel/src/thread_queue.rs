// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Priority-bucketed ready queue.
//! One FIFO per priority level; lower number = better priority.

use std::collections::VecDeque;

use log::error;
use rupsp_common::{Persist, PointerWrap, SceUid};

/// Number of priority levels.
pub const NUM_QUEUES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadQueueList {
    /// `None` until the level has been prepared.
    queues: Vec<Option<VecDeque<SceUid>>>,
}

impl ThreadQueueList {
    pub fn new() -> Self {
        Self {
            queues: vec![None; NUM_QUEUES],
        }
    }

    fn level(priority: u32) -> Option<usize> {
        let idx = priority as usize;
        if idx < NUM_QUEUES {
            Some(idx)
        } else {
            error!("Thread priority {} out of ready queue range", priority);
            None
        }
    }

    fn queue_mut(&mut self, priority: u32) -> Option<&mut VecDeque<SceUid>> {
        let idx = Self::level(priority)?;
        if self.queues[idx].is_none() {
            error!("Ready queue level {} used before prepare", priority);
        }
        Some(self.queues[idx].get_or_insert_with(VecDeque::new))
    }

    /// Make sure a bucket exists for `priority`.
    pub fn prepare(&mut self, priority: u32) {
        if let Some(idx) = Self::level(priority) {
            self.queues[idx].get_or_insert_with(VecDeque::new);
        }
    }

    pub fn is_prepared(&self, priority: u32) -> bool {
        (priority as usize) < NUM_QUEUES && self.queues[priority as usize].is_some()
    }

    pub fn push_front(&mut self, priority: u32, id: SceUid) {
        if let Some(q) = self.queue_mut(priority) {
            q.push_front(id);
        }
    }

    pub fn push_back(&mut self, priority: u32, id: SceUid) {
        if let Some(q) = self.queue_mut(priority) {
            q.push_back(id);
        }
    }

    /// Remove `id` from its bucket. Returns whether it was present.
    pub fn remove(&mut self, priority: u32, id: SceUid) -> bool {
        let Some(idx) = Self::level(priority) else {
            return false;
        };
        let Some(q) = self.queues[idx].as_mut() else {
            return false;
        };
        match q.iter().position(|&x| x == id) {
            Some(pos) => {
                q.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Move the front of a bucket to its back.
    pub fn rotate(&mut self, priority: u32) {
        if let Some(q) = Self::level(priority).and_then(|i| self.queues[i].as_mut()) {
            if let Some(front) = q.pop_front() {
                q.push_back(front);
            }
        }
    }

    /// Pop the best ready thread, or 0 if none.
    pub fn pop_first(&mut self) -> SceUid {
        self.pop_first_better(NUM_QUEUES as u32)
    }

    /// Pop the best ready thread strictly better than `priority`, or 0.
    pub fn pop_first_better(&mut self, priority: u32) -> SceUid {
        let limit = (priority as usize).min(NUM_QUEUES);
        self.queues[..limit]
            .iter_mut()
            .flatten()
            .find_map(|q| q.pop_front())
            .unwrap_or(0)
    }

    /// Best ready thread without removing it, or 0.
    pub fn peek_first(&self) -> SceUid {
        self.queues
            .iter()
            .flatten()
            .find_map(|q| q.front().copied())
            .unwrap_or(0)
    }

    /// Whether the bucket for `priority` has no threads.
    pub fn is_empty(&self, priority: u32) -> bool {
        Self::level(priority)
            .and_then(|i| self.queues[i].as_ref())
            .map_or(true, |q| q.is_empty())
    }

    pub fn contains(&self, priority: u32, id: SceUid) -> bool {
        Self::level(priority)
            .and_then(|i| self.queues[i].as_ref())
            .is_some_and(|q| q.contains(&id))
    }

    /// Bucket contents front to back.
    pub fn threads_at(&self, priority: u32) -> Vec<SceUid> {
        Self::level(priority)
            .and_then(|i| self.queues[i].as_ref())
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.queues.iter_mut().for_each(|q| *q = None);
    }
}

impl Default for ThreadQueueList {
    fn default() -> Self {
        Self::new()
    }
}

impl Persist for ThreadQueueList {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.section("ThreadQueueList", 1, 1, |p, _| {
            for q in self.queues.iter_mut() {
                let mut prepared = q.is_some();
                p.sync(&mut prepared);
                if prepared {
                    let bucket = q.get_or_insert_with(VecDeque::new);
                    p.sync(bucket);
                } else {
                    *q = None;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(levels: &[u32]) -> ThreadQueueList {
        let mut q = ThreadQueueList::new();
        for &l in levels {
            q.prepare(l);
        }
        q
    }

    #[test]
    fn test_pop_first_by_priority() {
        let mut q = prepared(&[10, 20, 30]);
        q.push_back(30, 3);
        q.push_back(10, 1);
        q.push_back(20, 2);
        assert_eq!(q.peek_first(), 1);
        assert_eq!(q.pop_first(), 1);
        assert_eq!(q.pop_first(), 2);
        assert_eq!(q.pop_first(), 3);
        assert_eq!(q.pop_first(), 0);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut q = prepared(&[0x20]);
        q.push_back(0x20, 0xA);
        q.push_back(0x20, 0xB);
        assert_eq!(q.threads_at(0x20), vec![0xA, 0xB]);
        q.rotate(0x20);
        assert_eq!(q.threads_at(0x20), vec![0xB, 0xA]);
        q.rotate(0x20);
        assert_eq!(q.pop_first(), 0xA);
        assert_eq!(q.pop_first(), 0xB);
    }

    #[test]
    fn test_push_front_and_remove() {
        let mut q = prepared(&[5]);
        q.push_back(5, 1);
        q.push_front(5, 2);
        assert_eq!(q.threads_at(5), vec![2, 1]);
        assert!(q.remove(5, 2));
        assert!(!q.remove(5, 2));
        assert!(q.contains(5, 1));
        assert!(!q.is_empty(5));
    }

    #[test]
    fn test_pop_first_better_is_strict() {
        let mut q = prepared(&[0x10, 0x20]);
        q.push_back(0x20, 7);
        assert_eq!(q.pop_first_better(0x20), 0);
        q.push_back(0x10, 8);
        assert_eq!(q.pop_first_better(0x20), 8);
        assert_eq!(q.pop_first_better(0x21), 7);
    }

    #[test]
    fn test_clear() {
        let mut q = prepared(&[1]);
        q.push_back(1, 9);
        q.clear();
        assert!(!q.is_prepared(1));
        assert!(q.is_empty(1));
    }

    #[test]
    fn test_persist() {
        let mut q = prepared(&[3, 0x7f]);
        q.push_back(3, 11);
        q.push_back(3, 12);
        let mut p = PointerWrap::writer();
        p.sync(&mut q);
        let bytes = p.into_bytes();

        let mut loaded = ThreadQueueList::new();
        let mut p = PointerWrap::reader(&bytes);
        p.sync(&mut loaded);
        assert!(p.check().is_ok());
        assert_eq!(loaded, q);
    }
}
