// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded, time-windowed set of message fingerprints.
//!
//! Consulted whenever an inbound cloud echo arrives: if the id was
//! pre-seeded at publish time the echo is a loopback of our own outbound
//! message and is dropped; otherwise it's a genuine inbound message from
//! another machine.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

/// LRU-by-age, count-and-age-bounded cache of message ids.
pub struct DedupCache {
    cap: usize,
    ttl: Duration,
    entries: IndexMap<String, Instant>,
    order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self { cap, ttl, entries: IndexMap::new(), order: VecDeque::new() }
    }

    /// Insert `id`, evicting expired and, failing that, oldest entries to
    /// stay within `cap`. Returns `true` if `id` was not already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        let now = Instant::now();
        self.evict_expired(now);

        if self.entries.contains_key(&id) {
            return false;
        }

        while self.entries.len() >= self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.shift_remove(&oldest);
            } else {
                break;
            }
        }

        self.entries.insert(id.clone(), now);
        self.order.push_back(id);
        true
    }

    /// Same housekeeping as `insert`, but phrased for the call site that
    /// cares whether `id` had already been seen rather than whether this
    /// call was the one to record it.
    pub fn seen(&mut self, id: impl Into<String>) -> bool {
        !self.insert(id)
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            let expired = match self.entries.get(front) {
                Some(observed_at) => now.duration_since(*observed_at) > self.ttl,
                None => true,
            };
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.entries.shift_remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "dedup_tests.rs"]
mod tests;
