// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent priority queues and the round-robin tick that hands the next
//! ready delivery to the Delivery Engine.
//!
//! One logical queue per agent, each a sorted multiset by `(priority,
//! enqueued-seq)` — `Priority`'s derived `Ord` puts `P0` first, and the
//! monotonic sequence number breaks ties in enqueue order, giving strict
//! FIFO within a priority tier.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use indexmap::IndexMap;

use crate::delivery::Priority;
use crate::registry::WorkerRegistry;

type QueueEntry = (Priority, u64, String);

/// A delivery the scheduler picked this tick, ready to hand to the
/// Delivery Engine for injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledInjection {
    pub agent: String,
    pub delivery_id: String,
}

pub struct Scheduler {
    queues: IndexMap<String, BTreeSet<QueueEntry>>,
    scheduled: HashSet<String>,
    next_seq: u64,
    soft_cap: usize,
    rr_cursor: usize,
}

impl Scheduler {
    pub fn new(soft_cap: usize) -> Self {
        Self { queues: IndexMap::new(), scheduled: HashSet::new(), next_seq: 0, soft_cap, rr_cursor: 0 }
    }

    /// Enqueue `delivery_id` for `agent` at `priority`. Returns `false`
    /// without effect if this delivery is already scheduled somewhere,
    /// guarding against duplicate re-enqueue after a retry backoff elapses
    /// while the delivery is still tracked.
    pub fn enqueue(&mut self, agent: &str, priority: Priority, delivery_id: String) -> bool {
        if self.scheduled.contains(&delivery_id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queues.entry(agent.to_owned()).or_default().insert((priority, seq, delivery_id.clone()));
        self.scheduled.insert(delivery_id);
        true
    }

    pub fn depth(&self, agent: &str) -> usize {
        self.queues.get(agent).map(BTreeSet::len).unwrap_or(0)
    }

    /// Remove a single delivery from its agent's queue, e.g. on explicit
    /// cancellation. Returns `true` if it was present.
    pub fn remove(&mut self, agent: &str, delivery_id: &str) -> bool {
        let Some(queue) = self.queues.get_mut(agent) else { return false };
        let before = queue.len();
        queue.retain(|(_, _, id)| id != delivery_id);
        let removed = queue.len() != before;
        if removed {
            self.scheduled.remove(delivery_id);
        }
        removed
    }

    /// Drop every queued delivery for `agent`, e.g. once it transitions to
    /// `gone`. Returns the dropped delivery ids so the caller can fail them.
    pub fn drain_agent(&mut self, agent: &str) -> Vec<String> {
        let Some(queue) = self.queues.shift_remove(agent) else { return Vec::new() };
        let ids: Vec<String> = queue.into_iter().map(|(_, _, id)| id).collect();
        for id in &ids {
            self.scheduled.remove(id);
        }
        ids
    }

    /// Shed entries once `agent`'s queue exceeds the soft cap while
    /// `busyness` is at or above 0.9: drop the newest `P4` entries first,
    /// then `P3`, until back under the cap. Returns the dropped delivery
    /// ids in drop order.
    pub fn shed(&mut self, agent: &str, busyness: f64) -> Vec<String> {
        let mut dropped = Vec::new();
        if busyness < 0.9 {
            return dropped;
        }
        let Some(queue) = self.queues.get_mut(agent) else { return dropped };
        for tier in [Priority::P4, Priority::P3] {
            while queue.len() > self.soft_cap {
                let victim = queue.iter().rev().find(|(p, _, _)| *p == tier).cloned();
                let Some(victim) = victim else { break };
                queue.remove(&victim);
                self.scheduled.remove(&victim.2);
                dropped.push(victim.2);
            }
        }
        dropped
    }

    /// Advance the round-robin cursor by one agent and hand back a single
    /// ready delivery, or `None` if no agent has work it's currently
    /// allowed to receive. Callers loop this once per tick interval (and on
    /// any event that could unblock progress) to drain as many ready
    /// deliveries as the current state permits.
    ///
    /// `injecting` is the set of agents with an already-in-flight
    /// `injected` delivery; the scheduler never hands out a second one for
    /// the same agent, preserving the at-most-one-in-flight invariant.
    pub fn tick(&mut self, now: Instant, registry: &WorkerRegistry, injecting: &HashSet<String>) -> Option<ScheduledInjection> {
        let agents: Vec<String> = self.queues.keys().cloned().collect();
        if agents.is_empty() {
            return None;
        }
        let n = agents.len();
        for step in 0..n {
            let idx = (self.rr_cursor + step) % n;
            let agent_name = &agents[idx];
            if injecting.contains(agent_name) {
                continue;
            }
            let Some(queue) = self.queues.get(agent_name) else { continue };
            let Some(head) = queue.iter().next().cloned() else { continue };
            let (priority, _, ref delivery_id) = head;
            let Some(agent) = registry.lookup(agent_name) else { continue };
            if agent.is_backpressured(now) && !matches!(priority, Priority::P0 | Priority::P1) {
                continue;
            }
            if !agent.ready_for_injection(now) {
                continue;
            }
            if let Some(q) = self.queues.get_mut(agent_name) {
                q.remove(&head);
            }
            self.scheduled.remove(delivery_id);
            self.rr_cursor = (idx + 1) % n;
            return Some(ScheduledInjection { agent: agent_name.clone(), delivery_id: delivery_id.clone() });
        }
        None
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
