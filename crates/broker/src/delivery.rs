// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Delivery state machine: `queued -> injected -> verified -> active
//! (-> acked) / failed`. One [`DeliveryEngine`] instance is owned by the
//! Broker Core; every transition here is a plain synchronous method, driven
//! by events the core receives from the Scheduler, the Output Scanner, and
//! the Worker Registry.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Total order `P0 > P1 > P2 > P3 > P4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub fn default_direct() -> Self {
        Priority::P2
    }

    pub fn default_channel() -> Self {
        Priority::P3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    High,
    Low,
}

/// Terminal and in-flight states of a [`PendingDelivery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Injected,
    Verified,
    Active { certainty: Certainty },
    Acked,
    Failed { reason: String },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub delivery_id: String,
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub body: Value,
    pub thread_id: Option<String>,
    pub priority: Priority,
    #[serde(skip, default = "Instant::now")]
    pub enqueued_at: Instant,
    pub attempt: u32,
    pub state: DeliveryState,
    #[serde(skip)]
    pub injected_at: Option<Instant>,
    #[serde(skip)]
    echo_deadline: Option<Instant>,
    #[serde(skip)]
    activity_deadline: Option<Instant>,
    #[serde(skip)]
    retry_at: Option<Instant>,
}

/// A receipt the Broker Core emits to the originating client (and mirrors
/// to the cloud as a lightweight event) whenever a delivery transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub delivery_id: String,
    pub message_id: String,
    pub to: String,
    pub state: DeliveryState,
}

pub struct DeliveryEngine {
    deliveries: IndexMap<String, PendingDelivery>,
    max_attempts: u32,
    backoff_ms: Vec<u64>,
    echo_window: Duration,
    activity_window: Duration,
}

impl DeliveryEngine {
    pub fn new(max_attempts: u32, backoff_ms: Vec<u64>, echo_window: Duration, activity_window: Duration) -> Self {
        Self { deliveries: IndexMap::new(), max_attempts, backoff_ms, echo_window, activity_window }
    }

    /// Accept a new delivery in the `queued` state. Returns its
    /// broker-internal delivery id (distinct from the client-supplied
    /// message id, since one message can fan out to several targets).
    pub fn enqueue(&mut self, message_id: String, from: String, to: String, body: Value, thread_id: Option<String>, priority: Priority) -> String {
        let delivery_id = Uuid::new_v4().to_string();
        self.deliveries.insert(
            delivery_id.clone(),
            PendingDelivery {
                delivery_id: delivery_id.clone(),
                message_id,
                from,
                to,
                body,
                thread_id,
                priority,
                enqueued_at: Instant::now(),
                attempt: 0,
                state: DeliveryState::Queued,
                injected_at: None,
                echo_deadline: None,
                activity_deadline: None,
                retry_at: None,
            },
        );
        delivery_id
    }

    /// Reconstruct a delivery directly into `queued`, bypassing the normal
    /// `attempt: 0` start. Used at startup to restore deliveries recovered
    /// from the pending-delivery log: anything that had already reached
    /// `injected` or beyond is demoted back to `queued` with `attempt`
    /// bumped by one, since the write that produced it is gone along with
    /// the process that made it.
    #[allow(clippy::too_many_arguments)]
    pub fn restore_queued(
        &mut self,
        delivery_id: String,
        message_id: String,
        from: String,
        to: String,
        body: Value,
        thread_id: Option<String>,
        priority: Priority,
        attempt: u32,
    ) {
        self.deliveries.insert(
            delivery_id.clone(),
            PendingDelivery {
                delivery_id,
                message_id,
                from,
                to,
                body,
                thread_id,
                priority,
                enqueued_at: Instant::now(),
                attempt,
                state: DeliveryState::Queued,
                injected_at: None,
                echo_deadline: None,
                activity_deadline: None,
                retry_at: None,
            },
        );
    }

    pub fn get(&self, delivery_id: &str) -> Option<&PendingDelivery> {
        self.deliveries.get(delivery_id)
    }

    /// The Scheduler picked this delivery and wrote it to the PTY. `attempt`
    /// counts injections made, not timeouts experienced, so it advances
    /// here rather than in `poll_timeout`.
    pub fn mark_injected(&mut self, delivery_id: &str, now: Instant) -> Option<Receipt> {
        let d = self.deliveries.get_mut(delivery_id)?;
        d.state = DeliveryState::Injected;
        d.attempt += 1;
        d.injected_at = Some(now);
        d.echo_deadline = Some(now + self.echo_window);
        d.activity_deadline = None;
        Some(receipt_of(d))
    }

    /// The Output Scanner matched the injected body within the echo
    /// window.
    pub fn mark_echo_matched(&mut self, delivery_id: &str, now: Instant) -> Option<Receipt> {
        let d = self.deliveries.get_mut(delivery_id)?;
        if d.state != DeliveryState::Injected {
            return None;
        }
        d.state = DeliveryState::Verified;
        d.echo_deadline = None;
        d.activity_deadline = Some(now + self.activity_window);
        Some(receipt_of(d))
    }

    /// The Output Scanner observed an activity marker for a verified
    /// delivery.
    pub fn mark_activity_observed(&mut self, delivery_id: &str) -> Option<Receipt> {
        let d = self.deliveries.get_mut(delivery_id)?;
        if d.state != DeliveryState::Verified {
            return None;
        }
        d.state = DeliveryState::Active { certainty: Certainty::High };
        d.activity_deadline = None;
        Some(receipt_of(d))
    }

    /// PTY-level write failure: fails immediately, no retry, to avoid
    /// compounding head-of-line blocking.
    pub fn mark_write_failed(&mut self, delivery_id: &str) -> Option<Receipt> {
        self.fail(delivery_id, "write_failed")
    }

    pub fn mark_canceled(&mut self, delivery_id: &str) -> Option<Receipt> {
        self.fail(delivery_id, "canceled")
    }

    /// An explicit client-side acknowledgment. Only valid from `active`;
    /// anything else is ignored since ack is a strictly additive
    /// confirmation on top of the scanner-observed success path.
    pub fn mark_acked(&mut self, delivery_id: &str) -> Option<Receipt> {
        let d = self.deliveries.get_mut(delivery_id)?;
        if !matches!(d.state, DeliveryState::Active { .. }) {
            return None;
        }
        d.state = DeliveryState::Acked;
        Some(receipt_of(d))
    }

    /// Fail every non-terminal delivery addressed to `agent`, e.g. when the
    /// Worker Registry reports it `gone`.
    pub fn fail_all_for_agent(&mut self, agent: &str) -> Vec<Receipt> {
        let ids: Vec<String> = self
            .deliveries
            .values()
            .filter(|d| d.to == agent && !d.state.is_terminal())
            .map(|d| d.delivery_id.clone())
            .collect();
        ids.into_iter().filter_map(|id| self.fail(&id, "agent_gone")).collect()
    }

    /// Fail a single delivery with an arbitrary reason, e.g. `shed` or
    /// `agent_gone` when the scheduler drops an already-queued entry rather
    /// than the agent-wide sweep in [`Self::fail_all_for_agent`].
    pub fn fail(&mut self, delivery_id: &str, reason: &str) -> Option<Receipt> {
        let d = self.deliveries.get_mut(delivery_id)?;
        if d.state.is_terminal() {
            return None;
        }
        d.state = DeliveryState::Failed { reason: reason.to_owned() };
        d.echo_deadline = None;
        d.activity_deadline = None;
        Some(receipt_of(d))
    }

    /// Check `delivery_id`'s echo/activity deadlines against `now`,
    /// applying the retry-with-backoff or certainty-downgrade rule. Returns
    /// a receipt if a transition occurred.
    pub fn poll_timeout(&mut self, delivery_id: &str, now: Instant) -> Option<Receipt> {
        let backoff_ms = self.backoff_ms.clone();
        let max_attempts = self.max_attempts;
        let d = self.deliveries.get_mut(delivery_id)?;

        if d.state == DeliveryState::Injected {
            if d.echo_deadline.map(|dl| now >= dl).unwrap_or(false) {
                if d.attempt >= max_attempts {
                    d.state = DeliveryState::Failed { reason: "echo_timeout".to_owned() };
                    d.echo_deadline = None;
                    return Some(receipt_of(d));
                }
                let backoff = backoff_ms.get((d.attempt as usize).saturating_sub(1)).copied().unwrap_or(1_600);
                d.state = DeliveryState::Queued;
                d.echo_deadline = None;
                d.retry_at = Some(now + Duration::from_millis(backoff));
                return Some(receipt_of(d));
            }
        } else if d.state == DeliveryState::Verified {
            if d.activity_deadline.map(|dl| now >= dl).unwrap_or(false) {
                d.state = DeliveryState::Active { certainty: Certainty::Low };
                d.activity_deadline = None;
                return Some(receipt_of(d));
            }
        }
        None
    }

    /// Deliveries in `queued` whose retry backoff has elapsed (or that have
    /// never been injected) and are ready for the Scheduler to consider.
    pub fn ready_to_schedule(&self, now: Instant) -> Vec<String> {
        self.deliveries
            .values()
            .filter(|d| d.state == DeliveryState::Queued && d.retry_at.map(|t| now >= t).unwrap_or(true))
            .map(|d| d.delivery_id.clone())
            .collect()
    }

    /// Every delivery with an outstanding echo or activity deadline, for
    /// the core's timer-select loop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deliveries
            .values()
            .filter_map(|d| match d.state {
                DeliveryState::Injected => d.echo_deadline,
                DeliveryState::Verified => d.activity_deadline,
                DeliveryState::Queued => d.retry_at,
                _ => None,
            })
            .min()
    }

    /// Count of deliveries per coarse state, for `get_metrics`.
    pub fn state_counts(&self) -> [(&'static str, usize); 5] {
        let mut queued = 0;
        let mut injected = 0;
        let mut verified = 0;
        let mut active = 0;
        let mut failed = 0;
        for d in self.deliveries.values() {
            match d.state {
                DeliveryState::Queued => queued += 1,
                DeliveryState::Injected => injected += 1,
                DeliveryState::Verified => verified += 1,
                DeliveryState::Active { .. } | DeliveryState::Acked => active += 1,
                DeliveryState::Failed { .. } => failed += 1,
            }
        }
        [("queued", queued), ("injected", injected), ("verified", verified), ("active", active), ("failed", failed)]
    }

    /// Drop terminal deliveries older than `retention` so late echoes for
    /// truly-gone deliveries are ignored rather than silently resurrected.
    pub fn gc_terminal(&mut self, retention: Duration, now: Instant) {
        self.deliveries.retain(|_, d| {
            if !d.state.is_terminal() {
                return true;
            }
            let age_anchor = d.injected_at.unwrap_or(d.enqueued_at);
            now.duration_since(age_anchor) < retention
        });
    }
}

fn receipt_of(d: &PendingDelivery) -> Receipt {
    Receipt {
        delivery_id: d.delivery_id.clone(),
        message_id: d.message_id.clone(),
        to: d.to.clone(),
        state: d.state.clone(),
    }
}

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;
