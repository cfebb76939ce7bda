use super::*;

fn engine() -> DeliveryEngine {
    DeliveryEngine::new(3, vec![100, 400, 1_600], Duration::from_millis(500), Duration::from_millis(500))
}

fn enqueue(engine: &mut DeliveryEngine, to: &str) -> String {
    engine.enqueue("msg-1".to_owned(), "alice".to_owned(), to.to_owned(), serde_json::json!({"text": "hi"}), None, Priority::default_direct())
}

#[test]
fn priority_orders_p0_before_p4() {
    assert!(Priority::P0 < Priority::P4);
    let mut priorities = vec![Priority::P3, Priority::P0, Priority::P4, Priority::P1];
    priorities.sort();
    assert_eq!(priorities, vec![Priority::P0, Priority::P1, Priority::P3, Priority::P4]);
}

#[yare::parameterized(
    p0 = { Priority::P0, 0 },
    p1 = { Priority::P1, 1 },
    p2 = { Priority::P2, 2 },
    p3 = { Priority::P3, 3 },
    p4 = { Priority::P4, 4 },
)]
fn priority_rank_matches_declaration_order(priority: Priority, rank: usize) {
    let all = [Priority::P0, Priority::P1, Priority::P2, Priority::P3, Priority::P4];
    let lower: Vec<Priority> = all.iter().copied().filter(|p| *p < priority).collect();
    assert_eq!(lower.len(), rank, "{priority:?} should rank above exactly {rank} tier(s)");
}

#[test]
fn full_success_path_transitions_in_order() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    assert_eq!(engine.get(&id).expect("delivery present").state, DeliveryState::Queued);

    let now = Instant::now();
    let receipt = engine.mark_injected(&id, now).expect("mark_injected receipt");
    assert_eq!(receipt.state, DeliveryState::Injected);

    let receipt = engine.mark_echo_matched(&id, now).expect("mark_echo_matched receipt");
    assert_eq!(receipt.state, DeliveryState::Verified);

    let receipt = engine.mark_activity_observed(&id).expect("mark_activity_observed receipt");
    assert_eq!(receipt.state, DeliveryState::Active { certainty: Certainty::High });

    let receipt = engine.mark_acked(&id).expect("mark_acked receipt");
    assert_eq!(receipt.state, DeliveryState::Acked);
}

#[test]
fn echo_matched_ignored_unless_injected() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    assert!(engine.mark_echo_matched(&id, Instant::now()).is_none());
}

#[test]
fn activity_observed_ignored_unless_verified() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    engine.mark_injected(&id, Instant::now());
    assert!(engine.mark_activity_observed(&id).is_none());
}

#[test]
fn ack_ignored_unless_active() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    assert!(engine.mark_acked(&id).is_none());
}

#[test]
fn write_failed_is_immediately_terminal_with_no_retry() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    let receipt = engine.mark_write_failed(&id).expect("mark_write_failed receipt");
    assert_eq!(receipt.state, DeliveryState::Failed { reason: "write_failed".to_owned() });
    assert!(engine.mark_write_failed(&id).is_none());
}

#[test]
fn echo_timeout_retries_with_backoff_then_fails() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    let t0 = Instant::now();
    engine.mark_injected(&id, t0);

    let after_echo_window = t0 + Duration::from_millis(600);
    let receipt = engine.poll_timeout(&id, after_echo_window).expect("first echo timeout retries");
    assert_eq!(receipt.state, DeliveryState::Queued);
    assert_eq!(engine.get(&id).expect("delivery present").attempt, 1);

    engine.mark_injected(&id, after_echo_window);
    let second_timeout = after_echo_window + Duration::from_millis(600);
    let receipt = engine.poll_timeout(&id, second_timeout).expect("second echo timeout retries");
    assert_eq!(receipt.state, DeliveryState::Queued);
    assert_eq!(engine.get(&id).expect("delivery present").attempt, 2);

    engine.mark_injected(&id, second_timeout);
    let third_timeout = second_timeout + Duration::from_millis(600);
    let receipt = engine.poll_timeout(&id, third_timeout).expect("third echo timeout fails terminally");
    assert_eq!(receipt.state, DeliveryState::Failed { reason: "echo_timeout".to_owned() });
}

#[test]
fn attempt_counts_injections_made_not_timeouts_experienced() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    let t0 = Instant::now();

    engine.mark_injected(&id, t0);
    assert_eq!(engine.get(&id).expect("present").attempt, 1, "first PTY write is attempt 1");

    let after_echo_window = t0 + Duration::from_millis(600);
    let receipt = engine.poll_timeout(&id, after_echo_window).expect("echo timeout retries");
    assert_eq!(receipt.state, DeliveryState::Queued);
    assert_eq!(engine.get(&id).expect("present").attempt, 1, "a timeout alone does not advance attempt");

    engine.mark_injected(&id, after_echo_window);
    assert_eq!(engine.get(&id).expect("present").attempt, 2, "the retry's PTY write is attempt 2");

    engine.mark_echo_matched(&id, after_echo_window);
    let receipt = engine.mark_activity_observed(&id).expect("activity observed");
    assert_eq!(receipt.state, DeliveryState::Active { certainty: Certainty::High });
    assert_eq!(engine.get(&id).expect("present").attempt, 2, "attempt_count=2 on the terminal receipt after one retry");
}

#[test]
fn activity_window_expiry_downgrades_to_low_certainty() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    let t0 = Instant::now();
    engine.mark_injected(&id, t0);
    engine.mark_echo_matched(&id, t0);

    let after_activity_window = t0 + Duration::from_millis(600);
    let receipt = engine.poll_timeout(&id, after_activity_window).expect("activity window expiry transitions");
    assert_eq!(receipt.state, DeliveryState::Active { certainty: Certainty::Low });
}

#[test]
fn fail_all_for_agent_only_touches_non_terminal_matching_deliveries() {
    let mut engine = engine();
    let bob_1 = enqueue(&mut engine, "bob");
    let bob_2 = enqueue(&mut engine, "bob");
    let carol = enqueue(&mut engine, "carol");
    engine.mark_write_failed(&bob_1);

    let receipts = engine.fail_all_for_agent("bob");
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].delivery_id, bob_2);
    assert_eq!(engine.get(&carol).expect("carol delivery present").state, DeliveryState::Queued);
}

#[test]
fn ready_to_schedule_respects_retry_at() {
    let mut engine = engine();
    let id = enqueue(&mut engine, "bob");
    let t0 = Instant::now();
    assert_eq!(engine.ready_to_schedule(t0), vec![id.clone()]);

    engine.mark_injected(&id, t0);
    let after_echo_window = t0 + Duration::from_millis(600);
    engine.poll_timeout(&id, after_echo_window);
    assert!(engine.ready_to_schedule(after_echo_window).is_empty());

    let after_backoff = after_echo_window + Duration::from_millis(200);
    assert_eq!(engine.ready_to_schedule(after_backoff), vec![id]);
}

#[test]
fn next_deadline_reports_the_soonest_pending_timer() {
    let mut engine = engine();
    let fast = enqueue(&mut engine, "bob");
    let slow = enqueue(&mut engine, "carol");
    let t0 = Instant::now();
    engine.mark_injected(&fast, t0);
    engine.mark_injected(&slow, t0 + Duration::from_millis(100));

    let deadline = engine.next_deadline().expect("a deadline is pending");
    let fast_deadline = engine.get(&fast).expect("fast delivery present");
    assert!(fast_deadline.injected_at.is_some());
    assert!(deadline <= t0 + Duration::from_millis(600));
}

#[test]
fn gc_terminal_drops_aged_terminal_deliveries_but_keeps_pending() {
    let mut engine = engine();
    let failed = enqueue(&mut engine, "bob");
    let pending = enqueue(&mut engine, "dave");

    engine.mark_write_failed(&failed);

    let future = Instant::now() + Duration::from_millis(200);
    engine.gc_terminal(Duration::from_millis(50), future);

    assert!(engine.get(&failed).is_none());
    assert!(engine.get(&pending).is_some());
}

#[test]
fn gc_terminal_keeps_terminal_deliveries_within_retention() {
    let mut engine = engine();
    let failed = enqueue(&mut engine, "bob");
    engine.mark_write_failed(&failed);

    engine.gc_terminal(Duration::from_secs(3600), Instant::now());
    assert!(engine.get(&failed).is_some());
}

mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Once a delivery reaches a terminal state, no further event can move
        /// it again: receipts only ever progress forward, never backward.
        #[test]
        fn terminal_deliveries_never_change_state_again(ops in prop::collection::vec(0u8..6, 0..20)) {
            let mut engine = engine();
            let id = enqueue(&mut engine, "bob");
            engine.mark_write_failed(&id);
            let now = Instant::now();

            for op in ops {
                match op {
                    0 => { engine.mark_injected(&id, now); }
                    1 => { engine.mark_echo_matched(&id, now); }
                    2 => { engine.mark_activity_observed(&id); }
                    3 => { engine.mark_acked(&id); }
                    4 => { engine.mark_write_failed(&id); }
                    _ => { engine.fail(&id, "other"); }
                }
                let state = engine.get(&id).expect("delivery still tracked").state.clone();
                prop_assert_eq!(state, DeliveryState::Failed { reason: "write_failed".to_owned() });
            }
        }

        /// `poll_timeout` never reaches back past `active`: once a delivery is
        /// observed active, arbitrarily many further timeout polls can't undo it.
        #[test]
        fn active_deliveries_are_not_undone_by_later_timeout_polls(extra_polls in 0u32..10) {
            let mut engine = engine();
            let id = enqueue(&mut engine, "bob");
            let t0 = Instant::now();
            engine.mark_injected(&id, t0);
            engine.mark_echo_matched(&id, t0);
            engine.mark_activity_observed(&id);

            let mut t = t0;
            for _ in 0..extra_polls {
                t += Duration::from_secs(1);
                engine.poll_timeout(&id, t);
                prop_assert_eq!(
                    engine.get(&id).expect("delivery still tracked").state.clone(),
                    DeliveryState::Active { certainty: Certainty::High }
                );
            }
        }
    }
}
