//! Five consecutive failures on one peer opens its circuit breaker, so
//! scheduling favors the other candidate until the breaker window elapses,
//! at which point the original peer is eligible again.

use std::time::Duration;

use gateway_relay::config::DispatcherPolicy;
use gateway_relay::dispatcher::{RelayDispatcher, ScheduleDecision};

fn peers(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn five_consecutive_failures_open_the_breaker_and_it_recovers_after_the_window() {
    let policy = DispatcherPolicy {
        circuit_breaker_duration_ms: 100,
        ..DispatcherPolicy::default()
    };
    let dispatcher = RelayDispatcher::new(policy);

    // Drive p1 through five failing jobs, one at a time, matching how the
    // gateway server would schedule/fail a job per subscription attempt.
    for i in 0..5 {
        let job_id = format!("job-fail-{i}");
        let decision = dispatcher.schedule(&job_id, &peers(&["p1"])).await;
        assert!(matches!(decision, ScheduleDecision::Assigned { ref peer_id, .. } if peer_id == "p1"));
        dispatcher.fail(&job_id, "peer unreachable").await;
    }

    // The breaker is now open for p1: a fresh job against [p1, p2] must
    // prefer p2 without being flagged degraded.
    let decision = dispatcher.schedule("job-after-breaker", &peers(&["p1", "p2"])).await;
    assert_eq!(
        decision,
        ScheduleDecision::Assigned { peer_id: "p2".to_string(), degraded: false },
        "a peer with an open circuit breaker must not be preferred while healthy alternatives exist"
    );

    // Past the breaker window, p1 re-enters scoring. Acknowledge the job
    // assigned to p2 so the two peers are scored on equal footing again,
    // then confirm p1 is eligible once more.
    dispatcher.acknowledge("job-after-breaker").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let recovered = dispatcher.schedule("job-recovered", &peers(&["p1"])).await;
    assert!(
        matches!(recovered, ScheduleDecision::Assigned { ref peer_id, degraded: false } if peer_id == "p1"),
        "p1 should be schedulable again once its circuit breaker window has elapsed, got {recovered:?}"
    );
}
