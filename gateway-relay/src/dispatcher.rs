//! Subscription work scheduler: health-weighted scoring, concurrency caps,
//! and circuit breaking across peers (spec §4.5).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::config::DispatcherPolicy;
use crate::telemetry::PeerTelemetry;

/// Outcome of a job's lifecycle with the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Assigned,
    Acknowledged,
    Failed,
    Rejected,
    Closed,
}

/// A decision returned by [`RelayDispatcher::schedule`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleDecision {
    Assigned { peer_id: String, degraded: bool },
    Rejected { reason: String },
}

struct InFlightJob {
    assigned_peer: Option<String>,
    status: JobStatus,
}

/// Scores, assigns, and circuit-breaks peers for subscription work (spec §4.5).
pub struct RelayDispatcher {
    policy: RwLock<DispatcherPolicy>,
    telemetry: RwLock<HashMap<String, PeerTelemetry>>,
    in_flight_counts: RwLock<HashMap<String, u32>>,
    failure_streaks: RwLock<HashMap<String, u32>>,
    jobs: RwLock<HashMap<String, InFlightJob>>,
    shutting_down: RwLock<bool>,
}

impl RelayDispatcher {
    #[must_use]
    pub fn new(policy: DispatcherPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            telemetry: RwLock::new(HashMap::new()),
            in_flight_counts: RwLock::new(HashMap::new()),
            failure_streaks: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            shutting_down: RwLock::new(false),
        }
    }

    /// Schedules a job across `candidate_peers`, returning the assignment or
    /// a rejection (spec §4.5). Repeated calls for the same `job_id` are
    /// idempotent, returning the existing assignment (spec §5).
    pub async fn schedule(&self, job_id: &str, candidate_peers: &[String]) -> ScheduleDecision {
        if let Some(job) = self.jobs.read().await.get(job_id) {
            if let Some(peer_id) = &job.assigned_peer {
                return ScheduleDecision::Assigned {
                    peer_id: peer_id.clone(),
                    degraded: false,
                };
            }
        }

        if *self.shutting_down.read().await {
            return ScheduleDecision::Rejected {
                reason: "dispatcher is shutting down".to_string(),
            };
        }

        if candidate_peers.is_empty() {
            return ScheduleDecision::Rejected {
                reason: "no candidate peers".to_string(),
            };
        }

        let policy = *self.policy.read().await;
        let telemetry = self.telemetry.read().await;
        let in_flight = self.in_flight_counts.read().await;
        let now = now_millis();

        let mut open_candidates: Vec<(&String, f64, u32)> = Vec::new();
        let mut all_scored: Vec<(&String, f64, u32)> = Vec::new();

        for peer_id in candidate_peers {
            let snapshot = telemetry.get(peer_id).copied().unwrap_or_default();
            let current_in_flight = in_flight.get(peer_id).copied().unwrap_or(0);
            let score = score_peer(&policy, &snapshot, current_in_flight);
            all_scored.push((peer_id, score, current_in_flight));
            if !snapshot.is_circuit_open(now) && current_in_flight < policy.max_concurrent_jobs_per_peer {
                open_candidates.push((peer_id, score, current_in_flight));
            }
        }

        let (chosen, degraded) = if let Some(best) = pick_lowest(&open_candidates) {
            (best, false)
        } else if let Some(best) = pick_lowest(&all_scored) {
            // Edge case (spec §4.5): all candidates circuit-broken or saturated
            // — assign to the least-bad peer anyway, flagged degraded.
            (best, true)
        } else {
            return ScheduleDecision::Rejected {
                reason: "no candidate peers".to_string(),
            };
        };

        drop(telemetry);
        drop(in_flight);

        let mut in_flight = self.in_flight_counts.write().await;
        *in_flight.entry(chosen.clone()).or_insert(0) += 1;
        drop(in_flight);

        self.jobs.write().await.insert(
            job_id.to_string(),
            InFlightJob {
                assigned_peer: Some(chosen.clone()),
                status: JobStatus::Assigned,
            },
        );

        ScheduleDecision::Assigned {
            peer_id: chosen,
            degraded,
        }
    }

    /// Acknowledges a job's completion: decrements the assigned peer's
    /// in-flight count and records a success for its failure EMA. A no-op
    /// for an unknown `job_id` (spec §4.5).
    pub async fn acknowledge(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        job.status = JobStatus::Acknowledged;
        if let Some(peer_id) = job.assigned_peer.clone() {
            drop(jobs);
            self.decrement_in_flight(&peer_id).await;
            self.record_outcome(&peer_id, true).await;
        }
    }

    /// Marks a job failed: increments the assigned peer's failure streak,
    /// possibly opening its circuit breaker (spec §4.5).
    pub async fn fail(&self, job_id: &str, _reason: &str) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        job.status = JobStatus::Failed;
        if let Some(peer_id) = job.assigned_peer.clone() {
            drop(jobs);
            self.decrement_in_flight(&peer_id).await;
            self.record_outcome(&peer_id, false).await;

            let policy = *self.policy.read().await;
            let mut streaks = self.failure_streaks.write().await;
            let streak = streaks.entry(peer_id.clone()).or_insert(0);
            *streak += 1;
            if *streak >= policy.circuit_breaker_threshold {
                let mut telemetry = self.telemetry.write().await;
                let entry = telemetry.entry(peer_id.clone()).or_default();
                entry.circuit_breaker_open_until = Some(now_millis() + policy.circuit_breaker_duration_ms as i64);
            }
        }
    }

    async fn decrement_in_flight(&self, peer_id: &str) {
        let mut in_flight = self.in_flight_counts.write().await;
        if let Some(count) = in_flight.get_mut(peer_id) {
            *count = count.saturating_sub(1);
        }
    }

    async fn record_outcome(&self, peer_id: &str, success: bool) {
        if success {
            self.failure_streaks.write().await.insert(peer_id.to_string(), 0);
        }
        let mut telemetry = self.telemetry.write().await;
        let entry = telemetry.entry(peer_id.to_string()).or_default();
        const ALPHA: f64 = 0.3;
        let sample = if success { 0.0 } else { 1.0 };
        entry.failure_rate = ALPHA * sample + (1.0 - ALPHA) * entry.failure_rate;
    }

    /// Merges telemetry reported by the peer pool into the dispatcher's
    /// view, honoring monotonic `reportedAt` (spec §4.5, §5). A report that
    /// clears a now-expired circuit breaker re-admits the peer to scoring
    /// (testable property 6).
    pub async fn report_peer_metrics(&self, peer_id: &str, incoming: PeerTelemetry) {
        let now = now_millis();
        let mut telemetry = self.telemetry.write().await;
        let entry = telemetry.entry(peer_id.to_string()).or_default();
        let carried_breaker = entry.circuit_breaker_open_until.filter(|&until| now < until);
        entry.merge(incoming);
        if entry.circuit_breaker_open_until.is_none() {
            entry.circuit_breaker_open_until = carried_breaker;
        }
    }

    /// Hot-swaps the scoring/breaker policy; in-flight assignments are unaffected.
    pub async fn apply_policy_update(&self, policy: DispatcherPolicy) {
        *self.policy.write().await = policy;
    }

    /// Refuses new schedules and marks the dispatcher as draining.
    pub async fn shutdown(&self) {
        *self.shutting_down.write().await = true;
    }

    /// Current in-flight job count for `peer_id`, for tests and metrics.
    pub async fn in_flight_jobs(&self, peer_id: &str) -> u32 {
        self.in_flight_counts.read().await.get(peer_id).copied().unwrap_or(0)
    }
}

fn score_peer(policy: &DispatcherPolicy, telemetry: &PeerTelemetry, in_flight: u32) -> f64 {
    let mut score = policy.in_flight_weight * f64::from(in_flight)
        + policy.latency_weight * telemetry.latency_ms
        + policy.failure_weight * telemetry.failure_rate;
    if telemetry.replica_lag > policy.reassign_on_lag_blocks {
        score += policy.lag_penalty;
    }
    score
}

fn pick_lowest<'a>(candidates: &[(&'a String, f64, u32)]) -> Option<String> {
    candidates
        .iter()
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)))
        .map(|(peer_id, _, _)| (*peer_id).clone())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
