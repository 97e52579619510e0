//! Scripted request driver.
//!
//! Replays a fixed burst-pause-burst pattern against a limiter, the way a
//! single caller hammering an endpoint would, and records every decision.

use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::ratelimit::{Clock, Limiter};

/// The request pattern to replay.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    /// Caller identity for every request
    pub key: String,
    /// Total number of requests to send
    pub requests: usize,
    /// Index of the request preceded by `pause`, if any
    pub pause_at: Option<usize>,
    /// How long to wait before request `pause_at`
    pub pause: Duration,
    /// Upper bound of a random delay inserted between requests
    pub jitter: Duration,
}

impl Default for SimulationPlan {
    fn default() -> Self {
        Self {
            key: "10".to_string(),
            requests: 200,
            pause_at: Some(101),
            pause: Duration::from_secs(10),
            jitter: Duration::ZERO,
        }
    }
}

/// The decision for one scripted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestOutcome {
    pub index: usize,
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
}

/// Every decision of a run plus totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub key: String,
    pub allowed: usize,
    pub denied: usize,
    pub outcomes: Vec<RequestOutcome>,
}

impl SimulationReport {
    fn record(&mut self, outcome: RequestOutcome) {
        if outcome.allowed {
            self.allowed += 1;
        } else {
            self.denied += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Run `plan` against `limiter`, reading time from `clock`.
pub async fn run(limiter: &Limiter, plan: &SimulationPlan, clock: &dyn Clock) -> SimulationReport {
    info!(
        key = %plan.key,
        requests = plan.requests,
        pause_at = ?plan.pause_at,
        pause_ms = plan.pause.as_millis() as u64,
        "Starting simulation"
    );

    let mut report = SimulationReport {
        key: plan.key.clone(),
        ..SimulationReport::default()
    };

    for index in 0..plan.requests {
        if plan.pause_at == Some(index) && !plan.pause.is_zero() {
            debug!(index, pause_ms = plan.pause.as_millis() as u64, "Pausing");
            tokio::time::sleep(plan.pause).await;
        }

        if !plan.jitter.is_zero() {
            let max_ms = plan.jitter.as_millis() as u64;
            let delay = rand::thread_rng().gen_range(0..=max_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let decision = limiter.check(plan.key.as_str(), clock.now());
        report.record(RequestOutcome {
            index,
            allowed: decision.allowed,
            remaining: decision.remaining,
            retry_after_ms: decision.retry_after.as_millis() as u64,
        });
    }

    info!(
        key = %plan.key,
        allowed = report.allowed,
        denied = report.denied,
        "Simulation finished"
    );

    report
}
