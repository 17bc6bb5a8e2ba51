//! This module contains the periodic ejection evaluator.
//!
//! Once per interval the timer rotates every endpoint's counter buckets and
//! runs two independent detection algorithms over the completed window: the
//! success-rate algorithm (statistical outliers below `mean - stdev * factor`)
//! and the failure-percentage algorithm (absolute threshold). Ejections are
//! enforced probabilistically and capped globally; afterwards every endpoint
//! gets a back-off decay / un-ejection step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

use crate::config::OutlierDetectionConfig;
use crate::endpoint::{EndpointKey, EndpointState};
use crate::policy::OutlierDetectionPolicy;
use crate::utils::metrics::{
    EJECTED_ENDPOINTS, EJECTIONS_TOTAL, EVALUATIONS_TOTAL, UNEJECTIONS_TOTAL,
};

/// One evaluation pass over the endpoint map. The caller holds the policy
/// lock for the duration of the pass, so the map cannot change under it.
///
/// The enforcement dice roll draws from the half-open range `[1, 100)` and
/// ejects on a strict compare against the enforcement percentage, so 0 never
/// ejects and 100 always does. The ejection cap tightens as the pass ejects:
/// a candidate is only ejected while `ejected * 100 / total` stays below
/// `max_ejection_percent`, except that the first ejection is always allowed.
pub(crate) fn run_ejection_pass(
    endpoints: &HashMap<EndpointKey, Arc<EndpointState>>,
    config: &OutlierDetectionConfig,
    now: Instant,
    rng: &mut impl Rng,
) {
    // Rotate every bucket before reading any statistic, so the window spans
    // the same interval for all endpoints.
    for state in endpoints.values() {
        state.rotate_buckets();
    }

    let mut success_rate_candidates: Vec<(&EndpointKey, &Arc<EndpointState>, f64)> = Vec::new();
    let mut failure_percentage_candidates: Vec<(&EndpointKey, &Arc<EndpointState>, f64)> =
        Vec::new();
    let mut ejected_count = 0usize;
    let mut success_rate_sum = 0.0;

    for (key, state) in endpoints {
        if state.is_ejected() {
            ejected_count += 1;
        }
        let Some((rate, volume)) = state.success_rate_and_volume() else {
            continue;
        };
        if let Some(sr) = &config.success_rate_ejection {
            if volume >= u64::from(sr.request_volume) {
                success_rate_candidates.push((key, state, rate));
                success_rate_sum += rate;
            }
        }
        if let Some(fp) = &config.failure_percentage_ejection {
            if volume >= u64::from(fp.request_volume) {
                failure_percentage_candidates.push((key, state, rate));
            }
        }
    }

    let total_endpoints = endpoints.len();

    if let Some(sr) = &config.success_rate_ejection {
        if !success_rate_candidates.is_empty()
            && success_rate_candidates.len() >= sr.minimum_hosts as usize
        {
            let mean = success_rate_sum / success_rate_candidates.len() as f64;
            let variance = success_rate_candidates
                .iter()
                .map(|(_, _, rate)| (rate - mean).powi(2))
                .sum::<f64>()
                / success_rate_candidates.len() as f64;
            let ejection_threshold =
                mean - variance.sqrt() * (f64::from(sr.stdev_factor) / 1000.0);
            debug!(
                mean,
                ejection_threshold,
                candidates = success_rate_candidates.len(),
                "running success rate algorithm"
            );
            for &(key, state, rate) in &success_rate_candidates {
                if rate < ejection_threshold {
                    roll_and_eject(
                        key,
                        state,
                        sr.enforcement_percentage,
                        config.max_ejection_percent,
                        &mut ejected_count,
                        total_endpoints,
                        now,
                        rng,
                        "success_rate",
                    );
                }
            }
        }
    }

    if let Some(fp) = &config.failure_percentage_ejection {
        if !failure_percentage_candidates.is_empty()
            && failure_percentage_candidates.len() >= fp.minimum_hosts as usize
        {
            for &(key, state, rate) in &failure_percentage_candidates {
                // The success rate algorithm may already have ejected it.
                if state.is_ejected() {
                    continue;
                }
                if 100.0 - rate > f64::from(fp.threshold) {
                    roll_and_eject(
                        key,
                        state,
                        fp.enforcement_percentage,
                        config.max_ejection_percent,
                        &mut ejected_count,
                        total_endpoints,
                        now,
                        rng,
                        "failure_percentage",
                    );
                }
            }
        }
    }

    // Back-off decay runs after all ejections so a fresh ejection is never
    // decayed within the same pass.
    for (key, state) in endpoints {
        if state.maybe_uneject(now, config.base_ejection_time, config.max_ejection_time()) {
            info!(endpoint = %key, "endpoint returned to service");
            UNEJECTIONS_TOTAL.inc();
        }
    }

    EVALUATIONS_TOTAL.inc();
    EJECTED_ENDPOINTS.set(endpoints.values().filter(|s| s.is_ejected()).count() as i64);
}

#[allow(clippy::too_many_arguments)]
fn roll_and_eject(
    key: &EndpointKey,
    state: &Arc<EndpointState>,
    enforcement_percentage: u32,
    max_ejection_percent: u32,
    ejected_count: &mut usize,
    total_endpoints: usize,
    now: Instant,
    rng: &mut impl Rng,
    algorithm: &str,
) {
    let roll: u32 = rng.gen_range(1..100);
    let current_percent = 100.0 * *ejected_count as f64 / total_endpoints as f64;
    if roll < enforcement_percentage
        && (*ejected_count == 0 || current_percent < f64::from(max_ejection_percent))
    {
        warn!(endpoint = %key, algorithm, "ejecting endpoint");
        state.eject(now);
        EJECTIONS_TOTAL.with_label_values(&[algorithm]).inc();
        *ejected_count += 1;
    }
}

/// Armed one-shot timer driving the evaluation passes.
///
/// Each firing locks the policy, runs a pass and re-arms by installing a
/// fresh timer. Cancellation raises the flag and aborts the task; a firing
/// that already started observes the flag under the policy lock and performs
/// no state changes.
pub(crate) struct EjectionTimer {
    start_time: TokioInstant,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl EjectionTimer {
    pub(crate) fn spawn(
        policy: Arc<OutlierDetectionPolicy>,
        start_time: TokioInstant,
        interval: Duration,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        debug!(interval_ms = interval.as_millis() as u64, "arming ejection timer");
        let handle = tokio::spawn(async move {
            // A deadline already in the past fires immediately.
            tokio::time::sleep_until(start_time + interval).await;
            let mut rng = StdRng::from_entropy();
            policy.on_ejection_timer(&flag, &mut rng);
        });
        Self { start_time, cancelled, handle }
    }

    /// Start time of the armed timer; reused when the interval is
    /// reconfigured so the next firing keeps its original schedule.
    pub(crate) fn start_time(&self) -> TokioInstant {
        self.start_time
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.abort();
    }
}

impl Drop for EjectionTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
