//! This module defines the core data structures for the outlier-detection layer.
//!
//! It contains the `EndpointState` struct, which accumulates per-endpoint call
//! outcomes in a pair of rotating counter buckets and tracks the ejection
//! back-off state, plus the `Address`/`EndpointKey` types used to key the
//! policy's endpoint map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::subchannel::SubchannelWrapper;

/// Channel arguments: an ordered string key/value map. Per-address arguments
/// participate in endpoint identity; channel-level arguments are passed
/// through to the child policy untouched.
pub type ChannelArgs = BTreeMap<String, String>;

/// A single transport destination as delivered by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// The transport target, e.g. `"10.0.0.1:443"`.
    pub target: String,
    /// Per-address channel arguments. Part of the endpoint identity.
    pub args: ChannelArgs,
    /// Routing attributes attached by resolvers and parent policies. These
    /// never influence endpoint identity, so attribute-only updates reuse
    /// the existing endpoint state.
    pub attributes: BTreeMap<String, String>,
}

impl Address {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), args: ChannelArgs::new(), attributes: BTreeMap::new() }
    }
}

/// Key of the policy's endpoint map, derived from an address with its routing
/// attributes stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn for_address(address: &Address) -> Self {
        let mut key = address.target.clone();
        for (name, value) in &address.args {
            key.push('|');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        EndpointKey(key)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One interval window of call outcomes.
#[derive(Debug, Default)]
struct Bucket {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl Bucket {
    fn reset(&self) {
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }
}

/// Serializer-owned portion of the endpoint state.
#[derive(Debug, Default)]
struct EndpointInner {
    /// Consecutive-ejection counter driving the back-off duration.
    multiplier: u32,
    /// Present iff the endpoint is currently ejected.
    ejection_time: Option<Instant>,
    /// Live wrappers bound to this address. Non-owning: wrappers detach
    /// themselves on drop.
    subchannels: Vec<Weak<SubchannelWrapper>>,
}

/// Per-address record shared between the policy map, the subchannel wrappers
/// and the call-completion path.
///
/// The two counter buckets rotate once per evaluation interval: new outcomes
/// land in the bucket selected by `active`, and after `rotate_buckets` the
/// other bucket holds the just-completed window for the evaluator to read.
/// Outcome recording is lock-free and may run on any thread; everything else
/// is driven from the policy's control plane.
#[derive(Debug)]
pub struct EndpointState {
    buckets: [Bucket; 2],
    /// Index of the bucket receiving new counts.
    active: AtomicUsize,
    inner: Mutex<EndpointInner>,
}

impl EndpointState {
    pub(crate) fn new() -> Self {
        Self {
            buckets: [Bucket::default(), Bucket::default()],
            active: AtomicUsize::new(0),
            inner: Mutex::new(EndpointInner::default()),
        }
    }

    /// Records a successful call completion. Lock-free.
    pub fn record_success(&self) {
        self.buckets[self.active.load(Ordering::Acquire)].successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed call completion. Lock-free.
    pub fn record_failure(&self) {
        self.buckets[self.active.load(Ordering::Acquire)].failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Zeroes the backup bucket and swaps the bucket roles. Afterwards the
    /// backup bucket holds the just-completed window and new outcomes land in
    /// a zeroed bucket.
    pub(crate) fn rotate_buckets(&self) {
        let backup = 1 - self.active.load(Ordering::Relaxed);
        self.buckets[backup].reset();
        // Publish the new active bucket; recorders acquire-load the index.
        self.active.store(backup, Ordering::Release);
    }

    /// Success rate (percent) and request volume of the completed window, or
    /// `None` when no calls finished in it.
    pub(crate) fn success_rate_and_volume(&self) -> Option<(f64, u64)> {
        let backup = &self.buckets[1 - self.active.load(Ordering::Acquire)];
        let successes = backup.successes.load(Ordering::Relaxed);
        let failures = backup.failures.load(Ordering::Relaxed);
        let total = successes + failures;
        if total == 0 {
            return None;
        }
        Some((successes as f64 * 100.0 / total as f64, total))
    }

    /// Whether the endpoint is currently ejected.
    pub fn is_ejected(&self) -> bool {
        self.inner.lock().ejection_time.is_some()
    }

    #[cfg(test)]
    pub(crate) fn multiplier(&self) -> u32 {
        self.inner.lock().multiplier
    }

    /// Ejects the endpoint: stamps the ejection time, bumps the back-off
    /// multiplier and masks every bound wrapper.
    pub(crate) fn eject(&self, now: Instant) {
        let wrappers = {
            let mut inner = self.inner.lock();
            inner.ejection_time = Some(now);
            inner.multiplier = inner.multiplier.saturating_add(1);
            live_wrappers(&mut inner)
        };
        for wrapper in wrappers {
            wrapper.eject();
        }
    }

    /// Returns the endpoint to service. Leaves the multiplier untouched; it
    /// decays one step per evaluation while the endpoint stays healthy.
    pub(crate) fn uneject(&self) {
        let wrappers = {
            let mut inner = self.inner.lock();
            inner.ejection_time = None;
            live_wrappers(&mut inner)
        };
        for wrapper in wrappers {
            wrapper.uneject();
        }
    }

    /// Called once per evaluation for every endpoint: decays the multiplier
    /// while un-ejected, or un-ejects once the back-off deadline has passed.
    /// Returns whether an un-ejection happened.
    ///
    /// The deadline is `ejection_time + min(base * multiplier, max(base,
    /// max_ejection_time))`, matching the xDS outlier-detection behavior,
    /// inner `max` included.
    pub(crate) fn maybe_uneject(
        &self,
        now: Instant,
        base_ejection_time: Duration,
        max_ejection_time: Duration,
    ) -> bool {
        let due = {
            let mut inner = self.inner.lock();
            match inner.ejection_time {
                None => {
                    inner.multiplier = inner.multiplier.saturating_sub(1);
                    return false;
                }
                Some(ejection_time) => {
                    let backoff = base_ejection_time
                        .saturating_mul(inner.multiplier)
                        .min(base_ejection_time.max(max_ejection_time));
                    now >= ejection_time + backoff
                }
            }
        };
        if due {
            self.uneject();
        }
        due
    }

    pub(crate) fn add_subchannel(&self, wrapper: &Arc<SubchannelWrapper>) {
        self.inner.lock().subchannels.push(Arc::downgrade(wrapper));
    }

    pub(crate) fn remove_subchannel(&self, wrapper: &SubchannelWrapper) {
        let ptr = wrapper as *const SubchannelWrapper;
        let mut inner = self.inner.lock();
        inner.subchannels.retain(|w| w.as_ptr() != ptr);
        debug!(remaining = inner.subchannels.len(), "subchannel detached from endpoint state");
    }
}

/// Upgrades the live wrappers and prunes the dead entries in passing.
fn live_wrappers(inner: &mut EndpointInner) -> Vec<Arc<SubchannelWrapper>> {
    let mut live = Vec::with_capacity(inner.subchannels.len());
    inner.subchannels.retain(|w| match w.upgrade() {
        Some(wrapper) => {
            live.push(wrapper);
            true
        }
        None => false,
    });
    live
}
