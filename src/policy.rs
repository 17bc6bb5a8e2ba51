//! The core logic for the outlier-detection policy: endpoint-map management,
//! ejection-timer lifecycle, child-policy plumbing, and the helper surface
//! handed to the child.
//!
//! All control-plane mutations (updates, helper callbacks, timer firings) are
//! ordered by one mutex; the call-completion path never takes it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info};

use crate::config::{ChildPolicyConfig, OutlierDetectionConfig};
use crate::endpoint::{Address, ChannelArgs, EndpointKey, EndpointState};
use crate::picker::{Picker, WrappedPicker};
use crate::subchannel::{ConnectivityState, Status, Subchannel, SubchannelWrapper};
use crate::utils::evaluator::{run_ejection_pass, EjectionTimer};
use crate::utils::metrics::TRACKED_ENDPOINTS;

/// Severity of a trace event forwarded through the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSeverity {
    Info,
    Warning,
    Error,
}

/// Capabilities a policy receives from the layer above it. The parent
/// framework implements this for the outlier-detection policy, and the
/// policy implements it again for its child.
pub trait ChannelControlHelper: Send + Sync {
    /// Creates a subchannel for `address`. Returns `None` when the policy is
    /// shutting down.
    fn create_subchannel(
        &self,
        address: Address,
        args: &ChannelArgs,
    ) -> Option<Arc<dyn Subchannel>>;

    /// Reports a new connectivity state, status and picker upward.
    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>);

    /// Asks the resolver for a fresh address list.
    fn request_reresolution(&self);

    /// Authority of the channel, for per-call authority overrides.
    fn authority(&self) -> String;

    /// Records a trace event on the channel's trace log.
    fn add_trace_event(&self, severity: TraceSeverity, message: &str);
}

/// Update forwarded to the child policy.
#[derive(Debug, Clone)]
pub struct ChildUpdate {
    pub addresses: Result<Vec<Address>, Status>,
    pub config: ChildPolicyConfig,
    pub channel_args: ChannelArgs,
}

/// The wrapped child load-balancing policy. Selection logic lives entirely
/// behind this contract; dropping the handle shuts the child down.
pub trait ChildPolicy: Send + Sync {
    fn update(&self, update: ChildUpdate);
    fn exit_idle(&self);
    fn reset_backoff(&self);
}

/// Builds child policies. Stands in for the policy registry of the
/// surrounding framework.
pub trait ChildPolicyFactory: Send + Sync {
    fn build(
        &self,
        helper: Arc<dyn ChannelControlHelper>,
        channel_args: &ChannelArgs,
    ) -> Arc<dyn ChildPolicy>;
}

/// Construction arguments for the policy.
pub struct PolicyArgs {
    /// The parent framework's helper.
    pub helper: Arc<dyn ChannelControlHelper>,
    pub child_factory: Arc<dyn ChildPolicyFactory>,
}

/// An address-list / configuration update from the parent.
pub struct PolicyUpdate {
    pub addresses: Result<Vec<Address>, Status>,
    pub config: Arc<OutlierDetectionConfig>,
    pub channel_args: ChannelArgs,
}

/// The load-balancing policy contract exposed to the parent framework.
pub trait LbPolicy: Send + Sync {
    fn update(self: Arc<Self>, update: PolicyUpdate);
    fn exit_idle(&self);
    fn reset_backoff(&self);
    fn shutdown(&self);
}

struct PolicyInner {
    config: Option<Arc<OutlierDetectionConfig>>,
    shutting_down: bool,
    child: Option<Arc<dyn ChildPolicy>>,
    /// Latest state, status and picker reported by the child.
    state: ConnectivityState,
    status: Status,
    picker: Option<Arc<dyn Picker>>,
    endpoints: HashMap<EndpointKey, Arc<EndpointState>>,
    ejection_timer: Option<EjectionTimer>,
}

/// Pass-through load-balancing policy that ejects statistical outliers.
pub struct OutlierDetectionPolicy {
    helper: Arc<dyn ChannelControlHelper>,
    child_factory: Arc<dyn ChildPolicyFactory>,
    inner: Mutex<PolicyInner>,
}

impl OutlierDetectionPolicy {
    pub fn new(args: PolicyArgs) -> Arc<Self> {
        debug!("outlier detection policy created");
        Arc::new(Self {
            helper: args.helper,
            child_factory: args.child_factory,
            inner: Mutex::new(PolicyInner {
                config: None,
                shutting_down: false,
                child: None,
                state: ConnectivityState::Idle,
                status: Status::ok(),
                picker: None,
                endpoints: HashMap::new(),
                ejection_timer: None,
            }),
        })
    }

    /// Applies a configuration / address update and forwards it to the child.
    ///
    /// Must run inside a tokio runtime when counting is enabled, since the
    /// ejection timer is a spawned task.
    pub fn update(self: &Arc<Self>, update: PolicyUpdate) {
        let (child, child_update) = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            let old_config = inner.config.replace(update.config.clone());
            let config = update.config;
            debug!(
                counting_enabled = config.counting_enabled(),
                addresses_ok = update.addresses.is_ok(),
                "received policy update"
            );

            if !config.counting_enabled() {
                if inner.ejection_timer.take().is_some() {
                    info!("counting disabled; ejection timer cancelled");
                }
            } else if inner.ejection_timer.is_none() {
                if let Some(interval) = config.interval {
                    inner.ejection_timer =
                        Some(EjectionTimer::spawn(self.clone(), TokioInstant::now(), interval));
                }
                // Discard counts accumulated while no timer was running.
                for state in inner.endpoints.values() {
                    state.rotate_buckets();
                }
                info!("ejection timer started");
            } else if old_config.as_ref().and_then(|c| c.interval) != config.interval {
                if let Some(interval) = config.interval {
                    // Keep the original schedule; a deadline already in the
                    // past fires immediately.
                    let start_time = inner
                        .ejection_timer
                        .as_ref()
                        .map_or_else(TokioInstant::now, EjectionTimer::start_time);
                    inner.ejection_timer =
                        Some(EjectionTimer::spawn(self.clone(), start_time, interval));
                    info!(
                        interval_ms = interval.as_millis() as u64,
                        "ejection interval changed; timer re-armed"
                    );
                }
            }

            if inner.child.is_none() {
                let helper = Arc::new(Helper { policy: self.clone() });
                inner.child = Some(self.child_factory.build(helper, &update.channel_args));
                debug!("created child policy");
            }

            if let Ok(addresses) = &update.addresses {
                let mut current = HashSet::with_capacity(addresses.len());
                for address in addresses {
                    let key = EndpointKey::for_address(address);
                    if !inner.endpoints.contains_key(&key) {
                        debug!(endpoint = %key, "tracking new endpoint");
                        inner.endpoints.insert(key.clone(), Arc::new(EndpointState::new()));
                    }
                    current.insert(key);
                }
                inner.endpoints.retain(|key, _| {
                    let keep = current.contains(key);
                    if !keep {
                        debug!(endpoint = %key, "endpoint dropped from the address list");
                    }
                    keep
                });
                TRACKED_ENDPOINTS.set(inner.endpoints.len() as i64);
            }

            let child_update = ChildUpdate {
                addresses: update.addresses,
                config: config.child_policy.clone(),
                channel_args: update.channel_args,
            };
            (inner.child.clone(), child_update)
        };
        // The child may call straight back into the helper, so it runs
        // outside the policy lock.
        if let Some(child) = child {
            child.update(child_update);
        }
    }

    pub fn exit_idle(&self) {
        let child = self.inner.lock().child.clone();
        if let Some(child) = child {
            child.exit_idle();
        }
    }

    pub fn reset_backoff(&self) {
        let child = self.inner.lock().child.clone();
        if let Some(child) = child {
            child.reset_backoff();
        }
    }

    pub fn shutdown(&self) {
        info!("shutting down");
        let dropped = {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            (inner.ejection_timer.take(), inner.child.take(), inner.picker.take())
        };
        // Dropped outside the lock: the timer cancels itself and the child
        // releases its helper reference back to this policy.
        drop(dropped);
    }

    /// Ejection timer firing. The policy lock is held across the whole
    /// firing, so the rotation, both algorithms, the decay step and the
    /// re-arm form one critical section that no update can interleave with.
    /// A firing whose timer was cancelled beforehand changes nothing.
    pub(crate) fn on_ejection_timer(self: &Arc<Self>, cancelled: &AtomicBool, rng: &mut StdRng) {
        let mut inner = self.inner.lock();
        if cancelled.load(Ordering::Acquire) || inner.shutting_down {
            return;
        }
        let Some(config) = inner.config.clone() else {
            return;
        };
        // The pass timestamp derives from the tokio clock so ejection
        // deadlines follow the same clock as the timer itself.
        run_ejection_pass(&inner.endpoints, &config, TokioInstant::now().into_std(), rng);
        if let Some(interval) = config.interval {
            inner.ejection_timer =
                Some(EjectionTimer::spawn(self.clone(), TokioInstant::now(), interval));
        }
    }

    /// Re-wraps the child's latest picker and pushes it upward. Nothing is
    /// propagated before the child has supplied a picker.
    fn maybe_update_picker(&self) {
        let (state, status, picker, counting_enabled) = {
            let inner = self.inner.lock();
            let Some(picker) = inner.picker.clone() else {
                return;
            };
            let counting_enabled =
                inner.config.as_ref().is_some_and(|c| c.counting_enabled());
            (inner.state, inner.status.clone(), picker, counting_enabled)
        };
        debug!(?state, counting_enabled, "propagating picker upward");
        let wrapped = WrappedPicker::new(Some(picker), counting_enabled);
        self.helper.update_state(state, status, Arc::new(wrapped));
    }
}

impl LbPolicy for OutlierDetectionPolicy {
    fn update(self: Arc<Self>, update: PolicyUpdate) {
        OutlierDetectionPolicy::update(&self, update);
    }

    fn exit_idle(&self) {
        OutlierDetectionPolicy::exit_idle(self);
    }

    fn reset_backoff(&self) {
        OutlierDetectionPolicy::reset_backoff(self);
    }

    fn shutdown(&self) {
        OutlierDetectionPolicy::shutdown(self);
    }
}

/// The helper handed to the child policy. Wraps subchannels, decorates
/// pickers, and passes everything else through to the parent helper unless
/// the policy is shutting down.
struct Helper {
    policy: Arc<OutlierDetectionPolicy>,
}

impl Helper {
    fn shutting_down(&self) -> bool {
        self.policy.inner.lock().shutting_down
    }
}

impl ChannelControlHelper for Helper {
    fn create_subchannel(
        &self,
        address: Address,
        args: &ChannelArgs,
    ) -> Option<Arc<dyn Subchannel>> {
        let endpoint_state = {
            let inner = self.policy.inner.lock();
            if inner.shutting_down {
                return None;
            }
            // Nullable: the subchannel may be created before any address
            // update delivered this key.
            inner.endpoints.get(&EndpointKey::for_address(&address)).cloned()
        };
        let subchannel = self.policy.helper.create_subchannel(address, args)?;
        Some(SubchannelWrapper::new(endpoint_state, subchannel))
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        {
            let mut inner = self.policy.inner.lock();
            if inner.shutting_down {
                return;
            }
            debug!(?state, status = %status, "child connectivity state update");
            inner.state = state;
            inner.status = status;
            inner.picker = Some(picker);
        }
        self.policy.maybe_update_picker();
    }

    fn request_reresolution(&self) {
        if self.shutting_down() {
            return;
        }
        self.policy.helper.request_reresolution();
    }

    fn authority(&self) -> String {
        if self.shutting_down() {
            return String::new();
        }
        self.policy.helper.authority()
    }

    fn add_trace_event(&self, severity: TraceSeverity, message: &str) {
        if self.shutting_down() {
            return;
        }
        self.policy.helper.add_trace_event(severity, message);
    }
}
