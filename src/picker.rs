//! This module contains the pick surface of the outlier-detection layer.
//!
//! The goal is to stay invisible on the pick path: selection is delegated to
//! the child policy's picker, and the only transformations applied to a
//! completed pick are unwrapping the decorated subchannel and attaching a
//! call tracker that feeds outcomes back into the endpoint's counters.

use std::sync::Arc;

use crate::endpoint::EndpointState;
use crate::subchannel::{Status, Subchannel, SubchannelWrapper};

/// Per-pick request metadata.
#[derive(Debug, Clone, Default)]
pub struct PickArgs {
    /// Request path, e.g. `"/pkg.Service/Method"`.
    pub path: String,
}

/// Observes the lifetime of a single call on a picked subchannel. The
/// framework invokes each method exactly once per call.
pub trait CallTracker: Send {
    fn on_call_started(&mut self);
    fn on_call_finished(&mut self, status: &Status);
}

/// Outcome of a pick.
pub enum PickResult {
    /// Use this subchannel for the call.
    Complete { subchannel: Arc<dyn Subchannel>, call_tracker: Option<Box<dyn CallTracker>> },
    /// No subchannel ready; queue the pick and retry on the next picker.
    Queue,
    /// Fail the call with a transient error; retries may be attempted.
    Fail(Status),
    /// Drop the call with a terminal error.
    Drop(Status),
}

/// A stateless object that, given pick args, chooses a subchannel.
pub trait Picker: Send + Sync {
    fn pick(&self, args: &PickArgs) -> PickResult;
}

/// Tracker attached to completed picks while counting is enabled: delegates
/// to whatever tracker the child supplied, then records the outcome on the
/// endpoint's active bucket.
pub(crate) struct CompletionTracker {
    delegate: Option<Box<dyn CallTracker>>,
    endpoint_state: Option<Arc<EndpointState>>,
}

impl CallTracker for CompletionTracker {
    fn on_call_started(&mut self) {
        if let Some(delegate) = &mut self.delegate {
            delegate.on_call_started();
        }
    }

    fn on_call_finished(&mut self, status: &Status) {
        if let Some(delegate) = &mut self.delegate {
            delegate.on_call_finished(status);
        }
        if let Some(state) = &self.endpoint_state {
            if status.is_ok() {
                state.record_success();
            } else {
                state.record_failure();
            }
        }
    }
}

/// Wraps the child policy's picker.
pub(crate) struct WrappedPicker {
    child: Option<Arc<dyn Picker>>,
    counting_enabled: bool,
}

impl WrappedPicker {
    pub(crate) fn new(child: Option<Arc<dyn Picker>>, counting_enabled: bool) -> Self {
        Self { child, counting_enabled }
    }
}

impl Picker for WrappedPicker {
    fn pick(&self, args: &PickArgs) -> PickResult {
        let Some(child) = &self.child else {
            return PickResult::Fail(Status::internal(
                "outlier_detection picker not given any child picker",
            ));
        };
        match child.pick(args) {
            PickResult::Complete { subchannel, call_tracker } => {
                let wrapper = match subchannel.clone().as_any().downcast::<SubchannelWrapper>() {
                    Ok(wrapper) => wrapper,
                    // Not one of ours; pass it through untouched.
                    Err(_) => return PickResult::Complete { subchannel, call_tracker },
                };
                let call_tracker = if self.counting_enabled {
                    Some(Box::new(CompletionTracker {
                        delegate: call_tracker,
                        endpoint_state: wrapper.endpoint_state(),
                    }) as Box<dyn CallTracker>)
                } else {
                    call_tracker
                };
                // The layers above must only ever see the transport subchannel.
                PickResult::Complete { subchannel: wrapper.wrapped_subchannel(), call_tracker }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subchannel::testing::FakeSubchannel;
    use crate::subchannel::Code;
    use parking_lot::Mutex;

    struct FixedPicker {
        result: Mutex<Option<PickResult>>,
    }

    impl FixedPicker {
        fn new(result: PickResult) -> Arc<Self> {
            Arc::new(Self { result: Mutex::new(Some(result)) })
        }
    }

    impl Picker for FixedPicker {
        fn pick(&self, _args: &PickArgs) -> PickResult {
            self.result.lock().take().expect("picker invoked more than once")
        }
    }

    #[derive(Default)]
    struct CountingTracker {
        started: usize,
        finished: Vec<Status>,
    }

    struct SharedTracker(Arc<Mutex<CountingTracker>>);

    impl CallTracker for SharedTracker {
        fn on_call_started(&mut self) {
            self.0.lock().started += 1;
        }

        fn on_call_finished(&mut self, status: &Status) {
            self.0.lock().finished.push(status.clone());
        }
    }

    fn completed_window(state: &EndpointState) -> Option<(f64, u64)> {
        state.rotate_buckets();
        state.success_rate_and_volume()
    }

    #[test]
    fn complete_pick_is_unwrapped_to_the_transport_subchannel() {
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(None, transport.clone());
        let child = FixedPicker::new(PickResult::Complete { subchannel: wrapper, call_tracker: None });

        let picker = WrappedPicker::new(Some(child), false);
        match picker.pick(&PickArgs::default()) {
            PickResult::Complete { subchannel, call_tracker } => {
                assert_eq!(subchannel.address(), "10.0.0.1:443");
                let transport_any: Arc<dyn std::any::Any + Send + Sync> = transport;
                assert!(Arc::ptr_eq(&subchannel.as_any(), &transport_any));
                assert!(call_tracker.is_none());
            }
            _ => panic!("expected a complete pick"),
        }
    }

    #[test]
    fn tracker_records_outcomes_when_counting_is_enabled() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state.clone()), transport);
        let child = FixedPicker::new(PickResult::Complete { subchannel: wrapper, call_tracker: None });

        let picker = WrappedPicker::new(Some(child), true);
        let PickResult::Complete { call_tracker: Some(mut tracker), .. } =
            picker.pick(&PickArgs::default())
        else {
            panic!("expected a complete pick with a tracker");
        };

        tracker.on_call_started();
        tracker.on_call_finished(&Status::ok());
        tracker.on_call_finished(&Status::unavailable("connection reset"));

        assert_eq!(completed_window(&state), Some((50.0, 2)));
    }

    #[test]
    fn tracker_composition_delegates_to_the_child_tracker() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state.clone()), transport);

        let child_tracker = Arc::new(Mutex::new(CountingTracker::default()));
        let child = FixedPicker::new(PickResult::Complete {
            subchannel: wrapper,
            call_tracker: Some(Box::new(SharedTracker(child_tracker.clone()))),
        });

        let picker = WrappedPicker::new(Some(child), true);
        let PickResult::Complete { call_tracker: Some(mut tracker), .. } =
            picker.pick(&PickArgs::default())
        else {
            panic!("expected a complete pick with a tracker");
        };

        tracker.on_call_started();
        tracker.on_call_finished(&Status::ok());

        let inner = child_tracker.lock();
        assert_eq!(inner.started, 1);
        assert_eq!(inner.finished, vec![Status::ok()]);
        drop(inner);
        assert_eq!(completed_window(&state), Some((100.0, 1)));
    }

    #[test]
    fn counting_disabled_leaves_the_child_tracker_alone() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state.clone()), transport);

        let child_tracker = Arc::new(Mutex::new(CountingTracker::default()));
        let child = FixedPicker::new(PickResult::Complete {
            subchannel: wrapper,
            call_tracker: Some(Box::new(SharedTracker(child_tracker.clone()))),
        });

        let picker = WrappedPicker::new(Some(child), false);
        let PickResult::Complete { call_tracker: Some(mut tracker), .. } =
            picker.pick(&PickArgs::default())
        else {
            panic!("expected a complete pick with a tracker");
        };

        tracker.on_call_finished(&Status::ok());
        assert_eq!(child_tracker.lock().finished.len(), 1);
        // No outcome recorded on the endpoint.
        assert!(completed_window(&state).is_none());
    }

    #[test]
    fn missing_child_picker_fails_the_pick() {
        let picker = WrappedPicker::new(None, true);
        match picker.pick(&PickArgs::default()) {
            PickResult::Fail(status) => {
                assert_eq!(status.code, Code::Internal);
                assert_eq!(status.message, "outlier_detection picker not given any child picker");
            }
            _ => panic!("expected a failed pick"),
        }
    }

    #[test]
    fn queue_and_failure_results_pass_through() {
        let picker = WrappedPicker::new(Some(FixedPicker::new(PickResult::Queue)), true);
        assert!(matches!(picker.pick(&PickArgs::default()), PickResult::Queue));

        let picker = WrappedPicker::new(
            Some(FixedPicker::new(PickResult::Drop(Status::unavailable("overloaded")))),
            true,
        );
        assert!(matches!(picker.pick(&PickArgs::default()), PickResult::Drop(_)));
    }

    #[test]
    fn foreign_subchannel_passes_through_untouched() {
        let transport = FakeSubchannel::new("10.0.0.2:443");
        let child = FixedPicker::new(PickResult::Complete {
            subchannel: transport.clone(),
            call_tracker: None,
        });

        let picker = WrappedPicker::new(Some(child), true);
        match picker.pick(&PickArgs::default()) {
            PickResult::Complete { subchannel, call_tracker } => {
                assert_eq!(subchannel.address(), "10.0.0.2:443");
                assert!(call_tracker.is_none());
            }
            _ => panic!("expected a complete pick"),
        }
    }
}
