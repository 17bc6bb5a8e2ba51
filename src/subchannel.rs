//! Subchannel decoration for ejection masking.
//!
//! The child policy never talks to transport subchannels directly: the helper
//! hands it `SubchannelWrapper`s instead. A wrapper forwards connectivity
//! events upward untouched while its endpoint is healthy, and while the
//! endpoint is ejected it presents a synthetic transient failure to every
//! watcher, restoring the real state on un-ejection.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::endpoint::EndpointState;

/// Status message delivered with the synthetic transient failure. Stable;
/// surfaced to applications through connectivity watchers.
pub const EJECTED_MESSAGE: &str = "subchannel ejected by outlier detection";

/// Connectivity state of a subchannel or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Status code carried alongside state changes and pick failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok,
    Unavailable,
    Internal,
}

/// A status value: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self { code: Code::Ok, message: String::new() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { code: Code::Unavailable, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { code: Code::Internal, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Code::Ok => f.write_str("OK"),
            _ => write!(f, "{:?}: {}", self.code, self.message),
        }
    }
}

/// Observer of a subchannel's connectivity state.
pub trait ConnectivityStateWatcher: Send + Sync {
    fn on_connectivity_state_change(&self, state: ConnectivityState, status: Status);
}

/// The transport-level connection abstraction to one endpoint, implemented by
/// the surrounding framework.
pub trait Subchannel: Send + Sync {
    /// The address this subchannel connects to.
    fn address(&self) -> String;

    /// Registers a watcher for connectivity state changes.
    fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>);

    /// Cancels a watch previously registered with the same watcher value.
    fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityStateWatcher>);

    /// Upcast hook so the pick path can recognize its own wrappers.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// What a watcher has seen so far, and whether deliveries are being masked.
struct WatcherSeen {
    last_seen: Option<(ConnectivityState, Status)>,
    ejected: bool,
}

/// Registered with the underlying subchannel in place of the user watcher.
/// Remembers the last real state so it can be replayed on un-ejection.
pub(crate) struct WatcherWrapper {
    watcher: Arc<dyn ConnectivityStateWatcher>,
    seen: Mutex<WatcherSeen>,
}

impl WatcherWrapper {
    fn new(watcher: Arc<dyn ConnectivityStateWatcher>, ejected: bool) -> Self {
        Self { watcher, seen: Mutex::new(WatcherSeen { last_seen: None, ejected }) }
    }

    fn eject(&self) {
        let deliver = {
            let mut seen = self.seen.lock();
            seen.ejected = true;
            seen.last_seen.is_some()
        };
        if deliver {
            self.watcher.on_connectivity_state_change(
                ConnectivityState::TransientFailure,
                Status::unavailable(EJECTED_MESSAGE),
            );
        }
    }

    fn uneject(&self) {
        let last_seen = {
            let mut seen = self.seen.lock();
            seen.ejected = false;
            seen.last_seen.clone()
        };
        if let Some((state, status)) = last_seen {
            self.watcher.on_connectivity_state_change(state, status);
        }
    }
}

impl ConnectivityStateWatcher for WatcherWrapper {
    fn on_connectivity_state_change(&self, state: ConnectivityState, status: Status) {
        let (send_update, ejected) = {
            let mut seen = self.seen.lock();
            // The first observation is always delivered so a new watcher is
            // never left without a state; later ones only while un-ejected.
            let send_update = seen.last_seen.is_none() || !seen.ejected;
            seen.last_seen = Some((state, status.clone()));
            (send_update, seen.ejected)
        };
        if send_update {
            if ejected {
                self.watcher.on_connectivity_state_change(
                    ConnectivityState::TransientFailure,
                    Status::unavailable(EJECTED_MESSAGE),
                );
            } else {
                self.watcher.on_connectivity_state_change(state, status);
            }
        }
    }
}

struct WrapperInner {
    ejected: bool,
    /// Maps each user watcher to the wrapper actually registered downstream,
    /// keyed by watcher identity.
    watchers: Vec<(Arc<dyn ConnectivityStateWatcher>, Arc<WatcherWrapper>)>,
}

/// Decorates a transport subchannel with ejection masking.
pub struct SubchannelWrapper {
    endpoint_state: Option<Arc<EndpointState>>,
    wrapped: Arc<dyn Subchannel>,
    inner: Mutex<WrapperInner>,
}

impl SubchannelWrapper {
    /// Wraps `subchannel`, binding it to `endpoint_state` when one exists for
    /// the address. A wrapper created for an already-ejected endpoint starts
    /// out masked.
    pub(crate) fn new(
        endpoint_state: Option<Arc<EndpointState>>,
        subchannel: Arc<dyn Subchannel>,
    ) -> Arc<Self> {
        let ejected = endpoint_state.as_deref().is_some_and(EndpointState::is_ejected);
        let wrapper = Arc::new(Self {
            endpoint_state: endpoint_state.clone(),
            wrapped: subchannel,
            inner: Mutex::new(WrapperInner { ejected, watchers: Vec::new() }),
        });
        if let Some(state) = &endpoint_state {
            state.add_subchannel(&wrapper);
        }
        wrapper
    }

    pub(crate) fn endpoint_state(&self) -> Option<Arc<EndpointState>> {
        self.endpoint_state.clone()
    }

    /// The undecorated transport subchannel, for handing back up the stack.
    pub(crate) fn wrapped_subchannel(&self) -> Arc<dyn Subchannel> {
        self.wrapped.clone()
    }

    pub(crate) fn eject(&self) {
        debug!(address = %self.wrapped.address(), "masking subchannel as transient failure");
        let watchers = {
            let mut inner = self.inner.lock();
            inner.ejected = true;
            inner.watchers.iter().map(|(_, w)| w.clone()).collect::<Vec<_>>()
        };
        for watcher in watchers {
            watcher.eject();
        }
    }

    pub(crate) fn uneject(&self) {
        debug!(address = %self.wrapped.address(), "restoring real subchannel state");
        let watchers = {
            let mut inner = self.inner.lock();
            inner.ejected = false;
            inner.watchers.iter().map(|(_, w)| w.clone()).collect::<Vec<_>>()
        };
        for watcher in watchers {
            watcher.uneject();
        }
    }
}

impl Subchannel for SubchannelWrapper {
    fn address(&self) -> String {
        self.wrapped.address()
    }

    fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        let wrapped_watcher = {
            let mut inner = self.inner.lock();
            let wrapped_watcher = Arc::new(WatcherWrapper::new(watcher.clone(), inner.ejected));
            inner.watchers.push((watcher, wrapped_watcher.clone()));
            wrapped_watcher
        };
        self.wrapped.watch_connectivity_state(wrapped_watcher);
    }

    fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityStateWatcher>) {
        let wrapped_watcher = {
            let mut inner = self.inner.lock();
            let position = inner.watchers.iter().position(|(w, _)| Arc::ptr_eq(w, watcher));
            match position {
                Some(position) => inner.watchers.remove(position).1,
                None => return,
            }
        };
        let wrapped_watcher: Arc<dyn ConnectivityStateWatcher> = wrapped_watcher;
        self.wrapped.cancel_connectivity_state_watch(&wrapped_watcher);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for SubchannelWrapper {
    fn drop(&mut self) {
        if let Some(state) = &self.endpoint_state {
            state.remove_subchannel(self);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A transport subchannel fake: remembers registered watchers and lets a
    /// test push connectivity changes through them.
    pub(crate) struct FakeSubchannel {
        address: String,
        watchers: Mutex<Vec<Arc<dyn ConnectivityStateWatcher>>>,
    }

    impl FakeSubchannel {
        pub(crate) fn new(address: &str) -> Arc<Self> {
            Arc::new(Self { address: address.to_string(), watchers: Mutex::new(Vec::new()) })
        }

        pub(crate) fn push_state(&self, state: ConnectivityState, status: Status) {
            let watchers = self.watchers.lock().clone();
            for watcher in watchers {
                watcher.on_connectivity_state_change(state, status.clone());
            }
        }

        pub(crate) fn watcher_count(&self) -> usize {
            self.watchers.lock().len()
        }
    }

    impl Subchannel for FakeSubchannel {
        fn address(&self) -> String {
            self.address.clone()
        }

        fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
            self.watchers.lock().push(watcher);
        }

        fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityStateWatcher>) {
            self.watchers.lock().retain(|w| !Arc::ptr_eq(w, watcher));
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    /// Collects every update a watcher receives.
    #[derive(Default)]
    pub(crate) struct RecordingWatcher {
        updates: Mutex<Vec<(ConnectivityState, Status)>>,
    }

    impl RecordingWatcher {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn updates(&self) -> Vec<(ConnectivityState, Status)> {
            self.updates.lock().clone()
        }

        pub(crate) fn last(&self) -> Option<(ConnectivityState, Status)> {
            self.updates.lock().last().cloned()
        }
    }

    impl ConnectivityStateWatcher for RecordingWatcher {
        fn on_connectivity_state_change(&self, state: ConnectivityState, status: Status) {
            self.updates.lock().push((state, status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeSubchannel, RecordingWatcher};
    use super::*;
    use std::time::Instant;

    fn watcher_arc(watcher: &Arc<RecordingWatcher>) -> Arc<dyn ConnectivityStateWatcher> {
        watcher.clone()
    }

    #[test]
    fn forwards_real_state_while_healthy() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state), transport.clone());

        let watcher = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&watcher));
        transport.push_state(ConnectivityState::Connecting, Status::ok());
        transport.push_state(ConnectivityState::Ready, Status::ok());

        assert_eq!(
            watcher.updates(),
            vec![
                (ConnectivityState::Connecting, Status::ok()),
                (ConnectivityState::Ready, Status::ok()),
            ]
        );
    }

    #[test]
    fn ejection_masks_and_unejection_replays_last_real_state() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state.clone()), transport.clone());

        let watcher = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&watcher));
        transport.push_state(ConnectivityState::Ready, Status::ok());

        state.eject(Instant::now());
        assert_eq!(
            watcher.last(),
            Some((ConnectivityState::TransientFailure, Status::unavailable(EJECTED_MESSAGE)))
        );

        // Real changes while ejected are remembered but not delivered.
        transport.push_state(ConnectivityState::Connecting, Status::ok());
        assert_eq!(watcher.updates().len(), 2);

        state.uneject();
        assert_eq!(watcher.last(), Some((ConnectivityState::Connecting, Status::ok())));
    }

    #[test]
    fn first_observation_is_delivered_even_while_ejected() {
        let state = Arc::new(EndpointState::new());
        state.eject(Instant::now());

        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state), transport.clone());

        let watcher = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&watcher));
        // Nothing observed yet, so nothing to mask yet.
        assert!(watcher.updates().is_empty());

        transport.push_state(ConnectivityState::Ready, Status::ok());
        // Delivered, but forced to the masked state.
        assert_eq!(
            watcher.updates(),
            vec![(ConnectivityState::TransientFailure, Status::unavailable(EJECTED_MESSAGE))]
        );
    }

    #[test]
    fn eject_before_any_observation_delivers_nothing() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state.clone()), transport);

        let watcher = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&watcher));

        state.eject(Instant::now());
        state.uneject();
        assert!(watcher.updates().is_empty());
    }

    #[test]
    fn cancel_unregisters_from_the_underlying_subchannel() {
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(None, transport.clone());

        let watcher = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&watcher));
        assert_eq!(transport.watcher_count(), 1);

        wrapper.cancel_connectivity_state_watch(&watcher_arc(&watcher));
        assert_eq!(transport.watcher_count(), 0);

        transport.push_state(ConnectivityState::Ready, Status::ok());
        assert!(watcher.updates().is_empty());
    }

    #[test]
    fn wrapper_without_endpoint_state_still_forwards() {
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(None, transport.clone());

        let watcher = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&watcher));
        transport.push_state(ConnectivityState::Ready, Status::ok());
        assert_eq!(watcher.last(), Some((ConnectivityState::Ready, Status::ok())));
        assert!(wrapper.endpoint_state().is_none());
    }

    #[test]
    fn dropping_the_wrapper_detaches_it_from_the_endpoint() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state.clone()), transport);

        let watcher = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&watcher));
        drop(wrapper);

        // The ejection finds no live wrappers and must not panic or notify.
        state.eject(Instant::now());
        assert!(watcher.updates().is_empty());
    }

    #[test]
    fn multiple_watchers_all_observe_the_masking() {
        let state = Arc::new(EndpointState::new());
        let transport = FakeSubchannel::new("10.0.0.1:443");
        let wrapper = SubchannelWrapper::new(Some(state.clone()), transport.clone());

        let first = RecordingWatcher::new();
        let second = RecordingWatcher::new();
        wrapper.watch_connectivity_state(watcher_arc(&first));
        wrapper.watch_connectivity_state(watcher_arc(&second));
        transport.push_state(ConnectivityState::Ready, Status::ok());

        state.eject(Instant::now());
        for watcher in [&first, &second] {
            assert_eq!(
                watcher.last(),
                Some((ConnectivityState::TransientFailure, Status::unavailable(EJECTED_MESSAGE)))
            );
        }
    }
}
