//! Expect-style recorder for request callbacks.
//!
//! The arbiter delivers callbacks synchronously when driven directly, and
//! from its worker thread when hosted in an [`ArbiterRuntime`]. Both paths
//! land in the same channel, so the `expect_*` helpers work for either;
//! they wait up to [`TestCallback::timeout`] for the next event.
//!
//! [`ArbiterRuntime`]: meridian_core::ArbiterRuntime

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use meridian_common::{LinkProperties, NetId, NetworkCapabilities};
use meridian_core::{BlockedReasons, CallbackEvent, NetworkEvent, NetworkListener};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

pub struct TestCallback {
    tx: Sender<CallbackEvent>,
    rx: Receiver<CallbackEvent>,
    timeout: Duration,
}

impl Default for TestCallback {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl NetworkListener for TestCallback {
    fn on_event(&self, event: CallbackEvent) {
        let _ = self.tx.send(event);
    }
}

impl TestCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Callback waiting up to `timeout` in each `expect_*` call.
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            ..Self::default()
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// This callback as the listener type the arbiter takes.
    pub fn listener(self: &Arc<Self>) -> Arc<dyn NetworkListener> {
        Arc::clone(self) as Arc<dyn NetworkListener>
    }

    /// Next event if one is already queued.
    pub fn poll(&self) -> Option<CallbackEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<CallbackEvent> {
        self.rx.try_iter().collect()
    }

    #[track_caller]
    pub fn next(&self) -> CallbackEvent {
        match self.rx.recv_timeout(self.timeout) {
            Ok(ev) => ev,
            Err(_) => panic!("no callback within {:?}", self.timeout),
        }
    }

    /// Next event, which must be `name` (see [`NetworkEvent::name`]) on `net`.
    #[track_caller]
    pub fn expect(&self, net: Option<NetId>, name: &str) -> CallbackEvent {
        let ev = self.next();
        assert_eq!(
            (ev.event.name(), ev.network),
            (name, net),
            "unexpected callback {ev}"
        );
        ev
    }

    /// AVAILABLE followed by the state burst: capabilities, link
    /// properties, blocked status. Returns the capabilities.
    #[track_caller]
    pub fn expect_available(&self, net: NetId) -> NetworkCapabilities {
        self.expect(Some(net), "AVAILABLE");
        let caps = self.expect_caps(net);
        self.expect_link_properties(net);
        self.expect_blocked(net);
        caps
    }

    /// Like [`expect_available`](Self::expect_available) for a network
    /// that is suspended when first seen.
    #[track_caller]
    pub fn expect_available_suspended(&self, net: NetId) -> NetworkCapabilities {
        self.expect(Some(net), "AVAILABLE");
        self.expect(Some(net), "SUSPENDED");
        let caps = self.expect_caps(net);
        self.expect_link_properties(net);
        self.expect_blocked(net);
        caps
    }

    #[track_caller]
    pub fn expect_caps(&self, net: NetId) -> NetworkCapabilities {
        match self.expect(Some(net), "CAPS_CHANGED").event {
            NetworkEvent::CapabilitiesChanged(caps) => caps,
            _ => unreachable!(),
        }
    }

    #[track_caller]
    pub fn expect_caps_that(
        &self,
        net: NetId,
        pred: impl Fn(&NetworkCapabilities) -> bool,
    ) -> NetworkCapabilities {
        let caps = self.expect_caps(net);
        assert!(pred(&caps), "capabilities of {net} do not match: {caps:?}");
        caps
    }

    #[track_caller]
    pub fn expect_link_properties(&self, net: NetId) -> LinkProperties {
        match self.expect(Some(net), "LINK_PROPERTIES_CHANGED").event {
            NetworkEvent::LinkPropertiesChanged(lp) => lp,
            _ => unreachable!(),
        }
    }

    #[track_caller]
    pub fn expect_blocked(&self, net: NetId) -> BlockedReasons {
        match self.expect(Some(net), "BLOCKED_STATUS").event {
            NetworkEvent::BlockedStatusChanged(reasons) => reasons,
            _ => unreachable!(),
        }
    }

    /// Returns `max_ms_to_live`.
    #[track_caller]
    pub fn expect_losing(&self, net: NetId) -> u64 {
        match self.expect(Some(net), "LOSING").event {
            NetworkEvent::Losing { max_ms_to_live } => max_ms_to_live,
            _ => unreachable!(),
        }
    }

    #[track_caller]
    pub fn expect_lost(&self, net: NetId) {
        self.expect(Some(net), "LOST");
    }

    #[track_caller]
    pub fn expect_unavailable(&self) {
        self.expect(None, "UNAVAILABLE");
    }

    /// Fails if any event is already queued.
    #[track_caller]
    pub fn assert_no_callback(&self) {
        if let Some(ev) = self.poll() {
            panic!("unexpected callback {ev}");
        }
    }

    /// Like [`assert_no_callback`](Self::assert_no_callback), but waits
    /// `within` for a late delivery from another thread.
    #[track_caller]
    pub fn assert_no_callback_within(&self, within: Duration) {
        if let Ok(ev) = self.rx.recv_timeout(within) {
            panic!("unexpected callback {ev}");
        }
    }
}
