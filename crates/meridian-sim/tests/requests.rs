//! Request registration tests: per-UID limits, intent replacement,
//! timeouts, sessions, permission checks, filter updates and network
//! offers.
//!
//! Run:
//! ```bash
//! cargo test -p meridian-sim --test requests -- --nocapture
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meridian_common::{
    ArbiterError, Capability, NetworkCapabilities, NetworkRequest, NetworkScore, RequestId,
    Transport,
};
use meridian_core::config::LimitConfig;
use meridian_core::{
    ArbiterConfig, Caller, NetworkProvider, OfferId, Permission, RequestOptions, SessionId,
};
use meridian_sim::callback::TestCallback;
use meridian_sim::harness::internet;
use meridian_sim::test_util::init_tracing;
use meridian_sim::{Harness, NetworkSpec};

const APP: u32 = 10_001;

// ─── Shared test harness ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProviderCall {
    Needed(OfferId, RequestId),
    Unneeded(OfferId, RequestId),
}

#[derive(Default)]
struct FakeProvider {
    calls: Mutex<Vec<ProviderCall>>,
}

impl FakeProvider {
    fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl NetworkProvider for FakeProvider {
    fn on_network_needed(&self, offer: OfferId, request: &NetworkRequest) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::Needed(offer, request.id));
        Ok(())
    }

    fn on_network_unneeded(&self, offer: OfferId, request: RequestId) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::Unneeded(offer, request));
        Ok(())
    }
}

fn limited(max: usize) -> Harness {
    let mut config = ArbiterConfig::default();
    config.limits = LimitConfig {
        max_requests_per_uid: max,
        ..LimitConfig::default()
    };
    Harness::with_config(config)
}

fn ethernet_only() -> NetworkCapabilities {
    internet().with_transport(Transport::Ethernet)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[test]
fn per_uid_limit_counts_every_app_request() {
    init_tracing();
    let mut h = limited(3);
    h.request(APP, internet());
    h.listen(APP, internet());
    h.default_callback(APP);
    assert_eq!(h.arbiter.request_count_for_uid(APP), 3);

    let cb = TestCallback::new();
    let err = h
        .arbiter
        .request_network(Caller::new(APP), internet(), cb.listener(), RequestOptions::default())
        .unwrap_err();
    assert_eq!(err, ArbiterError::TooManyRequests { uid: APP, limit: 3 });

    // Other apps have their own budget.
    h.request(APP + 1, internet());
    assert_eq!(h.arbiter.request_count_for_uid(APP + 1), 1);
}

#[test]
fn unregistering_frees_a_budget_slot() {
    init_tracing();
    let mut h = limited(1);
    let (id, _) = h.request(APP, internet());
    h.arbiter.unregister(id).unwrap();
    assert_eq!(h.arbiter.request_count_for_uid(APP), 0);
    h.request(APP, internet());
    assert_eq!(
        h.arbiter.unregister(id),
        Err(ArbiterError::UnknownRequest(id))
    );
}

#[test]
fn same_intent_replaces_the_earlier_request() {
    init_tracing();
    let mut h = limited(3);
    let cb = TestCallback::new();
    let mut last = None;
    for _ in 0..10 {
        let id = h
            .arbiter
            .request_network(
                Caller::new(APP),
                internet(),
                cb.listener(),
                RequestOptions::default().with_intent("sync"),
            )
            .unwrap();
        last = Some(id);
    }
    assert_eq!(h.arbiter.request_count_for_uid(APP), 1);
    let mut live = Vec::new();
    h.arbiter.for_each_request(|nri| {
        if nri.uid == APP {
            live.push(nri.id);
        }
    });
    assert_eq!(live, last.into_iter().collect::<Vec<_>>());
}

#[test]
fn timed_request_reports_unavailable_and_goes_away() {
    init_tracing();
    let mut h = Harness::new();
    h.connect_validated(NetworkSpec::wifi().with_score(60));
    let cb = TestCallback::new();
    let id = h
        .arbiter
        .request_network(
            Caller::new(APP),
            ethernet_only(),
            cb.listener(),
            RequestOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();

    h.advance(Duration::from_millis(99));
    cb.assert_no_callback();

    h.advance(Duration::from_millis(1));
    cb.expect_unavailable();
    cb.assert_no_callback();
    assert_eq!(h.arbiter.request_count_for_uid(APP), 0);
    assert_eq!(h.arbiter.unregister(id), Err(ArbiterError::UnknownRequest(id)));
}

#[test]
fn satisfied_timed_request_does_not_expire() {
    init_tracing();
    let mut h = Harness::new();
    let wifi = h.connect_validated(NetworkSpec::wifi().with_score(60));
    let cb = TestCallback::new();
    let id = h
        .arbiter
        .request_network(
            Caller::new(APP),
            internet(),
            cb.listener(),
            RequestOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    cb.expect_available(wifi.id);

    h.advance(Duration::from_secs(1));
    cb.assert_no_callback();
    assert_eq!(h.arbiter.satisfier(id), Some(wifi.id));
}

#[test]
fn releasing_a_session_drops_its_requests() {
    init_tracing();
    let mut h = Harness::new();
    let session = SessionId(7);
    let cb = TestCallback::new();
    for caps in [internet(), ethernet_only(), internet().with_capability(Capability::NotMetered)] {
        h.arbiter
            .request_network(
                Caller::new(APP).with_session(session),
                caps,
                cb.listener(),
                RequestOptions::default(),
            )
            .unwrap();
    }
    h.request(APP, internet());
    assert_eq!(h.arbiter.request_count_for_uid(APP), 4);

    assert_eq!(h.arbiter.release_session(session), 3);
    assert_eq!(h.arbiter.request_count_for_uid(APP), 1);
    assert_eq!(h.arbiter.release_session(session), 0);
}

#[test]
fn privileged_filters_need_permissions() {
    init_tracing();
    let mut h = Harness::new();
    let cb = TestCallback::new();
    let denied = |r: Result<RequestId, ArbiterError>| {
        assert!(
            matches!(r, Err(ArbiterError::PermissionDenied(_))),
            "expected permission denied, got {r:?}"
        )
    };

    let signal = internet().with_signal_strength(-70);
    denied(h.arbiter.listen_network(
        Caller::new(APP),
        signal.clone(),
        cb.listener(),
        RequestOptions::default(),
    ));
    h.policy.grant(APP, Permission::SignalStrengthWakeup);
    assert!(h
        .arbiter
        .listen_network(Caller::new(APP), signal, cb.listener(), RequestOptions::default())
        .is_ok());

    let ims = NetworkCapabilities::request_default().with_capability(Capability::Ims);
    denied(h.arbiter.request_network(
        Caller::new(APP),
        ims.clone(),
        cb.listener(),
        RequestOptions::default(),
    ));
    assert!(h
        .arbiter
        .listen_network(Caller::new(APP), ims, cb.listener(), RequestOptions::default())
        .is_ok());

    denied(h.arbiter.request_background_network(Caller::new(APP), internet(), cb.listener()));
    denied(
        h.arbiter
            .register_system_default_network_callback(Caller::new(APP), cb.listener()),
    );
    h.policy.grant(APP, Permission::NetworkSettings);
    assert!(h
        .arbiter
        .request_background_network(Caller::new(APP), internet(), cb.listener())
        .is_ok());
}

#[test]
fn requests_cannot_ask_for_arbiter_owned_capabilities() {
    init_tracing();
    let mut h = Harness::new();
    let cb = TestCallback::new();
    let r = h.arbiter.request_network(
        Caller::new(APP),
        internet().with_capability(Capability::Foreground),
        cb.listener(),
        RequestOptions::default(),
    );
    assert!(matches!(r, Err(ArbiterError::InvalidArgument(_))));
    assert_eq!(h.arbiter.request_count_for_uid(APP), 0);
}

#[test]
fn updating_a_filter_moves_the_request() {
    init_tracing();
    let mut h = Harness::new();
    let wifi = h.connect_validated(NetworkSpec::wifi().with_score(60));
    let cell = h.connect_validated(NetworkSpec::cellular().with_score(20));
    let (id, cb) = h.request(APP, internet());
    cb.expect_available(wifi.id);

    h.arbiter
        .update_request(id, internet().with_transport(Transport::Cellular))
        .unwrap();
    cb.expect_available(cell.id);
    cb.assert_no_callback();
    assert_eq!(h.arbiter.satisfier(id), Some(cell.id));

    let (tracker, _) = h.default_callback(APP);
    assert!(h.arbiter.update_request(tracker, internet()).is_err());
}

#[test]
fn offer_is_needed_until_a_better_network_serves_the_request() {
    init_tracing();
    let mut h = Harness::new();
    let provider = Arc::new(FakeProvider::default());
    let offer_caps = NetworkCapabilities::new()
        .with_transport(Transport::Cellular)
        .with_capability(Capability::Internet)
        .with_capability(Capability::NotRestricted)
        .with_capability(Capability::Trusted)
        .with_capability(Capability::NotVpn);
    let offer = h
        .arbiter
        .register_offer(
            Arc::clone(&provider) as _,
            NetworkScore::with_legacy_int(50),
            offer_caps,
        )
        .unwrap();
    let default_request = h.arbiter.default_request_id();
    assert_eq!(
        provider.calls(),
        vec![ProviderCall::Needed(offer, default_request)]
    );

    let (app, _) = h.request(APP, internet());
    assert_eq!(
        provider.calls().last(),
        Some(&ProviderCall::Needed(offer, app))
    );

    h.connect_validated(NetworkSpec::cellular().with_score(60));
    let calls = provider.calls();
    assert!(calls.contains(&ProviderCall::Unneeded(offer, default_request)));
    assert!(calls.contains(&ProviderCall::Unneeded(offer, app)));
    assert_eq!(h.arbiter.offer_count(), 1);

    h.arbiter.unregister_offer(offer).unwrap();
    assert_eq!(h.arbiter.offer_count(), 0);
    assert!(h.arbiter.unregister_offer(offer).is_err());
}

#[test]
fn unfulfillable_requests_are_dropped() {
    init_tracing();
    let mut h = Harness::new();
    let timed = TestCallback::new();
    let timed_id = h
        .arbiter
        .request_network(
            Caller::new(APP),
            ethernet_only(),
            timed.listener(),
            RequestOptions::default().with_timeout(Duration::from_secs(10)),
        )
        .unwrap();
    let (plain_id, plain) = h.request(APP, ethernet_only());

    h.arbiter.declare_unfulfillable(timed_id).unwrap();
    timed.expect_unavailable();
    h.arbiter.declare_unfulfillable(plain_id).unwrap();
    plain.assert_no_callback();
    assert_eq!(h.arbiter.request_count_for_uid(APP), 0);

    let default_request = h.arbiter.default_request_id();
    assert!(h.arbiter.declare_unfulfillable(default_request).is_err());
}
