//! VPN tests: capability derivation from underlying networks, UID range
//! routing rules and socket teardown when ranges shrink.
//!
//! Run:
//! ```bash
//! cargo test -p meridian-sim --test vpn -- --nocapture
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use meridian_common::{Capability, Transport, UidRange, UidRangeSet};
use meridian_sim::backend::BackendCall;
use meridian_sim::test_util::init_tracing;
use meridian_sim::{Harness, NetworkSpec, TestNetwork};

const OWNER: u32 = 10_200;
const COVERED: u32 = 10_010;
const OUTSIDE: u32 = 10_500;

// ─── Shared test harness ────────────────────────────────────────────

fn range(lo: u32, hi: u32) -> UidRangeSet {
    match UidRange::new(lo, hi) {
        Ok(r) => UidRangeSet::from(r),
        Err(e) => panic!("bad range {lo}-{hi}: {e}"),
    }
}

fn vpn_spec(lo: u32, hi: u32) -> NetworkSpec {
    NetworkSpec::vpn(range(lo, hi)).with_caps(|c| c.with_owner_uid(OWNER))
}

/// Registers a VPN, declares `underlying` before it connects, connects it.
fn connect_vpn(h: &mut Harness, spec: NetworkSpec, underlying: Option<Vec<&TestNetwork>>) -> TestNetwork {
    let vpn = h.register(spec);
    if let Some(nets) = underlying {
        h.arbiter
            .set_underlying_networks(vpn.id, Some(nets.iter().map(|n| n.id).collect()))
            .unwrap();
    }
    h.arbiter.mark_connected(vpn.id).unwrap();
    vpn
}

fn uid_calls(calls: Vec<BackendCall>) -> Vec<BackendCall> {
    calls
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                BackendCall::AddUidRanges { .. }
                    | BackendCall::RemoveUidRanges { .. }
                    | BackendCall::DestroySockets { .. }
            )
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[test]
fn vpn_without_underlying_networks_is_metered_until_one_is_declared() {
    init_tracing();
    let mut h = Harness::new();
    let wifi = h.connect_validated(NetworkSpec::wifi().with_score(60));
    let (_, default) = h.default_callback(COVERED);
    default.expect_available(wifi.id);

    let vpn = connect_vpn(&mut h, vpn_spec(10_000, 10_099), Some(Vec::new()));
    let caps = default.expect_available(vpn.id);
    assert!(caps.is_metered());
    assert!(caps.has_transport(Transport::Vpn));
    default.assert_no_callback();

    h.arbiter
        .set_underlying_networks(vpn.id, Some(vec![wifi.id]))
        .unwrap();
    let caps = default.expect_caps(vpn.id);
    assert!(!caps.is_metered());
    assert!(caps.has_transport(Transport::Wifi));
    default.assert_no_callback();

    h.arbiter
        .set_underlying_networks(vpn.id, Some(vec![wifi.id]))
        .unwrap();
    default.assert_no_callback();
}

#[test]
fn vpn_follows_the_system_default_when_nothing_is_declared() {
    init_tracing();
    let mut h = Harness::new();
    let wifi = h.connect_validated(NetworkSpec::wifi().with_score(60));
    let cell = h.connect_validated(NetworkSpec::cellular().with_score(20));
    let vpn = connect_vpn(&mut h, vpn_spec(10_000, 10_099), None);

    let caps = h.arbiter.network_capabilities(vpn.id).unwrap();
    assert!(!caps.is_metered());
    assert_eq!(caps.underlying_networks(), Some(&[wifi.id][..]));

    h.disconnect(&wifi);
    assert_eq!(h.arbiter.system_default_network(), Some(cell.id));
    let caps = h.arbiter.network_capabilities(vpn.id).unwrap();
    assert!(caps.is_metered());
    assert!(caps.has_transport(Transport::Cellular));
    assert!(!caps.has_transport(Transport::Wifi));
    assert_eq!(caps.underlying_networks(), Some(&[cell.id][..]));
}

#[test]
fn vpn_applies_only_to_its_uids() {
    init_tracing();
    let mut h = Harness::new();
    let wifi = h.connect_validated(NetworkSpec::wifi().with_score(60));
    let vpn = connect_vpn(&mut h, vpn_spec(10_000, 10_099), None);

    assert_eq!(h.arbiter.active_network_for_uid(COVERED), Some(vpn.id));
    assert_eq!(h.arbiter.active_network_for_uid(OUTSIDE), Some(wifi.id));
    assert_eq!(h.arbiter.system_default_network(), Some(wifi.id));
    assert!(h.backend.calls().contains(&BackendCall::AddUidRanges {
        net: vpn.id,
        ranges: range(10_000, 10_099),
        priority: 0,
    }));

    let (_, outside) = h.default_callback(OUTSIDE);
    outside.expect_available(wifi.id);
    outside.assert_no_callback();
}

#[test]
fn changing_vpn_uids_adds_then_removes_then_kills_sockets() {
    init_tracing();
    let mut h = Harness::new();
    h.connect_validated(NetworkSpec::wifi().with_score(60));
    let mut vpn = connect_vpn(&mut h, vpn_spec(10_000, 10_099), None);
    h.backend.clear();

    vpn.caps = vpn.caps.clone().with_uids(Some(range(10_050, 10_149)));
    h.arbiter
        .update_capabilities(vpn.id, vpn.caps.clone())
        .unwrap();

    assert_eq!(
        uid_calls(h.backend.take()),
        vec![
            BackendCall::AddUidRanges {
                net: vpn.id,
                ranges: range(10_100, 10_149),
                priority: 0,
            },
            BackendCall::RemoveUidRanges {
                net: vpn.id,
                ranges: range(10_000, 10_049),
                priority: 0,
            },
            BackendCall::DestroySockets {
                ranges: range(10_000, 10_049),
                exempt: BTreeSet::from([OWNER]),
            },
        ]
    );
}

#[test]
fn disconnect_removes_vpn_rules_before_destroying_the_network() {
    init_tracing();
    let mut h = Harness::new();
    h.connect_validated(NetworkSpec::wifi().with_score(60));
    let vpn = connect_vpn(&mut h, vpn_spec(10_000, 10_099), None);
    h.backend.clear();

    h.disconnect(&vpn);
    let calls = h.backend.take();
    let removed = calls.iter().position(|c| {
        matches!(c, BackendCall::RemoveUidRanges { net, priority: 0, .. } if *net == vpn.id)
    });
    let destroyed = calls
        .iter()
        .position(|c| *c == BackendCall::NetworkDestroy(vpn.id));
    assert!(removed.is_some() && removed < destroyed, "{calls:?}");
    assert!(
        !calls
            .iter()
            .any(|c| matches!(c, BackendCall::DestroySockets { .. })),
        "sockets of a vpn that went away are not killed"
    );
}

#[test]
fn vpn_is_never_reaped_for_lack_of_requests() {
    init_tracing();
    let mut h = Harness::new();
    let vpn = connect_vpn(&mut h, vpn_spec(10_000, 10_099), Some(Vec::new()));
    h.advance_by_steps(Duration::from_secs(30), Duration::from_secs(1));
    assert!(!vpn.agent.was_unwanted());
    assert!(
        h.arbiter
            .network_capabilities(vpn.id)
            .is_some_and(|c| !c.has_capability(Capability::NotVpn))
    );
}

#[test]
fn vpn_agents_must_declare_a_type() {
    init_tracing();
    let mut h = Harness::new();
    let spec = vpn_spec(10_000, 10_099).with_agent_config(|c| c.vpn_type = None);
    let err = h.arbiter.register_network_agent(
        std::sync::Arc::new(meridian_sim::agent::ScriptedAgent::new()),
        spec.config,
        spec.caps,
        spec.link_properties,
        spec.score,
    );
    assert!(err.is_err());

    let wifi = h.connect(NetworkSpec::wifi());
    assert!(h.arbiter.set_underlying_networks(wifi.id, None).is_err());
}
