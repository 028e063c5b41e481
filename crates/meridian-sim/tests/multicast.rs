//! Multicast routing tests driven through an arbiter hosting the
//! coordinator: virtual interface allocation, upcall handling, idle
//! sweeps on the arbiter's clock and group memberships.
//!
//! Run:
//! ```bash
//! cargo test -p meridian-sim --test multicast -- --nocapture
//! ```

use std::collections::BTreeSet;
use std::net::Ipv6Addr;
use std::time::Duration;

use meridian_mroute::{CoordinatorConfig, MfcRoute, MfcUsage, MulticastError, MulticastRoutingConfig};
use meridian_sim::Harness;
use meridian_sim::kernel::{KernelCall, RecordingKernel, nocache_upcall};
use meridian_sim::test_util::init_tracing;

const SWEEP: Duration = Duration::from_secs(60);

// ─── Shared test harness ────────────────────────────────────────────

fn addr(s: &str) -> Ipv6Addr {
    match s.parse() {
        Ok(a) => a,
        Err(e) => panic!("bad address {s}: {e}"),
    }
}

/// Harness hosting a coordinator over `eth0` (ifindex 2) and `wlan0`
/// (ifindex 3). Returns a handle sharing the kernel's call log.
fn hosted() -> (Harness, RecordingKernel) {
    let kernel = RecordingKernel::new()
        .with_interface("eth0", 2)
        .with_interface("wlan0", 3);
    let mut h = Harness::new();
    h.attach_multicast(kernel.clone(), CoordinatorConfig::default());
    (h, kernel)
}

fn apply(h: &mut Harness, from: &str, to: &str, config: MulticastRoutingConfig) -> Result<(), MulticastError> {
    match h.arbiter.multicast_mut() {
        Some(m) => m.apply_config(from, to, config),
        None => panic!("no multicast coordinator attached"),
    }
}

fn mfc_count(h: &Harness) -> usize {
    h.arbiter.multicast().map_or(0, |m| m.mfc_count())
}

fn del_mfcs(kernel: &RecordingKernel) -> usize {
    kernel.count(|c| matches!(c, KernelCall::DelMfc { .. }))
}

// ─── Tests ──────────────────────────────────────────────────────────

#[test]
fn forwarding_flow_is_installed_and_swept_after_five_idle_minutes() {
    init_tracing();
    let (mut h, kernel) = hosted();
    apply(&mut h, "eth0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap()).unwrap();
    assert_eq!(
        kernel.calls(),
        vec![
            KernelCall::AddMif { mif: 0, ifindex: 2 },
            KernelCall::AddMif { mif: 1, ifindex: 3 },
        ]
    );

    let (src, grp) = (addr("2001:db8::1"), addr("ff05::1234"));
    h.arbiter.handle_multicast_upcall(&nocache_upcall(0, src, grp));
    assert_eq!(
        kernel.calls().last(),
        Some(&KernelCall::AddMfc(MfcRoute {
            source: src,
            group: grp,
            iif: 0,
            oifs: BTreeSet::from([1]),
        }))
    );
    assert_eq!(h.arbiter.next_deadline(), Some(h.now() + SWEEP));

    for minute in 1..=5 {
        h.advance(SWEEP);
        assert_eq!(del_mfcs(&kernel), 0, "evicted early at minute {minute}");
    }
    h.advance(SWEEP);
    assert_eq!(del_mfcs(&kernel), 1);
    assert_eq!(mfc_count(&h), 0);
    assert_eq!(h.arbiter.next_deadline(), None);
}

#[test]
fn kernel_reported_traffic_keeps_an_entry_alive() {
    init_tracing();
    let (mut h, kernel) = hosted();
    apply(&mut h, "eth0", "wlan0", MulticastRoutingConfig::min_scope(4).unwrap()).unwrap();
    let (src, grp) = (addr("2001:db8::7"), addr("ff0e::1"));
    h.arbiter.handle_multicast_upcall(&nocache_upcall(0, src, grp));
    kernel.set_usage(vec![MfcUsage {
        source: src,
        group: grp,
        iif: 0,
        idle: Duration::from_secs(10),
    }]);

    h.advance_by_steps(Duration::from_secs(600), SWEEP);
    assert_eq!(del_mfcs(&kernel), 0);
    assert_eq!(mfc_count(&h), 1);

    kernel.set_usage(Vec::new());
    h.advance_by_steps(Duration::from_secs(360), SWEEP);
    assert_eq!(del_mfcs(&kernel), 1);
}

#[test]
fn flow_below_the_scope_threshold_gets_a_block_entry() {
    init_tracing();
    let (mut h, kernel) = hosted();
    apply(&mut h, "eth0", "wlan0", MulticastRoutingConfig::min_scope(5).unwrap()).unwrap();
    let (src, grp) = (addr("fe80::1"), addr("ff02::fb"));
    h.arbiter.handle_multicast_upcall(&nocache_upcall(0, src, grp));
    assert_eq!(
        kernel.calls().last(),
        Some(&KernelCall::AddMfc(MfcRoute {
            source: src,
            group: grp,
            iif: 0,
            oifs: BTreeSet::new(),
        }))
    );
    assert_eq!(mfc_count(&h), 1);
}

#[test]
fn upcalls_without_a_coordinator_or_for_unknown_mifs_are_ignored() {
    init_tracing();
    let mut bare = Harness::new();
    bare.arbiter
        .handle_multicast_upcall(&nocache_upcall(0, addr("2001:db8::1"), addr("ff05::1")));
    assert!(bare.arbiter.multicast().is_none());

    let (mut h, kernel) = hosted();
    h.arbiter
        .handle_multicast_upcall(&nocache_upcall(7, addr("2001:db8::1"), addr("ff05::1")));
    h.arbiter.handle_multicast_upcall(&[0u8; 12]);
    assert!(kernel.calls().is_empty());
}

#[test]
fn selected_groups_are_joined_and_left_with_the_config() {
    init_tracing();
    let (mut h, kernel) = hosted();
    let g = addr("ff05::1234");
    apply(&mut h, "eth0", "wlan0", MulticastRoutingConfig::selected([g]).unwrap()).unwrap();
    assert!(kernel.calls().contains(&KernelCall::JoinGroup { ifindex: 2, group: g }));

    apply(&mut h, "eth0", "wlan0", MulticastRoutingConfig::ForwardNone).unwrap();
    assert!(kernel.calls().contains(&KernelCall::LeaveGroup { ifindex: 2, group: g }));
    assert_eq!(kernel.count(|c| matches!(c, KernelCall::DelMif(_))), 2);
    let m = h.arbiter.multicast().unwrap();
    assert_eq!(m.virtual_index("eth0"), None);
    assert_eq!(m.virtual_index("wlan0"), None);
}

#[test]
fn unknown_interface_fails_without_leaking_virtual_interfaces() {
    init_tracing();
    let (mut h, kernel) = hosted();
    let err = apply(&mut h, "eth0", "usb0", MulticastRoutingConfig::min_scope(4).unwrap());
    assert!(matches!(err, Err(MulticastError::UnknownInterface(ref name)) if name == "usb0"));
    assert_eq!(kernel.count(|c| matches!(c, KernelCall::AddMif { .. })), 1);
    assert_eq!(kernel.count(|c| matches!(c, KernelCall::DelMif(_))), 1);
    assert_eq!(h.arbiter.multicast().and_then(|m| m.virtual_index("eth0")), None);
}
