//! Ranking and rematch cost benchmarks for meridian-core.
//!
//! Measures:
//! - NetworkRanker::best() over 2, 8 and 32 candidates
//! - A full rematch pass triggered by a score change, with 8 networks and
//!   64 app requests
//!
//! Run with: cargo bench --package meridian-core

use std::collections::BTreeSet;
use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use quanta::Clock;

use meridian_common::link::RouteInfo;
use meridian_common::{
    Capability, LinkProperties, NetId, NetworkCapabilities, NetworkScore, Transport, TransportSet,
    UidRangeSet, UserId,
};
use meridian_core::network::{Candidate, FullScore, NetworkRanker, ScoreFacts};
use meridian_core::{
    AgentConfig, AllowlistConfig, Arbiter, ArbiterConfig, CallbackEvent, Caller, Dependencies,
    NetworkAgent, NetworkConfigBackend, NetworkCreateConfig, NetworkListener, NetworkPermission,
    Permission, PolicyQuery, RequestOptions,
};

struct NullBackend;

impl NetworkConfigBackend for NullBackend {
    fn network_create(&self, _: &NetworkCreateConfig) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_destroy(&self, _: NetId) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_set_permission(&self, _: NetId, _: NetworkPermission) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_add_interface(&self, _: NetId, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_remove_interface(&self, _: NetId, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_add_route(&self, _: NetId, _: &RouteInfo) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_remove_route(&self, _: NetId, _: &RouteInfo) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_update_route(&self, _: NetId, _: &RouteInfo) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_add_uid_ranges(&self, _: NetId, _: &UidRangeSet, _: u32) -> anyhow::Result<()> {
        Ok(())
    }
    fn network_remove_uid_ranges(&self, _: NetId, _: &UidRangeSet, _: u32) -> anyhow::Result<()> {
        Ok(())
    }
    fn set_default_network(&self, _: Option<NetId>) -> anyhow::Result<()> {
        Ok(())
    }
    fn set_network_allowlist(&self, _: &[AllowlistConfig]) -> anyhow::Result<()> {
        Ok(())
    }
    fn set_reject_non_secure_vpn(&self, _: bool, _: &UidRangeSet) -> anyhow::Result<()> {
        Ok(())
    }
    fn destroy_live_tcp_sockets(&self, _: &UidRangeSet, _: &BTreeSet<u32>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct OpenPolicy;

impl PolicyQuery for OpenPolicy {
    fn has_permission(&self, _: u32, _: Permission) -> bool {
        true
    }
    fn uids_for_package(&self, _: &str) -> Vec<u32> {
        Vec::new()
    }
    fn users(&self) -> Vec<UserId> {
        vec![0]
    }
}

struct IdleAgent;

impl NetworkAgent for IdleAgent {
    fn on_network_unwanted(&self, _: NetId) {}
}

struct Sink;

impl NetworkListener for Sink {
    fn on_event(&self, event: CallbackEvent) {
        black_box(event);
    }
}

fn candidate(i: u32) -> Candidate {
    let transport = if i % 2 == 0 {
        Transport::Wifi
    } else {
        Transport::Cellular
    };
    let caps = NetworkCapabilities::new()
        .with_transport(transport)
        .with_capability(Capability::Internet);
    let facts = ScoreFacts {
        validated: i % 3 != 0,
        ever_validated: true,
        ..ScoreFacts::default()
    };
    let score = NetworkScore::with_legacy_int(50 + (i as i32 % 7));
    Candidate {
        id: NetId(100 + i),
        serial: i as u64,
        score: FullScore::compute(&score, &caps, &facts, true),
        transports: TransportSet::of(&[transport]),
    }
}

fn bench_ranker(c: &mut Criterion) {
    let mut group = c.benchmark_group("ranker_best");
    let ranker = NetworkRanker::new(false);
    for n in [2u32, 8, 32] {
        let pool: Vec<Candidate> = (0..n).map(candidate).collect();
        group.bench_function(format!("{n}_candidates"), |b| {
            b.iter(|| black_box(ranker.best(black_box(&pool), Some(NetId(101)))));
        });
    }
    group.finish();
}

fn network_caps(transport: Transport) -> NetworkCapabilities {
    NetworkCapabilities::new()
        .with_transport(transport)
        .with_capability(Capability::Internet)
        .with_capability(Capability::NotRestricted)
        .with_capability(Capability::Trusted)
        .with_capability(Capability::NotVpn)
        .with_capability(Capability::NotSuspended)
}

fn bench_rematch(c: &mut Criterion) {
    let deps = Dependencies {
        backend: Arc::new(NullBackend),
        policy: Arc::new(OpenPolicy),
    };
    let mut arbiter = Arbiter::new(ArbiterConfig::default(), deps, Clock::new());
    let mut nets = Vec::new();
    for i in 0..8 {
        let transport = if i % 2 == 0 {
            Transport::Wifi
        } else {
            Transport::Cellular
        };
        let net = arbiter
            .register_network_agent(
                Arc::new(IdleAgent),
                AgentConfig::default(),
                network_caps(transport),
                LinkProperties::with_interface(format!("if{i}")),
                NetworkScore::with_legacy_int(40 + i),
            )
            .unwrap();
        arbiter.mark_connected(net).unwrap();
        nets.push(net);
    }
    let sink: Arc<dyn NetworkListener> = Arc::new(Sink);
    for i in 0..64u32 {
        let caps = NetworkCapabilities::request_default().with_capability(Capability::Internet);
        arbiter
            .request_network(
                Caller::new(10_000 + i),
                caps,
                Arc::clone(&sink),
                RequestOptions::default(),
            )
            .unwrap();
    }

    let target = nets[0];
    let mut flip = false;
    c.bench_function("rematch_on_score_change_8nets_64reqs", |b| {
        b.iter(|| {
            flip = !flip;
            let legacy = if flip { 90 } else { 10 };
            arbiter
                .update_score(target, NetworkScore::with_legacy_int(legacy))
                .unwrap();
        });
    });
}

criterion_group!(benches, bench_ranker, bench_rematch);
criterion_main!(benches);
