//! Seeded churn: random sequences of connects, validations, score changes,
//! disconnects, requests and clock advances, replayed against a
//! [`Harness`] while checking the arbiter's observable invariants after
//! every step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use meridian_common::{Capability, NetId, NetworkScore, RequestId, Transport};
use meridian_core::{
    CallbackEvent, Caller, NetworkEvent, NetworkState, RequestOptions, ValidationResult,
};
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::callback::TestCallback;
use crate::harness::{Harness, NetworkSpec, internet};

/// Bounds of a generated churn sequence.
#[derive(Debug, Clone)]
pub struct ChurnConfig {
    pub seed: u64,
    pub steps: usize,
    pub max_networks: usize,
    pub max_requests: usize,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            steps: 200,
            max_networks: 4,
            max_requests: 8,
        }
    }
}

/// One churn step. `slot` indexes the live networks or requests modulo
/// their count at the time the step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnOp {
    Connect { transport: Transport, legacy: i32 },
    Validate { slot: usize },
    Invalidate { slot: usize },
    Rescore { slot: usize, legacy: i32 },
    Disconnect { slot: usize },
    Request { uid: u32 },
    Release { slot: usize },
    Advance { ms: u64 },
}

/// Deterministic churn generator.
#[derive(Debug)]
pub struct Churn {
    cfg: ChurnConfig,
    rng: StdRng,
}

impl Churn {
    pub fn new(cfg: ChurnConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self { cfg, rng }
    }

    pub fn ops(&mut self) -> Vec<ChurnOp> {
        let mut ops = Vec::with_capacity(self.cfg.steps);
        let mut networks = 0usize;
        let mut requests = 0usize;
        for _ in 0..self.cfg.steps {
            let roll = self.rng.random_range(0..100u32);
            let op = match roll {
                0..=14 if networks < self.cfg.max_networks => {
                    networks += 1;
                    let transport = if self.rng.random::<bool>() {
                        Transport::Wifi
                    } else {
                        Transport::Cellular
                    };
                    ChurnOp::Connect {
                        transport,
                        legacy: self.rng.random_range(10..=90),
                    }
                }
                15..=34 => ChurnOp::Validate {
                    slot: self.rng.random_range(0..8),
                },
                35..=42 => ChurnOp::Invalidate {
                    slot: self.rng.random_range(0..8),
                },
                43..=54 => ChurnOp::Rescore {
                    slot: self.rng.random_range(0..8),
                    legacy: self.rng.random_range(10..=90),
                },
                55..=62 => {
                    networks = networks.saturating_sub(1);
                    ChurnOp::Disconnect {
                        slot: self.rng.random_range(0..8),
                    }
                }
                63..=72 if requests < self.cfg.max_requests => {
                    requests += 1;
                    ChurnOp::Request {
                        uid: 10_000 + self.rng.random_range(0..4),
                    }
                }
                73..=79 => {
                    requests = requests.saturating_sub(1);
                    ChurnOp::Release {
                        slot: self.rng.random_range(0..8),
                    }
                }
                _ => ChurnOp::Advance {
                    ms: self.rng.random_range(100..=8_000),
                },
            };
            ops.push(op);
        }
        ops
    }
}

/// Outcome of a churn run.
#[derive(Debug, Default)]
pub struct ChurnReport {
    pub steps: usize,
    pub connects: usize,
    pub callbacks: usize,
    pub violations: Vec<String>,
}

impl ChurnReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

struct LiveNetwork {
    id: NetId,
    legacy: i32,
}

/// Callback bookkeeping used to check delivery order.
#[derive(Default)]
struct Observed {
    /// Current network of each keep-alive request.
    current: BTreeMap<RequestId, NetId>,
    /// Networks the catch-all listen has seen and not lost.
    listened: BTreeSet<NetId>,
}

/// Replays `ops` against `h` and collects every invariant violation.
pub fn run(h: &mut Harness, ops: &[ChurnOp]) -> ChurnReport {
    let mut report = ChurnReport::default();
    let linger_ms = h.arbiter.config().timers.linger_delay.as_millis() as u64;
    let mut nets: Vec<LiveNetwork> = Vec::new();
    let mut requests: Vec<RequestId> = Vec::new();
    let mut observed = Observed::default();

    let watch = TestCallback::new();
    let listen = h.arbiter.listen_network(
        Caller::new(1000),
        internet(),
        watch.listener(),
        RequestOptions::default(),
    );
    let listen = match listen {
        Ok(id) => id,
        Err(e) => {
            report.violations.push(format!("catch-all listen rejected: {e}"));
            return report;
        }
    };
    let apps = TestCallback::new();

    for (step, op) in ops.iter().enumerate() {
        nets.retain(|n| h.arbiter.network_state(n.id) == Some(NetworkState::Connected));
        requests.retain(|r| is_registered(h, *r));
        debug!(step, ?op, "churn step");
        apply(h, *op, &mut nets, &mut requests, &apps, &mut report);
        report.steps += 1;

        let events: Vec<CallbackEvent> = watch.drain().into_iter().chain(apps.drain()).collect();
        report.callbacks += events.len();
        for ev in &events {
            check_event(ev, listen, linger_ms, &mut observed, step, &mut report);
        }
        check_state(h, &nets, step, &mut report);
    }
    info!(
        steps = report.steps,
        connects = report.connects,
        callbacks = report.callbacks,
        violations = report.violations.len(),
        "churn finished"
    );
    report
}

fn is_registered(h: &Harness, id: RequestId) -> bool {
    let mut found = false;
    h.arbiter.for_each_request(|nri| found |= nri.id == id);
    found
}

fn pick<T>(items: &[T], slot: usize) -> Option<&T> {
    if items.is_empty() {
        None
    } else {
        items.get(slot % items.len())
    }
}

fn apply(
    h: &mut Harness,
    op: ChurnOp,
    nets: &mut Vec<LiveNetwork>,
    requests: &mut Vec<RequestId>,
    apps: &Arc<TestCallback>,
    report: &mut ChurnReport,
) {
    let result = match op {
        ChurnOp::Connect { transport, legacy } => {
            let spec = match transport {
                Transport::Wifi => NetworkSpec::wifi(),
                _ => NetworkSpec::cellular(),
            }
            .with_score(legacy);
            let agent = Arc::new(crate::agent::ScriptedAgent::new());
            let registered = h.arbiter.register_network_agent(
                agent as _,
                spec.config,
                spec.caps,
                spec.link_properties,
                spec.score,
            );
            registered.and_then(|id| {
                h.arbiter.mark_connected(id)?;
                nets.push(LiveNetwork { id, legacy });
                report.connects += 1;
                Ok(())
            })
        }
        ChurnOp::Validate { slot } => match pick(nets, slot) {
            Some(n) => h.arbiter.report_validation(n.id, ValidationResult::valid()),
            None => Ok(()),
        },
        ChurnOp::Invalidate { slot } => match pick(nets, slot) {
            Some(n) => h.arbiter.report_validation(n.id, ValidationResult::invalid()),
            None => Ok(()),
        },
        ChurnOp::Rescore { slot, legacy } if !nets.is_empty() => {
            let i = slot % nets.len();
            nets[i].legacy = legacy;
            h.arbiter
                .update_score(nets[i].id, NetworkScore::with_legacy_int(legacy))
        }
        ChurnOp::Rescore { .. } => Ok(()),
        ChurnOp::Disconnect { slot } => match pick(nets, slot) {
            Some(n) => h.arbiter.agent_disconnected(n.id),
            None => Ok(()),
        },
        ChurnOp::Request { uid } => h
            .arbiter
            .request_network(
                Caller::new(uid),
                internet(),
                apps.listener(),
                RequestOptions::default(),
            )
            .map(|id| requests.push(id)),
        ChurnOp::Release { slot } => match pick(requests, slot).copied() {
            Some(id) => {
                requests.retain(|r| *r != id);
                h.arbiter.unregister(id)
            }
            None => Ok(()),
        },
        ChurnOp::Advance { ms } => {
            h.advance(Duration::from_millis(ms));
            Ok(())
        }
    };
    if let Err(e) = result {
        report.violations.push(format!("{op:?} failed: {e}"));
    }
}

fn check_event(
    ev: &CallbackEvent,
    listen: RequestId,
    linger_ms: u64,
    observed: &mut Observed,
    step: usize,
    report: &mut ChurnReport,
) {
    let Some(net) = ev.network else {
        report
            .violations
            .push(format!("step {step}: {ev} without a network"));
        return;
    };
    let is_listen = ev.request_id == listen;
    match &ev.event {
        NetworkEvent::Losing { max_ms_to_live } => {
            if *max_ms_to_live > linger_ms {
                report.violations.push(format!(
                    "step {step}: LOSING {net} with {max_ms_to_live} ms, linger is {linger_ms} ms"
                ));
            }
        }
        NetworkEvent::Available if is_listen => {
            if !observed.listened.insert(net) {
                report
                    .violations
                    .push(format!("step {step}: listen saw AVAILABLE {net} twice"));
            }
        }
        NetworkEvent::Available => {
            if observed.current.insert(ev.request_id, net) == Some(net) {
                report.violations.push(format!(
                    "step {step}: {} got AVAILABLE for its current network {net}",
                    ev.request_id
                ));
            }
        }
        NetworkEvent::Lost if is_listen => {
            if !observed.listened.remove(&net) {
                report
                    .violations
                    .push(format!("step {step}: listen lost unseen {net}"));
            }
        }
        NetworkEvent::Lost => {
            if observed.current.remove(&ev.request_id) != Some(net) {
                report.violations.push(format!(
                    "step {step}: {} lost {net} which was not its network",
                    ev.request_id
                ));
            }
        }
        _ => {}
    }
}

fn check_state(h: &Harness, nets: &[LiveNetwork], step: usize, report: &mut ChurnReport) {
    h.arbiter.for_each_request(|nri| {
        if let Some(sat) = nri.satisfier {
            if h.arbiter.network_state(sat) != Some(NetworkState::Connected) {
                report.violations.push(format!(
                    "step {step}: {} satisfied by {sat} which is not connected",
                    nri.id
                ));
            }
        }
    });

    let validated: Vec<&LiveNetwork> = nets
        .iter()
        .filter(|n| h.arbiter.network_state(n.id) == Some(NetworkState::Connected))
        .filter(|n| {
            h.arbiter
                .network_capabilities(n.id)
                .is_some_and(|c| c.has_capability(Capability::Validated))
        })
        .collect();
    let Some(best) = validated.iter().map(|n| n.legacy).max() else {
        return;
    };
    let default = h.arbiter.system_default_network();
    match default.and_then(|d| validated.iter().find(|n| n.id == d)) {
        Some(n) if n.legacy == best => {}
        Some(n) => report.violations.push(format!(
            "step {step}: default {} scores {} but a validated network scores {best}",
            n.id, n.legacy
        )),
        None => report.violations.push(format!(
            "step {step}: default {default:?} is not validated while one is"
        )),
    }
}
