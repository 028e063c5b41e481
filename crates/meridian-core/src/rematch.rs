//! # Rematch pass
//!
//! Recomputes which network serves every ranked request and applies the
//! result in one batch. The order of side effects is fixed:
//!
//! 1. Attach each request to its new network, detach it from the old one
//!    and linger the old network for it.
//! 2. Switch the system default.
//! 3. Update inactivity (linger and nascent) state and the FOREGROUND bit.
//! 4. `Available` for requests whose network changed, `Lost` for requests
//!    left with none.
//! 5. Per network: `Lost` to listens it no longer satisfies, capability
//!    updates for FOREGROUND flips, `Available` to newly satisfied listens.
//! 6. `Losing` for networks that started lingering.
//! 7. Tear down networks nothing needs any more.
//!
//! A request only sees `Available` again when its network changes. Moving
//! between layers served by the same network is silent.

use std::collections::BTreeSet;

use meridian_common::caps::SYSTEM_MANAGED;
use meridian_common::{Capability, KeepConnectedReason, NetId, NetworkCapabilities, RequestId, RequestType};
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::arbiter::Arbiter;
use crate::backend::NetworkPermission;
use crate::callback::NetworkEvent;
use crate::network::{Attachment, Candidate, FullScore, NetworkRanker, NetworkRecord};
use crate::registry::NetworkRequestInfo;
use crate::timer::TimerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnneededFor {
    Teardown,
    Linger,
}

/// A request whose (network, layer) pick changed.
#[derive(Debug, Clone, Copy)]
struct Reassignment {
    request: RequestId,
    old: Option<(NetId, RequestId)>,
    new: Option<(NetId, RequestId)>,
}

impl Reassignment {
    fn network_changed(&self) -> bool {
        self.old.map(|(n, _)| n) != self.new.map(|(n, _)| n)
    }
}

fn is_listen_ish(kind: RequestType) -> bool {
    matches!(kind, RequestType::Listen | RequestType::ListenForBest)
}

fn without_system_bits(caps: &NetworkCapabilities) -> NetworkCapabilities {
    let mut out = caps.clone();
    for c in SYSTEM_MANAGED.iter() {
        out.set_capability(c, false);
    }
    out
}

impl Arbiter {
    // ─── Ranking ────────────────────────────────────────────────────────

    fn candidates_for(&self, layer: &meridian_common::NetworkRequest) -> Vec<Candidate> {
        self.networks
            .values()
            .filter(|n| n.satisfies(layer))
            .filter_map(|n| self.candidate(n.id))
            .collect()
    }

    /// First layer with at least one satisfying network wins; within that
    /// layer the ranker picks, keeping the current network on ties.
    fn rank_request(
        &self,
        nri: &NetworkRequestInfo,
        ranker: &NetworkRanker,
    ) -> Option<(NetId, RequestId)> {
        for layer in &nri.layers {
            let candidates = self.candidates_for(layer);
            if candidates.is_empty() {
                continue;
            }
            return ranker
                .best(&candidates, nri.satisfier)
                .map(|net| (net, layer.id));
        }
        None
    }

    fn compute_reassignments(&self) -> Vec<Reassignment> {
        let ranker = self.ranker();
        let default_pick = self
            .registry
            .get(self.default_request)
            .and_then(|nri| self.rank_request(nri, &ranker))
            .map(|(net, _)| net);

        let mut out = Vec::new();
        for nri in self.registry.iter() {
            if nri.is_listen_only() {
                continue;
            }
            let new = match nri.layers.first() {
                Some(layer) if layer.kind == RequestType::TrackSystemDefault => default_pick
                    .filter(|net| self.networks.get(net).is_some_and(|n| n.satisfies(layer)))
                    .map(|net| (net, layer.id)),
                _ if nri.id == self.default_request => {
                    default_pick.zip(nri.layers.first().map(|l| l.id))
                }
                _ => self.rank_request(nri, &ranker),
            };
            let old = nri.satisfier.zip(nri.active_layer);
            if old != new {
                out.push(Reassignment {
                    request: nri.id,
                    old,
                    new,
                });
            }
        }
        out
    }

    // ─── Need ───────────────────────────────────────────────────────────

    /// Whether `rec` serves `nri` now or could win it by validating.
    fn is_potential_satisfier(&self, rec: &NetworkRecord, nri: &NetworkRequestInfo) -> bool {
        if nri.layers.len() == 1 && nri.layers.iter().all(|l| is_listen_ish(l.kind)) {
            return false;
        }
        for layer in &nri.layers {
            let active = nri.active_layer == Some(layer.id);
            if is_listen_ish(layer.kind) {
                if active {
                    return false;
                }
                continue;
            }
            if !rec.satisfies(layer) {
                continue;
            }
            let champion = if active {
                nri.satisfier.and_then(|s| self.candidate(s))
            } else {
                None
            };
            let Some(mut contender) = self.candidate(rec.id) else {
                return false;
            };
            contender.score = contender.score.as_if_validated();
            return self.ranker().might_beat(champion.as_ref(), &contender);
        }
        false
    }

    /// Whether nothing keeps `net` up (teardown) or in the foreground (linger).
    pub(crate) fn unneeded(&self, net: NetId, reason: UnneededFor) -> bool {
        let Some(rec) = self.networks.get(&net) else {
            return false;
        };
        let count = match reason {
            UnneededFor::Teardown => rec.num_request_requests(),
            UnneededFor::Linger => rec.num_foreground_requests(),
        };
        if !rec.is_connected() || rec.is_vpn() || rec.is_inactive() || count > 0 {
            return false;
        }
        if rec.score.keep_connected != KeepConnectedReason::None {
            return false;
        }
        !self.registry.iter().any(|nri| {
            let background_only = !nri.is_multilayer()
                && nri.layers.first().is_some_and(|l| l.is_background_request());
            if reason == UnneededFor::Linger && background_only {
                return false;
            }
            self.is_potential_satisfier(rec, nri)
        })
    }

    // ─── Applying a pass ────────────────────────────────────────────────

    fn update_satisfiers(&mut self, changes: &[Reassignment], now: Instant) {
        for r in changes {
            if let Some((net, layer)) = r.new {
                let kind = self
                    .registry
                    .get(r.request)
                    .and_then(|nri| nri.layer(layer))
                    .map(|l| l.kind);
                if let (Some(rec), Some(kind)) = (self.networks.get_mut(&net), kind) {
                    if rec.is_nascent() {
                        rec.unlinger_request(RequestId::NONE);
                        rec.unset_inactive();
                    }
                    rec.unlinger_request(layer);
                    rec.add_request(
                        layer,
                        Attachment {
                            owner: r.request,
                            kind,
                        },
                    );
                }
            }
            if let Some((old_net, old_layer)) = r.old {
                let successor = r
                    .new
                    .filter(|(n, _)| *n != old_net)
                    .and_then(|(n, _)| self.networks.get(&n))
                    .map(|n| (n.caps.transports(), n.score.transport_primary));
                let moved_away = r.network_changed();
                if let Some(rec) = self.networks.get_mut(&old_net) {
                    let removed = rec.remove_request(old_layer);
                    let keeps_alive = removed.is_some_and(|a| {
                        matches!(a.kind, RequestType::Request | RequestType::BackgroundRequest)
                    });
                    // A radio that cannot serve both networks at once hands
                    // over without lingering.
                    let hard_switch = successor
                        .is_some_and(|(t, primary)| primary && t == rec.caps.transports());
                    if moved_away && keeps_alive && rec.is_connected() && !hard_switch {
                        let d = rec.linger_duration;
                        rec.linger_request(old_layer, now, d);
                        debug!(net = %old_net, request = %r.request, "lingering for request");
                    }
                }
            }
            if let Some(nri) = self.registry.get_mut(r.request) {
                nri.satisfier = r.new.map(|(n, _)| n);
                nri.active_layer = r.new.map(|(_, l)| l);
            }
        }
    }

    /// Re-arms the queue entry for the latest inactivity expiry of `net`.
    pub(crate) fn rearm_inactivity_timer(&mut self, net: NetId) {
        let Some(rec) = self.networks.get_mut(&net) else {
            return;
        };
        let expiry = rec.inactivity_expiry();
        if rec.armed_inactivity.map(|(at, _)| at) == expiry {
            return;
        }
        if let Some((_, handle)) = rec.armed_inactivity.take() {
            self.timers.cancel(handle);
        }
        rec.armed_inactivity = expiry.map(|deadline| {
            let handle = self
                .timers
                .schedule(deadline, TimerEvent::InactivityExpired { net, deadline });
            (deadline, handle)
        });
    }

    /// Returns true if `net` just became inactive.
    fn update_inactivity_state(&mut self, net: NetId) -> bool {
        let linger_unneeded = self.unneeded(net, UnneededFor::Linger);
        let Some(rec) = self.networks.get_mut(&net) else {
            return false;
        };
        if !rec.is_connected() || rec.is_vpn() {
            return false;
        }
        let mut newly_inactive = false;
        if rec.is_inactive()
            && (rec.num_foreground_requests() > 0 || rec.inactivity_expiry().is_none())
        {
            rec.unset_inactive();
            debug!(net = %net, "network no longer inactive");
        } else if !rec.is_inactive() && rec.inactivity_expiry().is_some() && linger_unneeded {
            rec.set_inactive();
            info!(net = %net, "network lingering");
            newly_inactive = true;
        }
        self.rearm_inactivity_timer(net);
        newly_inactive
    }

    /// Recomputes FOREGROUND. Returns true if it flipped.
    fn update_foreground(&mut self, net: NetId) -> bool {
        let Some(rec) = self.networks.get_mut(&net) else {
            return false;
        };
        let foreground = rec.is_vpn() || !rec.is_background_network();
        if foreground == rec.foreground {
            return false;
        }
        let before = NetworkPermission::for_capabilities(&rec.caps);
        rec.foreground = foreground;
        rec.caps.set_capability(Capability::Foreground, foreground);
        debug!(net = %net, foreground, "foreground state changed");
        self.push_permission(net, before);
        true
    }

    pub(crate) fn push_permission(&self, net: NetId, before: NetworkPermission) {
        let Some(rec) = self.networks.get(&net) else {
            return;
        };
        let after = NetworkPermission::for_capabilities(&rec.caps);
        if after == before || !rec.created {
            return;
        }
        if let Err(e) = self.deps.backend.network_set_permission(net, after) {
            warn!(net = %net, error = %e, "failed to update network permission");
        }
    }

    /// Listens `net` stopped satisfying: detached, with `Lost` queued.
    fn process_lost_listens(&mut self, net: NetId) {
        let Some(rec) = self.networks.get(&net) else {
            return;
        };
        let lost: Vec<(RequestId, RequestId)> = self
            .registry
            .iter()
            .filter(|nri| nri.is_listen_only())
            .filter_map(|nri| nri.layers.first().map(|l| (nri.id, l)))
            .filter(|(_, l)| rec.has_request(l.id) && !rec.satisfies(l))
            .map(|(owner, l)| (owner, l.id))
            .collect();
        for (owner, layer) in lost {
            if let Some(rec) = self.networks.get_mut(&net) {
                rec.remove_request(layer);
            }
            if let Some(nri) = self.registry.get_mut(owner) {
                nri.blocked.remove(&net);
            }
            self.notify(owner, Some(net), NetworkEvent::Lost);
        }
    }

    /// Listens `net` newly satisfies: attached, with `Available` queued.
    fn process_new_listens(&mut self, net: NetId) -> Vec<RequestId> {
        let Some(rec) = self.networks.get(&net) else {
            return Vec::new();
        };
        let gained: Vec<(RequestId, RequestId, RequestType)> = self
            .registry
            .iter()
            .filter(|nri| nri.is_listen_only())
            .filter_map(|nri| nri.layers.first().map(|l| (nri.id, l)))
            .filter(|(_, l)| !rec.has_request(l.id) && rec.satisfies(l))
            .map(|(owner, l)| (owner, l.id, l.kind))
            .collect();
        let mut owners = Vec::with_capacity(gained.len());
        for (owner, layer, kind) in gained {
            if let Some(rec) = self.networks.get_mut(&net) {
                rec.add_request(layer, Attachment { owner, kind });
            }
            self.notify_available(owner, net);
            owners.push(owner);
        }
        owners
    }

    /// Listen bookkeeping after a change that cannot move ranked requests.
    pub(crate) fn process_listen_requests(&mut self, net: NetId) {
        self.process_lost_listens(net);
        self.notify_caps_attached(net);
        self.process_new_listens(net);
    }

    fn notify_losing(&mut self, net: NetId, now: Instant) {
        let Some(rec) = self.networks.get(&net) else {
            return;
        };
        let Some(expiry) = rec.inactivity_expiry() else {
            return;
        };
        let remaining = expiry
            .saturating_duration_since(now)
            .min(rec.linger_duration);
        let max_ms_to_live = remaining.as_millis() as u64;
        self.notify_attached(net, NetworkEvent::Losing { max_ms_to_live });
    }

    /// Recomputes every ranked request and applies the outcome.
    pub(crate) fn rematch_all(&mut self) {
        let now = self.clock.now();
        let changes = self.compute_reassignments();
        self.update_satisfiers(&changes, now);

        let old_default = self.system_default;
        let new_default = self
            .registry
            .get(self.default_request)
            .and_then(|nri| nri.satisfier);
        let default_changed = old_default != new_default;
        if default_changed {
            info!(from = ?old_default, to = ?new_default, "default network changed");
            self.system_default = new_default;
            if let Err(e) = self.deps.backend.set_default_network(new_default) {
                warn!(error = %e, "failed to set default network");
            }
        }

        let connected: Vec<NetId> = self
            .networks
            .values()
            .filter(|n| n.is_connected())
            .map(|n| n.id)
            .collect();
        let mut newly_inactive = Vec::new();
        for &net in &connected {
            if self.update_inactivity_state(net) {
                newly_inactive.push(net);
            }
        }
        let flipped: BTreeSet<NetId> = connected
            .iter()
            .copied()
            .filter(|&net| self.update_foreground(net))
            .collect();

        let mut fresh: BTreeSet<(NetId, RequestId)> = BTreeSet::new();
        for r in changes.iter().filter(|r| r.network_changed()) {
            match (r.old, r.new) {
                (_, Some((net, _))) => {
                    self.notify_available(r.request, net);
                    fresh.insert((net, r.request));
                }
                (Some((net, _)), None) => {
                    if let Some(nri) = self.registry.get_mut(r.request) {
                        nri.blocked.remove(&net);
                    }
                    self.notify(r.request, Some(net), NetworkEvent::Lost);
                }
                (None, None) => {}
            }
        }

        for &net in &connected {
            self.process_lost_listens(net);
            if flipped.contains(&net) {
                let owners = self
                    .networks
                    .get(&net)
                    .map(|n| n.attached_owners())
                    .unwrap_or_default();
                for owner in owners {
                    if !fresh.contains(&(net, owner)) {
                        self.notify_caps(owner, net);
                    }
                }
            }
            self.process_new_listens(net);
        }

        for net in newly_inactive {
            if self.networks.get(&net).is_some_and(|n| !n.is_nascent()) {
                self.notify_losing(net, now);
            }
        }

        self.sync_uid_rules();
        self.update_network_allowlist();
        self.update_offers();

        // Tearing one network down reruns the pass, so re-check each one.
        for net in connected {
            let idle = self
                .networks
                .get(&net)
                .is_some_and(|n| n.is_connected() && n.inactivity_expiry().is_none());
            if idle && self.unneeded(net, UnneededFor::Teardown) {
                info!(net = %net, "reaping unneeded network");
                self.teardown_unneeded(net);
            }
        }

        if default_changed {
            self.propagate_to_vpns(None);
        }
    }

    // ─── Capability refresh ─────────────────────────────────────────────

    /// Recomposes the capabilities of `net` and propagates whatever changed.
    /// `prev_score` is the full score before the triggering mutation.
    pub(crate) fn refresh_network(&mut self, net: NetId, prev_score: Option<FullScore>) {
        let Some(declared) = self.compose_declared(net) else {
            return;
        };
        let Some(rec) = self.networks.get_mut(&net) else {
            return;
        };
        let composed = rec.with_system_bits(declared);
        let old_caps = std::mem::replace(&mut rec.caps, composed);
        let connected = rec.is_connected();
        let is_vpn = rec.is_vpn();
        let new_caps = rec.caps.clone();
        let score_changed = self.full_score(net) != prev_score;
        if old_caps == new_caps && !score_changed {
            return;
        }
        if old_caps != new_caps {
            debug!(net = %net, changes = %old_caps.describe_changes(&new_caps), "capabilities changed");
        }
        self.push_permission(net, NetworkPermission::for_capabilities(&old_caps));
        if !connected {
            return;
        }

        if score_changed || without_system_bits(&old_caps) != without_system_bits(&new_caps) {
            self.rematch_all();
            self.notify_caps_attached(net);
        } else {
            self.process_listen_requests(net);
        }

        if old_caps.is_metered() != new_caps.is_metered() {
            self.refresh_blocked_on(net);
        }
        if old_caps.is_suspended() != new_caps.is_suspended() {
            let event = if new_caps.is_suspended() {
                NetworkEvent::Suspended
            } else {
                NetworkEvent::Resumed
            };
            self.notify_attached(net, event);
        }
        if !is_vpn {
            self.propagate_to_vpns(Some(net));
        }
    }
}
