//! # Arbiter
//!
//! Owns every network record and every request, and decides which network
//! serves which request. All state lives here and is only touched from the
//! worker that owns the arbiter (see [`crate::runtime`]).
//!
//! Every public operation runs to completion: it mutates state, runs a
//! rematch pass if anything relevant changed, and finally delivers the
//! callbacks it produced, in order, through [`Arbiter::flush`].

use std::collections::BTreeMap;

use meridian_common::ids::NetIdAllocator;
use meridian_common::{
    LegacyType, LinkProperties, NetId, NetworkCapabilities, RequestId, RequestType,
};
use meridian_mroute::{CoordinatorConfig, MulticastKernel, MulticastRoutingCoordinator, Mrt6Upcall};
use quanta::{Clock, Instant};
use tracing::{debug, info, warn};

use crate::backend::{AllowlistConfig, Dependencies, NetworkCreateConfig, NetworkPermission};
use crate::callback::{CallbackEvent, NetworkEvent, PendingCallbacks};
use crate::config::ArbiterConfig;
use crate::network::{Candidate, FullScore, NetworkRanker, NetworkRecord, NetworkState};
use crate::offer::OfferTable;
use crate::policy::{BadWifiPolicy, PREFERENCE_ORDER_DEFAULT, PolicyState, internet_caps};
use crate::registry::{NetworkRequestInfo, RequestOrigin, RequestRegistry};
use crate::timer::{TimerEvent, TimerQueue};
use crate::uid_rules::UidRuleTable;

/// Multicast coordinator hosted on the arbiter's worker.
pub type HostedMulticast = MulticastRoutingCoordinator<Box<dyn MulticastKernel + Send>>;

pub struct Arbiter {
    pub(crate) config: ArbiterConfig,
    pub(crate) deps: Dependencies,
    pub(crate) clock: Clock,
    pub(crate) networks: BTreeMap<NetId, NetworkRecord>,
    pub(crate) net_ids: NetIdAllocator,
    pub(crate) next_serial: u64,
    pub(crate) registry: RequestRegistry,
    pub(crate) timers: TimerQueue,
    pub(crate) bad_wifi: BadWifiPolicy,
    pub(crate) policies: PolicyState,
    pub(crate) uid_rules: UidRuleTable,
    pub(crate) allowlist: Vec<AllowlistConfig>,
    /// The request deciding the system default network.
    pub(crate) default_request: RequestId,
    pub(crate) system_default: Option<NetId>,
    pub(crate) offers: OfferTable,
    pub(crate) pending: PendingCallbacks,
    multicast: Option<HostedMulticast>,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig, deps: Dependencies, clock: Clock) -> Self {
        let mut registry = RequestRegistry::new(config.limits.clone());
        let id = registry.next_id();
        let layer = meridian_common::NetworkRequest::new(
            id,
            RequestType::Request,
            internet_caps(),
            meridian_common::uid::SYSTEM_UID,
        );
        let mut nri = NetworkRequestInfo::new(
            id,
            vec![layer],
            meridian_common::uid::SYSTEM_UID,
            RequestOrigin::SystemDefault,
        );
        nri.preference_order = PREFERENCE_ORDER_DEFAULT;
        // Internal requests are not counted, so this cannot fail.
        let _ = registry.register(nri);

        let unreachable = NetworkCreateConfig {
            net_id: NetId::UNREACHABLE,
            permission: NetworkPermission::None,
            secure: false,
            vpn_type: None,
        };
        if let Err(e) = deps.backend.network_create(&unreachable) {
            warn!(error = %e, "failed to create unreachable network");
        }

        let bad_wifi = BadWifiPolicy::new(&config.wifi);
        let mobile_data_uids = config.mobile_data_preferred_uids.clone();
        info!(
            linger_ms = config.timers.linger_delay.as_millis() as u64,
            nascent_ms = config.timers.nascent_delay.as_millis() as u64,
            "arbiter started"
        );
        let mut arbiter = Self {
            config,
            deps,
            clock,
            networks: BTreeMap::new(),
            net_ids: NetIdAllocator::default(),
            next_serial: 0,
            registry,
            timers: TimerQueue::new(),
            bad_wifi,
            policies: PolicyState::default(),
            uid_rules: UidRuleTable::new(),
            allowlist: Vec::new(),
            default_request: id,
            system_default: None,
            offers: OfferTable::new(),
            pending: PendingCallbacks::default(),
            multicast: None,
        };
        if !mobile_data_uids.is_empty() {
            arbiter.policies.mobile_data_uids = mobile_data_uids;
            arbiter.apply_mobile_data_preference();
        }
        arbiter
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    // ─── Callback delivery ──────────────────────────────────────────────

    /// Queues `event` for `request` if it has a listener.
    pub(crate) fn notify(&mut self, request: RequestId, network: Option<NetId>, event: NetworkEvent) {
        let Some(nri) = self.registry.get(request) else {
            return;
        };
        let Some(listener) = &nri.listener else {
            return;
        };
        let ev = CallbackEvent {
            request_id: request,
            network,
            event,
        };
        self.pending.push(listener, ev);
    }

    /// Capabilities of `net` as `request` may see them.
    fn caps_for(&self, request: RequestId, net: NetId) -> Option<NetworkCapabilities> {
        let nri = self.registry.get(request)?;
        let rec = self.networks.get(&net)?;
        Some(rec.caps.redacted(nri.uid, nri.privileged))
    }

    pub(crate) fn notify_caps(&mut self, request: RequestId, net: NetId) {
        if let Some(caps) = self.caps_for(request, net) {
            self.notify(request, Some(net), NetworkEvent::CapabilitiesChanged(caps));
        }
    }

    /// The burst a request receives when it first sees a network: the
    /// network itself, then its full current state.
    pub(crate) fn notify_available(&mut self, request: RequestId, net: NetId) {
        let Some(rec) = self.networks.get(&net) else {
            return;
        };
        let suspended = rec.caps.is_suspended();
        let lp = rec.link_properties.clone();
        self.notify(request, Some(net), NetworkEvent::Available);
        if suspended {
            self.notify(request, Some(net), NetworkEvent::Suspended);
        }
        self.notify_caps(request, net);
        self.notify(request, Some(net), NetworkEvent::LinkPropertiesChanged(lp));
        let blocked = self.record_blocked(request, net);
        self.notify(request, Some(net), NetworkEvent::BlockedStatusChanged(blocked));
        self.cancel_request_timeout(request);
    }

    /// Sends `event` to every request attached to `net`.
    pub(crate) fn notify_attached(&mut self, net: NetId, event: NetworkEvent) {
        let Some(rec) = self.networks.get(&net) else {
            return;
        };
        for owner in rec.attached_owners() {
            self.notify(owner, Some(net), event.clone());
        }
    }

    pub(crate) fn notify_caps_attached(&mut self, net: NetId) {
        let Some(rec) = self.networks.get(&net) else {
            return;
        };
        for owner in rec.attached_owners() {
            self.notify_caps(owner, net);
        }
    }

    /// Delivers every queued callback, in the order it was produced.
    pub fn flush(&mut self) {
        for (listener, event) in self.pending.take() {
            debug!(%event, "callback");
            listener.on_event(event);
        }
    }

    // ─── Scoring helpers ────────────────────────────────────────────────

    pub(crate) fn ranker(&self) -> NetworkRanker {
        NetworkRanker::new(self.bad_wifi.actively_prefer())
    }

    pub(crate) fn full_score(&self, net: NetId) -> Option<FullScore> {
        let rec = self.networks.get(&net)?;
        Some(FullScore::compute(
            &rec.score,
            &rec.caps,
            &rec.score_facts(),
            self.bad_wifi.avoid_bad_wifi(),
        ))
    }

    pub(crate) fn candidate(&self, net: NetId) -> Option<Candidate> {
        let rec = self.networks.get(&net)?;
        Some(Candidate {
            id: net,
            serial: rec.serial,
            score: self.full_score(net)?,
            transports: rec.caps.transports(),
        })
    }

    // ─── Queries ────────────────────────────────────────────────────────

    fn connected(&self, net: NetId) -> Option<&NetworkRecord> {
        self.networks.get(&net).filter(|n| n.is_connected())
    }

    /// Network currently serving `request`.
    pub fn satisfier(&self, request: RequestId) -> Option<NetId> {
        self.registry.get(request)?.satisfier
    }

    pub fn system_default_network(&self) -> Option<NetId> {
        self.system_default
    }

    /// Default network of `uid`: the one chosen by the highest-priority
    /// policy covering it, or the system default.
    pub fn default_network_for_uid(&self, uid: u32) -> Option<NetId> {
        match self.policy_request_for_uid(uid) {
            Some(nri) => nri.satisfier,
            None => self.system_default,
        }
    }

    /// Network `uid` would use right now: a VPN covering it, else its default.
    pub fn active_network_for_uid(&self, uid: u32) -> Option<NetId> {
        let vpn = self
            .networks
            .values()
            .filter(|n| n.is_connected() && n.is_vpn())
            .find(|n| n.caps.uids().is_some_and(|u| u.contains_uid(uid)));
        match vpn {
            Some(v) => Some(v.id),
            None => self.default_network_for_uid(uid),
        }
    }

    pub fn network_capabilities(&self, net: NetId) -> Option<NetworkCapabilities> {
        self.connected(net).map(|n| n.caps.clone())
    }

    pub fn link_properties(&self, net: NetId) -> Option<LinkProperties> {
        self.connected(net).map(|n| n.link_properties.clone())
    }

    pub fn all_networks(&self) -> Vec<NetId> {
        self.networks
            .values()
            .filter(|n| n.is_connected())
            .map(|n| n.id)
            .collect()
    }

    /// Oldest connected network of `legacy` type that serves a request.
    pub fn network_for_legacy_type(&self, legacy: LegacyType) -> Option<NetId> {
        self.networks
            .values()
            .filter(|n| n.is_connected() && n.legacy_type == legacy && n.num_request_requests() > 0)
            .min_by_key(|n| n.serial)
            .map(|n| n.id)
    }

    pub fn network_state(&self, net: NetId) -> Option<NetworkState> {
        self.networks.get(&net).map(|n| n.state)
    }

    pub fn is_lingering(&self, net: NetId) -> bool {
        self.networks.get(&net).is_some_and(|n| n.is_lingering())
    }

    pub fn requests_sorted_by_id(&self) -> Vec<&NetworkRequestInfo> {
        self.registry.requests_sorted_by_id()
    }

    pub fn for_each_request(&self, f: impl FnMut(&NetworkRequestInfo)) {
        self.registry.for_each(f);
    }

    pub fn request_count_for_uid(&self, uid: u32) -> usize {
        self.registry.count_for_uid(uid)
    }

    pub fn default_request_id(&self) -> RequestId {
        self.default_request
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Earliest instant at which [`process_timers`](Self::process_timers)
    /// has work to do.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        let sweep = self.multicast.as_ref().and_then(|m| m.next_sweep_at());
        match (self.timers.next_deadline(), sweep) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires every timer due by now.
    pub fn process_timers(&mut self) {
        let now = self.clock.now();
        while let Some((_, event)) = self.timers.pop_due(now) {
            self.handle_timer(event);
        }
        if let Some(m) = self.multicast.as_mut() {
            let evicted = m.run_sweep_if_due(now);
            if evicted > 0 {
                debug!(evicted, "multicast cache sweep");
            }
        }
        self.flush();
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::InactivityExpired { net, deadline } => {
                self.handle_inactivity_expired(net, deadline)
            }
            TimerEvent::DestroyNetwork { net } => self.destroy_network(net),
            TimerEvent::RequestTimeout { request } => self.handle_request_timeout(request),
            TimerEvent::EvaluationTimeout { net } => self.handle_evaluation_timeout(net),
        }
    }

    // ─── Multicast ──────────────────────────────────────────────────────

    /// Hosts a multicast coordinator on this arbiter's worker.
    pub fn attach_multicast(
        &mut self,
        kernel: Box<dyn MulticastKernel + Send>,
        config: CoordinatorConfig,
    ) {
        self.multicast = Some(MulticastRoutingCoordinator::new(kernel, config));
    }

    pub fn multicast(&self) -> Option<&HostedMulticast> {
        self.multicast.as_ref()
    }

    pub fn multicast_mut(&mut self) -> Option<&mut HostedMulticast> {
        self.multicast.as_mut()
    }

    /// Feeds a raw kernel upcall to the hosted coordinator.
    pub fn handle_multicast_upcall(&mut self, buf: &[u8]) {
        let now = self.clock.now();
        let Some(m) = self.multicast.as_mut() else {
            return;
        };
        match Mrt6Upcall::parse(buf) {
            Some(up) => m.handle_upcall(&up, now),
            None => debug!(len = buf.len(), "short multicast upcall"),
        }
    }
}
