//! Per-network state held by the arbiter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use meridian_common::{
    Capability, LegacyType, LinkProperties, NetId, NetworkCapabilities, NetworkRequest,
    NetworkScore, RequestId, RequestType,
};
use quanta::Instant;

use crate::agent::{AgentConfig, NetworkAgent, ValidationResult};
use crate::timer::TimerHandle;

use super::score::ScoreFacts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkState {
    /// Registered, not yet connected. Invisible to requests.
    Registered,
    Connected,
    /// Unwanted or disconnected; waiting out the teardown delay.
    TearingDown,
}

/// A request layer attached to a network, and the request it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub owner: RequestId,
    pub kind: RequestType,
}

pub struct NetworkRecord {
    pub id: NetId,
    /// Connection order; the ranker prefers older networks on ties.
    pub serial: u64,
    pub agent: Arc<dyn NetworkAgent>,
    pub config: AgentConfig,
    pub legacy_type: LegacyType,
    /// Capabilities as last declared by the agent.
    pub declared_caps: NetworkCapabilities,
    /// Effective capabilities: declared, VPN-derived, plus arbiter bits.
    pub caps: NetworkCapabilities,
    pub link_properties: LinkProperties,
    pub score: NetworkScore,
    pub state: NetworkState,
    /// The backend network object exists.
    pub created: bool,

    pub validated: bool,
    pub partial_connectivity: bool,
    pub captive_portal: bool,
    pub ever_validated: bool,
    pub ever_evaluated: bool,
    pub avoid_unvalidated: bool,
    pub last_validation: Option<ValidationResult>,
    pub foreground: bool,
    /// Underlying networks as declared by a VPN agent. `None` tracks the
    /// system default.
    pub declared_underlying: Option<Vec<NetId>>,

    pub linger_duration: Duration,
    pub teardown_delay: Duration,
    inactivity_timers: BTreeMap<RequestId, Instant>,
    inactive: bool,
    pub(crate) armed_inactivity: Option<(Instant, TimerHandle)>,
    pub(crate) evaluation_timer: Option<TimerHandle>,
    /// Layer id -> owning request.
    requests: BTreeMap<RequestId, Attachment>,
}

impl NetworkRecord {
    pub fn new(
        id: NetId,
        serial: u64,
        agent: Arc<dyn NetworkAgent>,
        config: AgentConfig,
        caps: NetworkCapabilities,
        link_properties: LinkProperties,
        score: NetworkScore,
        linger_duration: Duration,
    ) -> Self {
        let legacy_type = config
            .legacy_type
            .unwrap_or_else(|| LegacyType::for_capabilities(&caps));
        let teardown_delay = config.teardown_delay;
        Self {
            id,
            serial,
            agent,
            config,
            legacy_type,
            declared_caps: caps.clone(),
            caps,
            link_properties,
            score,
            state: NetworkState::Registered,
            created: false,
            validated: false,
            partial_connectivity: false,
            captive_portal: false,
            ever_validated: false,
            ever_evaluated: false,
            avoid_unvalidated: false,
            last_validation: None,
            foreground: true,
            declared_underlying: None,
            linger_duration,
            teardown_delay,
            inactivity_timers: BTreeMap::new(),
            inactive: false,
            armed_inactivity: None,
            evaluation_timer: None,
            requests: BTreeMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == NetworkState::Connected
    }

    pub fn is_vpn(&self) -> bool {
        self.declared_caps.is_vpn()
    }

    /// Whether the network currently serves `request`.
    pub fn satisfies(&self, request: &NetworkRequest) -> bool {
        self.is_connected() && request.satisfied_by(&self.caps)
    }

    pub fn score_facts(&self) -> ScoreFacts {
        ScoreFacts {
            validated: self.validated,
            ever_validated: self.ever_validated,
            ever_evaluated: self.ever_evaluated,
            explicitly_selected: self.config.explicitly_selected,
            accept_unvalidated: self.config.accept_unvalidated,
            avoid_unvalidated: self.avoid_unvalidated,
            destroyed: self.state == NetworkState::TearingDown,
            invincible: false,
        }
    }

    /// Declared capabilities plus the bits the arbiter owns.
    pub fn with_system_bits(&self, mut caps: NetworkCapabilities) -> NetworkCapabilities {
        caps.set_capability(Capability::Validated, self.validated);
        caps.set_capability(Capability::PartialConnectivity, self.partial_connectivity);
        caps.set_capability(Capability::CaptivePortal, self.captive_portal);
        caps.set_capability(Capability::Foreground, self.foreground);
        caps
    }

    // ─── Attached requests ──────────────────────────────────────────────

    /// Returns false if the layer was already attached.
    pub fn add_request(&mut self, layer: RequestId, attachment: Attachment) -> bool {
        self.requests.insert(layer, attachment).is_none()
    }

    /// Detaching a keep-alive request also cancels any linger held for it.
    pub fn remove_request(&mut self, layer: RequestId) -> Option<Attachment> {
        let removed = self.requests.remove(&layer)?;
        if matches!(
            removed.kind,
            RequestType::Request | RequestType::BackgroundRequest
        ) {
            self.unlinger_request(layer);
        }
        Some(removed)
    }

    pub fn has_request(&self, layer: RequestId) -> bool {
        self.requests.contains_key(&layer)
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    /// Requests with at least one layer attached here, in id order.
    pub fn attached_owners(&self) -> BTreeSet<RequestId> {
        self.requests.values().map(|a| a.owner).collect()
    }

    pub fn attached_layer_of(&self, owner: RequestId) -> Option<RequestId> {
        self.requests
            .iter()
            .find(|(_, a)| a.owner == owner)
            .map(|(layer, _)| *layer)
    }

    fn count(&self, pred: impl Fn(RequestType) -> bool) -> usize {
        self.requests.values().filter(|a| pred(a.kind)).count()
    }

    /// Keep-alive requests, foreground or background.
    pub fn num_request_requests(&self) -> usize {
        self.count(|k| matches!(k, RequestType::Request | RequestType::BackgroundRequest))
    }

    pub fn num_foreground_requests(&self) -> usize {
        self.count(|k| k == RequestType::Request)
    }

    pub fn num_background_requests(&self) -> usize {
        self.count(|k| k == RequestType::BackgroundRequest)
    }

    /// Held up only by background requests.
    pub fn is_background_network(&self) -> bool {
        !self.is_vpn()
            && self.num_foreground_requests() == 0
            && self.num_background_requests() > 0
            && !self.is_lingering()
    }

    // ─── Inactivity (linger and nascent) ────────────────────────────────

    /// Starts lingering for `layer`. An existing timer for the same layer
    /// keeps its original expiry.
    pub fn linger_request(&mut self, layer: RequestId, now: Instant, duration: Duration) {
        self.inactivity_timers.entry(layer).or_insert(now + duration);
    }

    pub fn set_linger_expiry(&mut self, layer: RequestId, expiry: Instant) {
        self.inactivity_timers.insert(layer, expiry);
    }

    pub fn unlinger_request(&mut self, layer: RequestId) -> bool {
        self.inactivity_timers.remove(&layer).is_some()
    }

    pub fn linger_expiry(&self, layer: RequestId) -> Option<Instant> {
        self.inactivity_timers.get(&layer).copied()
    }

    /// Latest expiry across all timers; the network is inactive until then.
    pub fn inactivity_expiry(&self) -> Option<Instant> {
        self.inactivity_timers.values().max().copied()
    }

    pub fn set_inactive(&mut self) {
        self.inactive = true;
    }

    pub fn unset_inactive(&mut self) {
        self.inactive = false;
    }

    pub fn is_inactive(&self) -> bool {
        self.inactive
    }

    /// Inactive only because of the grace period given to a new network.
    pub fn is_nascent(&self) -> bool {
        self.inactive
            && self.inactivity_timers.len() == 1
            && self.inactivity_timers.contains_key(&RequestId::NONE)
    }

    pub fn is_lingering(&self) -> bool {
        self.inactive && !self.is_nascent()
    }

    /// Drops every timer. The caller cancels the armed queue entry.
    pub fn clear_inactivity_state(&mut self) {
        self.inactivity_timers.clear();
        self.inactive = false;
    }

    /// Changes the linger duration, moving already-armed linger expiries by
    /// the difference. The nascent timer is left alone.
    pub fn set_linger_duration(&mut self, duration: Duration) {
        let old = self.linger_duration;
        for (layer, expiry) in self.inactivity_timers.iter_mut() {
            if *layer == RequestId::NONE {
                continue;
            }
            *expiry = if duration >= old {
                *expiry + (duration - old)
            } else {
                *expiry - (old - duration)
            };
        }
        self.linger_duration = duration;
    }
}
