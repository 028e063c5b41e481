//! # Network lifecycle
//!
//! Agent-facing operations and the three-phase teardown:
//!
//! 1. **Unwanted**: the agent is told nothing needs its network.
//! 2. **Disconnect**: every attached request loses the network and the
//!    remaining requests are rematched.
//! 3. **Destroy**: after the teardown delay UID rules are reconciled, the
//!    backend network object is destroyed and the id is released.
//!
//! A registered network is invisible to requests until it connects.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use meridian_common::{
    ArbiterError, Capability, LinkProperties, NetId, NetworkCapabilities, NetworkScore, RequestId,
    UserId,
};
use quanta::Instant;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentConfig, NetworkAgent, ValidationResult, ValidationStatus};
use crate::arbiter::Arbiter;
use crate::backend::{NetworkCreateConfig, NetworkPermission};
use crate::callback::NetworkEvent;
use crate::network::{NetworkRecord, NetworkState};
use crate::rematch::UnneededFor;
use crate::timer::TimerEvent;

impl Arbiter {
    fn record_mut(&mut self, net: NetId) -> Result<&mut NetworkRecord, ArbiterError> {
        self.networks
            .get_mut(&net)
            .ok_or(ArbiterError::UnknownNetwork(net))
    }

    fn connected_mut(&mut self, net: NetId) -> Result<&mut NetworkRecord, ArbiterError> {
        let rec = self.record_mut(net)?;
        if !rec.is_connected() {
            return Err(ArbiterError::invalid(format!("{net} is not connected")));
        }
        Ok(rec)
    }

    // ─── Registration and connect ───────────────────────────────────────

    /// Registers a network. It takes part in ranking once connected.
    pub fn register_network_agent(
        &mut self,
        agent: Arc<dyn NetworkAgent>,
        config: AgentConfig,
        caps: NetworkCapabilities,
        link_properties: LinkProperties,
        score: NetworkScore,
    ) -> Result<NetId, ArbiterError> {
        caps.check_agent_declared()?;
        if caps.is_vpn() && config.vpn_type.is_none() {
            return Err(ArbiterError::invalid("vpn agents must declare a vpn type"));
        }
        let net = self
            .net_ids
            .allocate()
            .ok_or_else(|| ArbiterError::Internal("network ids exhausted".into()))?;
        let serial = self.next_serial;
        self.next_serial += 1;
        let rec = NetworkRecord::new(
            net,
            serial,
            agent,
            config,
            caps,
            link_properties,
            score,
            self.config.timers.linger_delay,
        );
        info!(
            net = %net,
            transports = ?rec.declared_caps.transports(),
            legacy = ?rec.legacy_type,
            "network agent registered"
        );
        self.networks.insert(net, rec);
        if let Some(declared) = self.compose_declared(net) {
            if let Some(rec) = self.networks.get_mut(&net) {
                rec.caps = rec.with_system_bits(declared);
            }
        }
        Ok(net)
    }

    /// Creates the backend network, installs interfaces and routes, and
    /// makes the network visible to requests.
    pub fn mark_connected(&mut self, net: NetId) -> Result<(), ArbiterError> {
        let rec = self.record_mut(net)?;
        if rec.state != NetworkState::Registered {
            return Err(ArbiterError::invalid(format!("{net} already connected")));
        }
        let create = NetworkCreateConfig {
            net_id: net,
            permission: NetworkPermission::for_capabilities(&rec.caps),
            secure: rec.is_vpn() && rec.config.secure_vpn,
            vpn_type: if rec.is_vpn() { rec.config.vpn_type } else { None },
        };
        let agent = Arc::clone(&rec.agent);
        let lp = rec.link_properties.clone();
        let is_vpn = rec.is_vpn();

        if let Err(e) = self.deps.backend.network_create(&create) {
            error!(net = %net, error = %e, "failed to create network");
            return Err(ArbiterError::Internal(format!("create {net}: {e}")));
        }
        agent.on_network_created(net);
        for iface in lp.all_interfaces() {
            if let Err(e) = self.deps.backend.network_add_interface(net, &iface) {
                warn!(net = %net, iface = %iface, error = %e, "failed to add interface");
            }
        }
        for route in lp.all_routes() {
            if let Err(e) = self.deps.backend.network_add_route(net, &route) {
                warn!(net = %net, error = %e, "failed to add route");
            }
        }

        let now = self.clock.now();
        let nascent = self.config.timers.nascent_delay;
        let evaluation_at = now + self.config.timers.evaluation_timeout;
        let handle = self
            .timers
            .schedule(evaluation_at, TimerEvent::EvaluationTimeout { net });
        if let Some(rec) = self.networks.get_mut(&net) {
            rec.created = true;
            rec.state = NetworkState::Connected;
            rec.evaluation_timer = Some(handle);
            if !is_vpn {
                rec.linger_request(RequestId::NONE, now, nascent);
                rec.set_inactive();
            }
        }
        if let Some(declared) = self.compose_declared(net) {
            if let Some(rec) = self.networks.get_mut(&net) {
                rec.caps = rec.with_system_bits(declared);
            }
        }
        info!(net = %net, vpn = is_vpn, "network connected");
        self.rematch_all();
        self.flush();
        Ok(())
    }

    // ─── Agent updates ──────────────────────────────────────────────────

    /// Replaces the declared capabilities. Changing transports or an
    /// immutable capability is an agent bug and is rejected.
    pub fn update_capabilities(
        &mut self,
        net: NetId,
        caps: NetworkCapabilities,
    ) -> Result<(), ArbiterError> {
        caps.check_agent_declared()?;
        let rec = self.record_mut(net)?;
        if let Some(what) = rec.declared_caps.immutable_change(&caps) {
            error!(net = %net, %what, "agent changed immutable capabilities");
            return Err(ArbiterError::Internal(format!("{net}: {what}")));
        }
        rec.declared_caps = caps;
        let prev = self.full_score(net);
        self.refresh_network(net, prev);
        self.flush();
        Ok(())
    }

    pub fn update_link_properties(
        &mut self,
        net: NetId,
        link_properties: LinkProperties,
    ) -> Result<(), ArbiterError> {
        let rec = self.record_mut(net)?;
        if rec.link_properties == link_properties {
            return Ok(());
        }
        let old = std::mem::replace(&mut rec.link_properties, link_properties.clone());
        let live = rec.is_connected() && rec.created;
        if live {
            self.apply_link_diff(net, &old, &link_properties);
        }
        if self.networks.get(&net).is_some_and(|n| n.is_connected()) {
            self.notify_attached(net, NetworkEvent::LinkPropertiesChanged(link_properties));
        }
        self.flush();
        Ok(())
    }

    /// Routes are added and updated before stale ones are removed.
    fn apply_link_diff(&self, net: NetId, old: &LinkProperties, new: &LinkProperties) {
        let backend = &self.deps.backend;
        let before: BTreeSet<String> = old.all_interfaces().into_iter().collect();
        let after: BTreeSet<String> = new.all_interfaces().into_iter().collect();
        for iface in after.difference(&before) {
            if let Err(e) = backend.network_add_interface(net, iface) {
                warn!(net = %net, iface = %iface, error = %e, "failed to add interface");
            }
        }
        let diff = old.diff_routes(new);
        for route in &diff.added {
            if let Err(e) = backend.network_add_route(net, route) {
                warn!(net = %net, error = %e, "failed to add route");
            }
        }
        for route in &diff.updated {
            if let Err(e) = backend.network_update_route(net, route) {
                warn!(net = %net, error = %e, "failed to update route");
            }
        }
        for route in &diff.removed {
            if let Err(e) = backend.network_remove_route(net, route) {
                warn!(net = %net, error = %e, "failed to remove route");
            }
        }
        for iface in before.difference(&after) {
            if let Err(e) = backend.network_remove_interface(net, iface) {
                warn!(net = %net, iface = %iface, error = %e, "failed to remove interface");
            }
        }
    }

    pub fn update_score(&mut self, net: NetId, score: NetworkScore) -> Result<(), ArbiterError> {
        let prev = self.full_score(net);
        let rec = self.record_mut(net)?;
        if rec.score == score {
            return Ok(());
        }
        rec.score = score;
        self.refresh_network(net, prev);
        self.flush();
        Ok(())
    }

    pub fn suspend(&mut self, net: NetId) -> Result<(), ArbiterError> {
        self.set_suspended(net, true)
    }

    pub fn resume(&mut self, net: NetId) -> Result<(), ArbiterError> {
        self.set_suspended(net, false)
    }

    fn set_suspended(&mut self, net: NetId, suspended: bool) -> Result<(), ArbiterError> {
        let prev = self.full_score(net);
        let rec = self.record_mut(net)?;
        rec.declared_caps
            .set_capability(Capability::NotSuspended, !suspended);
        debug!(net = %net, suspended, "suspend state reported");
        self.refresh_network(net, prev);
        self.flush();
        Ok(())
    }

    /// Applies the outcome of an evaluation. Partial connectivity counts as
    /// validated only once the user accepted it.
    pub fn report_validation(
        &mut self,
        net: NetId,
        result: ValidationResult,
    ) -> Result<(), ArbiterError> {
        let prev = self.full_score(net);
        let rec = self.connected_mut(net)?;
        let accept_partial = rec.config.accept_partial_connectivity;
        let status = result.status;
        rec.validated = match status {
            ValidationStatus::Valid => true,
            ValidationStatus::Partial => accept_partial,
            ValidationStatus::CaptivePortal | ValidationStatus::Invalid => false,
        };
        rec.partial_connectivity = status == ValidationStatus::Partial;
        rec.captive_portal = status == ValidationStatus::CaptivePortal;
        rec.ever_validated |= rec.validated;
        rec.ever_evaluated = true;
        rec.last_validation = Some(result);
        let timer = rec.evaluation_timer.take();
        info!(net = %net, ?status, validated = rec.validated, "validation result");
        if let Some(h) = timer {
            self.timers.cancel(h);
        }
        self.refresh_network(net, prev);
        self.flush();
        Ok(())
    }

    /// Asks the agent to evaluate its network again.
    pub fn request_revalidation(&mut self, net: NetId) -> Result<(), ArbiterError> {
        let rec = self.connected_mut(net)?;
        rec.agent.on_revalidation_requested(net);
        Ok(())
    }

    pub fn set_teardown_delay(&mut self, net: NetId, delay: Duration) -> Result<(), ArbiterError> {
        self.record_mut(net)?.teardown_delay = delay;
        Ok(())
    }

    /// Overrides the linger duration of one network. Linger timers already
    /// running move by the difference.
    pub fn set_linger_duration(&mut self, net: NetId, duration: Duration) -> Result<(), ArbiterError> {
        self.record_mut(net)?.set_linger_duration(duration);
        debug!(net = %net, ms = duration.as_millis() as u64, "linger duration set");
        self.rearm_inactivity_timer(net);
        Ok(())
    }

    /// Pins the linger expiry of `net` for one request layer.
    pub fn set_linger_expiry(
        &mut self,
        net: NetId,
        request: RequestId,
        expiry: Instant,
    ) -> Result<(), ArbiterError> {
        self.connected_mut(net)?.set_linger_expiry(request, expiry);
        self.rematch_all();
        self.flush();
        Ok(())
    }

    pub fn clear_linger_expiry(&mut self, net: NetId, request: RequestId) -> Result<(), ArbiterError> {
        self.connected_mut(net)?.unlinger_request(request);
        self.rematch_all();
        self.flush();
        Ok(())
    }

    /// The agent went away. A network that never connected disappears
    /// silently; a connected one is disconnected and destroyed.
    pub fn agent_disconnected(&mut self, net: NetId) -> Result<(), ArbiterError> {
        let state = self.record_mut(net)?.state;
        match state {
            NetworkState::Registered => {
                self.networks.remove(&net);
                self.net_ids.release(net);
                info!(net = %net, "network agent gone before connecting");
            }
            NetworkState::Connected => {
                info!(net = %net, "network agent disconnected");
                self.disconnect_and_destroy(net);
            }
            NetworkState::TearingDown => {}
        }
        self.flush();
        Ok(())
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    pub(crate) fn teardown_unneeded(&mut self, net: NetId) {
        let Some(rec) = self.networks.get(&net).filter(|n| n.is_connected()) else {
            return;
        };
        rec.agent.on_network_unwanted(net);
        self.disconnect_and_destroy(net);
    }

    fn disconnect_and_destroy(&mut self, net: NetId) {
        self.handle_disconnect(net);
        let Some(delay) = self.networks.get(&net).map(|n| n.teardown_delay) else {
            return;
        };
        if delay.is_zero() {
            self.destroy_network(net);
        } else {
            let at = self.clock.now() + delay;
            self.timers.schedule(at, TimerEvent::DestroyNetwork { net });
            debug!(net = %net, ms = delay.as_millis() as u64, "destroy deferred");
        }
    }

    /// Takes `net` away from every request and rematches the rest.
    fn handle_disconnect(&mut self, net: NetId) {
        let Some(rec) = self.networks.get_mut(&net) else {
            return;
        };
        rec.state = NetworkState::TearingDown;
        rec.clear_inactivity_state();
        let armed = rec.armed_inactivity.take().map(|(_, h)| h);
        let evaluation = rec.evaluation_timer.take();
        let owners = rec.attached_owners();
        rec.clear_requests();
        for h in armed.into_iter().chain(evaluation) {
            self.timers.cancel(h);
        }

        for owner in owners {
            self.notify(owner, Some(net), NetworkEvent::Lost);
        }
        for id in self.registry.ids() {
            if let Some(nri) = self.registry.get_mut(id) {
                nri.blocked.remove(&net);
                if nri.satisfier == Some(net) {
                    nri.satisfier = None;
                    nri.active_layer = None;
                }
            }
        }
        let is_vpn = self.networks.get(&net).is_some_and(|n| n.is_vpn());
        self.rematch_all();
        if !is_vpn {
            self.propagate_to_vpns(Some(net));
        }
    }

    /// Final phase: rules first, then the backend object, then the record.
    pub(crate) fn destroy_network(&mut self, net: NetId) {
        if !self
            .networks
            .get(&net)
            .is_some_and(|n| n.state == NetworkState::TearingDown)
        {
            return;
        }
        self.sync_uid_rules();
        let Some(rec) = self.networks.remove(&net) else {
            return;
        };
        if rec.created {
            if let Err(e) = self.deps.backend.network_destroy(net) {
                warn!(net = %net, error = %e, "failed to destroy network");
            }
        }
        rec.agent.on_network_destroyed(net);
        self.net_ids.release(net);
        self.update_network_allowlist();
        info!(net = %net, "network destroyed");
    }

    // ─── Timer handlers ─────────────────────────────────────────────────

    pub(crate) fn handle_inactivity_expired(&mut self, net: NetId, deadline: Instant) {
        let Some(rec) = self.networks.get_mut(&net) else {
            return;
        };
        if rec.armed_inactivity.map(|(at, _)| at) != Some(deadline) {
            return;
        }
        rec.armed_inactivity = None;
        if !rec.is_connected() {
            return;
        }
        let nascent = rec.is_nascent();
        rec.clear_inactivity_state();
        debug!(net = %net, nascent, "inactivity period over");
        if self.unneeded(net, UnneededFor::Teardown) {
            info!(net = %net, nascent, "tearing down network after inactivity");
            self.teardown_unneeded(net);
        } else {
            self.rematch_all();
        }
    }

    pub(crate) fn handle_request_timeout(&mut self, request: RequestId) {
        let Some(nri) = self.registry.get_mut(request) else {
            return;
        };
        nri.timeout_handle = None;
        if nri.satisfier.is_some() {
            return;
        }
        let layers: Vec<RequestId> = nri.layers.iter().map(|l| l.id).collect();
        let seen = self
            .networks
            .values()
            .any(|n| layers.iter().any(|l| n.has_request(*l)));
        if seen {
            return;
        }
        info!(request = %request, "request timed out unsatisfied");
        self.notify(request, None, NetworkEvent::Unavailable);
        self.remove_request_internal(request);
        self.rematch_all();
    }

    pub(crate) fn cancel_request_timeout(&mut self, request: RequestId) {
        let handle = self
            .registry
            .get_mut(request)
            .and_then(|nri| nri.timeout_handle.take());
        if let Some(h) = handle {
            self.timers.cancel(h);
        }
    }

    pub(crate) fn handle_evaluation_timeout(&mut self, net: NetId) {
        let prev = self.full_score(net);
        let Some(rec) = self.networks.get_mut(&net) else {
            return;
        };
        rec.evaluation_timer = None;
        if !rec.is_connected() || rec.ever_evaluated {
            return;
        }
        rec.ever_evaluated = true;
        debug!(net = %net, "evaluation timed out");
        self.refresh_network(net, prev);
    }

    // ─── User choices ───────────────────────────────────────────────────

    /// The user answered "stay connected?" for a network that does not
    /// validate. Declining tears it down.
    pub fn set_accept_unvalidated(
        &mut self,
        net: NetId,
        accept: bool,
        always: bool,
    ) -> Result<(), ArbiterError> {
        let prev = self.full_score(net);
        let rec = self.connected_mut(net)?;
        info!(net = %net, accept, always, "user choice on unvalidated network");
        if accept {
            rec.config.explicitly_selected = true;
            rec.config.accept_unvalidated = true;
        } else {
            rec.config.accept_unvalidated = false;
        }
        let validated = rec.validated;
        self.refresh_network(net, prev);
        if !accept && !validated {
            self.teardown_unneeded(net);
        }
        self.flush();
        Ok(())
    }

    pub fn set_accept_partial_connectivity(
        &mut self,
        net: NetId,
        accept: bool,
        always: bool,
    ) -> Result<(), ArbiterError> {
        let prev = self.full_score(net);
        let rec = self.connected_mut(net)?;
        info!(net = %net, accept, always, "user choice on partial connectivity");
        rec.config.accept_partial_connectivity = accept;
        if accept {
            rec.config.explicitly_selected = true;
        }
        if rec
            .last_validation
            .as_ref()
            .is_some_and(|r| r.status == ValidationStatus::Partial)
        {
            rec.validated = accept;
            rec.ever_validated |= accept;
        }
        self.refresh_network(net, prev);
        self.flush();
        Ok(())
    }

    /// The user chose to stop using a network once it loses validation.
    pub fn set_avoid_unvalidated(&mut self, net: NetId) -> Result<(), ArbiterError> {
        let prev = self.full_score(net);
        let rec = self.connected_mut(net)?;
        rec.avoid_unvalidated = true;
        self.refresh_network(net, prev);
        self.flush();
        Ok(())
    }

    // ─── User and package events ────────────────────────────────────────

    fn reapply_user_scoped_policy(&mut self) {
        self.apply_oem_preference();
        self.apply_profile_preferences();
        self.apply_lockdown();
        self.update_network_allowlist();
        self.flush();
    }

    pub fn on_user_added(&mut self, user: UserId) {
        info!(user, "user added");
        self.reapply_user_scoped_policy();
    }

    pub fn on_user_removed(&mut self, user: UserId) {
        info!(user, "user removed");
        self.policies.profile.remove(&user);
        self.reapply_user_scoped_policy();
    }

    /// Package installs and removals change the UIDs OEM preferences cover.
    pub fn on_packages_changed(&mut self) {
        debug!("packages changed");
        self.apply_oem_preference();
        self.flush();
    }
}
