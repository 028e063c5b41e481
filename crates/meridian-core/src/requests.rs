//! App-facing request registration.
//!
//! Every entry point validates and permission-checks the filter, scopes it
//! to the caller's UID, registers it and runs a pass so the caller learns
//! about matching networks in the same batch.

use std::sync::Arc;
use std::time::Duration;

use meridian_common::{
    ArbiterError, LegacyType, NetworkCapabilities, NetworkRequest, RequestId, RequestType,
    UidRangeSet,
};
use tracing::{debug, info};

use crate::arbiter::Arbiter;
use crate::backend::Permission;
use crate::callback::NetworkListener;
use crate::policy::internet_caps;
use crate::registry::{NetworkRequestInfo, RequestOrigin, SessionId};
use crate::timer::TimerEvent;

/// Identity of whoever registers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    /// Requests tied to a session go away together in [`Arbiter::release_session`].
    pub session: Option<SessionId>,
}

impl Caller {
    pub fn new(uid: u32) -> Self {
        Self { uid, session: None }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Deliver `Unavailable` and drop the request if nothing satisfies it in time.
    pub timeout: Option<Duration>,
    /// Registering the same key again replaces the earlier request.
    pub intent: Option<String>,
    /// Match networks that do not apply to the caller's UID.
    pub include_other_uid_networks: bool,
    pub legacy_type: Option<LegacyType>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }
}

impl Arbiter {
    fn has_permission(&self, uid: u32, permission: Permission) -> bool {
        self.deps.policy.has_permission(uid, permission)
    }

    /// Checks a caller-built filter and turns it into a request layer.
    fn build_app_layer(
        &mut self,
        caller: Caller,
        kind: RequestType,
        mut caps: NetworkCapabilities,
        options: &RequestOptions,
    ) -> Result<NetworkRequest, ArbiterError> {
        let keeps_alive = matches!(kind, RequestType::Request | RequestType::BackgroundRequest);
        if kind != RequestType::Listen {
            caps.maybe_mark_restricted();
        }
        if keeps_alive
            && caps.is_restricted()
            && !self.has_permission(caller.uid, Permission::UseRestrictedNetworks)
        {
            return Err(ArbiterError::denied("restricted networks need permission"));
        }
        if caps.signal_strength().is_some()
            && !self.has_permission(caller.uid, Permission::SignalStrengthWakeup)
        {
            return Err(ArbiterError::denied("signal strength filters need permission"));
        }
        let settings = self.has_permission(caller.uid, Permission::NetworkSettings);
        if !caps.allowed_uids().is_empty() && !settings {
            return Err(ArbiterError::denied("allowed uids need network settings"));
        }
        if options.include_other_uid_networks && !settings {
            return Err(ArbiterError::denied(
                "other uids' networks need network settings",
            ));
        }
        if kind == RequestType::BackgroundRequest && !settings {
            return Err(ArbiterError::denied("background requests need network settings"));
        }
        if !options.include_other_uid_networks {
            caps.set_uids(Some(UidRangeSet::from_uids([caller.uid])));
        }
        let mut layer = NetworkRequest::new(RequestId::NONE, kind, caps, caller.uid);
        if let Some(legacy) = options.legacy_type {
            layer.legacy_type = legacy;
        }
        layer.validate()?;
        layer.id = self.registry.next_id();
        Ok(layer)
    }

    /// Registers `nri` for the caller and runs a pass.
    fn register_app_request(
        &mut self,
        caller: Caller,
        mut nri: NetworkRequestInfo,
        listener: Arc<dyn NetworkListener>,
        options: RequestOptions,
    ) -> Result<RequestId, ArbiterError> {
        nri.listener = Some(listener);
        nri.session = caller.session;
        nri.timeout = options.timeout;
        nri.privileged = self.has_permission(caller.uid, Permission::NetworkSettings);
        if let Some(intent) = &options.intent {
            if let Some(old) = self.registry.find_by_intent(caller.uid, intent) {
                debug!(request = %old, "replacing request with the same intent");
                self.remove_request_internal(old);
            }
        }
        nri.intent = options.intent;
        let kinds: Vec<RequestType> = nri.layers.iter().map(|l| l.kind).collect();
        let id = self.registry.register(nri)?;
        if let Some(timeout) = options.timeout {
            let at = self.clock.now() + timeout;
            let handle = self.timers.schedule(at, TimerEvent::RequestTimeout { request: id });
            if let Some(nri) = self.registry.get_mut(id) {
                nri.timeout_handle = Some(handle);
            }
        }
        info!(request = %id, uid = caller.uid, ?kinds, "request registered");
        self.rematch_all();
        self.flush();
        Ok(id)
    }

    fn register_single(
        &mut self,
        caller: Caller,
        kind: RequestType,
        caps: NetworkCapabilities,
        listener: Arc<dyn NetworkListener>,
        options: RequestOptions,
    ) -> Result<RequestId, ArbiterError> {
        self.registry.check_limit(caller.uid)?;
        let layer = self.build_app_layer(caller, kind, caps, &options)?;
        let nri = NetworkRequestInfo::new(layer.id, vec![layer], caller.uid, RequestOrigin::App);
        self.register_app_request(caller, nri, listener, options)
    }

    /// Asks for the best network matching `caps` and keeps it up.
    pub fn request_network(
        &mut self,
        caller: Caller,
        caps: NetworkCapabilities,
        listener: Arc<dyn NetworkListener>,
        options: RequestOptions,
    ) -> Result<RequestId, ArbiterError> {
        self.register_single(caller, RequestType::Request, caps, listener, options)
    }

    /// Like [`request_network`](Self::request_network) without putting the
    /// network in the foreground.
    pub fn request_background_network(
        &mut self,
        caller: Caller,
        caps: NetworkCapabilities,
        listener: Arc<dyn NetworkListener>,
    ) -> Result<RequestId, ArbiterError> {
        self.register_single(
            caller,
            RequestType::BackgroundRequest,
            caps,
            listener,
            RequestOptions::default(),
        )
    }

    /// Observes every network matching `caps`.
    pub fn listen_network(
        &mut self,
        caller: Caller,
        caps: NetworkCapabilities,
        listener: Arc<dyn NetworkListener>,
        options: RequestOptions,
    ) -> Result<RequestId, ArbiterError> {
        self.register_single(caller, RequestType::Listen, caps, listener, options)
    }

    /// Follows the best network matching `caps` without keeping it up.
    pub fn register_best_matching_network_callback(
        &mut self,
        caller: Caller,
        caps: NetworkCapabilities,
        listener: Arc<dyn NetworkListener>,
    ) -> Result<RequestId, ArbiterError> {
        self.register_single(
            caller,
            RequestType::ListenForBest,
            caps,
            listener,
            RequestOptions::default(),
        )
    }

    /// Follows the caller's default network, including per-app policy and
    /// VPNs that apply to the caller.
    pub fn register_default_network_callback(
        &mut self,
        caller: Caller,
        listener: Arc<dyn NetworkListener>,
    ) -> Result<RequestId, ArbiterError> {
        self.registry.check_limit(caller.uid)?;
        let layers = self.default_layers_for_uid(caller.uid);
        let Some(id) = layers.first().map(|l| l.id) else {
            return Err(ArbiterError::Internal("no default layers".into()));
        };
        let mut nri = NetworkRequestInfo::new(id, layers, caller.uid, RequestOrigin::App);
        nri.tracks_default = true;
        self.register_app_request(caller, nri, listener, RequestOptions::default())
    }

    /// Follows the system default network, ignoring per-app policy.
    pub fn register_system_default_network_callback(
        &mut self,
        caller: Caller,
        listener: Arc<dyn NetworkListener>,
    ) -> Result<RequestId, ArbiterError> {
        if !self.has_permission(caller.uid, Permission::NetworkSettings) {
            return Err(ArbiterError::denied(
                "system default callbacks need network settings",
            ));
        }
        self.registry.check_limit(caller.uid)?;
        let id = self.registry.next_id();
        let layer = NetworkRequest::new(
            id,
            RequestType::TrackSystemDefault,
            internet_caps(),
            caller.uid,
        );
        let nri = NetworkRequestInfo::new(id, vec![layer], caller.uid, RequestOrigin::App);
        self.register_app_request(caller, nri, listener, RequestOptions::default())
    }

    /// Replaces the filter of a single-layer app request.
    pub fn update_request(
        &mut self,
        id: RequestId,
        caps: NetworkCapabilities,
    ) -> Result<(), ArbiterError> {
        let nri = self
            .registry
            .get(id)
            .ok_or(ArbiterError::UnknownRequest(id))?;
        if nri.origin != RequestOrigin::App || nri.is_multilayer() || nri.tracks_default {
            return Err(ArbiterError::invalid(format!("{id} cannot be updated")));
        }
        let Some(old) = nri.layers.first() else {
            return Err(ArbiterError::UnknownRequest(id));
        };
        let caller = Caller {
            uid: nri.uid,
            session: nri.session,
        };
        let kind = old.kind;
        let options = RequestOptions {
            include_other_uid_networks: old.capabilities.uids().is_none(),
            legacy_type: Some(old.legacy_type),
            ..RequestOptions::default()
        };
        let mut layer = self.build_app_layer(caller, kind, caps, &options)?;
        layer.id = id;
        if let Some(nri) = self.registry.get_mut(id) {
            nri.layers = vec![layer];
        }
        debug!(request = %id, "request updated");
        self.rematch_all();
        self.flush();
        Ok(())
    }

    /// Drops an app request. Its network may be torn down in the same pass.
    pub fn unregister(&mut self, id: RequestId) -> Result<(), ArbiterError> {
        match self.registry.get(id) {
            Some(nri) if nri.origin == RequestOrigin::App => {}
            _ => return Err(ArbiterError::UnknownRequest(id)),
        }
        info!(request = %id, "request unregistered");
        self.remove_request_internal(id);
        self.rematch_all();
        self.flush();
        Ok(())
    }

    /// Drops every request registered under `session`, e.g. when the
    /// process holding them dies. Returns how many were dropped.
    pub fn release_session(&mut self, session: SessionId) -> usize {
        let ids = self.registry.by_session(session);
        for id in &ids {
            self.remove_request_internal(*id);
        }
        if !ids.is_empty() {
            info!(session = session.0, requests = ids.len(), "session released");
            self.rematch_all();
            self.flush();
        }
        ids.len()
    }

    /// Removes a request and detaches it from every network, without a pass.
    pub(crate) fn remove_request_internal(&mut self, id: RequestId) {
        let Some(nri) = self.registry.unregister(id) else {
            return;
        };
        if let Some(h) = nri.timeout_handle {
            self.timers.cancel(h);
        }
        for rec in self.networks.values_mut() {
            for layer in &nri.layers {
                rec.remove_request(layer.id);
                rec.unlinger_request(layer.id);
            }
        }
        debug!(request = %id, "request removed");
    }
}
