//! Bookkeeping of every live request.
//!
//! A registered request ([`NetworkRequestInfo`]) holds one or more layers.
//! App requests have one; policy requests stack several, evaluated in
//! order. The request id is the id of its first layer.
//!
//! App requests count against a per-UID budget. Internal requests (the
//! system default, policy layers) are not counted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use meridian_common::uid::FIRST_APPLICATION_UID;
use meridian_common::{ArbiterError, NetId, NetworkRequest, RequestId, UidRangeSet};
use meridian_common::ids::RequestIdAllocator;

use crate::callback::{BlockedReasons, NetworkListener};
use crate::config::LimitConfig;
use crate::policy::PolicyKind;
use crate::timer::TimerHandle;

/// Handle tying requests to the process that registered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    App,
    SystemDefault,
    Policy(PolicyKind),
}

pub struct NetworkRequestInfo {
    pub id: RequestId,
    pub layers: Vec<NetworkRequest>,
    /// Registering UID.
    pub uid: u32,
    pub session: Option<SessionId>,
    pub listener: Option<Arc<dyn NetworkListener>>,
    pub origin: RequestOrigin,
    /// UIDs whose default network this request decides (policy requests).
    pub uids: Option<UidRangeSet>,
    pub preference_order: u32,
    pub satisfier: Option<NetId>,
    /// Layer currently attached to the satisfier.
    pub active_layer: Option<RequestId>,
    pub timeout: Option<Duration>,
    pub(crate) timeout_handle: Option<TimerHandle>,
    /// Delivery key; registering the same key again replaces the request.
    pub intent: Option<String>,
    /// May see unredacted capabilities.
    pub privileged: bool,
    /// App default-network callback whose layers follow policy changes.
    pub tracks_default: bool,
    /// Last blocked status sent, per network.
    pub(crate) blocked: BTreeMap<NetId, BlockedReasons>,
    counted: bool,
}

impl NetworkRequestInfo {
    pub fn new(id: RequestId, layers: Vec<NetworkRequest>, uid: u32, origin: RequestOrigin) -> Self {
        Self {
            id,
            layers,
            uid,
            session: None,
            listener: None,
            origin,
            uids: None,
            preference_order: 0,
            satisfier: None,
            active_layer: None,
            timeout: None,
            timeout_handle: None,
            intent: None,
            privileged: false,
            tracks_default: false,
            blocked: BTreeMap::new(),
            counted: origin == RequestOrigin::App,
        }
    }

    pub fn is_multilayer(&self) -> bool {
        self.layers.len() > 1
    }

    /// A plain listen: observes networks, takes no part in ranking.
    pub fn is_listen_only(&self) -> bool {
        !self.is_multilayer() && self.layers.first().is_some_and(|r| r.is_listen())
    }

    pub fn active_request(&self) -> Option<&NetworkRequest> {
        let active = self.active_layer?;
        self.layers.iter().find(|r| r.id == active)
    }

    pub fn layer(&self, id: RequestId) -> Option<&NetworkRequest> {
        self.layers.iter().find(|r| r.id == id)
    }

    pub fn is_counted(&self) -> bool {
        self.counted
    }
}

pub struct RequestRegistry {
    nris: BTreeMap<RequestId, NetworkRequestInfo>,
    per_uid: HashMap<u32, usize>,
    ids: RequestIdAllocator,
    limits: LimitConfig,
}

impl RequestRegistry {
    pub fn new(limits: LimitConfig) -> Self {
        Self {
            nris: BTreeMap::new(),
            per_uid: HashMap::new(),
            ids: RequestIdAllocator::default(),
            limits,
        }
    }

    pub fn next_id(&mut self) -> RequestId {
        self.ids.allocate()
    }

    pub fn limit_for(&self, uid: u32) -> usize {
        if uid < FIRST_APPLICATION_UID {
            self.limits.max_requests_per_system_uid
        } else {
            self.limits.max_requests_per_uid
        }
    }

    pub fn check_limit(&self, uid: u32) -> Result<(), ArbiterError> {
        let limit = self.limit_for(uid);
        if self.count_for_uid(uid) >= limit {
            return Err(ArbiterError::TooManyRequests { uid, limit });
        }
        Ok(())
    }

    pub fn register(&mut self, nri: NetworkRequestInfo) -> Result<RequestId, ArbiterError> {
        if nri.counted {
            self.check_limit(nri.uid)?;
            *self.per_uid.entry(nri.uid).or_insert(0) += 1;
        }
        let id = nri.id;
        self.nris.insert(id, nri);
        Ok(id)
    }

    /// Removes the request, releasing its budget slot exactly once.
    pub fn unregister(&mut self, id: RequestId) -> Option<NetworkRequestInfo> {
        let nri = self.nris.remove(&id)?;
        if nri.counted {
            if let Some(n) = self.per_uid.get_mut(&nri.uid) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    self.per_uid.remove(&nri.uid);
                }
            }
        }
        Some(nri)
    }

    pub fn get(&self, id: RequestId) -> Option<&NetworkRequestInfo> {
        self.nris.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut NetworkRequestInfo> {
        self.nris.get_mut(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.nris.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nris.is_empty()
    }

    /// Every request, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkRequestInfo> {
        self.nris.values()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.nris.keys().copied().collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&NetworkRequestInfo)) {
        for nri in self.nris.values() {
            f(nri);
        }
    }

    pub fn requests_sorted_by_id(&self) -> Vec<&NetworkRequestInfo> {
        self.nris.values().collect()
    }

    pub fn find_by_intent(&self, uid: u32, intent: &str) -> Option<RequestId> {
        self.nris
            .values()
            .find(|n| n.uid == uid && n.intent.as_deref() == Some(intent))
            .map(|n| n.id)
    }

    pub fn by_session(&self, session: SessionId) -> Vec<RequestId> {
        self.nris
            .values()
            .filter(|n| n.session == Some(session))
            .map(|n| n.id)
            .collect()
    }

    pub fn count_for_uid(&self, uid: u32) -> usize {
        self.per_uid.get(&uid).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::{NetworkCapabilities, RequestType};

    fn registry(limit: usize) -> RequestRegistry {
        RequestRegistry::new(LimitConfig {
            max_requests_per_uid: limit,
            max_requests_per_system_uid: limit * 2,
        })
    }

    fn app_nri(reg: &mut RequestRegistry, uid: u32) -> NetworkRequestInfo {
        let id = reg.next_id();
        let layer = NetworkRequest::new(
            id,
            RequestType::Request,
            NetworkCapabilities::request_default(),
            uid,
        );
        NetworkRequestInfo::new(id, vec![layer], uid, RequestOrigin::App)
    }

    #[test]
    fn per_uid_limit_is_enforced_and_released() {
        let mut reg = registry(2);
        let a = app_nri(&mut reg, 10_001);
        let a = reg.register(a).unwrap();
        let b = app_nri(&mut reg, 10_001);
        reg.register(b).unwrap();
        let c = app_nri(&mut reg, 10_001);
        assert_eq!(
            reg.register(c),
            Err(ArbiterError::TooManyRequests {
                uid: 10_001,
                limit: 2
            })
        );
        // Other UIDs have their own budget.
        let d = app_nri(&mut reg, 10_002);
        assert!(reg.register(d).is_ok());

        assert!(reg.unregister(a).is_some());
        assert!(reg.unregister(a).is_none());
        assert_eq!(reg.count_for_uid(10_001), 1);
        let e = app_nri(&mut reg, 10_001);
        assert!(reg.register(e).is_ok());
    }

    #[test]
    fn system_uids_get_a_larger_budget() {
        let reg = registry(3);
        assert_eq!(reg.limit_for(1000), 6);
        assert_eq!(reg.limit_for(10_500), 3);
    }

    #[test]
    fn internal_requests_are_not_counted() {
        let mut reg = registry(1);
        for _ in 0..3 {
            let id = reg.next_id();
            let nri = NetworkRequestInfo::new(id, Vec::new(), 1000, RequestOrigin::SystemDefault);
            assert!(reg.register(nri).is_ok());
        }
        assert_eq!(reg.count_for_uid(1000), 0);
    }

    #[test]
    fn lookup_by_intent_and_session() {
        let mut reg = registry(10);
        let mut nri = app_nri(&mut reg, 10_001);
        nri.intent = Some("alarm".into());
        nri.session = Some(SessionId(9));
        let id = reg.register(nri).unwrap();
        assert_eq!(reg.find_by_intent(10_001, "alarm"), Some(id));
        assert_eq!(reg.find_by_intent(10_002, "alarm"), None);
        assert_eq!(reg.by_session(SessionId(9)), vec![id]);
        assert_eq!(reg.requests_sorted_by_id().len(), 1);
    }
}
