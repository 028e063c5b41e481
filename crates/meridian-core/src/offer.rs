//! Network offers: providers that could bring up a network if asked.
//!
//! After every pass each offer is told which requests it could serve
//! better than whatever serves them now. An offer is scored as if the
//! network it would create validated.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use meridian_common::{ArbiterError, NetId, NetworkCapabilities, NetworkRequest, NetworkScore, RequestId};
use tracing::{debug, info, warn};

use crate::arbiter::Arbiter;
use crate::callback::NetworkEvent;
use crate::network::{Candidate, FullScore};
use crate::registry::{NetworkRequestInfo, RequestOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OfferId(pub u64);

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offer{}", self.0)
    }
}

/// Something that can create networks on demand: a radio, a tethering
/// service, a VPN app.
pub trait NetworkProvider: Send + Sync {
    fn on_network_needed(&self, offer: OfferId, request: &NetworkRequest) -> anyhow::Result<()>;
    fn on_network_unneeded(&self, offer: OfferId, request: RequestId) -> anyhow::Result<()>;
}

struct Offer {
    provider: Arc<dyn NetworkProvider>,
    score: NetworkScore,
    caps: NetworkCapabilities,
    /// Requests the provider was last told it is needed for.
    needed: BTreeSet<RequestId>,
}

#[derive(Default)]
pub(crate) struct OfferTable {
    offers: BTreeMap<OfferId, Offer>,
    next_id: u64,
}

impl OfferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }
}

/// Stand-in id for the network an offer would create.
const PROSPECTIVE: NetId = NetId(0);

impl Arbiter {
    pub fn register_offer(
        &mut self,
        provider: Arc<dyn NetworkProvider>,
        score: NetworkScore,
        caps: NetworkCapabilities,
    ) -> Result<OfferId, ArbiterError> {
        caps.check_agent_declared()?;
        let id = OfferId(self.offers.next_id);
        self.offers.next_id += 1;
        info!(offer = %id, "offer registered");
        self.offers.offers.insert(
            id,
            Offer {
                provider,
                score,
                caps,
                needed: BTreeSet::new(),
            },
        );
        self.update_offers();
        Ok(id)
    }

    /// Replaces the score and capabilities of an existing offer.
    pub fn update_offer(
        &mut self,
        id: OfferId,
        score: NetworkScore,
        caps: NetworkCapabilities,
    ) -> Result<(), ArbiterError> {
        caps.check_agent_declared()?;
        let offer = self
            .offers
            .offers
            .get_mut(&id)
            .ok_or_else(|| ArbiterError::invalid(format!("unknown {id}")))?;
        offer.score = score;
        offer.caps = caps;
        self.update_offers();
        Ok(())
    }

    pub fn unregister_offer(&mut self, id: OfferId) -> Result<(), ArbiterError> {
        self.offers
            .offers
            .remove(&id)
            .ok_or_else(|| ArbiterError::invalid(format!("unknown {id}")))?;
        info!(offer = %id, "offer unregistered");
        Ok(())
    }

    /// A provider gave up on `request`. Timed requests learn about it
    /// through `Unavailable`; others are dropped quietly.
    pub fn declare_unfulfillable(&mut self, request: RequestId) -> Result<(), ArbiterError> {
        let nri = self
            .registry
            .get(request)
            .ok_or(ArbiterError::UnknownRequest(request))?;
        if nri.origin != RequestOrigin::App {
            return Err(ArbiterError::invalid(format!(
                "{request} is not an app request"
            )));
        }
        info!(request = %request, "request declared unfulfillable");
        if nri.timeout.is_some() {
            self.notify(request, None, NetworkEvent::Unavailable);
        }
        self.remove_request_internal(request);
        self.rematch_all();
        self.flush();
        Ok(())
    }

    /// Layer of `nri` the offer is needed for, if any.
    fn offer_needed_for<'a>(
        &self,
        nri: &'a NetworkRequestInfo,
        offer_caps: &NetworkCapabilities,
        prospective: &Candidate,
    ) -> Option<&'a NetworkRequest> {
        for layer in &nri.layers {
            let active = nri.active_layer == Some(layer.id);
            if !layer.is_request() {
                if active {
                    return None;
                }
                continue;
            }
            if !layer.can_be_satisfied_by(offer_caps) {
                if active {
                    return None;
                }
                continue;
            }
            if !active {
                return Some(layer);
            }
            let current = nri.satisfier.and_then(|id| self.candidate(id));
            return self
                .ranker()
                .might_beat(current.as_ref(), prospective)
                .then_some(layer);
        }
        None
    }

    /// Tells every provider which requests it is needed for, issuing only
    /// the changes since the last pass.
    pub(crate) fn update_offers(&mut self) {
        let avoid = self.bad_wifi.avoid_bad_wifi();
        let mut calls: Vec<(Arc<dyn NetworkProvider>, OfferId, Option<NetworkRequest>, RequestId)> =
            Vec::new();
        let ids: Vec<OfferId> = self.offers.offers.keys().copied().collect();
        for id in ids {
            let Some(offer) = self.offers.offers.get(&id) else {
                continue;
            };
            let prospective = Candidate {
                id: PROSPECTIVE,
                serial: u64::MAX,
                score: FullScore::prospective(&offer.score, &offer.caps, avoid),
                transports: offer.caps.transports(),
            };
            let mut now_needed: BTreeMap<RequestId, NetworkRequest> = BTreeMap::new();
            for nri in self.registry.iter() {
                if nri.is_listen_only() {
                    continue;
                }
                if let Some(layer) = self.offer_needed_for(nri, &offer.caps, &prospective) {
                    now_needed.insert(nri.id, layer.clone());
                }
            }
            for (req, layer) in &now_needed {
                if !offer.needed.contains(req) {
                    calls.push((Arc::clone(&offer.provider), id, Some(layer.clone()), *req));
                }
            }
            for req in &offer.needed {
                if !now_needed.contains_key(req) {
                    calls.push((Arc::clone(&offer.provider), id, None, *req));
                }
            }
            if let Some(offer) = self.offers.offers.get_mut(&id) {
                offer.needed = now_needed.into_keys().collect();
            }
        }
        for (provider, offer, layer, request) in calls {
            let result = match &layer {
                Some(layer) => {
                    debug!(offer = %offer, request = %request, "network needed");
                    provider.on_network_needed(offer, layer)
                }
                None => {
                    debug!(offer = %offer, request = %request, "network unneeded");
                    provider.on_network_unneeded(offer, request)
                }
            };
            if let Err(e) = result {
                warn!(offer = %offer, request = %request, error = %e, "network provider failed");
            }
        }
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }
}
