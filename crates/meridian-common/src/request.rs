use crate::caps::{NetworkCapabilities, Transport};
use crate::error::ArbiterError;
use crate::ids::RequestId;

/// How a request participates in arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Observes every matching network; keeps nothing alive.
    Listen,
    /// Follows the caller's default network.
    TrackDefault,
    /// Keeps the best matching network alive, in the foreground.
    Request,
    /// Keeps the best matching network alive without making it foreground.
    BackgroundRequest,
    /// Follows the system default network regardless of per-app policy.
    TrackSystemDefault,
    /// Follows the best matching network; keeps nothing alive.
    ListenForBest,
}

/// Coarse network type kept for callers that still think in terms of
/// "the mobile network" or "the wifi network".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LegacyType {
    None,
    Mobile,
    Wifi,
    Bluetooth,
    Ethernet,
    Vpn,
}

impl LegacyType {
    /// Best guess from the transports a network declares.
    pub fn for_capabilities(caps: &NetworkCapabilities) -> Self {
        if caps.has_transport(Transport::Vpn) {
            LegacyType::Vpn
        } else if caps.has_transport(Transport::Ethernet) {
            LegacyType::Ethernet
        } else if caps.has_transport(Transport::Wifi) {
            LegacyType::Wifi
        } else if caps.has_transport(Transport::Bluetooth) {
            LegacyType::Bluetooth
        } else if caps.has_transport(Transport::Cellular) {
            LegacyType::Mobile
        } else {
            LegacyType::None
        }
    }
}

/// One capability filter and the role it plays. A multi-layer request is an
/// ordered list of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub id: RequestId,
    pub kind: RequestType,
    pub capabilities: NetworkCapabilities,
    pub requestor_uid: u32,
    pub legacy_type: LegacyType,
}

impl NetworkRequest {
    pub fn new(
        id: RequestId,
        kind: RequestType,
        capabilities: NetworkCapabilities,
        requestor_uid: u32,
    ) -> Self {
        Self {
            id,
            kind,
            capabilities,
            requestor_uid,
            legacy_type: LegacyType::None,
        }
    }

    pub fn is_listen(&self) -> bool {
        self.kind == RequestType::Listen
    }

    pub fn is_listen_for_best(&self) -> bool {
        self.kind == RequestType::ListenForBest
    }

    /// Requests that keep a network alive.
    pub fn is_request(&self) -> bool {
        matches!(
            self.kind,
            RequestType::Request | RequestType::BackgroundRequest
        )
    }

    pub fn is_foreground_request(&self) -> bool {
        self.kind == RequestType::Request
    }

    pub fn is_background_request(&self) -> bool {
        self.kind == RequestType::BackgroundRequest
    }

    pub fn is_default_tracking(&self) -> bool {
        matches!(
            self.kind,
            RequestType::TrackDefault | RequestType::TrackSystemDefault
        )
    }

    /// Whether a network with `nc` can serve this request.
    pub fn satisfied_by(&self, nc: &NetworkCapabilities) -> bool {
        self.capabilities.satisfied_by(nc) && nc.allows_uid(self.requestor_uid)
    }

    /// Whether an offer advertising `offer` could ever serve this request.
    pub fn can_be_satisfied_by(&self, offer: &NetworkCapabilities) -> bool {
        self.capabilities.satisfied_by_immutable(offer) && offer.allows_uid(self.requestor_uid)
    }

    /// Registration-time validation of a caller-built filter.
    pub fn validate(&self) -> Result<(), ArbiterError> {
        if self.is_request() {
            self.capabilities.check_requestable()?;
        }
        self.capabilities.check_allowed_uids_compatible()?;
        if !self.capabilities.allowed_uids().is_empty() && self.is_default_tracking() {
            return Err(ArbiterError::invalid(
                "allowed uids cannot be used with default-tracking requests",
            ));
        }
        Ok(())
    }
}
