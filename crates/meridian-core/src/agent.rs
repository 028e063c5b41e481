use std::time::Duration;

use meridian_common::{LegacyType, NetId};

use crate::backend::VpnType;

/// The side of a network that lives outside the arbiter: a radio driver,
/// an Ethernet port, a VPN tunnel.
pub trait NetworkAgent: Send + Sync {
    /// The backend network object exists; routes may be used.
    fn on_network_created(&self, _net: NetId) {}
    /// No request wants the network any more. The agent should shut the
    /// link down; the arbiter destroys the network after the teardown delay.
    fn on_network_unwanted(&self, net: NetId);
    /// The backend network object is gone.
    fn on_network_destroyed(&self, _net: NetId) {}
    fn on_revalidation_requested(&self, _net: NetId) {}
}

/// Registration-time settings of an agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Derived from the transports when `None`.
    pub legacy_type: Option<LegacyType>,
    /// The user picked this network by hand.
    pub explicitly_selected: bool,
    /// Keep using the network even if it never validates.
    pub accept_unvalidated: bool,
    pub accept_partial_connectivity: bool,
    /// Required for networks with the VPN transport.
    pub vpn_type: Option<VpnType>,
    /// Apps cannot bypass this VPN.
    pub secure_vpn: bool,
    /// Delay between "unwanted" and the final destroy.
    pub teardown_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            legacy_type: None,
            explicitly_selected: false,
            accept_unvalidated: false,
            accept_partial_connectivity: false,
            vpn_type: None,
            secure_vpn: true,
            teardown_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationStatus {
    Valid,
    /// Some probes passed; the network works for part of the internet.
    Partial,
    CaptivePortal,
    Invalid,
}

/// Outcome of one network evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub probes_attempted: u32,
    pub probes_succeeded: u32,
    pub redirect_url: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            status: ValidationStatus::Valid,
            probes_attempted: 1,
            probes_succeeded: 1,
            redirect_url: None,
        }
    }

    pub fn invalid() -> Self {
        Self {
            status: ValidationStatus::Invalid,
            probes_attempted: 1,
            probes_succeeded: 0,
            redirect_url: None,
        }
    }

    pub fn partial() -> Self {
        Self {
            status: ValidationStatus::Partial,
            probes_attempted: 2,
            probes_succeeded: 1,
            redirect_url: None,
        }
    }

    pub fn captive_portal(url: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::CaptivePortal,
            probes_attempted: 1,
            probes_succeeded: 0,
            redirect_url: Some(url.into()),
        }
    }
}
