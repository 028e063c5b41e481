//! Full score: the agent-declared [`NetworkScore`] plus everything the
//! arbiter knows about the network that the agent does not.

use meridian_common::caps::{Flag, FlagSet};
use meridian_common::{Capability, KeepConnectedReason, NetworkCapabilities, NetworkScore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    IsValidated,
    EverValidated,
    EverEvaluated,
    IsVpn,
    EverUserSelected,
    AcceptUnvalidated,
    AvoidedWhenUnvalidated,
    IsUnmetered,
    /// Never loses to anything.
    IsInvincible,
    /// Torn down, waiting for the final destroy.
    IsDestroyed,
    YieldToBadWifi,
    TransportPrimary,
    Exiting,
}

impl Flag for Policy {
    const ALL: &'static [Self] = &[
        Policy::IsValidated,
        Policy::EverValidated,
        Policy::EverEvaluated,
        Policy::IsVpn,
        Policy::EverUserSelected,
        Policy::AcceptUnvalidated,
        Policy::AvoidedWhenUnvalidated,
        Policy::IsUnmetered,
        Policy::IsInvincible,
        Policy::IsDestroyed,
        Policy::YieldToBadWifi,
        Policy::TransportPrimary,
        Policy::Exiting,
    ];

    fn index(self) -> u32 {
        self as u32
    }
}

pub type PolicySet = FlagSet<Policy>;

/// Arbiter-side facts about a network that feed its score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreFacts {
    pub validated: bool,
    pub ever_validated: bool,
    pub ever_evaluated: bool,
    pub explicitly_selected: bool,
    pub accept_unvalidated: bool,
    /// The user asked to stop using this network while it is unvalidated.
    pub avoid_unvalidated: bool,
    pub destroyed: bool,
    pub invincible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullScore {
    policies: PolicySet,
    pub legacy_int: i32,
    pub keep_connected: KeepConnectedReason,
}

impl FullScore {
    /// `avoid_bad_wifi` is the current platform setting: when on, networks
    /// no longer yield to bad Wi-Fi and degraded Wi-Fi is avoided.
    pub fn compute(
        score: &NetworkScore,
        caps: &NetworkCapabilities,
        facts: &ScoreFacts,
        avoid_bad_wifi: bool,
    ) -> Self {
        let mut p = PolicySet::empty();
        p.set(Policy::IsValidated, facts.validated);
        p.set(Policy::EverValidated, facts.ever_validated);
        p.set(Policy::EverEvaluated, facts.ever_evaluated);
        p.set(Policy::IsVpn, caps.is_vpn());
        p.set(Policy::EverUserSelected, facts.explicitly_selected);
        p.set(Policy::AcceptUnvalidated, facts.accept_unvalidated);
        let degraded_wifi = facts.ever_validated
            && avoid_bad_wifi
            && caps.has_transport(meridian_common::Transport::Wifi);
        p.set(
            Policy::AvoidedWhenUnvalidated,
            !facts.validated && (facts.avoid_unvalidated || degraded_wifi),
        );
        p.set(Policy::IsUnmetered, caps.has_capability(Capability::NotMetered));
        p.set(Policy::IsInvincible, facts.invincible);
        p.set(Policy::IsDestroyed, facts.destroyed);
        p.set(Policy::YieldToBadWifi, score.yield_to_bad_wifi && !avoid_bad_wifi);
        p.set(Policy::TransportPrimary, score.transport_primary);
        p.set(Policy::Exiting, score.exiting);
        Self {
            policies: p,
            legacy_int: score.legacy_int,
            keep_connected: score.keep_connected,
        }
    }

    /// Score an offer would have once up. Offers are assumed to validate if
    /// they provide internet.
    pub fn prospective(score: &NetworkScore, caps: &NetworkCapabilities, avoid_bad_wifi: bool) -> Self {
        let facts = ScoreFacts {
            validated: caps.has_capability(Capability::Internet),
            ..ScoreFacts::default()
        };
        Self::compute(score, caps, &facts, avoid_bad_wifi)
    }

    pub fn has(&self, policy: Policy) -> bool {
        self.policies.contains(policy)
    }

    pub fn policies(&self) -> PolicySet {
        self.policies
    }

    /// Same score as if the network had validated: what it could become.
    pub fn as_if_validated(&self) -> Self {
        let mut out = *self;
        out.policies.insert(Policy::IsValidated);
        out.policies.insert(Policy::EverValidated);
        out.policies.remove(Policy::AvoidedWhenUnvalidated);
        out
    }
}
