//! Per-profile network preference: route a user's apps onto enterprise
//! networks, with or without fallback, or block them elsewhere entirely.

use meridian_common::{
    ArbiterError, Capability, EnterpriseId, NetId, NetworkCapabilities, RequestType, UidRange,
    UidRangeSet, UserId,
};

use super::{Completion, PolicyKind, PolicyRequestSpec, check_disjoint, internet_caps};
use crate::arbiter::Arbiter;
use crate::backend::AllowlistConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilePreferenceKind {
    /// No preference: the system default applies.
    Default,
    /// Enterprise network if available, else the system default.
    Enterprise,
    /// Enterprise network or nothing.
    EnterpriseNoFallback,
    /// Enterprise network or nothing, and blocked on every other network.
    EnterpriseBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileNetworkPreference {
    pub kind: ProfilePreferenceKind,
    pub enterprise_id: u8,
    /// Only these UIDs, instead of the whole user.
    pub included_uids: Vec<u32>,
    /// The whole user except these UIDs.
    pub excluded_uids: Vec<u32>,
}

impl ProfileNetworkPreference {
    pub fn new(kind: ProfilePreferenceKind) -> Self {
        Self {
            kind,
            enterprise_id: 1,
            included_uids: Vec::new(),
            excluded_uids: Vec::new(),
        }
    }

    pub fn with_enterprise_id(mut self, id: u8) -> Self {
        self.enterprise_id = id;
        self
    }

    pub fn with_included_uids(mut self, uids: impl IntoIterator<Item = u32>) -> Self {
        self.included_uids = uids.into_iter().collect();
        self
    }

    pub fn with_excluded_uids(mut self, uids: impl IntoIterator<Item = u32>) -> Self {
        self.excluded_uids = uids.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedProfilePreference {
    pub kind: ProfilePreferenceKind,
    pub enterprise_id: EnterpriseId,
    pub uids: UidRangeSet,
}

/// Validates `prefs` for `user` and resolves the UIDs each one covers.
pub(crate) fn resolve(
    user: UserId,
    prefs: &[ProfileNetworkPreference],
) -> Result<Vec<ResolvedProfilePreference>, ArbiterError> {
    let user_range = UidRange::for_user(user);
    let mut out = Vec::with_capacity(prefs.len());
    for pref in prefs {
        if !pref.included_uids.is_empty() && !pref.excluded_uids.is_empty() {
            return Err(ArbiterError::invalid(
                "included and excluded uids cannot both be set",
            ));
        }
        if let Some(uid) = pref
            .included_uids
            .iter()
            .chain(&pref.excluded_uids)
            .find(|u| !user_range.contains_uid(**u))
        {
            return Err(ArbiterError::invalid(format!(
                "uid {uid} does not belong to user {user}"
            )));
        }
        let enterprise_id = EnterpriseId::new(pref.enterprise_id)?;
        let uids = if pref.included_uids.is_empty() {
            UidRangeSet::from(user_range).difference(&UidRangeSet::from_uids(
                pref.excluded_uids.iter().copied(),
            ))
        } else {
            UidRangeSet::from_uids(pref.included_uids.iter().copied())
        };
        out.push(ResolvedProfilePreference {
            kind: pref.kind,
            enterprise_id,
            uids,
        });
    }
    check_disjoint(out.iter().map(|p| &p.uids))?;
    Ok(out)
}

pub(crate) fn enterprise_caps(id: EnterpriseId) -> NetworkCapabilities {
    internet_caps()
        .with_capability(Capability::Enterprise)
        .with_enterprise_id(id)
}

pub(crate) fn profile_layers(
    pref: &ResolvedProfilePreference,
) -> Vec<(RequestType, NetworkCapabilities)> {
    let enterprise = (RequestType::Request, enterprise_caps(pref.enterprise_id));
    match pref.kind {
        ProfilePreferenceKind::Default => Vec::new(),
        ProfilePreferenceKind::Enterprise => {
            vec![enterprise, (RequestType::TrackDefault, internet_caps())]
        }
        ProfilePreferenceKind::EnterpriseNoFallback | ProfilePreferenceKind::EnterpriseBlocking => {
            vec![enterprise]
        }
    }
}

/// Allow-list per network for blocking preferences: every user's UIDs,
/// minus the UIDs of each blocking preference the network does not serve.
/// Empty when no blocking preference is installed.
pub(crate) fn compute_allowlist<'a>(
    all_users: &UidRangeSet,
    blocking: &[&ResolvedProfilePreference],
    networks: impl IntoIterator<Item = (NetId, &'a NetworkCapabilities)>,
) -> Vec<AllowlistConfig> {
    if blocking.is_empty() {
        return Vec::new();
    }
    networks
        .into_iter()
        .map(|(net_id, caps)| {
            let mut uids = all_users.clone();
            for pref in blocking {
                let filter = enterprise_caps(pref.enterprise_id);
                if !filter.satisfied_by(caps) {
                    uids = uids.difference(&pref.uids);
                }
            }
            AllowlistConfig { net_id, uids }
        })
        .collect()
}

impl Arbiter {
    /// Replaces the profile preferences of `user`. Invalid input changes nothing.
    pub fn set_profile_network_preferences(
        &mut self,
        user: UserId,
        prefs: Vec<ProfileNetworkPreference>,
        on_complete: Option<Completion>,
    ) -> Result<(), ArbiterError> {
        let resolved = resolve(user, &prefs)?;
        if resolved.is_empty() {
            self.policies.profile.remove(&user);
        } else {
            self.policies.profile.insert(user, resolved);
        }
        self.apply_profile_preferences();
        self.flush();
        if let Some(done) = on_complete {
            done();
        }
        Ok(())
    }

    pub(crate) fn apply_profile_preferences(&mut self) {
        let specs = self
            .policies
            .profile
            .values()
            .flatten()
            .filter(|p| p.kind != ProfilePreferenceKind::Default)
            .map(|p| PolicyRequestSpec {
                kind: PolicyKind::Profile,
                layers: profile_layers(p),
                uids: p.uids.clone(),
            })
            .collect();
        self.replace_policy_requests(PolicyKind::Profile, specs);
    }

    /// Pushes the blocking allow-list when it changes.
    pub(crate) fn update_network_allowlist(&mut self) {
        let blocking: Vec<&ResolvedProfilePreference> = self
            .policies
            .profile
            .values()
            .flatten()
            .filter(|p| p.kind == ProfilePreferenceKind::EnterpriseBlocking)
            .collect();
        let all_users = UidRangeSet::for_users(self.deps.policy.users());
        let configs = compute_allowlist(
            &all_users,
            &blocking,
            self.networks
                .values()
                .filter(|n| n.is_connected())
                .map(|n| (n.id, &n.caps)),
        );
        if configs == self.allowlist {
            return;
        }
        if let Err(e) = self.deps.backend.set_network_allowlist(&configs) {
            tracing::warn!(error = %e, "failed to set network allowlist");
        }
        self.allowlist = configs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::Transport;

    const USER: UserId = 10;

    fn uid(app: u32) -> u32 {
        USER * meridian_common::uid::PER_USER_RANGE + app
    }

    #[test]
    fn whole_user_minus_excluded() {
        let prefs = [ProfileNetworkPreference::new(ProfilePreferenceKind::Enterprise)
            .with_excluded_uids([uid(10_001)])];
        let resolved = resolve(USER, &prefs).unwrap();
        assert!(!resolved[0].uids.contains_uid(uid(10_001)));
        assert!(resolved[0].uids.contains_uid(uid(10_002)));
        assert_eq!(
            resolved[0].uids.uid_count(),
            UidRange::for_user(USER).count() - 1
        );
    }

    #[test]
    fn rejects_bad_input() {
        let both = ProfileNetworkPreference::new(ProfilePreferenceKind::Enterprise)
            .with_included_uids([uid(10_001)])
            .with_excluded_uids([uid(10_002)]);
        assert!(resolve(USER, &[both]).is_err());

        let bad_id = ProfileNetworkPreference::new(ProfilePreferenceKind::Enterprise)
            .with_enterprise_id(6);
        assert!(resolve(USER, &[bad_id]).is_err());

        let foreign = ProfileNetworkPreference::new(ProfilePreferenceKind::Enterprise)
            .with_included_uids([10_001]);
        assert!(resolve(USER, &[foreign]).is_err());

        let a = ProfileNetworkPreference::new(ProfilePreferenceKind::Enterprise)
            .with_included_uids([uid(10_001)]);
        let whole = ProfileNetworkPreference::new(ProfilePreferenceKind::EnterpriseBlocking);
        assert!(resolve(USER, &[a, whole]).is_err());
    }

    #[test]
    fn layers_per_kind() {
        let id = EnterpriseId::new(2).unwrap();
        let pref = |kind| ResolvedProfilePreference {
            kind,
            enterprise_id: id,
            uids: UidRangeSet::from_uids([uid(10_001)]),
        };
        let with_fallback = profile_layers(&pref(ProfilePreferenceKind::Enterprise));
        assert_eq!(with_fallback.len(), 2);
        assert!(with_fallback[0].1.enterprise_ids().contains(&id));
        assert_eq!(profile_layers(&pref(ProfilePreferenceKind::EnterpriseBlocking)).len(), 1);
        assert!(profile_layers(&pref(ProfilePreferenceKind::Default)).is_empty());
    }

    #[test]
    fn blocking_allowlist_excludes_profile_uids_from_other_networks() {
        let id = EnterpriseId::new(1).unwrap();
        let blocked_uid = uid(10_001);
        let pref = ResolvedProfilePreference {
            kind: ProfilePreferenceKind::EnterpriseBlocking,
            enterprise_id: id,
            uids: UidRangeSet::from_uids([blocked_uid]),
        };
        let all = UidRangeSet::from(UidRange::for_user(USER));
        let wifi = internet_caps().with_transport(Transport::Wifi);
        let work = enterprise_caps(id).with_transport(Transport::Cellular);
        let configs =
            compute_allowlist(&all, &[&pref], [(NetId(101), &wifi), (NetId(102), &work)]);
        assert_eq!(configs.len(), 2);
        assert_eq!(
            configs[0].uids,
            all.difference(&UidRangeSet::from_uids([blocked_uid]))
        );
        assert_eq!(configs[1].uids, all);
        assert!(compute_allowlist(&all, &[], [(NetId(101), &wifi)]).is_empty());
    }
}
