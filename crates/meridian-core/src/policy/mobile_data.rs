use std::collections::BTreeSet;

use meridian_common::{NetworkCapabilities, RequestType, Transport, UidRangeSet};
use tracing::info;

use super::{Completion, PolicyKind, PolicyRequestSpec, internet_caps};
use crate::arbiter::Arbiter;

/// Cellular if available, else the system default.
pub(crate) fn mobile_data_layers() -> Vec<(RequestType, NetworkCapabilities)> {
    vec![
        (
            RequestType::Request,
            internet_caps().with_transport(Transport::Cellular),
        ),
        (RequestType::TrackDefault, internet_caps()),
    ]
}

impl Arbiter {
    /// Replaces the set of UIDs that prefer mobile data.
    pub fn set_mobile_data_preferred_uids(
        &mut self,
        uids: BTreeSet<u32>,
        on_complete: Option<Completion>,
    ) {
        info!(count = uids.len(), "mobile data preferred uids updated");
        self.policies.mobile_data_uids = uids;
        self.apply_mobile_data_preference();
        self.flush();
        if let Some(done) = on_complete {
            done();
        }
    }

    pub(crate) fn apply_mobile_data_preference(&mut self) {
        let uids = UidRangeSet::from_uids(self.policies.mobile_data_uids.iter().copied());
        let specs = if uids.is_empty() {
            Vec::new()
        } else {
            vec![PolicyRequestSpec {
                kind: PolicyKind::MobileData,
                layers: mobile_data_layers(),
                uids,
            }]
        };
        self.replace_policy_requests(PolicyKind::MobileData, specs);
    }
}
