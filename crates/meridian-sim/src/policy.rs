//! In-memory policy source: permissions, package UIDs and users.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use meridian_common::UserId;
use meridian_core::{Permission, PolicyQuery};

use crate::test_util::lock;

#[derive(Default)]
struct PolicyTables {
    grants: BTreeMap<u32, Vec<Permission>>,
    packages: BTreeMap<String, Vec<u32>>,
    users: BTreeSet<UserId>,
}

/// Starts with user 0 and no grants.
pub struct FakePolicy {
    tables: Mutex<PolicyTables>,
}

impl Default for FakePolicy {
    fn default() -> Self {
        let mut tables = PolicyTables::default();
        tables.users.insert(0);
        Self {
            tables: Mutex::new(tables),
        }
    }
}

impl FakePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, uid: u32, permission: Permission) {
        let mut t = lock(&self.tables);
        let held = t.grants.entry(uid).or_default();
        if !held.contains(&permission) {
            held.push(permission);
        }
    }

    pub fn revoke(&self, uid: u32, permission: Permission) {
        if let Some(held) = lock(&self.tables).grants.get_mut(&uid) {
            held.retain(|p| *p != permission);
        }
    }

    pub fn set_package(&self, package: impl Into<String>, uids: impl IntoIterator<Item = u32>) {
        lock(&self.tables)
            .packages
            .insert(package.into(), uids.into_iter().collect());
    }

    pub fn remove_package(&self, package: &str) {
        lock(&self.tables).packages.remove(package);
    }

    pub fn add_user(&self, user: UserId) {
        lock(&self.tables).users.insert(user);
    }

    pub fn remove_user(&self, user: UserId) {
        lock(&self.tables).users.remove(&user);
    }
}

impl PolicyQuery for FakePolicy {
    fn has_permission(&self, uid: u32, permission: Permission) -> bool {
        lock(&self.tables)
            .grants
            .get(&uid)
            .is_some_and(|held| held.contains(&permission))
    }

    fn uids_for_package(&self, package: &str) -> Vec<u32> {
        lock(&self.tables)
            .packages
            .get(package)
            .cloned()
            .unwrap_or_default()
    }

    fn users(&self) -> Vec<UserId> {
        lock(&self.tables).users.iter().copied().collect()
    }
}
