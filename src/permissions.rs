//! The permission vocabulary granted to sensors via certificate SAN entries.
//!
//! See [`crate::cert`] for how these flags are encoded into and decoded
//! out of a peer certificate's Subject Alternative Name.

use std::collections::BTreeSet;
use std::fmt;

/// One grantable permission. `IDMEF_READ` is carried for forward
/// compatibility with peer-manager relaying (query APIs are a non-goal of
/// this manager) but is never consulted by the event-processing fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    IdmefRead,
    IdmefWrite,
    AdminRequestServerCredential,
    AdminDestroyServerCredential,
}

impl Permission {
    pub const ALL: &'static [Permission] = &[
        Permission::IdmefRead,
        Permission::IdmefWrite,
        Permission::AdminRequestServerCredential,
        Permission::AdminDestroyServerCredential,
    ];

    pub fn as_flag(self) -> &'static str {
        match self {
            Permission::IdmefRead => "IDMEF_READ",
            Permission::IdmefWrite => "IDMEF_WRITE",
            Permission::AdminRequestServerCredential => "ADMIN_REQUEST_SERVER_CREDENTIAL",
            Permission::AdminDestroyServerCredential => "ADMIN_DESTROY_SERVER_CREDENTIAL",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Permission> {
        Self::ALL.iter().copied().find(|p| p.as_flag() == flag)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

/// The set of permissions a session carries, derived once at
/// authentication time and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, perm: Permission) {
        self.0.insert(perm);
    }

    pub fn contains(&self, perm: Permission) -> bool {
        self.0.contains(&perm)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_round_trips() {
        for perm in Permission::ALL {
            let flag = perm.as_flag();
            assert_eq!(Permission::from_flag(flag), Some(*perm));
        }
    }

    #[test]
    fn unknown_flag_is_none() {
        assert_eq!(Permission::from_flag("NOT_A_REAL_FLAG"), None);
    }

    #[test]
    fn empty_set_reports_empty() {
        let set = PermissionSet::new();
        assert!(set.is_empty());
        assert!(!set.contains(Permission::IdmefWrite));
    }
}
