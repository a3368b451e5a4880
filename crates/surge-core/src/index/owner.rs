//! One-to-many index with optional reverse lookup.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use parking_lot::RwLock;

struct OwnerInner<O, M> {
    members: HashMap<O, HashSet<M>>,
    // present only when reverse tracking is enabled
    owners: Option<HashMap<M, O>>,
}

/// Maps an owner to a set of members, optionally tracking each member's
/// single owner.
///
/// With reverse tracking disabled, [`OwnerIndex::owner_of`] and
/// [`OwnerIndex::remove_member`] report not-found: that is the shape of
/// "connections under a channel". With it enabled ("connections under a
/// user") each member belongs to at most one owner; re-adding a member
/// under a new owner repoints the reverse entry.
pub struct OwnerIndex<O, M> {
    inner: RwLock<OwnerInner<O, M>>,
}

impl<O, M> OwnerIndex<O, M>
where
    O: Eq + Hash + Clone,
    M: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new(track_owners: bool) -> Self {
        Self {
            inner: RwLock::new(OwnerInner {
                members: HashMap::new(),
                owners: track_owners.then(HashMap::new),
            }),
        }
    }

    /// Add members under `owner`.
    pub fn add_members(&self, owner: &O, members: &[M]) {
        if members.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let member_set = inner.members.entry(owner.clone()).or_default();
        for member in members {
            member_set.insert(member.clone());
        }
        if let Some(owners) = inner.owners.as_mut() {
            for member in members {
                owners.insert(member.clone(), owner.clone());
            }
        }
    }

    /// Remove members from `owner`. Returns `false` when the owner is
    /// absent.
    pub fn remove_members(&self, owner: &O, members: &[M]) -> bool {
        let mut inner = self.inner.write();
        let Some(member_set) = inner.members.get_mut(owner) else {
            return false;
        };
        for member in members {
            member_set.remove(member);
        }
        if member_set.is_empty() {
            inner.members.remove(owner);
        }
        if let Some(owners) = inner.owners.as_mut() {
            for member in members {
                owners.remove(member);
            }
        }
        true
    }

    /// The members under `owner`, if any.
    #[must_use]
    pub fn members_of(&self, owner: &O) -> Option<Vec<M>> {
        self.inner
            .read()
            .members
            .get(owner)
            .map(|members| members.iter().cloned().collect())
    }

    /// The concatenated members of several owners, resolved under one read
    /// lock. Absent owners contribute nothing.
    #[must_use]
    pub fn members_of_any(&self, owners: &[O]) -> Vec<M> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for owner in owners {
            if let Some(member_set) = inner.members.get(owner) {
                out.extend(member_set.iter().cloned());
            }
        }
        out
    }

    /// The owner of `member`. Not-found when reverse tracking is disabled.
    #[must_use]
    pub fn owner_of(&self, member: &M) -> Option<O> {
        self.inner.read().owners.as_ref()?.get(member).cloned()
    }

    #[must_use]
    pub fn contains_owner(&self, owner: &O) -> bool {
        self.inner.read().members.contains_key(owner)
    }

    /// Remove an owner and every member link under it.
    pub fn remove_owner(&self, owner: &O) -> bool {
        let mut inner = self.inner.write();
        let Some(member_set) = inner.members.remove(owner) else {
            return false;
        };
        if let Some(owners) = inner.owners.as_mut() {
            for member in &member_set {
                owners.remove(member);
            }
        }
        true
    }

    /// Remove `member` from its owner, returning that owner. Requires
    /// reverse tracking; not-found otherwise.
    pub fn remove_member(&self, member: &M) -> Option<O> {
        let mut inner = self.inner.write();
        let owner = inner.owners.as_mut()?.remove(member)?;
        if let Some(member_set) = inner.members.get_mut(&owner) {
            member_set.remove(member);
            if member_set.is_empty() {
                inner.members.remove(&owner);
            }
        }
        Some(owner)
    }

    #[must_use]
    pub fn all_owners(&self) -> Vec<O> {
        self.inner.read().members.keys().cloned().collect()
    }
}
