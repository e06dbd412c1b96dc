//! Group membership indices.
//!
//! Three views are kept consistent under one lock: group → (case, members),
//! user → groups, and case → groups. Groups exist only while they have
//! members; the last `leave` deletes the group from every index.

use std::collections::{BTreeSet, HashMap};

use casehub_core::{CaseId, GroupId, UserId};
use parking_lot::RwLock;

use crate::errors::{HubError, Result};

/// Point-in-time copy of one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Case the group is scoped to.
    pub case_id: CaseId,
    /// Members, sorted.
    pub members: Vec<UserId>,
}

struct GroupEntry {
    case_id: CaseId,
    members: BTreeSet<UserId>,
}

#[derive(Default)]
struct Indices {
    groups: HashMap<GroupId, GroupEntry>,
    user_groups: HashMap<UserId, BTreeSet<GroupId>>,
    case_groups: HashMap<CaseId, BTreeSet<GroupId>>,
}

impl Indices {
    fn remove_member(&mut self, user: &UserId, group_id: &GroupId) -> bool {
        let Some(entry) = self.groups.get_mut(group_id) else {
            return false;
        };
        if !entry.members.remove(user) {
            return false;
        }
        if entry.members.is_empty() {
            let case_id = entry.case_id.clone();
            let _ = self.groups.remove(group_id);
            if let Some(groups) = self.case_groups.get_mut(&case_id) {
                let _ = groups.remove(group_id);
                if groups.is_empty() {
                    let _ = self.case_groups.remove(&case_id);
                }
            }
        }
        if let Some(groups) = self.user_groups.get_mut(user) {
            let _ = groups.remove(group_id);
            if groups.is_empty() {
                let _ = self.user_groups.remove(user);
            }
        }
        true
    }
}

/// Bidirectional group membership index.
pub struct GroupMembershipIndex {
    inner: RwLock<Indices>,
}

impl GroupMembershipIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indices::default()),
        }
    }

    /// Add `user` to `group_id`, creating the group under `case_id` if needed.
    ///
    /// Idempotent: returns `Ok(false)` if the user was already a member.
    /// Fails with [`HubError::CaseMismatch`] if the group is bound to another case.
    pub fn join(&self, user: &UserId, group_id: &GroupId, case_id: &CaseId) -> Result<bool> {
        let mut inner = self.inner.write();

        if let Some(entry) = inner.groups.get(group_id) {
            if &entry.case_id != case_id {
                return Err(HubError::CaseMismatch {
                    group_id: group_id.clone(),
                    expected: entry.case_id.clone(),
                    actual: case_id.clone(),
                });
            }
        }

        let entry = inner
            .groups
            .entry(group_id.clone())
            .or_insert_with(|| GroupEntry {
                case_id: case_id.clone(),
                members: BTreeSet::new(),
            });
        if !entry.members.insert(user.clone()) {
            return Ok(false);
        }

        let _ = inner
            .user_groups
            .entry(user.clone())
            .or_default()
            .insert(group_id.clone());
        let _ = inner
            .case_groups
            .entry(case_id.clone())
            .or_default()
            .insert(group_id.clone());
        Ok(true)
    }

    /// Remove `user` from `group_id`. Idempotent; returns whether a
    /// membership was removed. Empty groups are deleted.
    pub fn leave(&self, user: &UserId, group_id: &GroupId) -> bool {
        self.inner.write().remove_member(user, group_id)
    }

    /// Remove `user` from every group of `case_id` in one write.
    ///
    /// Returns the groups the user was removed from.
    pub fn remove_user_from_case(&self, user: &UserId, case_id: &CaseId) -> Vec<GroupId> {
        let mut inner = self.inner.write();
        let candidates: Vec<GroupId> = inner
            .user_groups
            .get(user)
            .map(|groups| {
                groups
                    .iter()
                    .filter(|g| inner.groups.get(*g).is_some_and(|e| &e.case_id == case_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        candidates
            .into_iter()
            .filter(|group_id| inner.remove_member(user, group_id))
            .collect()
    }

    /// Members of `group_id`, or `None` if the group does not exist.
    pub fn members_of(&self, group_id: &GroupId) -> Option<Vec<UserId>> {
        self.inner
            .read()
            .groups
            .get(group_id)
            .map(|entry| entry.members.iter().cloned().collect())
    }

    /// Case and members of `group_id` read under one lock acquisition.
    pub fn snapshot(&self, group_id: &GroupId) -> Option<GroupSnapshot> {
        self.inner
            .read()
            .groups
            .get(group_id)
            .map(|entry| GroupSnapshot {
                case_id: entry.case_id.clone(),
                members: entry.members.iter().cloned().collect(),
            })
    }

    /// Groups scoped to `case_id`, sorted.
    pub fn groups_of_case(&self, case_id: &CaseId) -> Vec<GroupId> {
        self.inner
            .read()
            .case_groups
            .get(case_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Groups `user` belongs to, sorted.
    pub fn groups_of_user(&self, user: &UserId) -> Vec<GroupId> {
        self.inner
            .read()
            .user_groups
            .get(user)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Case a group is scoped to.
    pub fn case_of(&self, group_id: &GroupId) -> Option<CaseId> {
        self.inner
            .read()
            .groups
            .get(group_id)
            .map(|entry| entry.case_id.clone())
    }

    /// Whether `user` is a member of `group_id`.
    pub fn is_member(&self, user: &UserId, group_id: &GroupId) -> bool {
        self.inner
            .read()
            .groups
            .get(group_id)
            .is_some_and(|entry| entry.members.contains(user))
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }
}

impl Default for GroupMembershipIndex {
    fn default() -> Self {
        Self::new()
    }
}
