// SPDX-License-Identifier: MIT OR Apache-2.0

//! Coalescence of a vertex's own grants with the privileges inherited from its ancestors.
//!
//! Coalescence is a pure function over already resolved inputs. Deny overrides allow: a user
//! denied at a vertex loses everything they inherited and everything the vertex itself allows
//! them, while the grants involved stay "known" in [`InheritedPrivs::all_grants`].
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::aggregate::GrantAggregator;
use crate::grant::{Grant, PermissionLevel};
use crate::types::UserId;

/// Membership of one user in one level together with the grant justifying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InheritedTuple {
    pub user: UserId,
    pub grant: Grant,
}

impl InheritedTuple {
    pub fn new(user: UserId, grant: Grant) -> Self {
        Self { user, grant }
    }
}

/// Effective privileges at a vertex along one lineage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InheritedPrivs {
    pub read: Vec<InheritedTuple>,
    pub write: Vec<InheritedTuple>,
    pub admin: Vec<InheritedTuple>,

    /// Every grant seen along the lineage, including grants whose target has been denied
    /// further down. Grants referenced by a persisted entity which are missing here are foreign
    /// to this lineage.
    pub all_grants: BTreeSet<Grant>,
}

impl InheritedPrivs {
    pub fn level(&self, level: PermissionLevel) -> &[InheritedTuple] {
        match level {
            PermissionLevel::Read => &self.read,
            PermissionLevel::Write => &self.write,
            PermissionLevel::Admin => &self.admin,
        }
    }

    fn level_mut(&mut self, level: PermissionLevel) -> &mut Vec<InheritedTuple> {
        match level {
            PermissionLevel::Read => &mut self.read,
            PermissionLevel::Write => &mut self.write,
            PermissionLevel::Admin => &mut self.admin,
        }
    }

    /// Users holding the given level.
    pub fn users(&self, level: PermissionLevel) -> impl Iterator<Item = &UserId> {
        self.level(level).iter().map(|tuple| &tuple.user)
    }

    /// Returns true if `user` holds `level` through a tuple of its own (no wildcard matching).
    pub fn holds(&self, user: &UserId, level: PermissionLevel) -> bool {
        self.users(level).any(|holder| holder == user)
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
            && self.write.is_empty()
            && self.admin.is_empty()
            && self.all_grants.is_empty()
    }
}

/// Merge a vertex's own aggregate with the privileges inherited from its parent.
///
/// 1. Users with any deny grant in `own` are globally denied at this vertex.
/// 2. Allow grants of all other users are copied into the output.
/// 3. Inherited tuples pass through unless their user is denied here, or the same grant is
///    already bucketed for that user and level.
///
/// Every grant of `own` is added to `all_grants`, which is seeded with the inherited set.
pub fn coalesce(own: &GrantAggregator, inherited: &InheritedPrivs) -> InheritedPrivs {
    let mut output = InheritedPrivs {
        all_grants: inherited.all_grants.clone(),
        ..Default::default()
    };

    let mut denied: HashSet<&UserId> = HashSet::new();

    for (user, buckets) in own.users() {
        output.all_grants.extend(buckets.grants().cloned());

        if buckets.is_denied() {
            denied.insert(user);
            continue;
        }

        for level in PermissionLevel::ALL {
            for grant in buckets.level(level) {
                output
                    .level_mut(level)
                    .push(InheritedTuple::new(user.clone(), grant.clone()));
            }
        }
    }

    for level in PermissionLevel::ALL {
        for tuple in inherited.level(level) {
            if denied.contains(&tuple.user) {
                continue;
            }

            match own.get(&tuple.user) {
                Some(buckets) if buckets.contains(level, &tuple.grant) => (),
                _ => output.level_mut(level).push(tuple.clone()),
            }
        }
    }

    output
}

/// Union the privileges observed for one entity along several lineages.
///
/// Tuples are de-duplicated by grant id and ordered by grant id, so the result does not depend
/// on the order of the observations.
pub fn union_inherited<'a>(
    observed: impl IntoIterator<Item = &'a InheritedPrivs>,
) -> InheritedPrivs {
    let mut levels: [BTreeMap<Grant, UserId>; 3] = Default::default();
    let mut all_grants = BTreeSet::new();

    for privs in observed {
        all_grants.extend(privs.all_grants.iter().cloned());

        for (index, level) in PermissionLevel::ALL.into_iter().enumerate() {
            for tuple in privs.level(level) {
                levels[index]
                    .entry(tuple.grant.clone())
                    .or_insert_with(|| tuple.user.clone());
            }
        }
    }

    let [read, write, admin] = levels.map(|tuples| {
        tuples
            .into_iter()
            .map(|(grant, user)| InheritedTuple::new(user, grant))
            .collect::<Vec<_>>()
    });

    InheritedPrivs {
        read,
        write,
        admin,
        all_grants,
    }
}
