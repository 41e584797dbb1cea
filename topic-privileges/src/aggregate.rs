// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregation of a vertex's own grants by target user and category.
use std::collections::BTreeMap;

use crate::grant::{Grant, PermissionLevel};
use crate::types::{RelationId, UserId};

/// Grants of one target user, bucketed by the level they allow. Everything which takes access
/// away lands in `deny`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrantBuckets {
    pub read: Vec<Grant>,
    pub write: Vec<Grant>,
    pub admin: Vec<Grant>,
    pub deny: Vec<Grant>,
}

impl GrantBuckets {
    pub fn level(&self, level: PermissionLevel) -> &[Grant] {
        match level {
            PermissionLevel::Read => &self.read,
            PermissionLevel::Write => &self.write,
            PermissionLevel::Admin => &self.admin,
        }
    }

    fn bucket_mut(&mut self, level: Option<PermissionLevel>) -> &mut Vec<Grant> {
        match level {
            Some(PermissionLevel::Read) => &mut self.read,
            Some(PermissionLevel::Write) => &mut self.write,
            Some(PermissionLevel::Admin) => &mut self.admin,
            None => &mut self.deny,
        }
    }

    /// Returns true if the user is denied at this vertex, regardless of any allow grants.
    pub fn is_denied(&self) -> bool {
        !self.deny.is_empty()
    }

    /// Returns true if `grant` is bucketed under `level` for this user.
    pub fn contains(&self, level: PermissionLevel, grant: &Grant) -> bool {
        self.level(level).contains(grant)
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
            && self.write.is_empty()
            && self.admin.is_empty()
            && self.deny.is_empty()
    }

    /// All grants of this user, allows first.
    pub fn grants(&self) -> impl Iterator<Item = &Grant> {
        self.read
            .iter()
            .chain(self.write.iter())
            .chain(self.admin.iter())
            .chain(self.deny.iter())
    }
}

/// Grants bucketed per target user.
pub type AggregatedGrants = BTreeMap<UserId, GrantBuckets>;

/// A vertex's own grants as seen through one inbound relation.
///
/// Without a context every grant is admitted. With a context only grants without a context
/// ("apex" grants) and grants placed through that very relation are admitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrantAggregator {
    context: Option<RelationId>,
    users: AggregatedGrants,
}

impl GrantAggregator {
    pub fn new(context: Option<RelationId>) -> Self {
        Self {
            context,
            users: AggregatedGrants::new(),
        }
    }

    pub fn from_grants(
        grants: impl IntoIterator<Item = Grant>,
        context: Option<RelationId>,
    ) -> Self {
        let mut aggregator = Self::new(context);
        for grant in grants {
            aggregator.insert(grant);
        }
        aggregator
    }

    pub fn context(&self) -> Option<&RelationId> {
        self.context.as_ref()
    }

    /// Returns true if the grant is visible through this aggregator's context.
    pub fn admits(&self, grant: &Grant) -> bool {
        match (&self.context, grant.context()) {
            (None, _) | (_, None) => true,
            (Some(context), Some(grant_context)) => context == grant_context,
        }
    }

    /// Bucket a grant under its target user. Returns false if the grant is outside of this
    /// aggregator's context or was already present.
    pub fn insert(&mut self, grant: Grant) -> bool {
        if !self.admits(&grant) {
            return false;
        }

        let bucket = self
            .users
            .entry(grant.target_user().clone())
            .or_default()
            .bucket_mut(grant.allowed_level());

        if bucket.contains(&grant) {
            return false;
        }

        bucket.push(grant);
        true
    }

    /// Remove a grant by id from its bucket. Returns false if it was not present.
    pub fn remove(&mut self, grant: &Grant) -> bool {
        let Some(buckets) = self.users.get_mut(grant.target_user()) else {
            return false;
        };

        let bucket = buckets.bucket_mut(grant.allowed_level());
        let before = bucket.len();
        bucket.retain(|existing| existing != grant);
        let removed = bucket.len() != before;

        if buckets.is_empty() {
            self.users.remove(grant.target_user());
        }

        removed
    }

    pub fn get(&self, user: &UserId) -> Option<&GrantBuckets> {
        self.users.get(user)
    }

    pub fn users(&self) -> &AggregatedGrants {
        &self.users
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Every grant held by this aggregator.
    pub fn grants(&self) -> impl Iterator<Item = &Grant> {
        self.users.values().flat_map(|buckets| buckets.grants())
    }
}
