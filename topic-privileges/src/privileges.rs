// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted privilege records and their projection from coalesced privileges.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::cache::GrantCache;
use crate::coalesce::InheritedPrivs;
use crate::grant::{Grant, PermissionLevel};
use crate::traits::PrivilegeStore;
use crate::types::{GrantId, UserId};

/// Wire shape of a privilege record as stored alongside every entity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeData {
    #[serde(rename = "recipientID")]
    pub recipient_id: Vec<UserId>,

    #[serde(rename = "writeID")]
    pub write_id: Vec<UserId>,

    #[serde(rename = "adminID")]
    pub admin_id: Vec<UserId>,

    #[serde(rename = "shareID")]
    pub share_id: Vec<GrantId>,
}

impl PrivilegeData {
    /// Same lists, sorted and without duplicates.
    pub fn normalized(&self) -> Self {
        fn normalize<T: Ord + Clone>(items: &[T]) -> Vec<T> {
            let mut items = items.to_vec();
            items.sort();
            items.dedup();
            items
        }

        Self {
            recipient_id: normalize(&self.recipient_id),
            write_id: normalize(&self.write_id),
            admin_id: normalize(&self.admin_id),
            share_id: normalize(&self.share_id),
        }
    }
}

/// Append every item not yet present, keeping insertion order.
fn extend_unique<T: PartialEq>(target: &mut Vec<T>, items: impl IntoIterator<Item = T>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

fn unique<T: PartialEq>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut target = Vec::new();
    extend_unique(&mut target, items);
    target
}

/// Who may read, write and administer an entity, and which grants justify it.
///
/// Records are immutable values, every change produces a new record. Records restored from the
/// store only know the ids of their grants until [`PrivilegeRecord::load`] resolved them. Clones
/// share the resolved grants.
#[derive(Clone, Debug)]
pub struct PrivilegeRecord {
    recipients: Vec<UserId>,
    writers: Vec<UserId>,
    admins: Vec<UserId>,
    grant_ids: Vec<GrantId>,
    grants: Arc<OnceCell<Vec<Grant>>>,
}

impl PrivilegeRecord {
    fn resolved(
        recipients: Vec<UserId>,
        writers: Vec<UserId>,
        admins: Vec<UserId>,
        grants: Vec<Grant>,
    ) -> Self {
        Self {
            recipients,
            writers,
            admins,
            grant_ids: grants.iter().map(|grant| grant.id().clone()).collect(),
            grants: Arc::new(OnceCell::new_with(Some(grants))),
        }
    }

    /// Only `user` can read, write and administer.
    pub fn default(user: UserId) -> Self {
        Self::resolved(vec![user.clone()], vec![user.clone()], vec![user], Vec::new())
    }

    /// `user` owns the entity, `recipients` may additionally read it.
    pub fn read_only(user: UserId, recipients: impl IntoIterator<Item = UserId>) -> Self {
        let readers = unique(std::iter::once(user.clone()).chain(recipients));
        Self::resolved(readers, vec![user.clone()], vec![user], Vec::new())
    }

    /// Everybody may read, `user` owns the entity.
    pub fn public_readonly(user: UserId) -> Self {
        Self::resolved(
            vec![UserId::public()],
            vec![user.clone()],
            vec![user],
            Vec::new(),
        )
    }

    /// Everybody may read and write, `user` administers the entity.
    pub fn public_edit(user: UserId) -> Self {
        Self::resolved(
            vec![UserId::public()],
            vec![UserId::public()],
            vec![user],
            Vec::new(),
        )
    }

    /// Restore a record from the store. Its grants are unresolved until loaded.
    pub fn from_persisted(data: PrivilegeData) -> Self {
        Self {
            recipients: data.recipient_id,
            writers: data.write_id,
            admins: data.admin_id,
            grant_ids: data.share_id,
            grants: Arc::new(OnceCell::new()),
        }
    }

    /// Project coalesced privileges onto a record.
    ///
    /// Writers are implicitly readers and admins are implicitly readers and writers.
    pub fn from_inherited(inherited: &InheritedPrivs) -> Self {
        let readers = inherited.users(PermissionLevel::Read).cloned();
        let writers = inherited.users(PermissionLevel::Write).cloned();
        let admins: Vec<UserId> = unique(inherited.users(PermissionLevel::Admin).cloned());

        let writers = unique(writers.chain(admins.iter().cloned()));
        let recipients = unique(readers.chain(writers.iter().cloned()));

        let grants = unique(
            PermissionLevel::ALL
                .into_iter()
                .flat_map(|level| inherited.level(level))
                .map(|tuple| tuple.grant.clone()),
        );

        Self::resolved(recipients, writers, admins, grants)
    }

    /// Resolve the grants referenced by this record.
    ///
    /// Concurrent callers share one lookup, once resolved this returns immediately.
    pub async fn load<S>(&self, cache: &GrantCache<S>) -> Result<(), S::Error>
    where
        S: PrivilegeStore,
    {
        self.grants
            .get_or_try_init(|| cache.get_many(&self.grant_ids))
            .await?;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.grants.initialized()
    }

    /// Resolved grants, `None` if the record was not loaded yet.
    pub fn grants(&self) -> Option<&[Grant]> {
        self.grants.get().map(Vec::as_slice)
    }

    pub fn recipients(&self) -> &[UserId] {
        &self.recipients
    }

    pub fn writers(&self) -> &[UserId] {
        &self.writers
    }

    pub fn admins(&self) -> &[UserId] {
        &self.admins
    }

    /// Ids of the referenced grants. Once loaded only grants which resolved remain.
    pub fn grant_ids(&self) -> Vec<GrantId> {
        match self.grants.get() {
            Some(grants) => grants.iter().map(|grant| grant.id().clone()).collect(),
            None => self.grant_ids.clone(),
        }
    }

    pub fn data(&self) -> PrivilegeData {
        PrivilegeData {
            recipient_id: self.recipients.clone(),
            write_id: self.writers.clone(),
            admin_id: self.admins.clone(),
            share_id: self.grant_ids(),
        }
    }

    /// Union of both records, field by field.
    pub fn merge(&self, other: &PrivilegeRecord) -> Self {
        let mut recipients = self.recipients.clone();
        extend_unique(&mut recipients, other.recipients.iter().cloned());
        let mut writers = self.writers.clone();
        extend_unique(&mut writers, other.writers.iter().cloned());
        let mut admins = self.admins.clone();
        extend_unique(&mut admins, other.admins.iter().cloned());

        let mut grants = self.grants().map(<[Grant]>::to_vec).unwrap_or_default();
        extend_unique(&mut grants, other.grants().unwrap_or_default().iter().cloned());

        Self::resolved(recipients, writers, admins, grants)
    }

    /// Give `user` every privilege on top of this record.
    pub fn add_user(&self, user: &UserId) -> Self {
        let mut record = self.clone();
        extend_unique(&mut record.recipients, [user.clone()]);
        extend_unique(&mut record.writers, [user.clone()]);
        extend_unique(&mut record.admins, [user.clone()]);
        record
    }

    /// Returns true if `user` may read, honouring the `PUBLIC` wildcard.
    pub fn can_read(&self, user: &UserId) -> bool {
        self.recipients
            .iter()
            .any(|recipient| recipient == user || recipient.is_public())
    }

    /// Returns true if `user` may write, honouring the `PUBLIC` wildcard.
    pub fn can_write(&self, user: &UserId) -> bool {
        self.writers
            .iter()
            .any(|writer| writer == user || writer.is_public())
    }

    /// Returns true if `user` is listed as admin.
    pub fn is_admin(&self, user: &UserId) -> bool {
        self.admins.contains(user)
    }
}

/// Records are equal if they list the same ids, regardless of order or duplicates.
impl PartialEq for PrivilegeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.data().normalized() == other.data().normalized()
    }
}

impl Eq for PrivilegeRecord {}
