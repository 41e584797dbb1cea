// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted entities carrying a privilege record.
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::privileges::PrivilegeRecord;
use crate::transaction::{Transaction, Write};
use crate::types::{EntityId, UserId};

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("privilege record for entity {0} has unresolved grants")]
    Unloaded(EntityId),
}

/// Kinds of stored graph objects which carry their own privilege record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Property,
    Backref,
    Edge,
}

struct EntityInner {
    id: EntityId,
    kind: EntityKind,
    creator: UserId,
    privileges: watch::Sender<PrivilegeRecord>,
}

/// Handle to a persisted entity.
///
/// The privilege record is only ever changed through [`Entity::set_privileges`], everybody else
/// reads the current value or subscribes to changes.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    pub fn new(
        id: EntityId,
        kind: EntityKind,
        creator: UserId,
        privileges: PrivilegeRecord,
    ) -> Self {
        let (privileges, _) = watch::channel(privileges);
        Self {
            inner: Arc::new(EntityInner {
                id,
                kind,
                creator,
                privileges,
            }),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.inner.id
    }

    pub fn kind(&self) -> EntityKind {
        self.inner.kind
    }

    /// User who created the entity. They keep every privilege on it.
    pub fn creator(&self) -> &UserId {
        &self.inner.creator
    }

    /// Current privilege record.
    pub fn privileges(&self) -> PrivilegeRecord {
        self.inner.privileges.borrow().clone()
    }

    /// Receive every future privilege record of this entity.
    pub fn subscribe(&self) -> watch::Receiver<PrivilegeRecord> {
        self.inner.privileges.subscribe()
    }

    /// Queue a privilege update in the transaction and publish the new record.
    ///
    /// Records with unresolved grants are rejected, we never persist a partially known record.
    /// Returns false if the record equals the current one and nothing was written. If the
    /// transaction aborts, the previous record is published again.
    pub fn set_privileges(
        &self,
        tx: &mut Transaction,
        record: PrivilegeRecord,
    ) -> Result<bool, PrivilegeError> {
        if !record.is_loaded() {
            error!(entity = %self.id(), "attempt to set privileges from unresolved record");
            return Err(PrivilegeError::Unloaded(self.id().clone()));
        }

        if *self.inner.privileges.borrow() == record {
            return Ok(false);
        }

        debug!(entity = %self.id(), tx = %tx.key(), "update privileges");
        tx.push(Write::UpdatePrivileges {
            entity: self.id().clone(),
            privileges: record.data(),
        });

        let previous = self.inner.privileges.send_replace(record.clone());
        let entity = self.clone();
        tx.add_abort_hook(move || entity.restore_privileges(&record, previous));

        Ok(true)
    }

    /// Publish `previous` again, unless the record was changed after `written`.
    fn restore_privileges(&self, written: &PrivilegeRecord, previous: PrivilegeRecord) {
        self.inner.privileges.send_if_modified(|current| {
            if current != written {
                return false;
            }
            debug!(entity = %self.id(), "restore privileges of aborted update");
            *current = previous;
            true
        });
    }

    pub fn archive(&self, tx: &mut Transaction) {
        tx.push(Write::ArchiveEntity {
            entity: self.id().clone(),
        });
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", self.id())
            .field("kind", &self.kind())
            .field("creator", self.creator())
            .finish()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Entity {}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::privileges::{PrivilegeData, PrivilegeRecord};
    use crate::test_utils::MemoryStore;
    use crate::transaction::{Transaction, Write};
    use crate::types::{EntityId, UserId};

    use super::{Entity, EntityKind, PrivilegeError};

    fn entity() -> Entity {
        let alice = UserId::from("alice");
        Entity::new(
            EntityId::from("e1"),
            EntityKind::Property,
            alice.clone(),
            PrivilegeRecord::default(alice),
        )
    }

    #[test]
    fn unresolved_record_is_rejected() {
        let entity = entity();
        let mut tx = Transaction::new("tx");
        let unresolved = PrivilegeRecord::from_persisted(PrivilegeData::default());

        assert_matches!(
            entity.set_privileges(&mut tx, unresolved),
            Err(PrivilegeError::Unloaded(id)) if id == *entity.id()
        );
        assert!(tx.writes().is_empty());
        assert_eq!(entity.privileges(), PrivilegeRecord::default(UserId::from("alice")));
    }

    #[test]
    fn equal_record_is_not_written() {
        let entity = entity();
        let mut tx = Transaction::new("tx");

        let same = PrivilegeRecord::default(UserId::from("alice"));
        assert!(!entity.set_privileges(&mut tx, same).unwrap());
        assert!(tx.writes().is_empty());
    }

    #[tokio::test]
    async fn changes_are_written_and_published() {
        let entity = entity();
        let mut receiver = entity.subscribe();
        let mut tx = Transaction::new("tx");

        let shared = PrivilegeRecord::default(UserId::from("alice")).add_user(&UserId::from("bob"));
        assert!(entity.set_privileges(&mut tx, shared.clone()).unwrap());

        assert_matches!(&tx.writes()[0], Write::UpdatePrivileges { entity: id, privileges } => {
            assert_eq!(id, entity.id());
            assert_eq!(privileges, &shared.data());
        });

        receiver.changed().await.unwrap();
        assert_eq!(*receiver.borrow(), shared);
        assert_eq!(entity.privileges(), shared);
    }

    #[tokio::test]
    async fn rejected_update_is_rolled_back() {
        let store = MemoryStore::new();
        store.reject_commits(true).await;
        let entity = entity();
        let original = entity.privileges();

        let mut tx = Transaction::new("tx");
        let shared = original.add_user(&UserId::from("bob"));
        assert!(entity.set_privileges(&mut tx, shared.clone()).unwrap());
        assert_eq!(entity.privileges(), shared);

        assert!(tx.commit(&store).await.is_err());
        assert_eq!(entity.privileges(), original);

        // The same update is written again once the store accepts it.
        store.reject_commits(false).await;
        let mut tx = Transaction::new("tx");
        assert!(entity.set_privileges(&mut tx, shared.clone()).unwrap());
        tx.commit(&store).await.unwrap();
        assert_eq!(
            store.entity_privileges(entity.id()).await,
            Some(shared.data())
        );
    }

    #[test]
    fn later_updates_survive_an_abort() {
        let entity = entity();
        let bob = entity.privileges().add_user(&UserId::from("bob"));
        let carol = bob.add_user(&UserId::from("carol"));

        let mut aborted = Transaction::new("tx-1");
        entity.set_privileges(&mut aborted, bob).unwrap();
        let mut tx = Transaction::new("tx-2");
        entity.set_privileges(&mut tx, carol.clone()).unwrap();

        aborted.abort();
        assert_eq!(entity.privileges(), carol);
    }

    #[tokio::test]
    async fn archive_is_committed() {
        let store = MemoryStore::new();
        let entity = entity();

        let mut tx = Transaction::new("tx");
        entity.archive(&mut tx);
        tx.commit(&store).await.unwrap();

        assert!(store.is_entity_archived(entity.id()).await);
        assert!(store.entity_privileges(entity.id()).await.is_none());
    }
}
