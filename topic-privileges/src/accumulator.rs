// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batched recomputation and write-back of entity privilege records.
use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, error};

use crate::aggregate::GrantAggregator;
use crate::coalesce::{InheritedPrivs, coalesce, union_inherited};
use crate::entity::{Entity, PrivilegeError};
use crate::privileges::PrivilegeRecord;
use crate::transaction::Transaction;
use crate::types::{EntityId, UserId};

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("grants of entity {0} are not loaded")]
    GrantsNotLoaded(EntityId),
}

/// Outcome of offering an observation to an accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accumulated {
    Buffered,

    /// The current user may not change the entity's privileges.
    Unauthorized,

    /// The accumulator was already flushed.
    Inactive,
}

/// Observations collected for one entity.
#[derive(Clone, Debug)]
pub(crate) struct PendingUpdate {
    pub(crate) entity: Entity,
    pub(crate) observed: Vec<InheritedPrivs>,
}

/// Collects privilege observations for entities and turns them into at most one privilege
/// record write per entity.
///
/// An accumulator is flushed exactly once, afterwards it does not accept further observations.
#[derive(Debug)]
pub struct UpdateAccumulator {
    active: bool,
    current_user: UserId,
    pending: BTreeMap<EntityId, PendingUpdate>,
}

impl UpdateAccumulator {
    pub fn new(current_user: UserId) -> Self {
        Self {
            active: true,
            current_user,
            pending: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stop accepting observations.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Buffer the privileges observed for an entity along one lineage.
    ///
    /// Only entities the current user administers or created are considered, everything else is
    /// silently dropped.
    pub fn accumulate(&mut self, privs: &InheritedPrivs, entity: &Entity) -> Accumulated {
        if !self.active {
            return Accumulated::Inactive;
        }

        if entity.creator() != &self.current_user
            && !entity.privileges().is_admin(&self.current_user)
        {
            debug!(
                entity = %entity.id(),
                user = %self.current_user,
                "not authorized to update privileges"
            );
            return Accumulated::Unauthorized;
        }

        self.pending
            .entry(entity.id().clone())
            .or_insert_with(|| PendingUpdate {
                entity: entity.clone(),
                observed: Vec::new(),
            })
            .observed
            .push(privs.clone());

        Accumulated::Buffered
    }

    /// Entities with buffered observations.
    pub fn entities(&self) -> Vec<Entity> {
        self.pending
            .values()
            .map(|pending| pending.entity.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take over observations of another accumulator. Authorization was checked when they were
    /// first buffered.
    pub(crate) fn requeue(&mut self, pending: Vec<PendingUpdate>) {
        for update in pending {
            self.pending
                .entry(update.entity.id().clone())
                .or_insert_with(|| PendingUpdate {
                    entity: update.entity.clone(),
                    observed: Vec::new(),
                })
                .observed
                .extend(update.observed);
        }
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingUpdate> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Compute the new privilege record of every buffered entity.
    ///
    /// Grants an entity references which no observation knows about are foreign, they were
    /// granted through a lineage not traversed here and are folded back in. The entity's creator
    /// always keeps every privilege. Records equal to the current one are skipped.
    ///
    /// If any entity's grants are not loaded nothing is computed and the observations stay
    /// buffered.
    pub fn flush(&mut self) -> Result<Option<PrivilegeUpdate>, FlushError> {
        self.deactivate();

        let mut writes = Vec::new();
        for (id, pending) in &self.pending {
            let current = pending.entity.privileges();
            let Some(persisted) = current.grants() else {
                error!(entity = %id, "can't flush privileges, grants are not loaded");
                return Err(FlushError::GrantsNotLoaded(id.clone()));
            };

            let merged = union_inherited(&pending.observed);
            let foreign = persisted
                .iter()
                .filter(|grant| grant.is_active() && !merged.all_grants.contains(*grant))
                .cloned();
            let effective = coalesce(&GrantAggregator::from_grants(foreign, None), &merged);

            let record =
                PrivilegeRecord::from_inherited(&effective).add_user(pending.entity.creator());

            if record != current {
                writes.push((pending.entity.clone(), record));
            }
        }

        self.pending.clear();

        if writes.is_empty() {
            return Ok(None);
        }

        Ok(Some(PrivilegeUpdate { writes }))
    }
}

/// Privilege records computed by a flush, ready to be written.
#[derive(Debug)]
pub struct PrivilegeUpdate {
    writes: Vec<(Entity, PrivilegeRecord)>,
}

impl PrivilegeUpdate {
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Entity, PrivilegeRecord)> {
        self.writes.iter()
    }

    /// Queue every record in the transaction. Returns the number of records which changed.
    pub fn apply(self, tx: &mut Transaction) -> Result<usize, PrivilegeError> {
        let mut changed = 0;
        for (entity, record) in self.writes {
            if entity.set_privileges(tx, record)? {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::aggregate::GrantAggregator;
    use crate::coalesce::{InheritedPrivs, coalesce};
    use crate::entity::{Entity, EntityKind};
    use crate::grant::{Grant, GrantInstruction, GrantStatus, PermissionLevel};
    use crate::privileges::{PrivilegeData, PrivilegeRecord};
    use crate::transaction::{Transaction, Write};
    use crate::types::{EntityId, GrantId, UserId, VertexId};

    use super::{Accumulated, FlushError, UpdateAccumulator};

    fn grant(id: &str, vertex: &str, instruction: GrantInstruction) -> Grant {
        Grant::new(
            GrantId::from(id),
            VertexId::from(vertex),
            instruction,
            GrantStatus::Active,
        )
    }

    fn privs(grants: impl IntoIterator<Item = Grant>) -> InheritedPrivs {
        coalesce(
            &GrantAggregator::from_grants(grants, None),
            &InheritedPrivs::default(),
        )
    }

    fn entity(id: &str, creator: &str, record: PrivilegeRecord) -> Entity {
        Entity::new(
            EntityId::from(id),
            EntityKind::Property,
            UserId::from(creator),
            record,
        )
    }

    fn sorted(users: &[UserId]) -> Vec<&str> {
        let mut users: Vec<&str> = users.iter().map(UserId::as_str).collect();
        users.sort();
        users
    }

    #[test]
    fn only_admins_and_creators_accumulate() {
        let mut accumulator = UpdateAccumulator::new(UserId::from("alice"));
        let observed = InheritedPrivs::default();

        let own = entity("e1", "alice", PrivilegeRecord::default(UserId::from("alice")));
        let administered = entity(
            "e2",
            "bob",
            PrivilegeRecord::default(UserId::from("bob")).add_user(&UserId::from("alice")),
        );
        let foreign = entity("e3", "bob", PrivilegeRecord::public_edit(UserId::from("bob")));

        assert_eq!(accumulator.accumulate(&observed, &own), Accumulated::Buffered);
        assert_eq!(
            accumulator.accumulate(&observed, &administered),
            Accumulated::Buffered
        );
        assert_eq!(
            accumulator.accumulate(&observed, &foreign),
            Accumulated::Unauthorized
        );
        assert_eq!(accumulator.entities(), vec![own.clone(), administered]);

        accumulator.flush().unwrap();
        assert_eq!(accumulator.accumulate(&observed, &own), Accumulated::Inactive);
    }

    #[test]
    fn creator_keeps_all_privileges() {
        let mut accumulator = UpdateAccumulator::new(UserId::from("alice"));
        let doc = entity("e1", "alice", PrivilegeRecord::default(UserId::from("alice")));

        let observed = privs([grant(
            "g1",
            "doc",
            GrantInstruction::allow(PermissionLevel::Read, "bob"),
        )]);
        accumulator.accumulate(&observed, &doc);

        let update = accumulator.flush().unwrap().unwrap();
        let (_, record) = update.iter().next().unwrap();
        assert_eq!(sorted(record.recipients()), vec!["alice", "bob"]);
        assert_eq!(sorted(record.writers()), vec!["alice"]);
        assert_eq!(sorted(record.admins()), vec!["alice"]);
    }

    #[test]
    fn observations_along_lineages_are_merged() {
        let mut accumulator = UpdateAccumulator::new(UserId::from("alice"));
        let doc = entity("e1", "alice", PrivilegeRecord::default(UserId::from("alice")));

        accumulator.accumulate(
            &privs([grant("g1", "a", GrantInstruction::allow(PermissionLevel::Read, "bob"))]),
            &doc,
        );
        accumulator.accumulate(
            &privs([grant("g2", "b", GrantInstruction::allow(PermissionLevel::Write, "carol"))]),
            &doc,
        );

        let update = accumulator.flush().unwrap().unwrap();
        assert_eq!(update.len(), 1, "one write per entity");
        let (_, record) = update.iter().next().unwrap();
        assert_eq!(sorted(record.recipients()), vec!["alice", "bob", "carol"]);
        assert_eq!(sorted(record.writers()), vec!["alice", "carol"]);
    }

    #[test]
    fn foreign_grants_are_preserved() {
        let local = grant("g-local", "a", GrantInstruction::allow(PermissionLevel::Read, "bob"));
        let foreign = grant(
            "g-foreign",
            "x",
            GrantInstruction::allow(PermissionLevel::Write, "carol"),
        );

        // Persisted record references a grant from a lineage we don't traverse.
        let persisted = PrivilegeRecord::from_inherited(&privs([local.clone(), foreign.clone()]))
            .add_user(&UserId::from("alice"));
        let doc = entity("e1", "alice", persisted);

        let mut accumulator = UpdateAccumulator::new(UserId::from("alice"));
        let upgraded = grant("g-new", "a", GrantInstruction::allow(PermissionLevel::Admin, "bob"));
        accumulator.accumulate(&privs([local, upgraded]), &doc);

        let update = accumulator.flush().unwrap().unwrap();
        let (_, record) = update.iter().next().unwrap();
        assert!(record.can_write(&UserId::from("carol")));
        assert!(record.is_admin(&UserId::from("bob")));
        assert!(record.grant_ids().contains(&GrantId::from("g-foreign")));
    }

    #[test]
    fn archived_foreign_grants_are_dropped() {
        let foreign = grant(
            "g-foreign",
            "x",
            GrantInstruction::allow(PermissionLevel::Write, "carol"),
        );
        let persisted = PrivilegeRecord::from_inherited(&privs([foreign.clone()]))
            .add_user(&UserId::from("alice"));
        let doc = entity("e1", "alice", persisted);
        foreign.mark_archived();

        let mut accumulator = UpdateAccumulator::new(UserId::from("alice"));
        accumulator.accumulate(&InheritedPrivs::default(), &doc);

        let update = accumulator.flush().unwrap().unwrap();
        let (_, record) = update.iter().next().unwrap();
        assert_eq!(sorted(record.writers()), vec!["alice"]);
    }

    #[test]
    fn unchanged_records_produce_no_update() {
        let read = grant("g1", "a", GrantInstruction::allow(PermissionLevel::Read, "bob"));
        let observed = privs([read]);
        let persisted =
            PrivilegeRecord::from_inherited(&observed).add_user(&UserId::from("alice"));
        let doc = entity("e1", "alice", persisted);

        let mut accumulator = UpdateAccumulator::new(UserId::from("alice"));
        accumulator.accumulate(&observed, &doc);
        assert!(accumulator.flush().unwrap().is_none());
    }

    #[test]
    fn unloaded_grants_abort_the_flush() {
        let alice = UserId::from("alice");
        let loaded = entity("e1", "alice", PrivilegeRecord::default(alice.clone()));
        let unloaded = entity(
            "e2",
            "alice",
            PrivilegeRecord::from_persisted(PrivilegeData {
                recipient_id: vec![alice.clone()],
                write_id: vec![alice.clone()],
                admin_id: vec![alice.clone()],
                share_id: vec![GrantId::from("g1")],
            }),
        );

        let mut accumulator = UpdateAccumulator::new(alice);
        let observed = privs([grant(
            "g2",
            "a",
            GrantInstruction::allow(PermissionLevel::Read, "bob"),
        )]);
        accumulator.accumulate(&observed, &loaded);
        accumulator.accumulate(&observed, &unloaded);

        assert_matches!(
            accumulator.flush(),
            Err(FlushError::GrantsNotLoaded(id)) if id == EntityId::from("e2")
        );
        assert!(!accumulator.is_active());

        // Observations survive so they can be handed on.
        assert_eq!(accumulator.take_pending().len(), 2);
    }

    #[test]
    fn update_is_applied_to_transaction() {
        let doc = entity("e1", "alice", PrivilegeRecord::default(UserId::from("alice")));
        let mut accumulator = UpdateAccumulator::new(UserId::from("alice"));
        accumulator.accumulate(
            &privs([grant("g1", "a", GrantInstruction::allow(PermissionLevel::Read, "bob"))]),
            &doc,
        );

        let update = accumulator.flush().unwrap().unwrap();
        let mut tx = Transaction::new("tx");
        assert_eq!(update.apply(&mut tx).unwrap(), 1);

        assert_matches!(
            &tx.writes()[..],
            [Write::UpdatePrivileges { entity, .. }] if entity == doc.id()
        );
        assert!(doc.privileges().can_read(&UserId::from("bob")));
    }
}
