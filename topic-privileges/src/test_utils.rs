// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory store and helpers for testing privilege reconciliation.
use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::grant::{Grant, GrantError, GrantStatus};
use crate::privileges::{PrivilegeData, PrivilegeRecord};
use crate::traits::PrivilegeStore;
use crate::transaction::Write;
use crate::types::{EntityId, GrantId, UserId};

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("store rejected commit")]
    Rejected,

    #[error("store is unavailable")]
    Unavailable,

    #[error(transparent)]
    Grant(#[from] GrantError),
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    grants: HashMap<GrantId, (Grant, PrivilegeData)>,
    lookups: HashMap<GrantId, usize>,
    entities: HashMap<EntityId, PrivilegeData>,
    archived_entities: Vec<EntityId>,
    commits: Vec<Vec<Write>>,
    reject_commits: bool,
    fail_lookups: bool,
    detach_handles: bool,
}

/// Grant and entity records kept in memory, with switches to make the store misbehave.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a grant record directly, bypassing any transaction.
    pub async fn insert_grant(&self, grant: Grant, privileges: PrivilegeRecord) {
        let mut inner = self.inner.write().await;
        inner
            .grants
            .insert(grant.id().clone(), (grant, privileges.data()));
    }

    /// Handle to a stored grant, ignoring visibility.
    pub async fn stored_grant(&self, id: &GrantId) -> Option<Grant> {
        let inner = self.inner.read().await;
        inner.grants.get(id).map(|(grant, _)| grant.clone())
    }

    /// Number of times the grant was requested from the store.
    pub async fn lookups(&self, id: &GrantId) -> usize {
        let inner = self.inner.read().await;
        inner.lookups.get(id).copied().unwrap_or_default()
    }

    /// Every batch of writes the store accepted, in commit order.
    pub async fn commits(&self) -> Vec<Vec<Write>> {
        let inner = self.inner.read().await;
        inner.commits.clone()
    }

    /// Last privilege record written for an entity.
    pub async fn entity_privileges(&self, id: &EntityId) -> Option<PrivilegeData> {
        let inner = self.inner.read().await;
        inner.entities.get(id).cloned()
    }

    pub async fn is_entity_archived(&self, id: &EntityId) -> bool {
        let inner = self.inner.read().await;
        inner.archived_entities.contains(id)
    }

    pub async fn reject_commits(&self, reject: bool) {
        self.inner.write().await.reject_commits = reject;
    }

    pub async fn fail_lookups(&self, fail: bool) {
        self.inner.write().await.fail_lookups = fail;
    }

    /// Hand out a copy of the stored grant on every lookup instead of the stored handle.
    pub async fn detach_handles(&self, detach: bool) {
        self.inner.write().await.detach_handles = detach;
    }
}

impl PrivilegeStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn grant(&self, id: &GrantId, viewer: &UserId) -> Result<Option<Grant>, Self::Error> {
        let mut inner = self.inner.write().await;
        if inner.fail_lookups {
            return Err(MemoryStoreError::Unavailable);
        }

        *inner.lookups.entry(id.clone()).or_default() += 1;

        let detach = inner.detach_handles;
        let grant = inner.grants.get(id).and_then(|(grant, privileges)| {
            let visible = privileges
                .recipient_id
                .iter()
                .any(|recipient| recipient == viewer || recipient.is_public());
            visible.then(|| {
                if detach {
                    Grant::new(
                        grant.id().clone(),
                        grant.vertex().clone(),
                        grant.instruction().clone(),
                        grant.status(),
                    )
                } else {
                    grant.clone()
                }
            })
        });

        Ok(grant)
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        if inner.reject_commits {
            return Err(MemoryStoreError::Rejected);
        }

        // Validate everything first so a bad write leaves the store untouched.
        let mut inserted = Vec::new();
        for write in &writes {
            if let Write::InsertGrant {
                id,
                vertex,
                payload,
                privileges,
                ..
            } = write
            {
                let grant =
                    Grant::from_payload(id.clone(), vertex.clone(), payload, GrantStatus::Active)?;
                inserted.push((grant, privileges.clone()));
            }
        }

        for (grant, privileges) in inserted {
            inner.grants.insert(grant.id().clone(), (grant, privileges));
        }

        for write in &writes {
            match write {
                Write::InsertGrant { .. } => (),
                Write::ArchiveGrant { id } => {
                    if let Some((grant, _)) = inner.grants.get(id) {
                        grant.mark_archived();
                    }
                }
                Write::UpdatePrivileges { entity, privileges } => {
                    inner.entities.insert(entity.clone(), privileges.clone());
                }
                Write::ArchiveEntity { entity } => {
                    inner.archived_entities.push(entity.clone());
                }
            }
        }

        inner.commits.push(writes);
        Ok(())
    }
}

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
