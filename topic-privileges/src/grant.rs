// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grant records: immutable allow / deny instructions attached to a vertex.
//!
//! A grant is never modified after creation. "Changing" a grant means archiving it and creating a
//! new one in its place, see [`Grant::replace`].
use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::privileges::PrivilegeRecord;
use crate::transaction::{Transaction, Write};
use crate::types::{GrantId, RelationId, UserId, VertexId};

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("failed to encode grant instruction: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed grant instruction: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Whether a grant hands out or takes away a privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantType {
    Allow,
    Deny,
}

/// The three privilege levels an actor can hold on a vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 3] = [
        PermissionLevel::Read,
        PermissionLevel::Write,
        PermissionLevel::Admin,
    ];
}

impl Display for PermissionLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Admin => "admin",
        };

        write!(f, "{}", s)
    }
}

/// Category as found on the wire.
///
/// Categories we do not understand are kept verbatim and treated as `deny` during aggregation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GrantCategory {
    Read,
    Write,
    Admin,
    Unknown(String),
}

impl GrantCategory {
    /// Permission level of this category, `None` if the category is not recognised.
    pub fn level(&self) -> Option<PermissionLevel> {
        match self {
            GrantCategory::Read => Some(PermissionLevel::Read),
            GrantCategory::Write => Some(PermissionLevel::Write),
            GrantCategory::Admin => Some(PermissionLevel::Admin),
            GrantCategory::Unknown(_) => None,
        }
    }
}

impl From<PermissionLevel> for GrantCategory {
    fn from(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::Read => GrantCategory::Read,
            PermissionLevel::Write => GrantCategory::Write,
            PermissionLevel::Admin => GrantCategory::Admin,
        }
    }
}

impl From<String> for GrantCategory {
    fn from(value: String) -> Self {
        match value.as_str() {
            "read" => GrantCategory::Read,
            "write" => GrantCategory::Write,
            "admin" => GrantCategory::Admin,
            _ => GrantCategory::Unknown(value),
        }
    }
}

impl From<GrantCategory> for String {
    fn from(value: GrantCategory) -> Self {
        match value {
            GrantCategory::Read => "read".to_owned(),
            GrantCategory::Write => "write".to_owned(),
            GrantCategory::Admin => "admin".to_owned(),
            GrantCategory::Unknown(other) => other,
        }
    }
}

/// Persisted payload of a grant record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantInstruction {
    #[serde(rename = "shareType")]
    pub grant_type: GrantType,

    #[serde(rename = "shareCategory")]
    pub category: GrantCategory,

    #[serde(rename = "targetUserID")]
    pub target_user: UserId,

    /// Inbound relation the grant was placed through. Grants without a context apply on every
    /// path leading to the vertex.
    #[serde(rename = "contextId", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<RelationId>,
}

impl GrantInstruction {
    pub fn allow(level: PermissionLevel, target_user: impl Into<UserId>) -> Self {
        Self {
            grant_type: GrantType::Allow,
            category: level.into(),
            target_user: target_user.into(),
            context: None,
        }
    }

    pub fn deny(level: PermissionLevel, target_user: impl Into<UserId>) -> Self {
        Self {
            grant_type: GrantType::Deny,
            category: level.into(),
            target_user: target_user.into(),
            context: None,
        }
    }

    /// Scope the instruction to one inbound relation.
    pub fn with_context(mut self, context: impl Into<RelationId>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn to_json(&self) -> Result<String, GrantError> {
        serde_json::to_string(self).map_err(GrantError::Encode)
    }

    pub fn from_json(payload: &str) -> Result<Self, GrantError> {
        serde_json::from_str(payload).map_err(GrantError::Decode)
    }
}

/// Lifecycle of a grant record. Archiving is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Active,
    Archived,
}

/// Fields which may differ between a grant and its replacement. Target user and context are
/// always carried over.
#[derive(Clone, Debug, Default)]
pub struct GrantReplacement {
    pub grant_type: Option<GrantType>,
    pub category: Option<GrantCategory>,
}

struct GrantInner {
    id: GrantId,
    vertex: VertexId,
    instruction: GrantInstruction,
    archived: AtomicBool,
}

/// Handle to a grant record.
///
/// Clones share the record's status, so archiving through one handle is observed by all of them.
/// Equality, ordering and hashing only consider the grant id.
#[derive(Clone)]
pub struct Grant {
    inner: Arc<GrantInner>,
}

impl Grant {
    pub fn new(
        id: GrantId,
        vertex: VertexId,
        instruction: GrantInstruction,
        status: GrantStatus,
    ) -> Self {
        Self {
            inner: Arc::new(GrantInner {
                id,
                vertex,
                instruction,
                archived: AtomicBool::new(status == GrantStatus::Archived),
            }),
        }
    }

    /// Restore a grant from its persisted JSON payload.
    pub fn from_payload(
        id: GrantId,
        vertex: VertexId,
        payload: &str,
        status: GrantStatus,
    ) -> Result<Self, GrantError> {
        let instruction = GrantInstruction::from_json(payload)?;
        Ok(Self::new(id, vertex, instruction, status))
    }

    /// Create a new active grant under `vertex`.
    ///
    /// The record itself is readable by everybody and by the target user, so that anyone can
    /// evaluate whether they may access the vertex. What it grants is not widened by this.
    pub fn create(
        tx: &mut Transaction,
        vertex: &VertexId,
        instruction: GrantInstruction,
        author: &UserId,
    ) -> Result<Self, GrantError> {
        let id = GrantId::random();
        let privileges = PrivilegeRecord::read_only(
            author.clone(),
            [UserId::public(), instruction.target_user.clone()],
        );

        tx.push(Write::InsertGrant {
            id: id.clone(),
            vertex: vertex.clone(),
            payload: instruction.to_json()?,
            privileges: privileges.data(),
            created_at: tx.now(),
        });

        Ok(Self::new(
            id,
            vertex.clone(),
            instruction,
            GrantStatus::Active,
        ))
    }

    /// Archive this grant and create a new one with the replaced fields.
    ///
    /// Archiving happens first, so there is never a moment with two live instructions for the
    /// same target which could contradict each other.
    pub fn replace(
        &self,
        tx: &mut Transaction,
        replacement: GrantReplacement,
        author: &UserId,
    ) -> Result<Self, GrantError> {
        self.archive(tx);

        let current = self.instruction();
        let instruction = GrantInstruction {
            grant_type: replacement.grant_type.unwrap_or(current.grant_type),
            category: replacement
                .category
                .unwrap_or_else(|| current.category.clone()),
            target_user: current.target_user.clone(),
            context: current.context.clone(),
        };

        Self::create(tx, self.vertex(), instruction, author)
    }

    /// Mark the grant as archived and queue the change in the transaction.
    ///
    /// The grant becomes active again if the transaction aborts.
    pub fn archive(&self, tx: &mut Transaction) {
        let was_archived = self.inner.archived.swap(true, AtomicOrdering::AcqRel);
        tx.push(Write::ArchiveGrant {
            id: self.id().clone(),
        });

        if !was_archived {
            let grant = self.clone();
            tx.add_abort_hook(move || grant.inner.archived.store(false, AtomicOrdering::Release));
        }
    }

    pub(crate) fn mark_archived(&self) {
        self.inner.archived.store(true, AtomicOrdering::Release);
    }

    pub fn id(&self) -> &GrantId {
        &self.inner.id
    }

    pub fn vertex(&self) -> &VertexId {
        &self.inner.vertex
    }

    pub fn instruction(&self) -> &GrantInstruction {
        &self.inner.instruction
    }

    pub fn grant_type(&self) -> GrantType {
        self.inner.instruction.grant_type
    }

    pub fn category(&self) -> &GrantCategory {
        &self.inner.instruction.category
    }

    pub fn target_user(&self) -> &UserId {
        &self.inner.instruction.target_user
    }

    pub fn context(&self) -> Option<&RelationId> {
        self.inner.instruction.context.as_ref()
    }

    /// Level this grant allows, `None` if it has to be treated as a deny.
    ///
    /// Deny grants and grants with an unrecognised category both take away access.
    pub fn allowed_level(&self) -> Option<PermissionLevel> {
        match self.grant_type() {
            GrantType::Allow => self.category().level(),
            GrantType::Deny => None,
        }
    }

    pub fn status(&self) -> GrantStatus {
        if self.inner.archived.load(AtomicOrdering::Acquire) {
            GrantStatus::Archived
        } else {
            GrantStatus::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == GrantStatus::Active
    }
}

impl Debug for Grant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grant")
            .field("id", self.id())
            .field("vertex", self.vertex())
            .field("instruction", self.instruction())
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Grant {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Grant {}

impl PartialOrd for Grant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Grant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id().cmp(other.id())
    }
}

impl Hash for Grant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}
