// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hierarchical privileges for shareable topic-space graphs.
//!
//! Users place allow and deny grants on vertices of a graph. Privileges flow from parents to
//! children, where every vertex coalesces its own grants with the ones it inherited: deny
//! overrides allow and a denied user loses everything at and below that vertex.
//!
//! Every persisted entity (properties, backrefs and edges) stores a projection of the coalesced
//! privileges as a flat record of readers, writers and admins together with the grants
//! justifying them. [`PrivilegeService`] keeps these records in line with the grants, batching
//! recomputation per transaction or per debounce window when no transaction is at hand.
pub mod accumulator;
pub mod aggregate;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod entity;
pub mod grant;
pub mod lineage;
pub mod privileges;
pub mod service;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
pub mod transaction;
pub mod types;

pub use accumulator::{FlushError, PrivilegeUpdate, UpdateAccumulator};
pub use aggregate::GrantAggregator;
pub use cache::GrantCache;
pub use coalesce::{InheritedPrivs, InheritedTuple, coalesce, union_inherited};
pub use config::Config;
pub use entity::{Entity, EntityKind, PrivilegeError};
pub use grant::{
    Grant, GrantCategory, GrantInstruction, GrantReplacement, GrantStatus, GrantType,
    PermissionLevel,
};
pub use lineage::{GraphError, PrivilegeGraph};
pub use privileges::{PrivilegeData, PrivilegeRecord};
pub use service::{AttachError, PrivilegeService};
pub use transaction::{Transaction, TransactionError, Write};
pub use types::{EntityId, GrantId, PUBLIC, RelationId, UserId, VertexId};
