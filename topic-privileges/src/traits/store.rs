// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;
use std::future::Future;

use crate::grant::Grant;
use crate::transaction::Write;
use crate::types::{GrantId, UserId};

/// Persistence backend holding grant records and entity privilege records.
pub trait PrivilegeStore {
    type Error: Error + Send + Sync + 'static;

    /// Look up a grant record by id.
    ///
    /// Only records readable by `viewer` (their recipients contain `viewer` or `PUBLIC`) are
    /// returned. Archived records are returned as well, callers decide what to do with them.
    ///
    /// Returned handles are cached. A store may hand out a fresh copy per lookup, archives are
    /// only observed on cached copies when they are made through
    /// [`PrivilegeService`](crate::PrivilegeService) or when the store hands out one shared handle
    /// per grant and archives it on commit.
    fn grant(
        &self,
        id: &GrantId,
        viewer: &UserId,
    ) -> impl Future<Output = Result<Option<Grant>, Self::Error>> + Send;

    /// Atomically apply all writes of a committed transaction.
    fn commit(&self, writes: Vec<Write>) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
