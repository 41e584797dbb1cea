// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unit of work collecting writes, with ordered commit hooks.
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use crate::privileges::PrivilegeData;
use crate::traits::PrivilegeStore;
use crate::types::{EntityId, GrantId, VertexId};

#[derive(Debug, Error)]
pub enum TransactionError<E> {
    #[error("failed to commit transaction {0}: {1}")]
    Commit(String, #[source] E),
}

/// A single change queued in a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    /// Persist a new grant record under a vertex.
    InsertGrant {
        id: GrantId,
        vertex: VertexId,
        /// JSON encoded [`GrantInstruction`](crate::grant::GrantInstruction).
        payload: String,
        privileges: PrivilegeData,
        created_at: u64,
    },

    /// Move a grant record into its terminal archived state.
    ArchiveGrant { id: GrantId },

    /// Replace the privilege record of an entity.
    UpdatePrivileges {
        entity: EntityId,
        privileges: PrivilegeData,
    },

    ArchiveEntity { entity: EntityId },
}

type PreCommitHook = Box<dyn FnOnce(&mut Transaction) + Send>;

type Hook = Box<dyn FnOnce() + Send>;

/// Collects writes and runs hooks around committing them.
///
/// Pre-commit hooks run in registration order and may queue further writes and hooks into the
/// same transaction, including more pre-commit hooks. Post-commit hooks run after the store
/// accepted all writes, abort hooks run when the store rejected them or the transaction is
/// aborted. A transaction dropped without being committed counts as aborted.
pub struct Transaction {
    key: String,
    now: u64,
    writes: Vec<Write>,
    pre_commit: VecDeque<PreCommitHook>,
    post_commit: Vec<Hook>,
    abort: Vec<Hook>,
}

impl Transaction {
    pub fn new(key: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or_default();

        Self {
            key: key.into(),
            now,
            writes: Vec::new(),
            pre_commit: VecDeque::new(),
            post_commit: Vec::new(),
            abort: Vec::new(),
        }
    }

    /// Key identifying this transaction while it is in flight.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Timestamp in milliseconds taken when the transaction began.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn push(&mut self, write: Write) {
        self.writes.push(write);
    }

    /// Writes queued so far.
    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn add_pre_commit_hook(&mut self, hook: impl FnOnce(&mut Transaction) + Send + 'static) {
        self.pre_commit.push_back(Box::new(hook));
    }

    pub fn add_post_commit_hook(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.post_commit.push(Box::new(hook));
    }

    pub fn add_abort_hook(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.abort.push(Box::new(hook));
    }

    /// Run all pre-commit hooks, hand the writes to the store and run the post-commit hooks.
    pub async fn commit<S>(mut self, store: &S) -> Result<(), TransactionError<S::Error>>
    where
        S: PrivilegeStore,
    {
        while let Some(hook) = self.pre_commit.pop_front() {
            hook(&mut self);
        }

        let writes = std::mem::take(&mut self.writes);
        debug!(tx = %self.key, writes = writes.len(), "commit transaction");

        if !writes.is_empty() {
            if let Err(err) = store.commit(writes).await {
                self.run_abort_hooks();
                return Err(TransactionError::Commit(std::mem::take(&mut self.key), err));
            }
        }

        self.abort.clear();
        for hook in self.post_commit.drain(..) {
            hook();
        }

        Ok(())
    }

    /// Discard all writes and run the abort hooks.
    pub fn abort(mut self) {
        debug!(tx = %self.key, writes = self.writes.len(), "abort transaction");
        self.run_abort_hooks();
    }

    fn run_abort_hooks(&mut self) {
        for hook in self.abort.drain(..) {
            hook();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.abort.is_empty() {
            return;
        }

        debug!(tx = %self.key, "transaction dropped without commit");
        self.run_abort_hooks();
    }
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .field("now", &self.now)
            .field("writes", &self.writes)
            .field("pre_commit", &self.pre_commit.len())
            .field("post_commit", &self.post_commit.len())
            .field("abort", &self.abort.len())
            .finish()
    }
}
